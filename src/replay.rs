//! Replay of recorded messages through the normalization pipeline.
//!
//! Recorded message files carry the bare payload without transport
//! metadata, so the message family has to be inferred from payload
//! shape instead of from queue bindings: update manifests carry
//! `ACCEPTED_MAR_CHANNEL_IDS`, build messages carry `tags`, everything
//! else is treated as a release message. Unlike live handling, a file
//! that does not parse is an operator error and fails loudly.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::archive::PayloadArchive;
use crate::dispatch::{Dispatcher, Disposition};
use crate::error::ReplayError;
use crate::request::{Delivery, MessageFamily};

/// A classification field counts only when present and non-empty.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

/// Infer the message family from a recorded payload.
pub fn classify(payload: &Value) -> MessageFamily {
    if truthy(payload.get("ACCEPTED_MAR_CHANNEL_IDS")) {
        MessageFamily::Update
    } else if truthy(payload.get("tags")) {
        MessageFamily::Build
    } else {
        MessageFamily::Release
    }
}

/// The three per-family dispatchers a consumer runs.
pub struct DispatcherSet {
    pub build: Dispatcher,
    pub update: Dispatcher,
    pub release: Dispatcher,
}

impl DispatcherSet {
    pub fn for_family(&self, family: MessageFamily) -> &Dispatcher {
        match family {
            MessageFamily::Build => &self.build,
            MessageFamily::Update => &self.update,
            MessageFamily::Release => &self.release,
        }
    }

    /// Attach one payload archive to all three dispatchers.
    pub fn with_archive(self, archive: Arc<dyn PayloadArchive>) -> Self {
        Self {
            build: self.build.with_archive(archive.clone()),
            update: self.update.with_archive(archive.clone()),
            release: self.release.with_archive(archive),
        }
    }
}

/// Classify one recorded payload and run it through its dispatcher.
pub async fn replay_message(
    set: &DispatcherSet,
    raw: &[u8],
) -> Result<Disposition, ReplayError> {
    let payload: Value = serde_json::from_slice(raw)?;
    let family = classify(&payload);
    info!(family = %family, "replay_classified");
    let disposition = set
        .for_family(family)
        .handle_delivery(&Delivery::from_value(&payload))
        .await?;
    Ok(disposition)
}

/// Replay a message file from disk.
pub async fn replay_file(set: &DispatcherSet, path: &Path) -> Result<Disposition, ReplayError> {
    let raw = std::fs::read(path)?;
    replay_message(set, &raw).await
}

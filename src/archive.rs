//! Best-effort archiving of raw payloads for emitted requests.
//!
//! Before a request reaches the sink its originating payload can be
//! written aside, one file per request, so operators can inspect what
//! the bus delivered or re-trigger a run by replaying the file. The
//! archive is explicitly non-critical: [`Dispatcher`] logs a failed
//! write at warn and carries on, and an archive failure never changes
//! a delivery's disposition.
//!
//! [`Dispatcher`]: crate::dispatch::Dispatcher

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::ArchiveError;
use crate::request::TestRequest;

/// Side channel that records the raw payload behind each request.
#[async_trait]
pub trait PayloadArchive: Send + Sync {
    /// Record one request's raw payload. Failures are logged and
    /// discarded by the caller, never propagated.
    async fn record(&self, request: &TestRequest) -> Result<(), ArchiveError>;
}

/// Archive that lays payloads out as JSON files under a root folder,
/// one subdirectory per tree.
///
/// File names carry the build id, product, locale and platform; update
/// requests are additionally prefixed with the target build id so the
/// two sides of an update share a directory without colliding. An
/// existing file is left untouched, so the payload on disk is always
/// the one from the first notification.
pub struct JsonFileArchive {
    root: PathBuf,
}

impl JsonFileArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, request: &TestRequest) -> PathBuf {
        let mut name = format!(
            "{}_{}_{}_{}.json",
            request.build_id, request.product, request.locale, request.platform
        );
        if let Some(target_build_id) = &request.target_build_id {
            name = format!("{target_build_id}_{name}");
        }
        self.root.join(&request.tree).join(name)
    }

    fn write_payload(path: &Path, request: &TestRequest) -> Result<(), ArchiveError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec(&request.raw_payload)?;
        fs::write(path, body)?;
        Ok(())
    }
}

#[async_trait]
impl PayloadArchive for JsonFileArchive {
    async fn record(&self, request: &TestRequest) -> Result<(), ArchiveError> {
        Self::write_payload(&self.path_for(request), request)
    }
}

//! Message normalizers, one per upstream notification family.
//!
//! Every family runs the same two-stage pipeline driven by the
//! dispatcher: `preprocess` peels the payload out of the delivery
//! envelope (pre-filtering on carbon-copy keys and fetching the full
//! manifest when the body only carries a task pointer), and
//! `validate_and_emit` runs the policy checks in their fixed order
//! (tree, product, platform, tags, locale) and constructs canonical
//! records. Rejection is an explicit, typed outcome, not an error.

mod build;
mod release;
mod update;

pub use build::BuildNormalizer;
pub use release::ReleaseNormalizer;
pub use update::UpdateNormalizer;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{NormalizeError, RejectReason};
use crate::request::{MessageFamily, TestRequest, TransportMeta};

/// Outcome of a filtering stage: the value to keep processing, or the
/// reason this message (or element) is not of interest.
#[derive(Debug, Clone, PartialEq)]
pub enum Filtered<T> {
    Pass(T),
    Reject(RejectReason),
}

/// Family-specific normalization driven by the dispatcher.
#[async_trait]
pub trait MessageNormalizer: Send + Sync {
    /// Which upstream family this normalizer understands.
    fn family(&self) -> MessageFamily;

    /// Extract the payload to validate from the message envelope.
    ///
    /// `meta` is `None` for replayed messages, which already carry the
    /// full payload; the carbon-copy pre-filter only applies to live
    /// deliveries.
    async fn preprocess(
        &self,
        body: &Value,
        meta: Option<&TransportMeta>,
    ) -> Result<Filtered<Value>, NormalizeError>;

    /// Validate the payload against policy and construct canonical
    /// records. Fan-out families return one record per surviving
    /// element; an element failure never aborts its siblings.
    async fn validate_and_emit(
        &self,
        payload: Value,
    ) -> Result<Filtered<Vec<TestRequest>>, NormalizeError>;
}

/// Task identifier out of a Taskcluster task-status envelope.
pub(crate) fn task_id(body: &Value) -> Result<&str, NormalizeError> {
    body.get("status")
        .and_then(|status| status.get("taskId"))
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingField("status.taskId"))
}

/// Serde helper for build identifiers, which upstream emits as either a
/// JSON string or a bare number.
pub(crate) mod build_id_string {
    use serde::{Deserialize, Deserializer, de};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(de::Error::custom(format!(
                "expected string or number for build id, got {other}"
            ))),
        }
    }
}

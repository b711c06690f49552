//! Artifact and task lookups against the Taskcluster queue.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FetchError;

/// Retrieves artifacts and task definitions for a task identifier.
///
/// Both calls perform exactly one GET with no retry; a failure aborts
/// processing of the current message, never the subscription.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch the named artifact of the task's latest run.
    async fn fetch_manifest(&self, task_id: &str, artifact_path: &str)
    -> Result<Value, FetchError>;

    /// Fetch the task definition.
    async fn fetch_task(&self, task_id: &str) -> Result<Value, FetchError>;
}

/// Fetcher backed by the Taskcluster queue REST API.
#[cfg(feature = "client")]
pub struct TaskQueueFetcher {
    base_url: String,
    timeout_secs: u64,
}

#[cfg(feature = "client")]
impl TaskQueueFetcher {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
        }
    }

    pub fn from_config(endpoints: &crate::config::EndpointConfig) -> Self {
        Self::new(&endpoints.taskcluster_queue_url, endpoints.fetch_timeout_secs)
    }
}

#[cfg(feature = "client")]
#[async_trait]
impl ArtifactFetcher for TaskQueueFetcher {
    async fn fetch_manifest(
        &self,
        task_id: &str,
        artifact_path: &str,
    ) -> Result<Value, FetchError> {
        let url = format!("{}/task/{}/artifacts/{}", self.base_url, task_id, artifact_path);
        crate::http::get_json(&url, self.timeout_secs).await
    }

    async fn fetch_task(&self, task_id: &str) -> Result<Value, FetchError> {
        let url = format!("{}/task/{}", self.base_url, task_id);
        crate::http::get_json(&url, self.timeout_secs).await
    }
}

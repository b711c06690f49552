//! Revision expansion against the Mercurial web service.
//!
//! Build notifications carry abbreviated revisions; the canonical record
//! promises full-length ones. Resolution is a pure function of (branch,
//! short revision) and is safe to repeat, so implementations may cache.

use async_trait::async_trait;

use crate::error::FetchError;

/// Length of a full Mercurial revision identifier.
pub const FULL_REVISION_LEN: usize = 40;

/// The one branch that is not namespaced under `releases/` on the
/// Mercurial server.
const TRUNK_BRANCH: &str = "mozilla-central";

/// Expands an abbreviated source-control revision into its full-length
/// identifier.
///
/// A failed resolution must propagate: a test request without a full
/// revision cannot safely be enqueued.
#[async_trait]
pub trait RevisionResolver: Send + Sync {
    async fn resolve(&self, branch: &str, short_revision: &str) -> Result<String, FetchError>;
}

/// Repository path for a branch on the Mercurial server.
pub fn repo_path(branch: &str) -> String {
    if branch == TRUNK_BRANCH {
        branch.to_string()
    } else {
        format!("releases/{branch}")
    }
}

/// Resolver backed by the `json-rev` endpoint of hg.mozilla.org.
#[cfg(feature = "client")]
pub struct HgRevisionResolver {
    base_url: String,
    timeout_secs: u64,
}

#[cfg(feature = "client")]
impl HgRevisionResolver {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
        }
    }

    pub fn from_config(endpoints: &crate::config::EndpointConfig) -> Self {
        Self::new(&endpoints.hg_url, endpoints.fetch_timeout_secs)
    }
}

#[cfg(feature = "client")]
#[derive(serde::Deserialize)]
struct RevisionInfo {
    node: String,
}

#[cfg(feature = "client")]
#[async_trait]
impl RevisionResolver for HgRevisionResolver {
    async fn resolve(&self, branch: &str, short_revision: &str) -> Result<String, FetchError> {
        let url = format!(
            "{}/{}/json-rev/{}",
            self.base_url,
            repo_path(branch),
            short_revision
        );
        let value = crate::http::get_json(&url, self.timeout_secs).await?;
        let info: RevisionInfo =
            serde_json::from_value(value).map_err(|e| FetchError::InvalidJson {
                url,
                reason: e.to_string(),
            })?;
        Ok(info.node)
    }
}

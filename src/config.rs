//! YAML configuration file support for the Pulse consumer.
//!
//! One document configures all three subscriptions: the queue naming and
//! durability of the consumer itself, the endpoints used for secondary
//! lookups, and the per-tree policy that decides which notifications
//! become test requests.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1.0"
//!
//! consumer:
//!   queue_prefix: "queue/pulse-user/ci-host/mozmill-ci"
//!   durable: false
//!
//! endpoints:
//!   hg_url: "https://hg.mozilla.org"
//!   taskcluster_queue_url: "https://queue.taskcluster.net/v1"
//!   fetch_timeout_secs: 60
//!
//! trees:
//!   mozilla-central:
//!     products: ["firefox"]
//!     platforms: ["linux64", "win32", "win64", "macosx64"]
//!     locales: []
//!     blacklist:
//!       locales: ["en-ZA"]
//!     tags: ["nightly"]
//!   release-mozilla-beta:
//!     products: ["firefox"]
//!     platforms: []
//!     locales: ["en-US", "de", "ru"]
//!     blacklist:
//!       locales: []
//!     tags: []
//! ```
//!
//! An absent or empty `trees` section switches the policy into
//! accept-all-trees mode; see [`PolicyStore`](crate::policy::PolicyStore).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::TreePolicy;

/// Errors that can occur when loading YAML configuration files
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

/// Top-level YAML configuration for the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PulsegateConfig {
    /// Configuration format version
    pub version: String,

    /// Optional configuration name/description
    #[serde(default)]
    pub name: Option<String>,

    /// Queue naming and durability
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Secondary-lookup endpoints
    #[serde(default)]
    pub endpoints: EndpointConfig,

    /// Per-tree policy document; empty means accept all trees
    #[serde(default)]
    pub trees: HashMap<String, TreePolicy>,
}

impl PulsegateConfig {
    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: PulsegateConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => Ok(()),
            v => Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }?;

        self.consumer.validate()?;
        self.endpoints.validate()?;

        Ok(())
    }
}

impl Default for PulsegateConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            name: None,
            consumer: ConsumerConfig::default(),
            endpoints: EndpointConfig::default(),
            trees: HashMap::new(),
        }
    }
}

/// Consumer-side YAML configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Prefix for the per-family queue names, conventionally
    /// `queue/<user>/<host>/<label>`. The family suffixes (`_build`,
    /// `_build_release`, `_update`) are appended by the subscription
    /// catalog.
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Whether the queues survive consumer restarts. Auto-delete is
    /// always the negation of this flag.
    #[serde(default)]
    pub durable: bool,
}

impl ConsumerConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.queue_prefix.trim().is_empty() {
            return Err(ConfigLoadError::Validation(
                "consumer.queue_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue_prefix: default_queue_prefix(),
            durable: false,
        }
    }
}

/// Secondary-lookup endpoint YAML configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL of the Mercurial web service used to expand abbreviated
    /// revisions and to derive repository URLs.
    #[serde(default = "default_hg_url")]
    pub hg_url: String,

    /// Base URL of the Taskcluster queue service used to fetch update
    /// manifests and task definitions.
    #[serde(default = "default_taskcluster_queue_url")]
    pub taskcluster_queue_url: String,

    /// Deadline for every secondary lookup, in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl EndpointConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        for (field, url) in [
            ("endpoints.hg_url", &self.hg_url),
            ("endpoints.taskcluster_queue_url", &self.taskcluster_queue_url),
        ] {
            if url.trim().is_empty() {
                return Err(ConfigLoadError::Validation(format!(
                    "{field} must not be empty"
                )));
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigLoadError::Validation(format!(
                    "{field} must be an http(s) URL, got {url:?}"
                )));
            }
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigLoadError::Validation(
                "endpoints.fetch_timeout_secs must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            hg_url: default_hg_url(),
            taskcluster_queue_url: default_taskcluster_queue_url(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

// Helper functions for serde defaults
fn default_queue_prefix() -> String {
    "queue/pulsegate".to_string()
}
fn default_hg_url() -> String {
    "https://hg.mozilla.org".to_string()
}
fn default_taskcluster_queue_url() -> String {
    "https://queue.taskcluster.net/v1".to_string()
}
fn default_fetch_timeout() -> u64 {
    60
}

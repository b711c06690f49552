//! Canonical test-request records and the delivery-side vocabulary.
//!
//! Three structurally different notification families arrive from the
//! bus; everything downstream of the normalizers speaks exactly one
//! shape, [`TestRequest`]. This module also owns the static subscription
//! catalog (exchange names, routing-key patterns, queue-name suffixes)
//! that binds each family to its place on the bus.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Exchange carrying normalized build-completed notifications.
pub const BUILD_EXCHANGE: &str = "exchange/build/normalized";

/// Exchange carrying Taskcluster task-completed notifications, shared by
/// the update and release families.
pub const TASK_COMPLETED_EXCHANGE: &str = "exchange/taskcluster-queue/v1/task-completed";

/// Routing-key pattern for build-completed notifications.
pub const BUILD_ROUTING_KEY: &str = "build.#";

/// Routing-key pattern for funsize update-manifest notifications.
pub const UPDATE_ROUTING_KEY: &str = "#.funsize-balrog.#";

/// Routing-key pattern for beetmover release-artifact notifications.
pub const RELEASE_ROUTING_KEY: &str = "route.index.releases.v1.#";

/// The reference locale whose build URL is authoritative; repack builds
/// for other locales report this locale's URL, which is meaningless for
/// them.
pub const REFERENCE_LOCALE: &str = "en-US";

/// The three upstream notification families this consumer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageFamily {
    /// Build-completed notifications from the normalized build exchange.
    Build,
    /// Update-available notifications produced by funsize.
    Update,
    /// Release-artifact notifications produced by beetmover.
    Release,
}

impl MessageFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFamily::Build => "build",
            MessageFamily::Update => "update",
            MessageFamily::Release => "release",
        }
    }
}

impl fmt::Display for MessageFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminator for the downstream test run a canonical record asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestKind {
    /// Functional test run against a completed build.
    Functional,
    /// Update test run driving the updater from one build to another.
    Update,
    /// Functional test run against one locale of a release candidate.
    ReleaseLocale,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Functional => "functional",
            TestKind::Update => "update",
            TestKind::ReleaseLocale => "release-locale",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The normalized output record, decoupled from any upstream message's
/// native shape.
///
/// Exactly one record is produced per (tree, platform, locale,
/// triggering event); a release message naming K locales yields K
/// independent records. `revision` is always the full-length identifier,
/// expanded through the revision resolver when the source carried an
/// abbreviated one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRequest {
    pub kind: TestKind,

    /// Tree the notification was filed under, e.g. `release-mozilla-beta`.
    pub tree: String,

    /// Source branch, i.e. the tree with any `release-` prefix stripped.
    pub branch: String,

    pub product: String,
    pub platform: String,
    pub locale: String,

    /// Full-length source-control revision.
    pub revision: String,

    /// Build identifier of the build under test. For update requests
    /// this is the build the updater starts from.
    pub build_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Canonical repository URL derived from the branch. Release records
    /// do not carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,

    /// Download URL of the build. Only populated for the reference
    /// locale of functional requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_url: Option<String>,

    /// Upstream build status code, carried through from build-completed
    /// notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_packages_url: Option<String>,

    /// Build identifier the update targets (update requests only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_build_id: Option<String>,

    /// Version the update targets (update requests only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_number: Option<u64>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// The payload this record was normalized from, retained verbatim
    /// for audit and debugging.
    pub raw_payload: Value,
}

/// Transport metadata attached to a bus delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMeta {
    /// Primary routing key the message was published under.
    pub routing_key: String,
    /// Carbon-copy routing keys, used for cheap pre-filtering without
    /// touching the message body.
    pub cc_keys: Vec<String>,
}

/// One raw message as handed over by the bus.
///
/// Replayed messages carry no transport metadata; the normalizers skip
/// their carbon-copy pre-filter in that case.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Bytes,
    pub meta: Option<TransportMeta>,
}

impl Delivery {
    pub fn new(body: Bytes, meta: Option<TransportMeta>) -> Self {
        Self { body, meta }
    }

    /// Wrap an already-parsed payload as a metadata-less delivery, the
    /// shape a replayed message file arrives in.
    pub fn from_value(value: &Value) -> Self {
        Self {
            body: Bytes::from(value.to_string()),
            meta: None,
        }
    }
}

/// Static subscription parameters for one message family.
///
/// Exchanges are expected to pre-exist; a transport binding this
/// descriptor must declare them passively and treat an absent exchange
/// as a fatal configuration error, not a retryable one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub durable: bool,
    /// Always the negation of `durable`.
    pub auto_delete: bool,
}

impl Subscription {
    fn new(queue: String, exchange: &str, routing_key: &str, durable: bool) -> Self {
        Self {
            queue,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            durable,
            auto_delete: !durable,
        }
    }

    /// Subscription for build-completed notifications.
    pub fn normalized_build(queue_prefix: &str, durable: bool) -> Self {
        Self::new(
            format!("{queue_prefix}_build"),
            BUILD_EXCHANGE,
            BUILD_ROUTING_KEY,
            durable,
        )
    }

    /// Subscription for funsize update notifications.
    pub fn funsize_task_completed(queue_prefix: &str, durable: bool) -> Self {
        Self::new(
            format!("{queue_prefix}_update"),
            TASK_COMPLETED_EXCHANGE,
            UPDATE_ROUTING_KEY,
            durable,
        )
    }

    /// Subscription for beetmover release-artifact notifications.
    pub fn release_task_completed(queue_prefix: &str, durable: bool) -> Self {
        Self::new(
            format!("{queue_prefix}_build_release"),
            TASK_COMPLETED_EXCHANGE,
            RELEASE_ROUTING_KEY,
            durable,
        )
    }

    pub fn for_family(family: MessageFamily, queue_prefix: &str, durable: bool) -> Self {
        match family {
            MessageFamily::Build => Self::normalized_build(queue_prefix, durable),
            MessageFamily::Update => Self::funsize_task_completed(queue_prefix, durable),
            MessageFamily::Release => Self::release_task_completed(queue_prefix, durable),
        }
    }
}

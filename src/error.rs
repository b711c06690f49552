//! Error surface for the consumer pipeline.
//!
//! The types here are split along the acknowledgment decision the
//! dispatcher has to make. [`RejectReason`] classifies messages that are
//! well-formed but not addressed to any configured tree; those are
//! expected traffic and are always acknowledged. The fallible lookup and
//! normalization errors carry an `is_transient` predicate that decides
//! between redelivery and a terminal drop.

use thiserror::Error;

/// Why a message or fan-out element was filtered out instead of
/// producing a test request.
///
/// Rejections are not failures: the exchanges carry notifications for
/// every tree, product, and platform, and the policy keeps only what the
/// configured trees ask for. Whole-message rejections log at debug
/// level, per-element rejections at info level, and the message is
/// acknowledged either way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RejectReason {
    /// Neither the routing key nor any CC header matched the family
    /// pattern.
    #[error("routing keys do not match")]
    RoutingKeyMismatch,

    /// The tree is not present in the policy.
    #[error("invalid tree: {0}")]
    Tree(String),

    /// The product is not allowed for this tree.
    #[error("invalid product: {0}")]
    Product(String),

    /// The platform is not allowed for this tree.
    #[error("invalid platform: {0}")]
    Platform(String),

    /// The message's tags do not cover the tags the tree requires.
    #[error("invalid tags: {0:?}")]
    Tags(Vec<String>),

    /// The locale is blacklisted or outside the tree's whitelist.
    #[error("invalid locale: {0}")]
    Locale(String),
}

/// A secondary HTTP lookup failed.
///
/// Covers both hg.mozilla.org revision expansion and the Taskcluster
/// queue fetches. The variant decides redelivery: a lookup that might
/// succeed later is worth requeueing the message for, a lookup that will
/// keep failing is not.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FetchError {
    /// The request never produced an HTTP response.
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    /// The request exceeded its deadline.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// The server answered with a non-success status.
    #[error("{url} returned status {status}: {body}")]
    Status { url: String, status: u16, body: String },

    /// The response body was not the JSON document asked for.
    #[error("invalid JSON from {url}: {reason}")]
    InvalidJson { url: String, reason: String },
}

impl FetchError {
    /// True when retrying the lookup later could succeed.
    ///
    /// Connection failures, timeouts, and 5xx responses are transient;
    /// 4xx responses and malformed bodies will keep failing for the same
    /// message and are terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { .. } | FetchError::Timeout { .. } => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::InvalidJson { .. } => false,
        }
    }
}

/// A message matched its family but could not be turned into test
/// requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NormalizeError {
    /// A field the canonical record requires was absent or of the wrong
    /// shape.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The payload did not deserialize into the family's expected shape.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A secondary lookup failed while deriving fields.
    #[error("secondary lookup failed: {0}")]
    Fetch(#[from] FetchError),
}

impl NormalizeError {
    /// True when redelivering the message could produce a different
    /// outcome. Only lookup failures qualify; a malformed or incomplete
    /// payload stays malformed on every delivery.
    pub fn is_transient(&self) -> bool {
        match self {
            NormalizeError::Fetch(err) => err.is_transient(),
            NormalizeError::MissingField(_) | NormalizeError::MalformedPayload(_) => false,
        }
    }
}

/// The downstream sink refused an emitted test request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sink rejected request: {0}")]
pub struct SinkError(pub String);

/// A payload-archive write failed.
///
/// Archiving is best-effort: the dispatcher logs this and moves on, so
/// the error never reaches a disposition or the caller.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ArchiveError {
    #[error("failed to write archived payload: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode archived payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the dispatcher loop.
///
/// Source and sink failures abort the loop; everything that concerns a
/// single message is handled inside [`handle_delivery`] and expressed as
/// a [`Disposition`] instead.
///
/// [`handle_delivery`]: crate::dispatch::Dispatcher::handle_delivery
/// [`Disposition`]: crate::dispatch::Disposition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DispatchError {
    /// The delivery source failed to produce or settle a message.
    #[error("delivery source failed: {0}")]
    Source(String),

    /// The downstream sink refused an emitted request.
    #[error("sink failed: {0}")]
    Sink(#[from] SinkError),
}

/// Errors from replaying a logged message file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReplayError {
    #[error("failed to read message file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("message file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("replayed message failed to dispatch: {0}")]
    Dispatch(#[from] DispatchError),
}

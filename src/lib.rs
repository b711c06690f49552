//! Pulse build-notification consumer core.
//!
//! This crate consumes build, update and release notifications from a
//! message bus, filters them against a per-tree policy document,
//! resolves auxiliary data over HTTP (source revisions, update
//! manifests, task metadata) and hands canonical test requests to a
//! caller-supplied sink. The bus client itself stays outside: callers
//! implement [`DeliverySource`] over whatever transport they run and
//! drive the per-family [`Dispatcher`]s with it, or replay recorded
//! message files through [`replay_file`].

pub mod archive;
pub mod artifacts;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod normalize;
pub mod policy;
pub mod replay;
pub mod request;
pub mod revision;
pub mod routing;

#[cfg(feature = "client")]
mod http;

use std::sync::Arc;

pub use archive::{JsonFileArchive, PayloadArchive};
#[cfg(feature = "client")]
pub use artifacts::TaskQueueFetcher;
pub use artifacts::ArtifactFetcher;
pub use config::{ConfigLoadError, PulsegateConfig};
pub use dispatch::{
    ConsumerMetrics, DeliverySource, Dispatcher, Disposition, LoggingSink, NoopMetrics,
    RequestSink,
};
pub use error::{
    ArchiveError, DispatchError, FetchError, NormalizeError, RejectReason, ReplayError, SinkError,
};
pub use normalize::{
    BuildNormalizer, Filtered, MessageNormalizer, ReleaseNormalizer, UpdateNormalizer,
};
pub use policy::{PolicyStore, TreePolicy};
pub use replay::{DispatcherSet, classify, replay_file, replay_message};
pub use request::{Delivery, MessageFamily, Subscription, TestKind, TestRequest, TransportMeta};
#[cfg(feature = "client")]
pub use revision::HgRevisionResolver;
pub use revision::RevisionResolver;

/// Wire the three per-family dispatchers from a loaded configuration.
///
/// The resolver and fetcher are injected so deployments and tests can
/// supply their own lookups; [`assemble_with_http`] covers the common
/// case. All dispatchers share one policy store and one sink.
pub fn assemble(
    config: &PulsegateConfig,
    resolver: Arc<dyn RevisionResolver>,
    fetcher: Arc<dyn ArtifactFetcher>,
    sink: Arc<dyn RequestSink>,
) -> DispatcherSet {
    let policy = Arc::new(PolicyStore::new(config.trees.clone()));
    let prefix = config.consumer.queue_prefix.as_str();
    let durable = config.consumer.durable;

    DispatcherSet {
        build: Dispatcher::new(
            Subscription::normalized_build(prefix, durable),
            Box::new(BuildNormalizer::new(
                policy.clone(),
                resolver.clone(),
                &config.endpoints,
            )),
            sink.clone(),
        ),
        update: Dispatcher::new(
            Subscription::funsize_task_completed(prefix, durable),
            Box::new(UpdateNormalizer::new(policy.clone(), fetcher.clone())),
            sink.clone(),
        ),
        release: Dispatcher::new(
            Subscription::release_task_completed(prefix, durable),
            Box::new(ReleaseNormalizer::new(policy, fetcher, resolver)),
            sink,
        ),
    }
}

/// [`assemble`] with the HTTP-backed resolver and fetcher built from
/// the configured endpoints.
#[cfg(feature = "client")]
pub fn assemble_with_http(config: &PulsegateConfig, sink: Arc<dyn RequestSink>) -> DispatcherSet {
    let resolver = Arc::new(HgRevisionResolver::from_config(&config.endpoints));
    let fetcher = Arc::new(TaskQueueFetcher::from_config(&config.endpoints));
    assemble(config, resolver, fetcher, sink)
}

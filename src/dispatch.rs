//! Delivery handling around one subscription.
//!
//! A [`Dispatcher`] owns the normalizer for one message family and
//! turns each delivery into an acknowledgment disposition: rejections
//! and permanently malformed messages are acknowledged so they leave
//! the queue, transient secondary-fetch failures are requeued for
//! bus-level redelivery. Surviving requests go to the [`RequestSink`];
//! sink failures mean the downstream consumer is broken and propagate
//! to whoever owns the loop instead of being traded for a disposition.
//! The optional [`PayloadArchive`] sits outside that contract entirely:
//! a failed archive write is logged and the delivery proceeds.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::archive::PayloadArchive;
use crate::error::{DispatchError, NormalizeError, SinkError};
use crate::normalize::{Filtered, MessageNormalizer};
use crate::request::{Delivery, MessageFamily, Subscription, TestRequest};

/// What to tell the bus about the delivery just handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue, successful or not.
    Ack,
    /// Put the message back for redelivery.
    Requeue,
}

/// Downstream consumer of canonical test requests.
#[async_trait]
pub trait RequestSink: Send + Sync {
    /// Accept one request. Failures are contract violations of the
    /// downstream consumer and abort delivery handling.
    async fn submit(&self, request: TestRequest) -> Result<(), SinkError>;
}

/// Sink that only logs what it would submit. Used for display-only
/// replays and as a stand-in while wiring a deployment.
pub struct LoggingSink;

#[async_trait]
impl RequestSink for LoggingSink {
    async fn submit(&self, request: TestRequest) -> Result<(), SinkError> {
        info!(
            kind = %request.kind,
            tree = %request.tree,
            product = %request.product,
            platform = %request.platform,
            locale = %request.locale,
            build_id = %request.build_id,
            revision = %request.revision,
            "test_request"
        );
        Ok(())
    }
}

/// Feed of deliveries for one subscription.
///
/// `settle` applies to the delivery most recently yielded by `next`;
/// callers alternate the two strictly. Implementations sit on top of
/// whatever bus client the deployment uses, or on a recorded message
/// file in tests and replays.
#[async_trait]
pub trait DeliverySource: Send {
    async fn next(&mut self) -> Result<Option<Delivery>, DispatchError>;
    async fn settle(&mut self, disposition: Disposition) -> Result<(), DispatchError>;
}

/// Counters a deployment can hang its instrumentation on.
pub trait ConsumerMetrics: Send + Sync {
    fn on_received(&self, family: MessageFamily);
    fn on_rejected(&self, family: MessageFamily);
    fn on_malformed(&self, family: MessageFamily);
    fn on_requeued(&self, family: MessageFamily);
    fn on_emitted(&self, family: MessageFamily, count: usize);
}

/// Default observer that records nothing.
pub struct NoopMetrics;

impl ConsumerMetrics for NoopMetrics {
    fn on_received(&self, _family: MessageFamily) {}
    fn on_rejected(&self, _family: MessageFamily) {}
    fn on_malformed(&self, _family: MessageFamily) {}
    fn on_requeued(&self, _family: MessageFamily) {}
    fn on_emitted(&self, _family: MessageFamily, _count: usize) {}
}

/// Drives one normalizer over one subscription's deliveries.
///
/// Handling is strictly serialized per dispatcher; run one dispatcher
/// per family, concurrently with the others.
pub struct Dispatcher {
    subscription: Subscription,
    normalizer: Box<dyn MessageNormalizer>,
    sink: Arc<dyn RequestSink>,
    metrics: Arc<dyn ConsumerMetrics>,
    archive: Option<Arc<dyn PayloadArchive>>,
}

impl Dispatcher {
    pub fn new(
        subscription: Subscription,
        normalizer: Box<dyn MessageNormalizer>,
        sink: Arc<dyn RequestSink>,
    ) -> Self {
        Self {
            subscription,
            normalizer,
            sink,
            metrics: Arc::new(NoopMetrics),
            archive: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn ConsumerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Archive raw payloads before requests reach the sink. Archive
    /// failures never affect the disposition.
    pub fn with_archive(mut self, archive: Arc<dyn PayloadArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn family(&self) -> MessageFamily {
        self.normalizer.family()
    }

    /// Handle one delivery and decide its disposition.
    ///
    /// Never fails on account of the message itself; the only error
    /// path out of here is a sink or source contract violation.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<Disposition, DispatchError> {
        let family = self.normalizer.family();
        self.metrics.on_received(family);

        let body: Value = match serde_json::from_slice(&delivery.body) {
            Ok(body) => body,
            Err(err) => {
                error!(family = %family, error = %err, "delivery_unparseable");
                self.metrics.on_malformed(family);
                return Ok(Disposition::Ack);
            }
        };

        debug!(
            family = %family,
            routing_key = %self.subscription.routing_key,
            payload = %body,
            "delivery_received"
        );

        let payload = match self.normalizer.preprocess(&body, delivery.meta.as_ref()).await {
            Ok(Filtered::Pass(payload)) => payload,
            Ok(Filtered::Reject(reason)) => {
                debug!(family = %family, reason = %reason, "delivery_rejected");
                self.metrics.on_rejected(family);
                return Ok(Disposition::Ack);
            }
            Err(err) => return Ok(self.settle_error(family, &body, err)),
        };

        let requests = match self.normalizer.validate_and_emit(payload).await {
            Ok(Filtered::Pass(requests)) => requests,
            Ok(Filtered::Reject(reason)) => {
                debug!(family = %family, reason = %reason, "delivery_rejected");
                self.metrics.on_rejected(family);
                return Ok(Disposition::Ack);
            }
            Err(err) => return Ok(self.settle_error(family, &body, err)),
        };

        let emitted = requests.len();
        for request in requests {
            // Archived before submission so a failed submit can still be
            // re-triggered by replaying the file.
            if let Some(archive) = &self.archive {
                if let Err(err) = archive.record(&request).await {
                    warn!(family = %family, error = %err, "payload_archive_failed");
                }
            }
            self.sink.submit(request).await?;
        }
        if emitted > 0 {
            info!(family = %family, count = emitted, "requests_emitted");
            self.metrics.on_emitted(family, emitted);
        }
        Ok(Disposition::Ack)
    }

    fn settle_error(&self, family: MessageFamily, body: &Value, err: NormalizeError) -> Disposition {
        if err.is_transient() {
            warn!(family = %family, error = %err, "delivery_requeued");
            self.metrics.on_requeued(family);
            Disposition::Requeue
        } else {
            error!(family = %family, error = %err, payload = %body, "delivery_failed");
            self.metrics.on_malformed(family);
            Disposition::Ack
        }
    }

    /// Drain a source to exhaustion, settling every delivery.
    pub async fn run<S: DeliverySource>(&self, source: &mut S) -> Result<(), DispatchError> {
        while let Some(delivery) = source.next().await? {
            let disposition = self.handle_delivery(&delivery).await?;
            source.settle(disposition).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ArchiveError, FetchError, RejectReason};
    use crate::request::{TestKind, TransportMeta};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Normalizer with canned stage outcomes.
    struct StubNormalizer {
        preprocess_outcome: Result<Filtered<Value>, NormalizeError>,
        emit_outcome: Result<Filtered<Vec<TestRequest>>, NormalizeError>,
    }

    impl StubNormalizer {
        fn passing(requests: Vec<TestRequest>) -> Self {
            Self {
                preprocess_outcome: Ok(Filtered::Pass(json!({}))),
                emit_outcome: Ok(Filtered::Pass(requests)),
            }
        }
    }

    #[async_trait]
    impl MessageNormalizer for StubNormalizer {
        fn family(&self) -> MessageFamily {
            MessageFamily::Build
        }

        async fn preprocess(
            &self,
            _body: &Value,
            _meta: Option<&TransportMeta>,
        ) -> Result<Filtered<Value>, NormalizeError> {
            self.preprocess_outcome.clone()
        }

        async fn validate_and_emit(
            &self,
            _payload: Value,
        ) -> Result<Filtered<Vec<TestRequest>>, NormalizeError> {
            self.emit_outcome.clone()
        }
    }

    struct VecSink {
        submitted: Mutex<Vec<TestRequest>>,
        fail: bool,
    }

    impl VecSink {
        fn new() -> Self {
            Self {
                submitted: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                submitted: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn count(&self) -> usize {
            self.submitted.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RequestSink for VecSink {
        async fn submit(&self, request: TestRequest) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError("scheduler unavailable".to_string()));
            }
            self.submitted.lock().unwrap().push(request);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingMetrics {
        received: AtomicUsize,
        rejected: AtomicUsize,
        malformed: AtomicUsize,
        requeued: AtomicUsize,
        emitted: AtomicUsize,
    }

    impl ConsumerMetrics for CountingMetrics {
        fn on_received(&self, _family: MessageFamily) {
            self.received.fetch_add(1, Ordering::Relaxed);
        }
        fn on_rejected(&self, _family: MessageFamily) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        fn on_malformed(&self, _family: MessageFamily) {
            self.malformed.fetch_add(1, Ordering::Relaxed);
        }
        fn on_requeued(&self, _family: MessageFamily) {
            self.requeued.fetch_add(1, Ordering::Relaxed);
        }
        fn on_emitted(&self, _family: MessageFamily, count: usize) {
            self.emitted.fetch_add(count, Ordering::Relaxed);
        }
    }

    struct StubArchive {
        recorded: AtomicUsize,
        fail: bool,
    }

    impl StubArchive {
        fn new() -> Self {
            Self {
                recorded: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                recorded: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl PayloadArchive for StubArchive {
        async fn record(&self, _request: &TestRequest) -> Result<(), ArchiveError> {
            if self.fail {
                return Err(ArchiveError::Io(std::io::Error::other("disk full")));
            }
            self.recorded.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct ScriptedSource {
        deliveries: VecDeque<Delivery>,
        settled: Vec<Disposition>,
    }

    impl ScriptedSource {
        fn new(deliveries: Vec<Delivery>) -> Self {
            Self {
                deliveries: deliveries.into(),
                settled: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl DeliverySource for ScriptedSource {
        async fn next(&mut self) -> Result<Option<Delivery>, DispatchError> {
            Ok(self.deliveries.pop_front())
        }

        async fn settle(&mut self, disposition: Disposition) -> Result<(), DispatchError> {
            self.settled.push(disposition);
            Ok(())
        }
    }

    fn sample_request() -> TestRequest {
        TestRequest {
            kind: TestKind::Functional,
            tree: "mozilla-central".to_string(),
            branch: "mozilla-central".to_string(),
            product: "firefox".to_string(),
            platform: "linux64".to_string(),
            locale: "en-US".to_string(),
            revision: "59f372c35b2416ac84d6572d64c49227481a8a6c".to_string(),
            build_id: "20160818000732".to_string(),
            build_number: None,
            version: Some("51.0a1".to_string()),
            repository_url: None,
            build_url: None,
            status: None,
            test_packages_url: None,
            target_build_id: None,
            target_version: None,
            update_number: None,
            tags: Vec::new(),
            raw_payload: json!({}),
        }
    }

    fn dispatcher_with(
        normalizer: StubNormalizer,
        sink: Arc<VecSink>,
        metrics: Arc<CountingMetrics>,
    ) -> Dispatcher {
        Dispatcher::new(
            Subscription::normalized_build("queue/test", false),
            Box::new(normalizer),
            sink,
        )
        .with_metrics(metrics)
    }

    #[tokio::test]
    async fn acks_and_submits_passing_deliveries() {
        let sink = Arc::new(VecSink::new());
        let metrics = Arc::new(CountingMetrics::default());
        let dispatcher = dispatcher_with(
            StubNormalizer::passing(vec![sample_request(), sample_request()]),
            sink.clone(),
            metrics.clone(),
        );

        let disposition = dispatcher
            .handle_delivery(&Delivery::from_value(&json!({"payload": {}})))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(sink.count(), 2);
        assert_eq!(metrics.received.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.emitted.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn acks_rejections_without_submitting() {
        let sink = Arc::new(VecSink::new());
        let metrics = Arc::new(CountingMetrics::default());
        let dispatcher = dispatcher_with(
            StubNormalizer {
                preprocess_outcome: Ok(Filtered::Reject(RejectReason::RoutingKeyMismatch)),
                emit_outcome: Ok(Filtered::Pass(Vec::new())),
            },
            sink.clone(),
            metrics.clone(),
        );

        let disposition = dispatcher
            .handle_delivery(&Delivery::from_value(&json!({})))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(sink.count(), 0);
        assert_eq!(metrics.rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn requeues_transient_fetch_failures() {
        let sink = Arc::new(VecSink::new());
        let metrics = Arc::new(CountingMetrics::default());
        let dispatcher = dispatcher_with(
            StubNormalizer {
                preprocess_outcome: Err(NormalizeError::Fetch(FetchError::Timeout {
                    url: "https://queue.example.org/task/T1".to_string(),
                    timeout_secs: 60,
                })),
                emit_outcome: Ok(Filtered::Pass(Vec::new())),
            },
            sink,
            metrics.clone(),
        );

        let disposition = dispatcher
            .handle_delivery(&Delivery::from_value(&json!({})))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(metrics.requeued.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.malformed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn acks_permanently_malformed_deliveries() {
        let sink = Arc::new(VecSink::new());
        let metrics = Arc::new(CountingMetrics::default());
        let dispatcher = dispatcher_with(
            StubNormalizer {
                preprocess_outcome: Ok(Filtered::Pass(json!({}))),
                emit_outcome: Err(NormalizeError::MissingField("buildid")),
            },
            sink.clone(),
            metrics.clone(),
        );

        let disposition = dispatcher
            .handle_delivery(&Delivery::from_value(&json!({})))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(sink.count(), 0);
        assert_eq!(metrics.malformed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn acks_unparseable_bodies() {
        let sink = Arc::new(VecSink::new());
        let metrics = Arc::new(CountingMetrics::default());
        let dispatcher = dispatcher_with(
            StubNormalizer::passing(vec![sample_request()]),
            sink.clone(),
            metrics.clone(),
        );

        let delivery = Delivery::new(bytes::Bytes::from_static(b"not json"), None);
        let disposition = dispatcher.handle_delivery(&delivery).await.unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(sink.count(), 0);
        assert_eq!(metrics.malformed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn sink_errors_propagate() {
        let sink = Arc::new(VecSink::failing());
        let metrics = Arc::new(CountingMetrics::default());
        let dispatcher = dispatcher_with(
            StubNormalizer::passing(vec![sample_request()]),
            sink,
            metrics,
        );

        let err = dispatcher
            .handle_delivery(&Delivery::from_value(&json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Sink(_)));
    }

    #[tokio::test]
    async fn archives_every_emitted_request() {
        let sink = Arc::new(VecSink::new());
        let archive = Arc::new(StubArchive::new());
        let dispatcher = dispatcher_with(
            StubNormalizer::passing(vec![sample_request(), sample_request()]),
            sink.clone(),
            Arc::new(CountingMetrics::default()),
        )
        .with_archive(archive.clone());

        let disposition = dispatcher
            .handle_delivery(&Delivery::from_value(&json!({})))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(archive.recorded.load(Ordering::Relaxed), 2);
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test]
    async fn archive_failures_are_swallowed() {
        let sink = Arc::new(VecSink::new());
        let dispatcher = dispatcher_with(
            StubNormalizer::passing(vec![sample_request()]),
            sink.clone(),
            Arc::new(CountingMetrics::default()),
        )
        .with_archive(Arc::new(StubArchive::failing()));

        let disposition = dispatcher
            .handle_delivery(&Delivery::from_value(&json!({})))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test]
    async fn run_settles_every_delivery_in_order() {
        let sink = Arc::new(VecSink::new());
        let metrics = Arc::new(CountingMetrics::default());
        let dispatcher = dispatcher_with(
            StubNormalizer::passing(vec![sample_request()]),
            sink.clone(),
            metrics,
        );

        let mut source = ScriptedSource::new(vec![
            Delivery::from_value(&json!({"payload": {"n": 1}})),
            Delivery::from_value(&json!({"payload": {"n": 2}})),
        ]);
        dispatcher.run(&mut source).await.unwrap();

        assert_eq!(source.settled, vec![Disposition::Ack, Disposition::Ack]);
        assert_eq!(sink.count(), 2);
    }
}

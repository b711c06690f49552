//! Normalizer for beetmover release task-completed messages.
//!
//! The live message carries only a task pointer; task metadata is
//! fetched and its `extra.build_props` block massaged into the
//! build-completed schema the downstream consumer expects: `tree` is
//! reconstructed as `release-<branch>`, `product` forced to the fixed
//! release product, and `buildid` synthesized from the task's most
//! recent run timestamp. One record is emitted per surviving locale.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::artifacts::ArtifactFetcher;
use crate::error::{NormalizeError, RejectReason};
use crate::normalize::{Filtered, MessageNormalizer, build_id_string, task_id};
use crate::policy::PolicyStore;
use crate::request::{MessageFamily, TestKind, TestRequest, TransportMeta};
use crate::revision::{FULL_REVISION_LEN, RevisionResolver};
use crate::routing::match_release_cc;

/// Beetmover moves exactly one product.
const RELEASE_PRODUCT: &str = "firefox";

/// Scheduled-run timestamps as the task queue reports them.
const SCHEDULED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Turns a beetmover task-completed message into per-locale requests.
pub struct ReleaseNormalizer {
    policy: Arc<PolicyStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    resolver: Arc<dyn RevisionResolver>,
}

impl ReleaseNormalizer {
    pub fn new(
        policy: Arc<PolicyStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
        resolver: Arc<dyn RevisionResolver>,
    ) -> Self {
        Self {
            policy,
            fetcher,
            resolver,
        }
    }
}

/// Build identifier from the task's most recent run, in the same
/// `YYYYMMDDHHMM` shape build messages carry natively.
fn synthesize_build_id(body: &Value) -> Option<String> {
    let scheduled = body
        .get("status")?
        .get("runs")?
        .as_array()?
        .last()?
        .get("scheduled")?
        .as_str()?;
    let parsed = NaiveDateTime::parse_from_str(scheduled, SCHEDULED_FORMAT).ok()?;
    Some(parsed.format("%Y%m%d%H%M").to_string())
}

/// Fields consumed from a massaged release manifest.
#[derive(Debug, Deserialize)]
struct ReleaseFields {
    tree: String,
    product: String,
    platform: String,
    branch: Option<String>,
    #[serde(default, deserialize_with = "build_id_string::deserialize")]
    buildid: Option<String>,
    version: Option<String>,
    revision: Option<String>,
    locale: Option<String>,
    #[serde(default)]
    locales: Vec<String>,
}

#[async_trait]
impl MessageNormalizer for ReleaseNormalizer {
    fn family(&self) -> MessageFamily {
        MessageFamily::Release
    }

    async fn preprocess(
        &self,
        body: &Value,
        meta: Option<&TransportMeta>,
    ) -> Result<Filtered<Value>, NormalizeError> {
        if let Some(meta) = meta {
            debug!(cc_keys = ?meta.cc_keys, "release_cc_keys");
            let Some(found) = meta.cc_keys.iter().find_map(|key| match_release_cc(key)) else {
                return Ok(Filtered::Reject(RejectReason::RoutingKeyMismatch));
            };
            // Policy trees for releases carry the release- prefix the
            // carbon-copy key lacks.
            let tree = format!("release-{}", found.tree);
            if !self.policy.is_valid_tree(&tree) {
                return Ok(Filtered::Reject(RejectReason::Tree(tree)));
            }
        }

        // Replayed messages already carry the manifest.
        if body.get("workerId").is_none() {
            return Ok(Filtered::Pass(body.clone()));
        }

        let task_id = task_id(body)?;
        let task = self.fetcher.fetch_task(task_id).await?;

        let props = task.get("extra").and_then(|extra| extra.get("build_props"));
        let Some(Value::Object(mut manifest)) = props.cloned() else {
            return Err(NormalizeError::MissingField("extra.build_props"));
        };

        let branch = manifest
            .get("branch")
            .and_then(Value::as_str)
            .ok_or(NormalizeError::MissingField("branch"))?
            .to_string();

        // Downstream consumes the build-completed schema; fill in the
        // fields beetmover does not carry.
        manifest.insert(
            "tree".to_string(),
            Value::String(format!("release-{branch}")),
        );
        manifest.insert(
            "product".to_string(),
            Value::String(RELEASE_PRODUCT.to_string()),
        );

        match synthesize_build_id(body) {
            Some(build_id) => {
                manifest.insert("buildid".to_string(), Value::String(build_id));
            }
            None => debug!(task_id = %task_id, "release_buildid_unavailable"),
        }

        Ok(Filtered::Pass(Value::Object(manifest)))
    }

    async fn validate_and_emit(
        &self,
        payload: Value,
    ) -> Result<Filtered<Vec<TestRequest>>, NormalizeError> {
        let fields: ReleaseFields = serde_json::from_value(payload.clone())
            .map_err(|err| NormalizeError::MalformedPayload(err.to_string()))?;

        let tree = fields.tree;
        if !self.policy.is_valid_tree(&tree) {
            return Ok(Filtered::Reject(RejectReason::Tree(tree)));
        }

        let product_check = fields.product.to_lowercase();
        if !self.policy.is_valid_product(&tree, &product_check) {
            return Ok(Filtered::Reject(RejectReason::Product(product_check)));
        }

        if !self.policy.is_valid_platform(&tree, &fields.platform) {
            return Ok(Filtered::Reject(RejectReason::Platform(fields.platform)));
        }

        // Message-level requirements come before the locale fan-out so
        // a transient resolution failure surfaces once for the whole
        // message instead of being swallowed per locale.
        let branch = fields
            .branch
            .ok_or(NormalizeError::MissingField("branch"))?;
        let version = fields
            .version
            .ok_or(NormalizeError::MissingField("version"))?;
        let build_id = fields
            .buildid
            .ok_or(NormalizeError::MissingField("buildid"))?;
        let revision = match fields.revision {
            Some(revision) if revision.len() < FULL_REVISION_LEN => {
                self.resolver.resolve(&branch, &revision).await?
            }
            Some(revision) => revision,
            None => return Err(NormalizeError::MissingField("revision")),
        };

        let locales = match fields.locale {
            Some(locale) => vec![locale],
            None => fields.locales,
        };

        let mut requests = Vec::new();
        for locale in locales {
            if !self.policy.is_valid_locale(&tree, &locale) {
                info!(locale = %locale, tree = %tree, "release_locale_rejected");
                continue;
            }
            requests.push(TestRequest {
                kind: TestKind::ReleaseLocale,
                tree: tree.clone(),
                branch: branch.clone(),
                product: fields.product.clone(),
                platform: fields.platform.clone(),
                locale,
                revision: revision.clone(),
                build_id: build_id.clone(),
                build_number: None,
                version: Some(version.clone()),
                repository_url: None,
                build_url: None,
                status: None,
                test_packages_url: None,
                target_build_id: None,
                target_version: None,
                update_number: None,
                tags: Vec::new(),
                raw_payload: payload.clone(),
            });
        }
        Ok(Filtered::Pass(requests))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::policy::TreePolicy;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedTaskFetcher {
        task: Value,
        requests: Mutex<Vec<String>>,
    }

    impl FixedTaskFetcher {
        fn new(task: Value) -> Self {
            Self {
                task,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ArtifactFetcher for FixedTaskFetcher {
        async fn fetch_manifest(
            &self,
            _task_id: &str,
            _artifact_path: &str,
        ) -> Result<Value, FetchError> {
            panic!("release normalization never fetches artifacts");
        }

        async fn fetch_task(&self, task_id: &str) -> Result<Value, FetchError> {
            self.requests.lock().unwrap().push(task_id.to_string());
            Ok(self.task.clone())
        }
    }

    struct FixedResolver {
        node: &'static str,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl FixedResolver {
        fn new(node: &'static str) -> Self {
            Self {
                node,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RevisionResolver for FixedResolver {
        async fn resolve(&self, branch: &str, short_revision: &str) -> Result<String, FetchError> {
            self.seen
                .lock()
                .unwrap()
                .push((branch.to_string(), short_revision.to_string()));
            Ok(self.node.to_string())
        }
    }

    const FULL_REVISION: &str = "59f372c35b2416ac84d6572d64c49227481a8a6c";

    fn policy_for_beta(locales: &[&str]) -> Arc<PolicyStore> {
        let mut trees = HashMap::new();
        trees.insert(
            "release-mozilla-beta".to_string(),
            TreePolicy {
                locales: locales.iter().map(|l| l.to_string()).collect(),
                ..Default::default()
            },
        );
        Arc::new(PolicyStore::new(trees))
    }

    fn normalizer(
        policy: Arc<PolicyStore>,
        fetcher: Arc<FixedTaskFetcher>,
        resolver: Arc<FixedResolver>,
    ) -> ReleaseNormalizer {
        ReleaseNormalizer::new(policy, fetcher, resolver)
    }

    fn task_body() -> Value {
        json!({
            "workerId": "i-0abc",
            "status": {
                "taskId": "Trel456",
                "runs": [
                    {"runId": 0, "scheduled": "2016-08-11T22:01:05.761Z"},
                    {"runId": 1, "scheduled": "2016-08-12T00:40:13.519Z"}
                ]
            }
        })
    }

    fn task_metadata() -> Value {
        json!({
            "extra": {
                "build_props": {
                    "branch": "mozilla-beta",
                    "platform": "win64",
                    "version": "49.0b3",
                    "revision": FULL_REVISION,
                    "locales": ["en-US", "de"]
                }
            }
        })
    }

    fn beetmover_meta() -> TransportMeta {
        TransportMeta {
            routing_key: "task.completed".to_string(),
            cc_keys: vec![
                "route.index.releases.v1.mozilla-beta.latest.firefox.latest.beetmover.en_US.win64"
                    .to_string(),
            ],
        }
    }

    #[tokio::test]
    async fn live_delivery_builds_the_manifest_from_task_metadata() {
        let fetcher = Arc::new(FixedTaskFetcher::new(task_metadata()));
        let resolver = Arc::new(FixedResolver::new(FULL_REVISION));
        let normalizer = normalizer(policy_for_beta(&[]), fetcher.clone(), resolver);

        let Filtered::Pass(manifest) = normalizer
            .preprocess(&task_body(), Some(&beetmover_meta()))
            .await
            .unwrap()
        else {
            panic!("matching delivery should pass");
        };

        assert_eq!(fetcher.requested(), vec!["Trel456".to_string()]);
        assert_eq!(manifest["tree"], json!("release-mozilla-beta"));
        assert_eq!(manifest["product"], json!("firefox"));
        // Most recent run scheduled 2016-08-12T00:40:13.519Z.
        assert_eq!(manifest["buildid"], json!("201608120040"));
        assert_eq!(manifest["locales"], json!(["en-US", "de"]));
    }

    #[tokio::test]
    async fn unmatched_cc_keys_reject_without_fetching() {
        let fetcher = Arc::new(FixedTaskFetcher::new(task_metadata()));
        let resolver = Arc::new(FixedResolver::new(FULL_REVISION));
        let normalizer = normalizer(policy_for_beta(&[]), fetcher.clone(), resolver);

        let meta = TransportMeta {
            routing_key: "task.completed".to_string(),
            cc_keys: vec!["index.funsize.v1.mozilla-beta.latest.win64.1.2.balrog".to_string()],
        };
        let outcome = normalizer
            .preprocess(&task_body(), Some(&meta))
            .await
            .unwrap();
        assert_eq!(outcome, Filtered::Reject(RejectReason::RoutingKeyMismatch));
        assert!(fetcher.requested().is_empty());
    }

    #[tokio::test]
    async fn foreign_tree_in_cc_key_rejects_without_fetching() {
        let fetcher = Arc::new(FixedTaskFetcher::new(task_metadata()));
        let resolver = Arc::new(FixedResolver::new(FULL_REVISION));
        let normalizer = normalizer(policy_for_beta(&[]), fetcher.clone(), resolver);

        let meta = TransportMeta {
            routing_key: "task.completed".to_string(),
            cc_keys: vec![
                "route.index.releases.v1.oak.latest.firefox.latest.beetmover.en_US.win64"
                    .to_string(),
            ],
        };
        let outcome = normalizer
            .preprocess(&task_body(), Some(&meta))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Filtered::Reject(RejectReason::Tree("release-oak".into()))
        );
        assert!(fetcher.requested().is_empty());
    }

    #[tokio::test]
    async fn replayed_manifest_skips_the_fetch() {
        let fetcher = Arc::new(FixedTaskFetcher::new(task_metadata()));
        let resolver = Arc::new(FixedResolver::new(FULL_REVISION));
        let normalizer = normalizer(policy_for_beta(&[]), fetcher.clone(), resolver);

        let body = json!({
            "tree": "release-mozilla-beta",
            "product": "firefox",
            "platform": "win64",
            "locale": "en-US"
        });
        let Filtered::Pass(out) = normalizer.preprocess(&body, None).await.unwrap() else {
            panic!("replayed manifest should pass");
        };
        assert_eq!(out, body);
        assert!(fetcher.requested().is_empty());
    }

    #[tokio::test]
    async fn missing_build_props_is_an_error() {
        let fetcher = Arc::new(FixedTaskFetcher::new(json!({"extra": {}})));
        let resolver = Arc::new(FixedResolver::new(FULL_REVISION));
        let normalizer = normalizer(policy_for_beta(&[]), fetcher, resolver);

        let err = normalizer
            .preprocess(&task_body(), Some(&beetmover_meta()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::MissingField("extra.build_props")
        ));
    }

    #[tokio::test]
    async fn unparseable_run_timestamp_leaves_buildid_absent() {
        let fetcher = Arc::new(FixedTaskFetcher::new(task_metadata()));
        let resolver = Arc::new(FixedResolver::new(FULL_REVISION));
        let normalizer = normalizer(policy_for_beta(&[]), fetcher, resolver);

        let mut body = task_body();
        body["status"]["runs"][1]["scheduled"] = json!("not a timestamp");
        let Filtered::Pass(manifest) = normalizer
            .preprocess(&body, Some(&beetmover_meta()))
            .await
            .unwrap()
        else {
            panic!("delivery should still pass");
        };
        assert!(manifest.get("buildid").is_none());
    }

    #[tokio::test]
    async fn fans_out_per_locale_with_isolation() {
        let fetcher = Arc::new(FixedTaskFetcher::new(task_metadata()));
        let resolver = Arc::new(FixedResolver::new(FULL_REVISION));
        let normalizer = normalizer(policy_for_beta(&["en-US", "de"]), fetcher, resolver.clone());

        let payload = json!({
            "tree": "release-mozilla-beta",
            "branch": "mozilla-beta",
            "product": "firefox",
            "platform": "win64",
            "version": "49.0b3",
            "revision": FULL_REVISION,
            "buildid": "201608120040",
            "locales": ["en-US", "xx-INVALID"]
        });

        let Filtered::Pass(requests) = normalizer.validate_and_emit(payload.clone()).await.unwrap()
        else {
            panic!("fan-out should pass");
        };

        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.kind, TestKind::ReleaseLocale);
        assert_eq!(request.locale, "en-US");
        assert_eq!(request.tree, "release-mozilla-beta");
        assert_eq!(request.branch, "mozilla-beta");
        assert_eq!(request.build_id, "201608120040");
        assert_eq!(request.version.as_deref(), Some("49.0b3"));
        assert!(request.repository_url.is_none());
        // Full-length revisions are not re-resolved.
        assert!(resolver.seen.lock().unwrap().is_empty());
        // The raw payload keeps the full locales list.
        assert_eq!(request.raw_payload, payload);
    }

    #[tokio::test]
    async fn short_revision_is_resolved_against_the_branch() {
        let fetcher = Arc::new(FixedTaskFetcher::new(task_metadata()));
        let resolver = Arc::new(FixedResolver::new(FULL_REVISION));
        let normalizer = normalizer(policy_for_beta(&[]), fetcher, resolver.clone());

        let payload = json!({
            "tree": "release-mozilla-beta",
            "branch": "mozilla-beta",
            "product": "firefox",
            "platform": "win64",
            "version": "49.0b3",
            "revision": "59f372c35b24",
            "buildid": "201608120040",
            "locale": "en-US"
        });

        let Filtered::Pass(requests) = normalizer.validate_and_emit(payload).await.unwrap() else {
            panic!("single-locale payload should pass");
        };
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].revision, FULL_REVISION);
        assert_eq!(
            resolver.seen.lock().unwrap().clone(),
            vec![("mozilla-beta".to_string(), "59f372c35b24".to_string())]
        );
    }
}

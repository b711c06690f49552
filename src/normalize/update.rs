//! Normalizer for funsize update-available messages.
//!
//! Live deliveries carry only a task pointer; the update manifest is
//! fetched from the task's artifacts after the carbon-copy keys pass a
//! cheap tree/platform pre-filter. A manifest describes one or more
//! updates, each validated and emitted independently.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::artifacts::ArtifactFetcher;
use crate::error::{NormalizeError, RejectReason};
use crate::normalize::{Filtered, MessageNormalizer, build_id_string, task_id};
use crate::policy::PolicyStore;
use crate::request::{MessageFamily, TestKind, TestRequest, TransportMeta};
use crate::routing::match_update_cc;

/// Artifact holding the update manifest on the completed task.
const MANIFEST_ARTIFACT: &str = "public/env/manifest.json";

/// Turns a funsize task-completed message into update test requests.
pub struct UpdateNormalizer {
    policy: Arc<PolicyStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl UpdateNormalizer {
    pub fn new(policy: Arc<PolicyStore>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self { policy, fetcher }
    }

    fn normalize_element(&self, element: &Value) -> Result<Filtered<TestRequest>, NormalizeError> {
        let fields: UpdateFields = serde_json::from_value(element.clone())
            .map_err(|err| NormalizeError::MalformedPayload(err.to_string()))?;

        // Updates carry no separate tree name; the branch is both.
        let tree = fields.branch;
        if !self.policy.is_valid_tree(&tree) {
            return Ok(Filtered::Reject(RejectReason::Tree(tree)));
        }

        let product = fields.app_name.to_lowercase();
        if !self.policy.is_valid_product(&tree, &product) {
            return Ok(Filtered::Reject(RejectReason::Product(product)));
        }

        if !self.policy.is_valid_platform(&tree, &fields.platform) {
            return Ok(Filtered::Reject(RejectReason::Platform(fields.platform)));
        }

        if !self.policy.is_valid_locale(&tree, &fields.locale) {
            return Ok(Filtered::Reject(RejectReason::Locale(fields.locale)));
        }

        let build_id = fields
            .from_buildid
            .ok_or(NormalizeError::MissingField("from_buildid"))?;
        let target_build_id = fields
            .to_buildid
            .ok_or(NormalizeError::MissingField("to_buildid"))?;
        let target_version = fields
            .version
            .ok_or(NormalizeError::MissingField("version"))?;
        let update_number = fields
            .update_number
            .ok_or(NormalizeError::MissingField("update_number"))?;
        let repository_url = fields.repo.ok_or(NormalizeError::MissingField("repo"))?;
        let revision = fields
            .revision
            .ok_or(NormalizeError::MissingField("revision"))?;

        Ok(Filtered::Pass(TestRequest {
            kind: TestKind::Update,
            tree: tree.clone(),
            branch: tree,
            product,
            platform: fields.platform,
            locale: fields.locale,
            revision,
            build_id,
            build_number: None,
            version: None,
            repository_url: Some(repository_url),
            build_url: None,
            status: None,
            test_packages_url: None,
            target_build_id: Some(target_build_id),
            target_version: Some(target_version),
            update_number: Some(update_number),
            tags: Vec::new(),
            raw_payload: element.clone(),
        }))
    }
}

/// Fields consumed from one update entry of the manifest. The manifest
/// names the update's own version as `version`; for the canonical
/// record that is the target version.
#[derive(Debug, Deserialize)]
struct UpdateFields {
    branch: String,
    #[serde(rename = "appName")]
    app_name: String,
    platform: String,
    locale: String,
    #[serde(default, deserialize_with = "build_id_string::deserialize")]
    from_buildid: Option<String>,
    #[serde(default, deserialize_with = "build_id_string::deserialize")]
    to_buildid: Option<String>,
    version: Option<String>,
    update_number: Option<u64>,
    repo: Option<String>,
    revision: Option<String>,
}

#[async_trait]
impl MessageNormalizer for UpdateNormalizer {
    fn family(&self) -> MessageFamily {
        MessageFamily::Update
    }

    async fn preprocess(
        &self,
        body: &Value,
        meta: Option<&TransportMeta>,
    ) -> Result<Filtered<Value>, NormalizeError> {
        if let Some(meta) = meta {
            // All entries of one message share tree and platform, so a
            // single invalid matching key rejects the whole message
            // before any fetch.
            let mut matched = false;
            for key in &meta.cc_keys {
                let Some(found) = match_update_cc(key) else {
                    continue;
                };
                debug!(
                    routing_key = %key,
                    tree = %found.tree,
                    platform = %found.platform,
                    "update_cc_key_matched"
                );

                if !self.policy.is_valid_tree(&found.tree) {
                    return Ok(Filtered::Reject(RejectReason::Tree(found.tree)));
                }
                if !self.policy.is_valid_platform(&found.tree, &found.platform) {
                    return Ok(Filtered::Reject(RejectReason::Platform(found.platform)));
                }
                matched = true;
            }
            if !matched {
                return Ok(Filtered::Reject(RejectReason::RoutingKeyMismatch));
            }
        }

        // Replayed messages already carry the manifest.
        if body.get("workerId").is_none() {
            return Ok(Filtered::Pass(body.clone()));
        }

        let task_id = task_id(body)?;
        let manifest = self.fetcher.fetch_manifest(task_id, MANIFEST_ARTIFACT).await?;
        debug!(task_id = %task_id, "update_manifest_fetched");
        Ok(Filtered::Pass(manifest))
    }

    async fn validate_and_emit(
        &self,
        payload: Value,
    ) -> Result<Filtered<Vec<TestRequest>>, NormalizeError> {
        // A replayed manifest holds a single update; the live feed
        // delivers a list of them.
        let elements = match payload {
            Value::Array(items) => items,
            other => vec![other],
        };

        let mut requests = Vec::new();
        for element in &elements {
            match self.normalize_element(element) {
                Ok(Filtered::Pass(request)) => requests.push(request),
                Ok(Filtered::Reject(reason)) => {
                    info!(reason = %reason, "update_element_rejected");
                }
                Err(err) => {
                    error!(error = %err, payload = %element, "update_element_failed");
                }
            }
        }
        Ok(Filtered::Pass(requests))
    }
}

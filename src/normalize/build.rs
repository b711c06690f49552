//! Normalizer for normalized-build completion messages.
//!
//! Builds arrive with the full payload inline (wrapped in a `payload`
//! envelope on the live feed), so preprocessing never fetches. Each
//! accepted message yields exactly one functional test request.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::config::EndpointConfig;
use crate::error::{NormalizeError, RejectReason};
use crate::normalize::{Filtered, MessageNormalizer, build_id_string};
use crate::policy::PolicyStore;
use crate::request::{MessageFamily, REFERENCE_LOCALE, TestKind, TestRequest, TransportMeta};
use crate::revision::RevisionResolver;

/// Turns a normalized-build message into a single functional request.
pub struct BuildNormalizer {
    policy: Arc<PolicyStore>,
    resolver: Arc<dyn RevisionResolver>,
    hg_url: String,
}

impl BuildNormalizer {
    pub fn new(
        policy: Arc<PolicyStore>,
        resolver: Arc<dyn RevisionResolver>,
        endpoints: &EndpointConfig,
    ) -> Self {
        Self {
            policy,
            resolver,
            hg_url: endpoints.hg_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Fields consumed from a build payload. Policy-checked fields are
/// required up front; the rest are checked individually so a missing
/// one names itself in the error.
#[derive(Debug, Deserialize)]
struct BuildFields {
    tree: String,
    product: String,
    platform: String,
    tags: Vec<String>,
    locale: String,
    revision: Option<String>,
    #[serde(default, deserialize_with = "build_id_string::deserialize")]
    buildid: Option<String>,
    build_number: Option<u64>,
    buildurl: Option<String>,
    status: Option<i64>,
    test_packages_url: Option<String>,
    version: Option<String>,
}

#[async_trait]
impl MessageNormalizer for BuildNormalizer {
    fn family(&self) -> MessageFamily {
        MessageFamily::Build
    }

    async fn preprocess(
        &self,
        body: &Value,
        _meta: Option<&TransportMeta>,
    ) -> Result<Filtered<Value>, NormalizeError> {
        // The live feed wraps the build data in a `payload` envelope;
        // replayed messages carry it bare.
        let payload = body.get("payload").cloned().unwrap_or_else(|| body.clone());
        Ok(Filtered::Pass(payload))
    }

    async fn validate_and_emit(
        &self,
        payload: Value,
    ) -> Result<Filtered<Vec<TestRequest>>, NormalizeError> {
        let fields: BuildFields = serde_json::from_value(payload.clone())
            .map_err(|err| NormalizeError::MalformedPayload(err.to_string()))?;

        let tree = fields.tree;
        if !self.policy.is_valid_tree(&tree) {
            return Ok(Filtered::Reject(RejectReason::Tree(tree)));
        }

        let product = fields.product.to_lowercase();
        if !self.policy.is_valid_product(&tree, &product) {
            return Ok(Filtered::Reject(RejectReason::Product(product)));
        }

        if !self.policy.is_valid_platform(&tree, &fields.platform) {
            return Ok(Filtered::Reject(RejectReason::Platform(fields.platform)));
        }

        if !self.policy.has_required_tags(&tree, &fields.tags) {
            return Ok(Filtered::Reject(RejectReason::Tags(fields.tags)));
        }

        if !self.policy.is_valid_locale(&tree, &fields.locale) {
            return Ok(Filtered::Reject(RejectReason::Locale(fields.locale)));
        }

        // Candidate builds for betas and releases arrive on trees named
        // release-mozilla-(release|beta|esrXX); the checkout branch is
        // the name without that prefix.
        let branch = tree.strip_prefix("release-").unwrap_or(&tree).to_string();

        let repository_url = format!(
            "{}/{}{}",
            self.hg_url,
            if tree.ends_with("-central") { "" } else { "releases/" },
            branch,
        );

        // Repack builds report the reference locale's URL, which is
        // meaningless for any other locale.
        let build_url = if fields.locale == REFERENCE_LOCALE {
            Some(
                fields
                    .buildurl
                    .ok_or(NormalizeError::MissingField("buildurl"))?,
            )
        } else {
            None
        };

        let build_id = fields
            .buildid
            .ok_or(NormalizeError::MissingField("buildid"))?;
        let status = fields.status.ok_or(NormalizeError::MissingField("status"))?;
        let test_packages_url = fields
            .test_packages_url
            .ok_or(NormalizeError::MissingField("test_packages_url"))?;
        let version = fields
            .version
            .ok_or(NormalizeError::MissingField("version"))?;
        let short_revision = fields
            .revision
            .ok_or(NormalizeError::MissingField("revision"))?;

        let revision = self.resolver.resolve(&branch, &short_revision).await?;

        let request = TestRequest {
            kind: TestKind::Functional,
            tree,
            branch,
            product,
            platform: fields.platform,
            locale: fields.locale,
            revision,
            build_id,
            build_number: fields.build_number,
            version: Some(version),
            repository_url: Some(repository_url),
            build_url,
            status: Some(status),
            test_packages_url: Some(test_packages_url),
            target_build_id: None,
            target_version: None,
            update_number: None,
            tags: fields.tags,
            raw_payload: payload,
        };

        Ok(Filtered::Pass(vec![request]))
    }
}

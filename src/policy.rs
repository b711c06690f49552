//! Per-tree filtering policy.
//!
//! The policy document maps a tree name to the products, platforms,
//! locales, and tags worth testing on that tree. Empty lists are
//! wildcards; the locale list is paired with an explicit block-list that
//! wins over it. The store is immutable after load and shared read-only
//! across all dispatchers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Allow/deny lists for one tree.
///
/// All lists default to empty, which means "no restriction" everywhere
/// except `blacklist`, where an empty list blocks nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreePolicy {
    #[serde(default)]
    pub products: Vec<String>,

    #[serde(default)]
    pub platforms: Vec<String>,

    /// Locale whitelist; empty accepts every locale not blacklisted.
    #[serde(default)]
    pub locales: Vec<String>,

    /// Locales to drop even when the whitelist would accept them.
    #[serde(default)]
    pub blacklist: LocaleBlacklist,

    /// Tags a message must all carry to be accepted.
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleBlacklist {
    #[serde(default)]
    pub locales: Vec<String>,
}

/// Read-only lookup over the loaded policy document.
///
/// Every check is pure and total. A tree missing from a non-empty
/// document fails every check; `is_valid_tree` alone carries the
/// wildcard rule that an empty document accepts all trees.
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    trees: HashMap<String, TreePolicy>,
}

impl PolicyStore {
    pub fn new(trees: HashMap<String, TreePolicy>) -> Self {
        Self { trees }
    }

    pub fn is_valid_tree(&self, tree: &str) -> bool {
        self.trees.is_empty() || self.trees.contains_key(tree)
    }

    pub fn is_valid_product(&self, tree: &str, product: &str) -> bool {
        let Some(policy) = self.trees.get(tree) else {
            return false;
        };
        policy.products.is_empty() || policy.products.iter().any(|p| p == product)
    }

    pub fn is_valid_platform(&self, tree: &str, platform: &str) -> bool {
        let Some(policy) = self.trees.get(tree) else {
            return false;
        };
        policy.platforms.is_empty() || policy.platforms.iter().any(|p| p == platform)
    }

    /// A locale is valid iff it is not blacklisted and the whitelist is
    /// either empty or contains it.
    pub fn is_valid_locale(&self, tree: &str, locale: &str) -> bool {
        let Some(policy) = self.trees.get(tree) else {
            return false;
        };
        let blocked = policy.blacklist.locales.iter().any(|l| l == locale);
        let allowed = policy.locales.is_empty() || policy.locales.iter().any(|l| l == locale);
        !blocked && allowed
    }

    /// True when the message's tags cover every tag the tree requires.
    /// A tree without required tags accepts any tag set.
    pub fn has_required_tags(&self, tree: &str, tags: &[String]) -> bool {
        let Some(policy) = self.trees.get(tree) else {
            return false;
        };
        policy.tags.iter().all(|required| tags.contains(required))
    }
}

// src/rules/file.rs — Rule set loaded from a TOML file

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::{PermissionRule, PricingRule, RuleSource, TierPolicy};
use crate::core::types::Tier;
use crate::infra::errors::GenTaskError;

/// On-disk shape of a rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub pricing: Vec<PricingRule>,
    #[serde(default)]
    pub permissions: Vec<PermissionRule>,
    #[serde(default)]
    pub tiers: Vec<TierPolicy>,
}

/// Immutable in-memory rules. Later duplicates of a key override earlier ones.
#[derive(Debug, Clone, Default)]
pub struct StaticRules {
    pricing: HashMap<String, PricingRule>,
    permissions: HashMap<(String, Tier), PermissionRule>,
    tiers: HashMap<Tier, TierPolicy>,
}

impl StaticRules {
    pub fn new(set: RuleSet) -> Self {
        Self {
            pricing: set
                .pricing
                .into_iter()
                .map(|r| (r.key.clone(), r))
                .collect(),
            permissions: set
                .permissions
                .into_iter()
                .map(|r| ((r.key.clone(), r.tier), r))
                .collect(),
            tiers: set.tiers.into_iter().map(|t| (t.tier, t)).collect(),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, GenTaskError> {
        let set: RuleSet = toml::from_str(content)
            .map_err(|e| GenTaskError::Config(format!("invalid rules file: {e}")))?;
        Ok(Self::new(set))
    }

    pub fn load(path: &Path) -> Result<Self, GenTaskError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn len(&self) -> usize {
        self.pricing.len() + self.permissions.len() + self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RuleSource for StaticRules {
    async fn pricing_rule(&self, key: &str) -> Result<Option<PricingRule>, GenTaskError> {
        Ok(self.pricing.get(key).cloned())
    }

    async fn permission_rule(
        &self,
        key: &str,
        tier: Tier,
    ) -> Result<Option<PermissionRule>, GenTaskError> {
        Ok(self.permissions.get(&(key.to_string(), tier)).cloned())
    }

    async fn tier_policy(&self, tier: Tier) -> Result<Option<TierPolicy>, GenTaskError> {
        Ok(self.tiers.get(&tier).cloned())
    }
}

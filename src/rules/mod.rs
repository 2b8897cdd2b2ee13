// src/rules/mod.rs — Pricing, permission and tier-policy configuration

pub mod cache;
pub mod file;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::types::{CapabilityRef, Tier};
use crate::infra::errors::GenTaskError;

pub use cache::CachedRules;
pub use file::StaticRules;

/// How a pricing rule turns quantities into credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    PerRequest,
    PerImage,
    PerDuration,
    DurationResolution,
    PerCharacter,
    DurationMode,
    OperationMode,
}

impl BillingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingType::PerRequest => "per_request",
            BillingType::PerImage => "per_image",
            BillingType::PerDuration => "per_duration",
            BillingType::DurationResolution => "duration_resolution",
            BillingType::PerCharacter => "per_character",
            BillingType::DurationMode => "duration_mode",
            BillingType::OperationMode => "operation_mode",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingUnit {
    #[default]
    PerSecond,
    PerRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceDimension {
    Resolution,
    Mode,
    OperationType,
    Characters,
}

/// One price point of a rule, e.g. `{ dimension = "resolution", value = "720p_5", credits_per_unit = 40 }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub dimension: PriceDimension,
    #[serde(default)]
    pub value: String,
    pub credits_per_unit: f64,
    #[serde(default)]
    pub unit_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    /// Capability key this rule applies to (`model:…`, `node:…` or `module:…`).
    pub key: String,
    pub billing_type: BillingType,
    #[serde(default)]
    pub base_credits: f64,
    #[serde(default)]
    pub prices: Vec<PriceEntry>,
    #[serde(default)]
    pub round_up: Option<bool>,
    #[serde(default)]
    pub pricing_unit: PricingUnit,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// What a tier may do with a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub key: String,
    pub tier: Tier,
    #[serde(default = "default_true")]
    pub allowed: bool,
    /// Daily use cap; `None` is unlimited.
    #[serde(default)]
    pub daily_limit: Option<u32>,
    /// Uses per day granted without a charge.
    #[serde(default)]
    pub free_daily_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub tier: Tier,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    /// Daily gift tops the balance up to this amount.
    #[serde(default)]
    pub daily_gift_credits: i64,
    /// Gift window in days from account creation; 0 means no window.
    #[serde(default)]
    pub gift_days: u32,
}

impl TierPolicy {
    pub fn default_for(tier: Tier) -> Self {
        Self {
            tier,
            max_concurrency: default_max_concurrency(),
            daily_gift_credits: 0,
            gift_days: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrency() -> u32 {
    1
}

/// Configuration-store boundary. Lookups are by exact key; callers resolve
/// a `CapabilityRef` through `resolve_pricing` / `resolve_permission`.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn pricing_rule(&self, key: &str) -> Result<Option<PricingRule>, GenTaskError>;

    async fn permission_rule(
        &self,
        key: &str,
        tier: Tier,
    ) -> Result<Option<PermissionRule>, GenTaskError>;

    async fn tier_policy(&self, tier: Tier) -> Result<Option<TierPolicy>, GenTaskError>;
}

/// First configured pricing rule in capability lookup order.
pub async fn resolve_pricing(
    rules: &dyn RuleSource,
    capability: &CapabilityRef,
) -> Result<Option<PricingRule>, GenTaskError> {
    for key in capability.lookup_keys() {
        if let Some(rule) = rules.pricing_rule(&key).await? {
            return Ok(Some(rule));
        }
    }
    Ok(None)
}

/// First configured permission rule for the tier in capability lookup order.
pub async fn resolve_permission(
    rules: &dyn RuleSource,
    capability: &CapabilityRef,
    tier: Tier,
) -> Result<Option<PermissionRule>, GenTaskError> {
    for key in capability.lookup_keys() {
        if let Some(rule) = rules.permission_rule(&key, tier).await? {
            return Ok(Some(rule));
        }
    }
    Ok(None)
}

/// Tier policy, falling back to defaults (one task in flight, no gift).
pub async fn resolve_tier_policy(
    rules: &dyn RuleSource,
    tier: Tier,
) -> Result<TierPolicy, GenTaskError> {
    Ok(rules
        .tier_policy(tier)
        .await?
        .unwrap_or_else(|| TierPolicy::default_for(tier)))
}

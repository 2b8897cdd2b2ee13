// src/core/entitlement.rs — Entitlement gate
//
// Decides whether a user may invoke a capability today and whether the use
// is free. Checking has no side effects; counters move only through
// `record_usage`, after the task exists.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::core::types::{CapabilityRef, Tier, UserAccount};
use crate::infra::errors::GenTaskError;
use crate::rules::{resolve_permission, RuleSource};
use crate::store::{UsageStore, UserDirectory};

/// Usage counters roll over at midnight UTC.
pub fn usage_day(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// A lapsed membership counts as the plain tier. Computed on every call.
pub fn effective_tier(account: &UserAccount, now: DateTime<Utc>) -> Tier {
    match account.membership_expires_at {
        Some(expires) if account.tier.is_membership() && expires <= now => Tier::User,
        _ => account.tier,
    }
}

/// Load the account and compute its effective tier at `now`.
pub async fn resolve_tier(
    users: &dyn UserDirectory,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<(UserAccount, Tier), GenTaskError> {
    let account = users
        .account(user_id)
        .await?
        .ok_or_else(|| GenTaskError::UserNotFound(user_id.to_string()))?;
    let tier = effective_tier(&account, now);
    Ok((account, tier))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The tier may not use this capability at all.
    NotPermitted,
    QuotaExhausted { used: u32, limit: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub is_free: bool,
    /// Free uses left today after this one; `None` when no free allowance applies.
    pub free_remaining: Option<u32>,
    pub tier: Tier,
}

impl PermissionDecision {
    fn allow(tier: Tier, is_free: bool, free_remaining: Option<u32>) -> Self {
        Self {
            allowed: true,
            reason: None,
            is_free,
            free_remaining,
            tier,
        }
    }

    fn deny(tier: Tier, reason: DenyReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            is_free: false,
            free_remaining: None,
            tier,
        }
    }

    /// Turn a denial into the matching rejection error.
    pub fn ensure_allowed(&self, capability: &CapabilityRef) -> Result<(), GenTaskError> {
        match self.reason {
            None => Ok(()),
            Some(DenyReason::NotPermitted) => Err(GenTaskError::PermissionDenied {
                reason: format!("tier '{}' may not use {capability}", self.tier),
            }),
            Some(DenyReason::QuotaExhausted { used, limit }) => Err(GenTaskError::QuotaExhausted {
                capability: capability.to_string(),
                used,
                limit,
            }),
        }
    }
}

pub struct EntitlementGate {
    users: Arc<dyn UserDirectory>,
    usage: Arc<dyn UsageStore>,
    rules: Arc<dyn RuleSource>,
}

impl EntitlementGate {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        usage: Arc<dyn UsageStore>,
        rules: Arc<dyn RuleSource>,
    ) -> Self {
        Self {
            users,
            usage,
            rules,
        }
    }

    pub async fn check_permission(
        &self,
        user_id: &str,
        capability: &CapabilityRef,
    ) -> Result<PermissionDecision, GenTaskError> {
        self.check_permission_at(user_id, capability, Utc::now()).await
    }

    pub async fn check_permission_at(
        &self,
        user_id: &str,
        capability: &CapabilityRef,
        now: DateTime<Utc>,
    ) -> Result<PermissionDecision, GenTaskError> {
        let (_, tier) = resolve_tier(self.users.as_ref(), user_id, now).await?;

        if tier.is_privileged() {
            return Ok(PermissionDecision::allow(tier, true, None));
        }

        let Some(rule) = resolve_permission(self.rules.as_ref(), capability, tier).await? else {
            return Ok(PermissionDecision::allow(tier, false, None));
        };

        if !rule.allowed {
            tracing::debug!(user_id, %capability, %tier, "Capability not permitted for tier");
            return Ok(PermissionDecision::deny(tier, DenyReason::NotPermitted));
        }

        // Counters are kept under the key of the rule that matched, so a
        // module-level limit spans every model of that module.
        let counters = self
            .usage
            .usage(user_id, &rule.key, &usage_day(now))
            .await?;

        if let Some(limit) = rule.daily_limit {
            if counters.used >= limit {
                tracing::debug!(user_id, %capability, used = counters.used, limit, "Daily quota exhausted");
                return Ok(PermissionDecision::deny(
                    tier,
                    DenyReason::QuotaExhausted {
                        used: counters.used,
                        limit,
                    },
                ));
            }
        }

        if rule.free_daily_limit == 0 {
            return Ok(PermissionDecision::allow(tier, false, None));
        }
        if counters.free_used < rule.free_daily_limit {
            let remaining = rule.free_daily_limit - counters.free_used - 1;
            Ok(PermissionDecision::allow(tier, true, Some(remaining)))
        } else {
            Ok(PermissionDecision::allow(tier, false, Some(0)))
        }
    }

    /// Count one use (and one free use when `was_free`) for today.
    pub async fn record_usage(
        &self,
        user_id: &str,
        capability: &CapabilityRef,
        was_free: bool,
    ) -> Result<(), GenTaskError> {
        let now = Utc::now();
        let (_, tier) = resolve_tier(self.users.as_ref(), user_id, now).await?;
        let key = match resolve_permission(self.rules.as_ref(), capability, tier).await? {
            Some(rule) => rule.key,
            None => capability.usage_key(),
        };
        self.usage
            .record_usage(user_id, &key, &usage_day(now), was_free)
            .await
    }
}

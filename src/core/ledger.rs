// src/core/ledger.rs — Credit ledger
//
// Prices operations from the configured rules and moves credits through the
// ledger store. Free operations are recorded as zero-amount entries so every
// task carries the same billing linkage.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::core::entitlement::{resolve_tier, usage_day};
use crate::core::pricing::{compute_cost, QuantityParams};
use crate::core::types::{CapabilityRef, CreditTransaction, LedgerEntry, RefundOutcome, TransactionKind};
use crate::infra::errors::GenTaskError;
use crate::rules::{resolve_pricing, resolve_tier_policy, RuleSource};
use crate::store::{LedgerStore, NewLedgerEntry, UserDirectory};

pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    users: Arc<dyn UserDirectory>,
    rules: Arc<dyn RuleSource>,
}

impl CreditLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        users: Arc<dyn UserDirectory>,
        rules: Arc<dyn RuleSource>,
    ) -> Self {
        Self {
            store,
            users,
            rules,
        }
    }

    /// Cost preview. Only the rule lookup touches the store.
    pub async fn estimate(
        &self,
        capability: &CapabilityRef,
        quantity: &QuantityParams,
    ) -> Result<i64, GenTaskError> {
        let rule = resolve_pricing(self.rules.as_ref(), capability).await?;
        Ok(compute_cost(rule.as_ref(), quantity))
    }

    /// Price an operation into a debit that has not been written yet.
    pub async fn quote(
        &self,
        user_id: &str,
        capability: &CapabilityRef,
        quantity: &QuantityParams,
        is_free: bool,
        task_id: Option<&str>,
    ) -> Result<NewLedgerEntry, GenTaskError> {
        let amount = if is_free {
            0
        } else {
            self.estimate(capability, quantity).await?
        };
        Ok(NewLedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            task_id: task_id.map(str::to_string),
            capability: capability.usage_key(),
            amount,
            is_free,
            description: format!("{capability}"),
        })
    }

    /// Debit the priced cost (or record a zero entry when `is_free`).
    pub async fn charge(
        &self,
        user_id: &str,
        capability: &CapabilityRef,
        quantity: &QuantityParams,
        is_free: bool,
        task_id: Option<&str>,
    ) -> Result<LedgerEntry, GenTaskError> {
        let pending = self
            .quote(user_id, capability, quantity, is_free, task_id)
            .await?;
        let entry = self.store.charge(pending).await?;

        tracing::debug!(
            user_id,
            entry_id = %entry.id,
            credits = entry.amount,
            is_free,
            "Charged"
        );
        Ok(entry)
    }

    /// Idempotent. A repeated refund is reported, never double-credited.
    pub async fn refund(&self, entry_id: &str, reason: &str) -> Result<RefundOutcome, GenTaskError> {
        let outcome = self.store.refund(entry_id, reason).await?;
        match outcome {
            RefundOutcome::Refunded { amount, balance } => {
                tracing::info!(entry_id, credits = amount, balance, "Refunded");
            }
            RefundOutcome::AlreadyRefunded => {
                tracing::warn!(entry_id, "Refund skipped: entry already refunded");
            }
        }
        Ok(outcome)
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64, GenTaskError> {
        self.store.balance(user_id).await
    }

    /// Operator top-up. Returns the new balance.
    pub async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<i64, GenTaskError> {
        if amount <= 0 {
            return Err(GenTaskError::Validation(format!(
                "grant amount must be positive, got {amount}"
            )));
        }
        let balance = self
            .store
            .grant(user_id, amount, TransactionKind::Grant, description)
            .await?;
        tracing::info!(user_id, credits = amount, balance, "Granted credits");
        Ok(balance)
    }

    pub async fn grant_daily_gift(&self, user_id: &str) -> Result<Option<i64>, GenTaskError> {
        self.grant_daily_gift_at(user_id, Utc::now()).await
    }

    /// Top the balance up to the tier's gift level, once per UTC day.
    /// `None` when the tier has no gift, the gift window closed, or today's
    /// gift was already claimed.
    pub async fn grant_daily_gift_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, GenTaskError> {
        let (account, tier) = resolve_tier(self.users.as_ref(), user_id, now).await?;
        let policy = resolve_tier_policy(self.rules.as_ref(), tier).await?;
        if policy.daily_gift_credits <= 0 {
            return Ok(None);
        }
        if policy.gift_days > 0 {
            let window_end = account.created_at + chrono::Duration::days(i64::from(policy.gift_days));
            if now >= window_end {
                return Ok(None);
            }
        }

        let granted = self
            .store
            .grant_daily_gift(user_id, &usage_day(now), policy.daily_gift_credits)
            .await?;
        if let Some(credits) = granted {
            tracing::info!(user_id, credits, %tier, "Daily gift");
        }
        Ok(granted)
    }

    pub async fn transactions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<CreditTransaction>, GenTaskError> {
        self.store.transactions(user_id, limit).await
    }
}

// src/core/concurrency.rs — Per-user in-flight task ceiling

use chrono::Utc;
use std::sync::Arc;

use crate::core::entitlement::resolve_tier;
use crate::core::types::Tier;
use crate::infra::errors::GenTaskError;
use crate::rules::{resolve_tier_policy, RuleSource};
use crate::store::{TaskStore, UserDirectory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyCheck {
    pub allowed: bool,
    pub current: u32,
    /// `None` for tiers without a ceiling.
    pub max: Option<u32>,
}

impl ConcurrencyCheck {
    pub fn ensure_allowed(&self) -> Result<(), GenTaskError> {
        match self.max {
            Some(max) if !self.allowed => Err(GenTaskError::ConcurrencyLimitExceeded {
                current: self.current,
                max,
            }),
            _ => Ok(()),
        }
    }
}

/// Reads the in-flight count from the task store on every check instead of
/// keeping a counter, so a crashed process cannot leave it drifted.
pub struct ConcurrencyLimiter {
    tasks: Arc<dyn TaskStore>,
    users: Arc<dyn UserDirectory>,
    rules: Arc<dyn RuleSource>,
}

impl ConcurrencyLimiter {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        users: Arc<dyn UserDirectory>,
        rules: Arc<dyn RuleSource>,
    ) -> Self {
        Self {
            tasks,
            users,
            rules,
        }
    }

    pub async fn check(&self, user_id: &str) -> Result<ConcurrencyCheck, GenTaskError> {
        let (_, tier) = resolve_tier(self.users.as_ref(), user_id, Utc::now()).await?;
        self.check_for_tier(user_id, tier).await
    }

    /// Check against an already resolved tier.
    pub async fn check_for_tier(
        &self,
        user_id: &str,
        tier: Tier,
    ) -> Result<ConcurrencyCheck, GenTaskError> {
        let max = self.max_for(tier).await?;
        let current = self.tasks.count_in_flight(user_id).await?;
        let allowed = max.map_or(true, |m| current < m);
        if !allowed {
            tracing::debug!(user_id, current, max = ?max, "Concurrency ceiling reached");
        }
        Ok(ConcurrencyCheck {
            allowed,
            current,
            max,
        })
    }

    pub async fn max_for(&self, tier: Tier) -> Result<Option<u32>, GenTaskError> {
        if tier.is_privileged() {
            return Ok(None);
        }
        let policy = resolve_tier_policy(self.rules.as_ref(), tier).await?;
        Ok(Some(policy.max_concurrency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{GenerationParams, ProviderBinding, Task, TaskKind, TaskState};
    use crate::rules::StaticRules;
    use crate::store::{spawn_store_server, Database, StoreHandle};

    async fn limiter() -> (ConcurrencyLimiter, StoreHandle) {
        let db = Database::in_memory().unwrap();
        let (store, _) = spawn_store_server(db.store);
        let rules = StaticRules::from_toml(
            r#"
[[tiers]]
tier = "user"
max_concurrency = 2
"#,
        )
        .unwrap();
        let limiter = ConcurrencyLimiter::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(rules),
        );
        (limiter, store)
    }

    fn task(id: &str, user: &str) -> Task {
        let now = Utc::now();
        Task {
            id: id.into(),
            user_id: user.into(),
            kind: TaskKind::Text,
            binding: ProviderBinding::new("p", "m"),
            node_type: None,
            prompt: "hi".into(),
            reference_media: vec![],
            params: GenerationParams::default(),
            state: TaskState::Pending,
            progress: 0,
            result_url: None,
            extra_results: vec![],
            error_code: None,
            error_message: None,
            ledger_entry_id: None,
            charged: 0,
            is_free: true,
            refunded: false,
            external_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_ceiling_counts_pending_and_processing() {
        let (limiter, store) = limiter().await;
        store.upsert_user("u", Tier::User, None).await.unwrap();

        let c = limiter.check("u").await.unwrap();
        assert_eq!(c, ConcurrencyCheck { allowed: true, current: 0, max: Some(2) });

        store.insert_task(task("a", "u"), None).await.unwrap();
        store.insert_task(task("b", "u"), None).await.unwrap();
        store.claim_task("b", 10).await.unwrap();

        let c = limiter.check("u").await.unwrap();
        assert!(!c.allowed);
        assert_eq!(c.current, 2);
        assert!(matches!(
            c.ensure_allowed(),
            Err(GenTaskError::ConcurrencyLimitExceeded { current: 2, max: 2 })
        ));

        store.complete_task("b", "https://cdn/x", &[]).await.unwrap();
        assert!(limiter.check("u").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unconfigured_tier_defaults_to_one() {
        let (limiter, store) = limiter().await;
        store.upsert_user("v", Tier::Vip, None).await.unwrap();
        store.insert_task(task("a", "v"), None).await.unwrap();
        let c = limiter.check("v").await.unwrap();
        assert_eq!(c.max, Some(1));
        assert!(!c.allowed);
    }

    #[tokio::test]
    async fn test_privileged_tier_unbounded() {
        let (limiter, store) = limiter().await;
        store.upsert_user("ops", Tier::Admin, None).await.unwrap();
        for id in ["a", "b", "c"] {
            store.insert_task(task(id, "ops"), None).await.unwrap();
        }
        let c = limiter.check("ops").await.unwrap();
        assert!(c.allowed);
        assert_eq!(c.max, None);
        assert!(c.ensure_allowed().is_ok());
    }
}

// src/rules/cache.rs — Read-through TTL cache around any RuleSource
//
// Misses are cached too, so an unconfigured capability does not hit the
// backing store on every request. A rule change becomes visible at most
// `ttl` after it is written.

use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::{PermissionRule, PricingRule, RuleSource, TierPolicy};
use crate::core::types::Tier;
use crate::infra::errors::GenTaskError;

/// Default staleness window for cached rules.
pub const DEFAULT_RULE_TTL: Duration = Duration::from_secs(600);

struct TtlMap<K, V> {
    entries: Mutex<HashMap<K, (Instant, Option<V>)>>,
}

impl<K: Eq + Hash, V: Clone> TtlMap<K, V> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// `Some(cached)` if a fresh entry exists (the cached value may be a miss).
    fn get(&self, key: &K, ttl: Duration) -> Option<Option<V>> {
        let entries = self.entries.lock().ok()?;
        let (at, value) = entries.get(key)?;
        if at.elapsed() < ttl {
            Some(value.clone())
        } else {
            None
        }
    }

    fn put(&self, key: K, value: Option<V>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, (Instant::now(), value));
        }
    }

    fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// Caching decorator with a declared TTL.
pub struct CachedRules<S> {
    inner: S,
    ttl: Duration,
    pricing: TtlMap<String, PricingRule>,
    permissions: TtlMap<(String, Tier), PermissionRule>,
    tiers: TtlMap<Tier, TierPolicy>,
}

impl<S: RuleSource> CachedRules<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            pricing: TtlMap::new(),
            permissions: TtlMap::new(),
            tiers: TtlMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop every cached entry, forcing the next lookups through.
    pub fn invalidate(&self) {
        self.pricing.clear();
        self.permissions.clear();
        self.tiers.clear();
    }
}

#[async_trait]
impl<S: RuleSource> RuleSource for CachedRules<S> {
    async fn pricing_rule(&self, key: &str) -> Result<Option<PricingRule>, GenTaskError> {
        let k = key.to_string();
        if let Some(hit) = self.pricing.get(&k, self.ttl) {
            return Ok(hit);
        }
        let value = self.inner.pricing_rule(key).await?;
        self.pricing.put(k, value.clone());
        Ok(value)
    }

    async fn permission_rule(
        &self,
        key: &str,
        tier: Tier,
    ) -> Result<Option<PermissionRule>, GenTaskError> {
        let k = (key.to_string(), tier);
        if let Some(hit) = self.permissions.get(&k, self.ttl) {
            return Ok(hit);
        }
        let value = self.inner.permission_rule(key, tier).await?;
        self.permissions.put(k, value.clone());
        Ok(value)
    }

    async fn tier_policy(&self, tier: Tier) -> Result<Option<TierPolicy>, GenTaskError> {
        if let Some(hit) = self.tiers.get(&tier, self.ttl) {
            return Ok(hit);
        }
        let value = self.inner.tier_policy(tier).await?;
        self.tiers.put(tier, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::BillingType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts lookups and serves whatever rule is currently installed.
    struct CountingSource {
        calls: Arc<AtomicUsize>,
        rule: Arc<Mutex<Option<PricingRule>>>,
    }

    #[async_trait]
    impl RuleSource for CountingSource {
        async fn pricing_rule(&self, _key: &str) -> Result<Option<PricingRule>, GenTaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rule.lock().unwrap().clone())
        }

        async fn permission_rule(
            &self,
            _key: &str,
            _tier: Tier,
        ) -> Result<Option<PermissionRule>, GenTaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        async fn tier_policy(&self, _tier: Tier) -> Result<Option<TierPolicy>, GenTaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    fn rule(credits: f64) -> PricingRule {
        PricingRule {
            key: "module:image".into(),
            billing_type: BillingType::PerRequest,
            base_credits: credits,
            prices: vec![],
            round_up: None,
            pricing_unit: Default::default(),
            active: true,
        }
    }

    fn setup(ttl: Duration) -> (CachedRules<CountingSource>, Arc<AtomicUsize>, Arc<Mutex<Option<PricingRule>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(Mutex::new(Some(rule(10.0))));
        let cache = CachedRules::new(
            CountingSource {
                calls: calls.clone(),
                rule: current.clone(),
            },
            ttl,
        );
        (cache, calls, current)
    }

    #[tokio::test(start_paused = true)]
    async fn test_serves_stale_within_ttl_then_refreshes() {
        let (cache, calls, current) = setup(Duration::from_secs(600));

        let first = cache.pricing_rule("module:image").await.unwrap().unwrap();
        assert_eq!(first.base_credits, 10.0);

        *current.lock().unwrap() = Some(rule(25.0));
        tokio::time::advance(Duration::from_secs(599)).await;
        let cached = cache.pricing_rule("module:image").await.unwrap().unwrap();
        assert_eq!(cached.base_credits, 10.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = cache.pricing_rule("module:image").await.unwrap().unwrap();
        assert_eq!(fresh.base_credits, 25.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_misses_are_cached() {
        let (cache, calls, _) = setup(Duration::from_secs(60));
        assert!(cache.tier_policy(Tier::Vip).await.unwrap().is_none());
        assert!(cache.tier_policy(Tier::Vip).await.unwrap().is_none());
        assert!(cache
            .permission_rule("module:image", Tier::User)
            .await
            .unwrap()
            .is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_reload() {
        let (cache, calls, _) = setup(Duration::from_secs(600));
        cache.pricing_rule("module:image").await.unwrap();
        cache.invalidate();
        cache.pricing_rule("module:image").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

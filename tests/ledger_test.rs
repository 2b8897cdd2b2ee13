// tests/ledger_test.rs — Integration test: entitlements and credits over database rules

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use gentask::core::entitlement::{DenyReason, EntitlementGate};
use gentask::core::ledger::CreditLedger;
use gentask::core::pricing::QuantityParams;
use gentask::core::types::{CapabilityRef, ProviderBinding, TaskKind, Tier};
use gentask::infra::errors::GenTaskError;
use gentask::rules::file::RuleSet;
use gentask::rules::{CachedRules, RuleSource};
use gentask::store::{spawn_store_server, Database, StoreHandle, UserDirectory};

const RULES: &str = r#"
[[pricing]]
key = "module:video"
billing_type = "duration_resolution"
prices = [
    { dimension = "resolution", value = "720p_5", credits_per_unit = 40.0 },
    { dimension = "resolution", value = "720p_10", credits_per_unit = 70.0 },
]

[[permissions]]
key = "module:video"
tier = "user"
daily_limit = 2
free_daily_limit = 1

[[permissions]]
key = "module:video"
tier = "vip"
free_daily_limit = 3

[[permissions]]
key = "model:kling/v2-master"
tier = "user"
allowed = false

[[tiers]]
tier = "user"
daily_gift_credits = 100

[[tiers]]
tier = "vip"
max_concurrency = 4
daily_gift_credits = 500
"#;

struct Setup {
    store: StoreHandle,
    gate: EntitlementGate,
    ledger: CreditLedger,
}

async fn setup() -> Setup {
    let db = Database::in_memory().unwrap();
    let (store, _) = spawn_store_server(db.store);
    let set: RuleSet = toml::from_str(RULES).unwrap();
    store.import_rules(set).await.unwrap();

    let rules: Arc<dyn RuleSource> =
        Arc::new(CachedRules::new(store.clone(), Duration::from_secs(60)));
    let handle = Arc::new(store.clone());
    Setup {
        gate: EntitlementGate::new(handle.clone(), handle.clone(), rules.clone()),
        ledger: CreditLedger::new(handle.clone(), handle, rules),
        store,
    }
}

fn video(model: &str) -> CapabilityRef {
    CapabilityRef::for_task(&ProviderBinding::new("kling", model), TaskKind::Video, None)
}

fn clip(secs: f64) -> QuantityParams {
    QuantityParams {
        duration_secs: Some(secs),
        resolution: Some("720p".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_module_rule_prices_every_model() {
    let s = setup().await;
    assert_eq!(s.ledger.estimate(&video("v2"), &clip(5.0)).await.unwrap(), 40);
    assert_eq!(s.ledger.estimate(&video("v1-6"), &clip(10.0)).await.unwrap(), 70);
    assert_eq!(s.ledger.estimate(&video("v2"), &clip(7.0)).await.unwrap(), 70);
    // Past the largest tier the largest tier applies
    assert_eq!(s.ledger.estimate(&video("v2"), &clip(20.0)).await.unwrap(), 70);
}

#[tokio::test]
async fn test_free_then_paid_then_quota() {
    let s = setup().await;
    s.store.upsert_user("alice", Tier::User, None).await.unwrap();
    s.ledger.grant("alice", 200, "seed").await.unwrap();

    // Usage counts under the module key, so both models share the quota
    let first = s.gate.check_permission("alice", &video("v2")).await.unwrap();
    assert!(first.allowed && first.is_free);
    s.ledger
        .charge("alice", &video("v2"), &clip(5.0), first.is_free, None)
        .await
        .unwrap();
    s.gate
        .record_usage("alice", &video("v2"), first.is_free)
        .await
        .unwrap();
    assert_eq!(s.ledger.balance("alice").await.unwrap(), 200);

    let second = s.gate.check_permission("alice", &video("v1-6")).await.unwrap();
    assert!(second.allowed && !second.is_free);
    s.ledger
        .charge("alice", &video("v1-6"), &clip(5.0), second.is_free, None)
        .await
        .unwrap();
    s.gate
        .record_usage("alice", &video("v1-6"), second.is_free)
        .await
        .unwrap();
    assert_eq!(s.ledger.balance("alice").await.unwrap(), 160);

    let third = s.gate.check_permission("alice", &video("v2")).await.unwrap();
    assert!(!third.allowed);
    assert_eq!(
        third.reason,
        Some(DenyReason::QuotaExhausted { used: 2, limit: 2 })
    );
    assert!(matches!(
        third.ensure_allowed(&video("v2")),
        Err(GenTaskError::QuotaExhausted { .. })
    ));
}

#[tokio::test]
async fn test_model_rule_overrides_module_rule() {
    let s = setup().await;
    s.store.upsert_user("alice", Tier::User, None).await.unwrap();
    let decision = s
        .gate
        .check_permission("alice", &video("v2-master"))
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(DenyReason::NotPermitted));
    assert!(matches!(
        decision.ensure_allowed(&video("v2-master")),
        Err(GenTaskError::PermissionDenied { .. })
    ));
}

#[tokio::test]
async fn test_lapsed_membership_falls_back_to_user_tier() {
    let s = setup().await;
    let yesterday = Utc::now() - chrono::Duration::days(1);
    let next_month = Utc::now() + chrono::Duration::days(30);
    s.store
        .upsert_user("lapsed", Tier::Vip, Some(yesterday))
        .await
        .unwrap();
    s.store
        .upsert_user("member", Tier::Vip, Some(next_month))
        .await
        .unwrap();

    let lapsed = s.gate.check_permission("lapsed", &video("v2")).await.unwrap();
    assert_eq!(lapsed.tier, Tier::User);
    assert_eq!(lapsed.free_remaining, Some(0));

    let member = s.gate.check_permission("member", &video("v2")).await.unwrap();
    assert_eq!(member.tier, Tier::Vip);
    assert_eq!(member.free_remaining, Some(2));

    assert_eq!(s.ledger.grant_daily_gift("lapsed").await.unwrap(), Some(100));
    assert_eq!(s.ledger.grant_daily_gift("member").await.unwrap(), Some(500));
    assert_eq!(s.ledger.grant_daily_gift("member").await.unwrap(), None);
}

#[tokio::test]
async fn test_privileged_tiers_are_free_and_unlimited() {
    let s = setup().await;
    s.store.upsert_user("ops", Tier::Admin, None).await.unwrap();

    for _ in 0..5 {
        let decision = s.gate.check_permission("ops", &video("v2-master")).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.is_free);
        s.gate
            .record_usage("ops", &video("v2-master"), true)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_unknown_user_is_rejected() {
    let s = setup().await;
    assert!(matches!(
        s.gate.check_permission("ghost", &video("v2")).await,
        Err(GenTaskError::UserNotFound(_))
    ));
}

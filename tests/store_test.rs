// tests/store_test.rs — Integration test: store actor over a file-backed database

use std::time::Duration;

use chrono::Utc;
use gentask::core::types::{
    FailureCode, GenerationParams, ProviderBinding, RefundOutcome, Task, TaskFailure, TaskKind,
    TaskState, Tier, TransactionKind,
};
use gentask::infra::errors::GenTaskError;
use gentask::infra::leader::{LeaderElector, LeaseGuard};
use gentask::rules::file::RuleSet;
use gentask::rules::RuleSource;
use gentask::store::{
    spawn_store_server, Database, LedgerStore, NewLedgerEntry, StoreHandle, TaskStore,
    UserDirectory,
};

fn open(dir: &std::path::Path) -> StoreHandle {
    let db = Database::open(&dir.join("gentask.db")).unwrap();
    spawn_store_server(db.store).0
}

fn entry(id: &str, user: &str, amount: i64) -> NewLedgerEntry {
    NewLedgerEntry {
        id: id.into(),
        user_id: user.into(),
        task_id: None,
        capability: "model:mock/img-v1".into(),
        amount,
        is_free: false,
        description: "test charge".into(),
    }
}

fn pending_task(id: &str, user: &str, entry_id: Option<&str>) -> Task {
    let now = Utc::now();
    Task {
        id: id.into(),
        user_id: user.into(),
        kind: TaskKind::Image,
        binding: ProviderBinding::new("mock", "img-v1"),
        node_type: None,
        prompt: "a lighthouse".into(),
        reference_media: vec!["https://example.com/ref.png".into()],
        params: GenerationParams {
            resolution: Some("1024x1024".into()),
            ..Default::default()
        },
        state: TaskState::Pending,
        progress: 0,
        result_url: None,
        extra_results: vec![],
        error_code: None,
        error_message: None,
        ledger_entry_id: entry_id.map(str::to_string),
        charged: 30,
        is_free: false,
        refunded: false,
        external_id: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(dir.path());
        store.upsert_user("alice", Tier::Vip, None).await.unwrap();
        store
            .grant("alice", 500, TransactionKind::Grant, "welcome")
            .await
            .unwrap();
        store.charge(entry("e1", "alice", 30)).await.unwrap();
        store
            .insert_task(pending_task("t1", "alice", Some("e1")), None)
            .await
            .unwrap();
    }

    // Migrations are idempotent and the rows are still there
    let store = open(dir.path());
    let account = store.account("alice").await.unwrap().unwrap();
    assert_eq!(account.tier, Tier::Vip);
    assert_eq!(account.balance, 470);

    let task = store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.params.resolution.as_deref(), Some("1024x1024"));
    assert_eq!(task.reference_media.len(), 1);
}

#[tokio::test]
async fn test_concurrent_charges_never_overdraw() {
    let db = Database::in_memory().unwrap();
    let (store, _) = spawn_store_server(db.store);
    store.upsert_user("alice", Tier::User, None).await.unwrap();
    store
        .grant("alice", 100, TransactionKind::Grant, "welcome")
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.charge(entry(&format!("e{i}"), "alice", 30)).await
        }));
    }

    let mut charged = 0;
    let mut rejected = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => charged += 1,
            Err(GenTaskError::InsufficientCredits { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(charged, 3);
    assert_eq!(rejected, 7);
    assert_eq!(store.balance("alice").await.unwrap(), 10);
}

#[tokio::test]
async fn test_terminal_transition_happens_once() {
    let db = Database::in_memory().unwrap();
    let (store, _) = spawn_store_server(db.store);
    store.upsert_user("alice", Tier::User, None).await.unwrap();
    store
        .grant("alice", 100, TransactionKind::Grant, "welcome")
        .await
        .unwrap();
    store.charge(entry("e1", "alice", 30)).await.unwrap();
    store
        .insert_task(pending_task("t1", "alice", Some("e1")), None)
        .await
        .unwrap();
    assert!(store.claim_task("t1", 10).await.unwrap());

    let failure = TaskFailure::new(FailureCode::ProviderError, "boom");
    let (a, b) = tokio::join!(
        store.fail_task("t1", &failure, None),
        store.fail_task("t1", &failure, None)
    );
    let applied: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
    assert_eq!(applied.len(), 1);
    assert!(matches!(
        applied[0].refund,
        Some(RefundOutcome::Refunded { amount: 30, .. })
    ));

    // A result arriving after the failure is discarded
    assert!(!store.complete_task("t1", "mem://late.png", &[]).await.unwrap());
    let task = store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failure);
    assert!(task.result_url.is_none());
    assert!(task.refunded);
    assert_eq!(store.balance("alice").await.unwrap(), 100);
}

#[tokio::test]
async fn test_rules_imported_into_database() {
    let db = Database::in_memory().unwrap();
    let (store, _) = spawn_store_server(db.store);

    let set: RuleSet = toml::from_str(
        r#"
[[pricing]]
key = "module:video"
billing_type = "per_duration"
base_credits = 8.0
round_up = true

[[permissions]]
key = "module:video"
tier = "user"
daily_limit = 3

[[tiers]]
tier = "vip"
max_concurrency = 5
daily_gift_credits = 200
"#,
    )
    .unwrap();
    assert_eq!(store.import_rules(set).await.unwrap(), 3);

    let pricing = store.pricing_rule("module:video").await.unwrap().unwrap();
    assert_eq!(pricing.base_credits, 8.0);
    assert_eq!(pricing.round_up, Some(true));
    let permission = store
        .permission_rule("module:video", Tier::User)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(permission.daily_limit, Some(3));
    assert!(store
        .permission_rule("module:video", Tier::Vip)
        .await
        .unwrap()
        .is_none());
    let policy = store.tier_policy(Tier::Vip).await.unwrap().unwrap();
    assert_eq!(policy.max_concurrency, 5);
}

#[tokio::test]
async fn test_lease_guard_single_leader() {
    let db = Database::in_memory().unwrap();
    let (store, _) = spawn_store_server(db.store);
    let lease = Duration::from_secs(30);

    let mut a = LeaseGuard::new("zombie-reaper", "instance-a", lease);
    let mut b = LeaseGuard::new("zombie-reaper", "instance-b", lease);

    assert!(a.ensure(&store).await.unwrap());
    assert!(!b.ensure(&store).await.unwrap());
    assert!(a.ensure(&store).await.unwrap());
    assert_eq!(
        store.current_leader("zombie-reaper").await.unwrap().as_deref(),
        Some("instance-a")
    );

    a.release(&store).await.unwrap();
    assert!(!a.is_held());
    assert!(b.ensure(&store).await.unwrap());
    assert_eq!(
        store.current_leader("zombie-reaper").await.unwrap().as_deref(),
        Some("instance-b")
    );
}

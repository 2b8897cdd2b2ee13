// tests/reaper_test.rs — Integration test: zombie reaper sweeps and leadership

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use gentask::core::reaper::{run_reaper, ZombieReaper, REAPER_LOCK};
use gentask::core::types::{
    FailureCode, GenerationParams, ProviderBinding, Task, TaskKind, TaskState, Tier,
    TransactionKind,
};
use gentask::infra::config::ReaperConfig;
use gentask::infra::leader::LeaderElector;
use gentask::store::{
    spawn_store_server, Database, LedgerStore, NewLedgerEntry, StoreHandle, TaskStore,
    UserDirectory,
};

async fn store() -> StoreHandle {
    let db = Database::in_memory().unwrap();
    let (store, _) = spawn_store_server(db.store);
    store.upsert_user("alice", Tier::User, None).await.unwrap();
    store
        .grant("alice", 100, TransactionKind::Grant, "welcome")
        .await
        .unwrap();
    store
}

/// Charge `credits` and insert a task last touched at `updated_at`.
async fn charged_task(
    store: &StoreHandle,
    id: &str,
    credits: i64,
    state: TaskState,
    updated_at: DateTime<Utc>,
) {
    let entry = NewLedgerEntry {
        id: format!("entry-{id}"),
        user_id: "alice".into(),
        task_id: Some(id.into()),
        capability: "module:video".into(),
        amount: credits,
        is_free: false,
        description: "module:video".into(),
    };
    store
        .create_charged_task(
            entry.clone(),
            Task {
                id: id.into(),
                user_id: "alice".into(),
                kind: TaskKind::Video,
                binding: ProviderBinding::new("kling", "v2"),
                node_type: None,
                prompt: "waves at dusk".into(),
                reference_media: vec![],
                params: GenerationParams {
                    duration_secs: Some(5.0),
                    ..Default::default()
                },
                state,
                progress: if state == TaskState::Processing { 30 } else { 0 },
                result_url: None,
                extra_results: vec![],
                error_code: None,
                error_message: None,
                ledger_entry_id: Some(entry.id),
                charged: credits,
                is_free: false,
                refunded: false,
                external_id: None,
                created_at: updated_at,
                updated_at,
                completed_at: None,
            },
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sweep_fails_and_refunds_lost_tasks() {
    let store = store().await;
    let now = Utc::now();
    let two_hours_ago = now - chrono::Duration::hours(2);

    charged_task(&store, "lost-pending", 20, TaskState::Pending, two_hours_ago).await;
    charged_task(&store, "lost-processing", 30, TaskState::Processing, two_hours_ago).await;
    charged_task(&store, "fresh", 10, TaskState::Processing, now).await;
    assert_eq!(store.balance("alice").await.unwrap(), 40);

    let reaper = ZombieReaper::new(Arc::new(store.clone()), 10);
    let report = reaper.sweep(Duration::from_secs(1800)).await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.failed, 2);
    assert_eq!(report.refunded, 2);
    assert_eq!(report.credits_refunded, 50);
    assert_eq!(store.balance("alice").await.unwrap(), 90);

    for id in ["lost-pending", "lost-processing"] {
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failure);
        assert_eq!(task.error_code, Some(FailureCode::ZombieTimeout));
        assert!(task.refunded);
        assert!(task.completed_at.is_some());
    }
    let fresh = store.get_task("fresh").await.unwrap().unwrap();
    assert_eq!(fresh.state, TaskState::Processing);

    // A second sweep finds nothing and refunds nothing twice
    let again = reaper.sweep(Duration::from_secs(1800)).await.unwrap();
    assert_eq!(again.examined, 0);
    assert_eq!(store.balance("alice").await.unwrap(), 90);
}

#[tokio::test]
async fn test_sweep_skips_task_that_progressed() {
    let store = store().await;
    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    charged_task(&store, "slow", 30, TaskState::Processing, an_hour_ago).await;

    // A progress rise counts as activity
    assert!(store.update_progress("slow", 50).await.unwrap());

    let reaper = ZombieReaper::new(Arc::new(store.clone()), 10);
    let report = reaper.sweep(Duration::from_secs(1800)).await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(
        store.get_task("slow").await.unwrap().unwrap().state,
        TaskState::Processing
    );
}

#[tokio::test(start_paused = true)]
async fn test_only_one_instance_sweeps() {
    let store = store().await;
    let stale = Utc::now() - chrono::Duration::hours(2);
    charged_task(&store, "lost", 30, TaskState::Pending, stale).await;

    let config = ReaperConfig {
        interval_secs: 1,
        initial_delay_secs: 0,
        threshold_secs: 1800,
        ..ReaperConfig::default()
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut jobs = Vec::new();
    for instance in ["instance-a", "instance-b"] {
        jobs.push(tokio::spawn(run_reaper(
            ZombieReaper::new(Arc::new(store.clone()), 10),
            Arc::new(store.clone()),
            instance.to_string(),
            config.clone(),
            shutdown_rx.clone(),
        )));
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(store.current_leader(REAPER_LOCK).await.unwrap().is_some());

    shutdown_tx.send(true).unwrap();
    for job in jobs {
        job.await.unwrap();
    }

    let task = store.get_task("lost").await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failure);
    assert_eq!(store.balance("alice").await.unwrap(), 100);

    // The leader gave its lease up on shutdown
    assert!(store.current_leader(REAPER_LOCK).await.unwrap().is_none());
}

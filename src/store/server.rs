// src/store/server.rs — Async message passing for Store
//
// The SQLite connection lives on one task; everything else talks to it
// through a cloneable `StoreHandle`. Requests are processed one at a time,
// which also serializes every ledger and task transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::{LedgerStore, NewLedgerEntry, Store, TaskStore, UsageStore, UserDirectory};
use crate::core::types::{
    CreditTransaction, FailOutcome, LedgerEntry, RefundOutcome, Task, TaskFailure, Tier,
    TransactionKind, UsageCounters, UserAccount,
};
use crate::infra::errors::GenTaskError;
use crate::infra::leader::{LeaderElector, LeadershipResult, RenewalResult};
use crate::rules::file::RuleSet;
use crate::rules::{PermissionRule, PricingRule, RuleSource, TierPolicy};

type Reply<T> = oneshot::Sender<Result<T, GenTaskError>>;

#[derive(Debug)]
pub enum StoreCommand {
    UpsertUser {
        user_id: String,
        tier: Tier,
        membership_expires_at: Option<DateTime<Utc>>,
        resp: Reply<UserAccount>,
    },
    Account {
        user_id: String,
        resp: Reply<Option<UserAccount>>,
    },
    Charge {
        entry: NewLedgerEntry,
        resp: Reply<LedgerEntry>,
    },
    Refund {
        entry_id: String,
        reason: String,
        resp: Reply<RefundOutcome>,
    },
    Entry {
        id: String,
        resp: Reply<Option<LedgerEntry>>,
    },
    Balance {
        user_id: String,
        resp: Reply<i64>,
    },
    Grant {
        user_id: String,
        amount: i64,
        kind: TransactionKind,
        description: String,
        resp: Reply<i64>,
    },
    GrantDailyGift {
        user_id: String,
        day: String,
        top_up_to: i64,
        resp: Reply<Option<i64>>,
    },
    Transactions {
        user_id: String,
        limit: u32,
        resp: Reply<Vec<CreditTransaction>>,
    },
    InsertTask {
        task: Box<Task>,
        max_in_flight: Option<u32>,
        resp: Reply<()>,
    },
    CreateChargedTask {
        entry: NewLedgerEntry,
        task: Box<Task>,
        max_in_flight: Option<u32>,
        resp: Reply<LedgerEntry>,
    },
    GetTask {
        id: String,
        resp: Reply<Option<Task>>,
    },
    ListTasks {
        user_id: String,
        limit: u32,
        resp: Reply<Vec<Task>>,
    },
    CountInFlight {
        user_id: String,
        resp: Reply<u32>,
    },
    ClaimTask {
        id: String,
        progress: u8,
        resp: Reply<bool>,
    },
    SetExternalId {
        id: String,
        external_id: String,
        progress: u8,
        resp: Reply<bool>,
    },
    UpdateProgress {
        id: String,
        progress: u8,
        resp: Reply<bool>,
    },
    TouchTask {
        id: String,
        resp: Reply<bool>,
    },
    CompleteTask {
        id: String,
        result_url: String,
        extra_results: Vec<String>,
        resp: Reply<bool>,
    },
    FailTask {
        id: String,
        failure: TaskFailure,
        stale_before: Option<DateTime<Utc>>,
        resp: Reply<Option<FailOutcome>>,
    },
    ListStale {
        before: DateTime<Utc>,
        limit: u32,
        resp: Reply<Vec<Task>>,
    },
    ListPending {
        before: DateTime<Utc>,
        limit: u32,
        resp: Reply<Vec<Task>>,
    },
    ListAwaitingPoll {
        limit: u32,
        resp: Reply<Vec<Task>>,
    },
    Usage {
        user_id: String,
        capability: String,
        day: String,
        resp: Reply<UsageCounters>,
    },
    RecordUsage {
        user_id: String,
        capability: String,
        day: String,
        was_free: bool,
        resp: Reply<()>,
    },
    PricingRule {
        key: String,
        resp: Reply<Option<PricingRule>>,
    },
    PermissionRule {
        key: String,
        tier: Tier,
        resp: Reply<Option<PermissionRule>>,
    },
    TierPolicy {
        tier: Tier,
        resp: Reply<Option<TierPolicy>>,
    },
    ImportRules {
        set: RuleSet,
        resp: Reply<usize>,
    },
    AcquireLease {
        lock_key: String,
        holder: String,
        lease: Duration,
        resp: Reply<LeadershipResult>,
    },
    RenewLease {
        lock_key: String,
        token: String,
        lease: Duration,
        resp: Reply<RenewalResult>,
    },
    ReleaseLease {
        lock_key: String,
        token: String,
        resp: Reply<bool>,
    },
    CurrentLeader {
        lock_key: String,
        resp: Reply<Option<String>>,
    },
}

/// A handle to the Store that uses message passing.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    pub fn new(tx: mpsc::Sender<StoreCommand>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> StoreCommand,
    ) -> Result<T, GenTaskError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(make(resp_tx))
            .await
            .map_err(|_| GenTaskError::StoreUnavailable("store server stopped".into()))?;
        resp_rx
            .await
            .map_err(|_| GenTaskError::StoreUnavailable("store server dropped request".into()))?
    }

    /// Upsert every rule of a rules file into the database.
    pub async fn import_rules(&self, set: RuleSet) -> Result<usize, GenTaskError> {
        self.request(|resp| StoreCommand::ImportRules { set, resp })
            .await
    }
}

#[async_trait]
impl TaskStore for StoreHandle {
    async fn insert_task(&self, task: Task, max_in_flight: Option<u32>) -> Result<(), GenTaskError> {
        self.request(|resp| StoreCommand::InsertTask {
            task: Box::new(task),
            max_in_flight,
            resp,
        })
        .await
    }

    async fn create_charged_task(
        &self,
        entry: NewLedgerEntry,
        task: Task,
        max_in_flight: Option<u32>,
    ) -> Result<LedgerEntry, GenTaskError> {
        self.request(|resp| StoreCommand::CreateChargedTask {
            entry,
            task: Box::new(task),
            max_in_flight,
            resp,
        })
        .await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, GenTaskError> {
        let id = id.to_string();
        self.request(|resp| StoreCommand::GetTask { id, resp }).await
    }

    async fn list_tasks(&self, user_id: &str, limit: u32) -> Result<Vec<Task>, GenTaskError> {
        let user_id = user_id.to_string();
        self.request(|resp| StoreCommand::ListTasks {
            user_id,
            limit,
            resp,
        })
        .await
    }

    async fn count_in_flight(&self, user_id: &str) -> Result<u32, GenTaskError> {
        let user_id = user_id.to_string();
        self.request(|resp| StoreCommand::CountInFlight { user_id, resp })
            .await
    }

    async fn claim_task(&self, id: &str, progress: u8) -> Result<bool, GenTaskError> {
        let id = id.to_string();
        self.request(|resp| StoreCommand::ClaimTask { id, progress, resp })
            .await
    }

    async fn set_external_id(
        &self,
        id: &str,
        external_id: &str,
        progress: u8,
    ) -> Result<bool, GenTaskError> {
        let id = id.to_string();
        let external_id = external_id.to_string();
        self.request(|resp| StoreCommand::SetExternalId {
            id,
            external_id,
            progress,
            resp,
        })
        .await
    }

    async fn update_progress(&self, id: &str, progress: u8) -> Result<bool, GenTaskError> {
        let id = id.to_string();
        self.request(|resp| StoreCommand::UpdateProgress { id, progress, resp })
            .await
    }

    async fn touch_task(&self, id: &str) -> Result<bool, GenTaskError> {
        let id = id.to_string();
        self.request(|resp| StoreCommand::TouchTask { id, resp }).await
    }

    async fn complete_task(
        &self,
        id: &str,
        result_url: &str,
        extra_results: &[String],
    ) -> Result<bool, GenTaskError> {
        let id = id.to_string();
        let result_url = result_url.to_string();
        let extra_results = extra_results.to_vec();
        self.request(|resp| StoreCommand::CompleteTask {
            id,
            result_url,
            extra_results,
            resp,
        })
        .await
    }

    async fn fail_task(
        &self,
        id: &str,
        failure: &TaskFailure,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<FailOutcome>, GenTaskError> {
        let id = id.to_string();
        let failure = failure.clone();
        self.request(|resp| StoreCommand::FailTask {
            id,
            failure,
            stale_before,
            resp,
        })
        .await
    }

    async fn list_stale(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Task>, GenTaskError> {
        self.request(|resp| StoreCommand::ListStale {
            before,
            limit,
            resp,
        })
        .await
    }

    async fn list_pending(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Task>, GenTaskError> {
        self.request(|resp| StoreCommand::ListPending {
            before,
            limit,
            resp,
        })
        .await
    }

    async fn list_awaiting_poll(&self, limit: u32) -> Result<Vec<Task>, GenTaskError> {
        self.request(|resp| StoreCommand::ListAwaitingPoll { limit, resp })
            .await
    }
}

#[async_trait]
impl LedgerStore for StoreHandle {
    async fn charge(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, GenTaskError> {
        self.request(|resp| StoreCommand::Charge { entry, resp }).await
    }

    async fn refund(&self, entry_id: &str, reason: &str) -> Result<RefundOutcome, GenTaskError> {
        let entry_id = entry_id.to_string();
        let reason = reason.to_string();
        self.request(|resp| StoreCommand::Refund {
            entry_id,
            reason,
            resp,
        })
        .await
    }

    async fn entry(&self, id: &str) -> Result<Option<LedgerEntry>, GenTaskError> {
        let id = id.to_string();
        self.request(|resp| StoreCommand::Entry { id, resp }).await
    }

    async fn balance(&self, user_id: &str) -> Result<i64, GenTaskError> {
        let user_id = user_id.to_string();
        self.request(|resp| StoreCommand::Balance { user_id, resp })
            .await
    }

    async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<i64, GenTaskError> {
        let user_id = user_id.to_string();
        let description = description.to_string();
        self.request(|resp| StoreCommand::Grant {
            user_id,
            amount,
            kind,
            description,
            resp,
        })
        .await
    }

    async fn grant_daily_gift(
        &self,
        user_id: &str,
        day: &str,
        top_up_to: i64,
    ) -> Result<Option<i64>, GenTaskError> {
        let user_id = user_id.to_string();
        let day = day.to_string();
        self.request(|resp| StoreCommand::GrantDailyGift {
            user_id,
            day,
            top_up_to,
            resp,
        })
        .await
    }

    async fn transactions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<CreditTransaction>, GenTaskError> {
        let user_id = user_id.to_string();
        self.request(|resp| StoreCommand::Transactions {
            user_id,
            limit,
            resp,
        })
        .await
    }
}

#[async_trait]
impl UsageStore for StoreHandle {
    async fn usage(
        &self,
        user_id: &str,
        capability: &str,
        day: &str,
    ) -> Result<UsageCounters, GenTaskError> {
        let user_id = user_id.to_string();
        let capability = capability.to_string();
        let day = day.to_string();
        self.request(|resp| StoreCommand::Usage {
            user_id,
            capability,
            day,
            resp,
        })
        .await
    }

    async fn record_usage(
        &self,
        user_id: &str,
        capability: &str,
        day: &str,
        was_free: bool,
    ) -> Result<(), GenTaskError> {
        let user_id = user_id.to_string();
        let capability = capability.to_string();
        let day = day.to_string();
        self.request(|resp| StoreCommand::RecordUsage {
            user_id,
            capability,
            day,
            was_free,
            resp,
        })
        .await
    }
}

#[async_trait]
impl UserDirectory for StoreHandle {
    async fn account(&self, user_id: &str) -> Result<Option<UserAccount>, GenTaskError> {
        let user_id = user_id.to_string();
        self.request(|resp| StoreCommand::Account { user_id, resp })
            .await
    }

    async fn upsert_user(
        &self,
        user_id: &str,
        tier: Tier,
        membership_expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserAccount, GenTaskError> {
        let user_id = user_id.to_string();
        self.request(|resp| StoreCommand::UpsertUser {
            user_id,
            tier,
            membership_expires_at,
            resp,
        })
        .await
    }
}

#[async_trait]
impl RuleSource for StoreHandle {
    async fn pricing_rule(&self, key: &str) -> Result<Option<PricingRule>, GenTaskError> {
        let key = key.to_string();
        self.request(|resp| StoreCommand::PricingRule { key, resp })
            .await
    }

    async fn permission_rule(
        &self,
        key: &str,
        tier: Tier,
    ) -> Result<Option<PermissionRule>, GenTaskError> {
        let key = key.to_string();
        self.request(|resp| StoreCommand::PermissionRule { key, tier, resp })
            .await
    }

    async fn tier_policy(&self, tier: Tier) -> Result<Option<TierPolicy>, GenTaskError> {
        self.request(|resp| StoreCommand::TierPolicy { tier, resp })
            .await
    }
}

#[async_trait]
impl LeaderElector for StoreHandle {
    async fn try_acquire(
        &self,
        lock_key: &str,
        instance_id: &str,
        lease: Duration,
    ) -> Result<LeadershipResult, GenTaskError> {
        let lock_key = lock_key.to_string();
        let holder = instance_id.to_string();
        self.request(|resp| StoreCommand::AcquireLease {
            lock_key,
            holder,
            lease,
            resp,
        })
        .await
    }

    async fn renew(
        &self,
        lock_key: &str,
        lease_token: &str,
        lease: Duration,
    ) -> Result<RenewalResult, GenTaskError> {
        let lock_key = lock_key.to_string();
        let token = lease_token.to_string();
        self.request(|resp| StoreCommand::RenewLease {
            lock_key,
            token,
            lease,
            resp,
        })
        .await
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool, GenTaskError> {
        let lock_key = lock_key.to_string();
        let token = lease_token.to_string();
        self.request(|resp| StoreCommand::ReleaseLease {
            lock_key,
            token,
            resp,
        })
        .await
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>, GenTaskError> {
        let lock_key = lock_key.to_string();
        self.request(|resp| StoreCommand::CurrentLeader { lock_key, resp })
            .await
    }
}

/// Helper to spawn the store server and return a handle.
pub fn spawn_store_server(store: Store) -> (StoreHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(100);
    let handle = StoreHandle::new(tx);
    let join_handle = tokio::spawn(run_store_server(store, rx));
    (handle, join_handle)
}

/// The background task that owns the Store. Exits once every handle is dropped.
pub async fn run_store_server(mut store: Store, mut rx: mpsc::Receiver<StoreCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::UpsertUser {
                user_id,
                tier,
                membership_expires_at,
                resp,
            } => {
                let res = store.upsert_user(&user_id, tier, membership_expires_at.as_ref());
                let _ = resp.send(res);
            }
            StoreCommand::Account { user_id, resp } => {
                let _ = resp.send(store.account(&user_id));
            }
            StoreCommand::Charge { entry, resp } => {
                let _ = resp.send(store.charge(&entry));
            }
            StoreCommand::Refund {
                entry_id,
                reason,
                resp,
            } => {
                let _ = resp.send(store.refund(&entry_id, &reason));
            }
            StoreCommand::Entry { id, resp } => {
                let _ = resp.send(store.entry(&id));
            }
            StoreCommand::Balance { user_id, resp } => {
                let _ = resp.send(store.balance(&user_id));
            }
            StoreCommand::Grant {
                user_id,
                amount,
                kind,
                description,
                resp,
            } => {
                let res = store.grant(&user_id, amount, kind, &description);
                let _ = resp.send(res);
            }
            StoreCommand::GrantDailyGift {
                user_id,
                day,
                top_up_to,
                resp,
            } => {
                let res = store.grant_daily_gift(&user_id, &day, top_up_to);
                let _ = resp.send(res);
            }
            StoreCommand::Transactions {
                user_id,
                limit,
                resp,
            } => {
                let _ = resp.send(store.transactions(&user_id, limit));
            }
            StoreCommand::InsertTask {
                task,
                max_in_flight,
                resp,
            } => {
                let _ = resp.send(store.insert_task(&task, max_in_flight));
            }
            StoreCommand::CreateChargedTask {
                entry,
                task,
                max_in_flight,
                resp,
            } => {
                let _ = resp.send(store.create_charged_task(&entry, &task, max_in_flight));
            }
            StoreCommand::GetTask { id, resp } => {
                let _ = resp.send(store.get_task(&id));
            }
            StoreCommand::ListTasks {
                user_id,
                limit,
                resp,
            } => {
                let _ = resp.send(store.list_tasks(&user_id, limit));
            }
            StoreCommand::CountInFlight { user_id, resp } => {
                let _ = resp.send(store.count_in_flight(&user_id));
            }
            StoreCommand::ClaimTask { id, progress, resp } => {
                let _ = resp.send(store.claim_task(&id, progress));
            }
            StoreCommand::SetExternalId {
                id,
                external_id,
                progress,
                resp,
            } => {
                let res = store.set_external_id(&id, &external_id, progress);
                let _ = resp.send(res);
            }
            StoreCommand::UpdateProgress { id, progress, resp } => {
                let _ = resp.send(store.update_progress(&id, progress));
            }
            StoreCommand::TouchTask { id, resp } => {
                let _ = resp.send(store.touch_task(&id));
            }
            StoreCommand::CompleteTask {
                id,
                result_url,
                extra_results,
                resp,
            } => {
                let res = store.complete_task(&id, &result_url, &extra_results);
                let _ = resp.send(res);
            }
            StoreCommand::FailTask {
                id,
                failure,
                stale_before,
                resp,
            } => {
                let res = store.fail_task(&id, &failure, stale_before.as_ref());
                let _ = resp.send(res);
            }
            StoreCommand::ListStale {
                before,
                limit,
                resp,
            } => {
                let _ = resp.send(store.list_stale(&before, limit));
            }
            StoreCommand::ListPending {
                before,
                limit,
                resp,
            } => {
                let _ = resp.send(store.list_pending(&before, limit));
            }
            StoreCommand::ListAwaitingPoll { limit, resp } => {
                let _ = resp.send(store.list_awaiting_poll(limit));
            }
            StoreCommand::Usage {
                user_id,
                capability,
                day,
                resp,
            } => {
                let _ = resp.send(store.usage(&user_id, &capability, &day));
            }
            StoreCommand::RecordUsage {
                user_id,
                capability,
                day,
                was_free,
                resp,
            } => {
                let res = store.record_usage(&user_id, &capability, &day, was_free);
                let _ = resp.send(res);
            }
            StoreCommand::PricingRule { key, resp } => {
                let _ = resp.send(store.pricing_rule(&key));
            }
            StoreCommand::PermissionRule { key, tier, resp } => {
                let _ = resp.send(store.permission_rule(&key, tier));
            }
            StoreCommand::TierPolicy { tier, resp } => {
                let _ = resp.send(store.tier_policy(tier));
            }
            StoreCommand::ImportRules { set, resp } => {
                let _ = resp.send(store.import_rules(&set));
            }
            StoreCommand::AcquireLease {
                lock_key,
                holder,
                lease,
                resp,
            } => {
                let res = store.try_acquire_lease(&lock_key, &holder, lease);
                let _ = resp.send(res);
            }
            StoreCommand::RenewLease {
                lock_key,
                token,
                lease,
                resp,
            } => {
                let _ = resp.send(store.renew_lease(&lock_key, &token, lease));
            }
            StoreCommand::ReleaseLease {
                lock_key,
                token,
                resp,
            } => {
                let _ = resp.send(store.release_lease(&lock_key, &token));
            }
            StoreCommand::CurrentLeader { lock_key, resp } => {
                let _ = resp.send(store.current_leader(&lock_key));
            }
        }
    }
    tracing::debug!("Store server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn test_handle_roundtrip() {
        let db = Database::in_memory().unwrap();
        let (handle, _join) = spawn_store_server(db.store);

        handle.upsert_user("bob", Tier::Vip, None).await.unwrap();
        let balance = handle
            .grant("bob", 25, TransactionKind::Grant, "welcome")
            .await
            .unwrap();
        assert_eq!(balance, 25);
        assert_eq!(handle.balance("bob").await.unwrap(), 25);
        assert_eq!(handle.account("bob").await.unwrap().unwrap().tier, Tier::Vip);
        assert!(handle.account("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_server() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = StoreHandle::new(tx);
        let err = handle.balance("bob").await.unwrap_err();
        assert!(matches!(err, GenTaskError::StoreUnavailable(_)));
    }
}

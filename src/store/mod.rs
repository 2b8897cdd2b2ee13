// src/store/mod.rs — Persistence: repository traits and the SQLite store

pub mod schema;
pub mod server;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use crate::core::types::{
    CreditTransaction, FailOutcome, LedgerEntry, RefundOutcome, Task, TaskFailure, Tier,
    TransactionKind, UsageCounters, UserAccount,
};
use crate::infra::errors::GenTaskError;

pub use server::{spawn_store_server, StoreHandle};
pub use sqlite::Store;

/// A debit about to be written. `amount` is ignored (stored as 0) for free entries.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub id: String,
    pub user_id: String,
    pub task_id: Option<String>,
    pub capability: String,
    pub amount: i64,
    pub is_free: bool,
    pub description: String,
}

impl NewLedgerEntry {
    /// Credits actually taken from the balance.
    pub fn debit(&self) -> i64 {
        if self.is_free {
            0
        } else {
            self.amount.max(0)
        }
    }
}

/// Durable task records. Every transition is conditional on the current
/// state, so a transition attempt on a terminal task is a no-op (`false`).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a PENDING task. With `max_in_flight`, the user's in-flight count
    /// is re-checked in the same transaction.
    async fn insert_task(&self, task: Task, max_in_flight: Option<u32>)
        -> Result<(), GenTaskError>;

    /// Charge `entry` and insert `task` in one transaction, re-checking the
    /// in-flight ceiling first. On any error nothing is written.
    async fn create_charged_task(
        &self,
        entry: NewLedgerEntry,
        task: Task,
        max_in_flight: Option<u32>,
    ) -> Result<LedgerEntry, GenTaskError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, GenTaskError>;

    /// Newest first.
    async fn list_tasks(&self, user_id: &str, limit: u32) -> Result<Vec<Task>, GenTaskError>;

    async fn count_in_flight(&self, user_id: &str) -> Result<u32, GenTaskError>;

    /// PENDING -> PROCESSING.
    async fn claim_task(&self, id: &str, progress: u8) -> Result<bool, GenTaskError>;

    async fn set_external_id(
        &self,
        id: &str,
        external_id: &str,
        progress: u8,
    ) -> Result<bool, GenTaskError>;

    /// Raise progress of a PROCESSING task. `false` if it did not rise.
    async fn update_progress(&self, id: &str, progress: u8) -> Result<bool, GenTaskError>;

    /// Mark a PROCESSING task as active without changing its progress.
    async fn touch_task(&self, id: &str) -> Result<bool, GenTaskError>;

    /// PROCESSING -> SUCCESS with durable result URLs.
    async fn complete_task(
        &self,
        id: &str,
        result_url: &str,
        extra_results: &[String],
    ) -> Result<bool, GenTaskError>;

    /// {PENDING, PROCESSING} -> FAILURE, refunding the linked ledger entry in
    /// the same transaction. With `stale_before`, only applies if the task has
    /// not been updated since that instant. `None` if nothing transitioned.
    async fn fail_task(
        &self,
        id: &str,
        failure: &TaskFailure,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<FailOutcome>, GenTaskError>;

    /// In-flight tasks last updated before `before`, oldest first.
    async fn list_stale(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Task>, GenTaskError>;

    /// PENDING tasks last updated before `before`, oldest first.
    async fn list_pending(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Task>, GenTaskError>;

    /// PROCESSING tasks waiting on an asynchronous provider, least recently
    /// handed out first.
    async fn list_awaiting_poll(&self, limit: u32) -> Result<Vec<Task>, GenTaskError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Debit atomically; `InsufficientCredits` if the balance cannot cover it.
    async fn charge(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, GenTaskError>;

    async fn refund(&self, entry_id: &str, reason: &str) -> Result<RefundOutcome, GenTaskError>;

    async fn entry(&self, id: &str) -> Result<Option<LedgerEntry>, GenTaskError>;

    async fn balance(&self, user_id: &str) -> Result<i64, GenTaskError>;

    /// Credit a user; returns the new balance.
    async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<i64, GenTaskError>;

    /// Top the balance up to `top_up_to` once per `day`. `None` if already
    /// granted that day, else the amount credited (possibly 0).
    async fn grant_daily_gift(
        &self,
        user_id: &str,
        day: &str,
        top_up_to: i64,
    ) -> Result<Option<i64>, GenTaskError>;

    /// Newest first.
    async fn transactions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<CreditTransaction>, GenTaskError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn usage(
        &self,
        user_id: &str,
        capability: &str,
        day: &str,
    ) -> Result<UsageCounters, GenTaskError>;

    async fn record_usage(
        &self,
        user_id: &str,
        capability: &str,
        day: &str,
        was_free: bool,
    ) -> Result<(), GenTaskError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn account(&self, user_id: &str) -> Result<Option<UserAccount>, GenTaskError>;

    /// Create the user or update tier and membership expiry (balance kept).
    async fn upsert_user(
        &self,
        user_id: &str,
        tier: Tier,
        membership_expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserAccount, GenTaskError>;
}

/// Owns the SQLite connection until it is handed to the store actor.
pub struct Database {
    pub store: Store,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self, GenTaskError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        schema::run_migrations(&conn)?;

        Ok(Self {
            store: Store::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, GenTaskError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            store: Store::new(conn),
        })
    }
}

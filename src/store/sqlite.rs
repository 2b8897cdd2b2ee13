// src/store/sqlite.rs — SQLite operations
//
// Every multi-statement write runs in an IMMEDIATE transaction so the write
// lock is taken before the first read; balance checks and state guards are
// expressed as conditional UPDATEs.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::time::Duration;

use super::NewLedgerEntry;
use crate::core::types::{
    CreditTransaction, FailOutcome, LedgerEntry, ProviderBinding, RefundOutcome, Task,
    TaskFailure, Tier, TransactionKind, UsageCounters, UserAccount,
};
use crate::infra::errors::GenTaskError;
use crate::infra::leader::{LeadershipResult, RenewalResult};
use crate::rules::file::RuleSet;
use crate::rules::{PermissionRule, PricingRule, TierPolicy};

/// Fixed-width RFC 3339 (microseconds, `Z`) so TEXT comparison orders by time.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_ts() -> String {
    ts(&Utc::now())
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn col_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn col_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => col_ts(row, idx).map(Some),
    }
}

fn col_json<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, e))
}

fn col_parse<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = GenTaskError>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, e))
}

fn col_opt_parse<T>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = GenTaskError>,
{
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => col_parse(row, idx).map(Some),
    }
}

const TASK_COLUMNS: &str = "id, user_id, kind, provider, model, node_type, prompt, reference_media,
    params, state, progress, result_url, extra_results, error_code, error_message,
    ledger_entry_id, charged, is_free, refunded, external_id, created_at, updated_at,
    completed_at";

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: col_parse(row, 2)?,
        binding: ProviderBinding {
            provider: row.get(3)?,
            model: row.get(4)?,
        },
        node_type: row.get(5)?,
        prompt: row.get(6)?,
        reference_media: col_json(row, 7)?,
        params: col_json(row, 8)?,
        state: col_parse(row, 9)?,
        progress: row.get(10)?,
        result_url: row.get(11)?,
        extra_results: col_json(row, 12)?,
        error_code: col_opt_parse(row, 13)?,
        error_message: row.get(14)?,
        ledger_entry_id: row.get(15)?,
        charged: row.get(16)?,
        is_free: row.get(17)?,
        refunded: row.get(18)?,
        external_id: row.get(19)?,
        created_at: col_ts(row, 20)?,
        updated_at: col_ts(row, 21)?,
        completed_at: col_opt_ts(row, 22)?,
    })
}

const ENTRY_COLUMNS: &str = "id, user_id, task_id, capability, amount, is_free, refunded,
    description, refund_reason, created_at, refunded_at";

fn entry_from_row(row: &Row) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        task_id: row.get(2)?,
        capability: row.get(3)?,
        amount: row.get(4)?,
        is_free: row.get(5)?,
        refunded: row.get(6)?,
        description: row.get(7)?,
        refund_reason: row.get(8)?,
        created_at: col_ts(row, 9)?,
        refunded_at: col_opt_ts(row, 10)?,
    })
}

fn account_from_row(row: &Row) -> rusqlite::Result<UserAccount> {
    Ok(UserAccount {
        id: row.get(0)?,
        tier: col_parse(row, 1)?,
        membership_expires_at: col_opt_ts(row, 2)?,
        balance: row.get(3)?,
        created_at: col_ts(row, 4)?,
    })
}

fn transaction_from_row(row: &Row) -> rusqlite::Result<CreditTransaction> {
    Ok(CreditTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: col_parse(row, 2)?,
        amount: row.get(3)?,
        balance_after: row.get(4)?,
        entry_id: row.get(5)?,
        description: row.get(6)?,
        created_at: col_ts(row, 7)?,
    })
}

#[allow(clippy::too_many_arguments)]
fn journal(
    conn: &Connection,
    user_id: &str,
    kind: TransactionKind,
    amount: i64,
    balance_after: i64,
    entry_id: Option<&str>,
    description: &str,
    now: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO credit_transactions
            (id, user_id, kind, amount, balance_after, entry_id, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            uuid::Uuid::new_v4().to_string(),
            user_id,
            kind.as_str(),
            amount,
            balance_after,
            entry_id,
            description,
            now
        ],
    )?;
    Ok(())
}

fn read_balance(conn: &Connection, user_id: &str) -> Result<i64, GenTaskError> {
    conn.query_row(
        "SELECT balance FROM users WHERE id = ?1",
        [user_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| GenTaskError::UserNotFound(user_id.to_string()))
}

/// Flip `refunded` and credit the user, at most once per entry.
fn refund_entry(
    conn: &Connection,
    entry_id: &str,
    reason: &str,
    now: &str,
) -> Result<RefundOutcome, GenTaskError> {
    let (user_id, amount): (String, i64) = conn
        .query_row(
            "SELECT user_id, amount FROM ledger_entries WHERE id = ?1",
            [entry_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| GenTaskError::EntryNotFound(entry_id.to_string()))?;

    let flipped = conn.execute(
        "UPDATE ledger_entries SET refunded = 1, refund_reason = ?1, refunded_at = ?2
         WHERE id = ?3 AND refunded = 0",
        params![reason, now, entry_id],
    )?;
    if flipped == 0 {
        return Ok(RefundOutcome::AlreadyRefunded);
    }

    if amount > 0 {
        conn.execute(
            "UPDATE users SET balance = balance + ?1, updated_at = ?2 WHERE id = ?3",
            params![amount, now, user_id],
        )?;
    }
    let balance = read_balance(conn, &user_id)?;
    if amount > 0 {
        journal(
            conn,
            &user_id,
            TransactionKind::Refund,
            amount,
            balance,
            Some(entry_id),
            reason,
            now,
        )?;
    }
    conn.execute(
        "UPDATE tasks SET refunded = 1 WHERE ledger_entry_id = ?1",
        [entry_id],
    )?;

    Ok(RefundOutcome::Refunded { amount, balance })
}

/// Low-level SQLite operations for all data types.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    // -- Users --

    pub fn upsert_user(
        &mut self,
        id: &str,
        tier: Tier,
        membership_expires_at: Option<&DateTime<Utc>>,
    ) -> Result<UserAccount, GenTaskError> {
        let now = now_ts();
        self.conn.execute(
            "INSERT INTO users (id, tier, membership_expires_at, balance, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET tier = excluded.tier,
                membership_expires_at = excluded.membership_expires_at,
                updated_at = excluded.updated_at",
            params![id, tier.as_str(), membership_expires_at.map(ts), now],
        )?;
        self.account(id)?
            .ok_or_else(|| GenTaskError::UserNotFound(id.to_string()))
    }

    pub fn account(&self, id: &str) -> Result<Option<UserAccount>, GenTaskError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, tier, membership_expires_at, balance, created_at FROM users WHERE id = ?1",
                [id],
                account_from_row,
            )
            .optional()?)
    }

    // -- Ledger --

    pub fn charge(&mut self, req: &NewLedgerEntry) -> Result<LedgerEntry, GenTaskError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry = debit_entry(&tx, req, Utc::now())?;
        tx.commit()?;
        Ok(entry)
    }

    pub fn refund(&mut self, entry_id: &str, reason: &str) -> Result<RefundOutcome, GenTaskError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = refund_entry(&tx, entry_id, reason, &now_ts())?;
        tx.commit()?;
        Ok(outcome)
    }

    pub fn entry(&self, id: &str) -> Result<Option<LedgerEntry>, GenTaskError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = ?1"),
                [id],
                entry_from_row,
            )
            .optional()?)
    }

    pub fn balance(&self, user_id: &str) -> Result<i64, GenTaskError> {
        read_balance(&self.conn, user_id)
    }

    pub fn grant(
        &mut self,
        user_id: &str,
        amount: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<i64, GenTaskError> {
        let now = now_ts();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "UPDATE users SET balance = balance + ?1, updated_at = ?2 WHERE id = ?3",
            params![amount, now, user_id],
        )?;
        if updated == 0 {
            return Err(GenTaskError::UserNotFound(user_id.to_string()));
        }
        let balance = read_balance(&tx, user_id)?;
        journal(&tx, user_id, kind, amount, balance, None, description, &now)?;
        tx.commit()?;
        Ok(balance)
    }

    pub fn grant_daily_gift(
        &mut self,
        user_id: &str,
        day: &str,
        top_up_to: i64,
    ) -> Result<Option<i64>, GenTaskError> {
        let now = now_ts();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let balance = read_balance(&tx, user_id)?;

        let claimed = tx.execute(
            "INSERT OR IGNORE INTO gift_grants (user_id, day, amount, created_at)
             VALUES (?1, ?2, 0, ?3)",
            params![user_id, day, now],
        )?;
        if claimed == 0 {
            return Ok(None);
        }

        let top_up = (top_up_to - balance).max(0);
        if top_up > 0 {
            tx.execute(
                "UPDATE users SET balance = balance + ?1, updated_at = ?2 WHERE id = ?3",
                params![top_up, now, user_id],
            )?;
            tx.execute(
                "UPDATE gift_grants SET amount = ?1 WHERE user_id = ?2 AND day = ?3",
                params![top_up, user_id, day],
            )?;
            journal(
                &tx,
                user_id,
                TransactionKind::Gift,
                top_up,
                balance + top_up,
                None,
                &format!("daily gift {day}"),
                &now,
            )?;
        }
        tx.commit()?;
        Ok(Some(top_up))
    }

    pub fn transactions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<CreditTransaction>, GenTaskError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, kind, amount, balance_after, entry_id, description, created_at
             FROM credit_transactions WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit], transaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- Tasks --

    pub fn insert_task(&mut self, task: &Task, max_in_flight: Option<u32>) -> Result<(), GenTaskError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_in_flight(&tx, &task.user_id, max_in_flight)?;
        insert_task_row(&tx, task)?;
        tx.commit()?;
        Ok(())
    }

    /// Ceiling re-check, debit and task row in one transaction: either the
    /// task exists with its entry or neither was written.
    pub fn create_charged_task(
        &mut self,
        req: &NewLedgerEntry,
        task: &Task,
        max_in_flight: Option<u32>,
    ) -> Result<LedgerEntry, GenTaskError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_in_flight(&tx, &task.user_id, max_in_flight)?;
        let entry = debit_entry(&tx, req, Utc::now())?;
        insert_task_row(&tx, task)?;
        tx.commit()?;
        Ok(entry)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>, GenTaskError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                task_from_row,
            )
            .optional()?)
    }

    pub fn list_tasks(&self, user_id: &str, limit: u32) -> Result<Vec<Task>, GenTaskError> {
        self.query_tasks(
            "WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            params![user_id, limit],
        )
    }

    pub fn count_in_flight(&self, user_id: &str) -> Result<u32, GenTaskError> {
        count_in_flight(&self.conn, user_id)
    }

    pub fn claim_task(&mut self, id: &str, progress: u8) -> Result<bool, GenTaskError> {
        let n = self.conn.execute(
            "UPDATE tasks SET state = 'PROCESSING', progress = MAX(progress, ?1), updated_at = ?2
             WHERE id = ?3 AND state = 'PENDING'",
            params![progress, now_ts(), id],
        )?;
        Ok(n == 1)
    }

    pub fn set_external_id(
        &mut self,
        id: &str,
        external_id: &str,
        progress: u8,
    ) -> Result<bool, GenTaskError> {
        let n = self.conn.execute(
            "UPDATE tasks SET external_id = ?1, progress = MAX(progress, ?2), updated_at = ?3
             WHERE id = ?4 AND state = 'PROCESSING'",
            params![external_id, progress, now_ts(), id],
        )?;
        Ok(n == 1)
    }

    /// Only a rise counts as activity: `updated_at` stays put otherwise, so a
    /// job stuck at the same progress still ages towards the reaper threshold.
    /// Bump `updated_at` of a PROCESSING task without changing anything else.
    pub fn touch_task(&mut self, id: &str) -> Result<bool, GenTaskError> {
        let n = self.conn.execute(
            "UPDATE tasks SET updated_at = ?1 WHERE id = ?2 AND state = 'PROCESSING'",
            params![now_ts(), id],
        )?;
        Ok(n == 1)
    }

    pub fn update_progress(&mut self, id: &str, progress: u8) -> Result<bool, GenTaskError> {
        let n = self.conn.execute(
            "UPDATE tasks SET progress = ?1, updated_at = ?2
             WHERE id = ?3 AND state = 'PROCESSING' AND progress < ?1",
            params![progress.min(99), now_ts(), id],
        )?;
        Ok(n == 1)
    }

    pub fn complete_task(
        &mut self,
        id: &str,
        result_url: &str,
        extra_results: &[String],
    ) -> Result<bool, GenTaskError> {
        let now = now_ts();
        let n = self.conn.execute(
            "UPDATE tasks SET state = 'SUCCESS', progress = 100, result_url = ?1,
                extra_results = ?2, updated_at = ?3, completed_at = ?3
             WHERE id = ?4 AND state = 'PROCESSING'",
            params![result_url, serde_json::to_string(extra_results)?, now, id],
        )?;
        Ok(n == 1)
    }

    pub fn fail_task(
        &mut self,
        id: &str,
        failure: &TaskFailure,
        stale_before: Option<&DateTime<Utc>>,
    ) -> Result<Option<FailOutcome>, GenTaskError> {
        let now = now_ts();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let failed = tx.execute(
            "UPDATE tasks SET state = 'FAILURE', error_code = ?1, error_message = ?2,
                updated_at = ?3, completed_at = ?3
             WHERE id = ?4 AND state IN ('PENDING', 'PROCESSING')
               AND (?5 IS NULL OR updated_at < ?5)",
            params![
                failure.code.as_str(),
                failure.message,
                now,
                id,
                stale_before.map(ts)
            ],
        )?;
        if failed == 0 {
            return Ok(None);
        }

        let entry_id: Option<String> = tx.query_row(
            "SELECT ledger_entry_id FROM tasks WHERE id = ?1",
            [id],
            |r| r.get(0),
        )?;
        let refund = match entry_id {
            Some(ref e) => Some(refund_entry(&tx, e, &failure.message, &now)?),
            None => None,
        };
        tx.commit()?;
        Ok(Some(FailOutcome { refund }))
    }

    pub fn list_stale(&self, before: &DateTime<Utc>, limit: u32) -> Result<Vec<Task>, GenTaskError> {
        self.query_tasks(
            "WHERE state IN ('PENDING', 'PROCESSING') AND updated_at < ?1
             ORDER BY updated_at ASC LIMIT ?2",
            params![ts(before), limit],
        )
    }

    /// PENDING tasks not touched since `before`, oldest first.
    pub fn list_pending(&self, before: &DateTime<Utc>, limit: u32) -> Result<Vec<Task>, GenTaskError> {
        self.query_tasks(
            "WHERE state = 'PENDING' AND updated_at < ?1 ORDER BY updated_at ASC LIMIT ?2",
            params![ts(before), limit],
        )
    }

    /// The next batch of jobs to poll, least recently polled first. Handing
    /// a task out stamps it, so a batch of stalled jobs cannot starve the rest.
    pub fn list_awaiting_poll(&mut self, limit: u32) -> Result<Vec<Task>, GenTaskError> {
        let now = now_ts();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let tasks = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE state = 'PROCESSING' AND external_id IS NOT NULL
                 ORDER BY COALESCE(last_polled_at, '') ASC, updated_at ASC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for task in &tasks {
            tx.execute(
                "UPDATE tasks SET last_polled_at = ?1 WHERE id = ?2",
                params![now, task.id],
            )?;
        }
        tx.commit()?;
        Ok(tasks)
    }

    fn query_tasks(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Task>, GenTaskError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks {clause}"))?;
        let rows = stmt
            .query_map(args, task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- Usage --

    pub fn usage(&self, user_id: &str, capability: &str, day: &str) -> Result<UsageCounters, GenTaskError> {
        let counters = self
            .conn
            .query_row(
                "SELECT used, free_used FROM daily_usage
                 WHERE user_id = ?1 AND capability = ?2 AND day = ?3",
                params![user_id, capability, day],
                |r| {
                    Ok(UsageCounters {
                        used: r.get(0)?,
                        free_used: r.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(counters.unwrap_or_default())
    }

    pub fn record_usage(
        &mut self,
        user_id: &str,
        capability: &str,
        day: &str,
        was_free: bool,
    ) -> Result<(), GenTaskError> {
        self.conn.execute(
            "INSERT INTO daily_usage (user_id, capability, day, used, free_used)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(user_id, capability, day) DO UPDATE SET
                used = used + 1,
                free_used = free_used + excluded.free_used",
            params![user_id, capability, day, was_free as i64],
        )?;
        Ok(())
    }

    // -- Rules --

    pub fn pricing_rule(&self, key: &str) -> Result<Option<PricingRule>, GenTaskError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT rule FROM pricing_rules WHERE key = ?1",
                [key],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub fn permission_rule(&self, key: &str, tier: Tier) -> Result<Option<PermissionRule>, GenTaskError> {
        Ok(self
            .conn
            .query_row(
                "SELECT key, tier, allowed, daily_limit, free_daily_limit
                 FROM permission_rules WHERE key = ?1 AND tier = ?2",
                params![key, tier.as_str()],
                |r| {
                    Ok(PermissionRule {
                        key: r.get(0)?,
                        tier: col_parse(r, 1)?,
                        allowed: r.get(2)?,
                        daily_limit: r.get(3)?,
                        free_daily_limit: r.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn tier_policy(&self, tier: Tier) -> Result<Option<TierPolicy>, GenTaskError> {
        Ok(self
            .conn
            .query_row(
                "SELECT tier, max_concurrency, daily_gift_credits, gift_days
                 FROM tier_policies WHERE tier = ?1",
                [tier.as_str()],
                |r| {
                    Ok(TierPolicy {
                        tier: col_parse(r, 0)?,
                        max_concurrency: r.get(1)?,
                        daily_gift_credits: r.get(2)?,
                        gift_days: r.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    /// Upsert every rule in the set. Returns the number of rows written.
    pub fn import_rules(&mut self, set: &RuleSet) -> Result<usize, GenTaskError> {
        let now = now_ts();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut written = 0;

        for rule in &set.pricing {
            written += tx.execute(
                "INSERT INTO pricing_rules (key, rule, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET rule = excluded.rule, updated_at = excluded.updated_at",
                params![rule.key, serde_json::to_string(rule)?, now],
            )?;
        }
        for rule in &set.permissions {
            written += tx.execute(
                "INSERT INTO permission_rules (key, tier, allowed, daily_limit, free_daily_limit, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key, tier) DO UPDATE SET allowed = excluded.allowed,
                    daily_limit = excluded.daily_limit,
                    free_daily_limit = excluded.free_daily_limit,
                    updated_at = excluded.updated_at",
                params![
                    rule.key,
                    rule.tier.as_str(),
                    rule.allowed,
                    rule.daily_limit,
                    rule.free_daily_limit,
                    now
                ],
            )?;
        }
        for policy in &set.tiers {
            written += tx.execute(
                "INSERT INTO tier_policies (tier, max_concurrency, daily_gift_credits, gift_days, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(tier) DO UPDATE SET max_concurrency = excluded.max_concurrency,
                    daily_gift_credits = excluded.daily_gift_credits,
                    gift_days = excluded.gift_days,
                    updated_at = excluded.updated_at",
                params![
                    policy.tier.as_str(),
                    policy.max_concurrency,
                    policy.daily_gift_credits,
                    policy.gift_days,
                    now
                ],
            )?;
        }
        tx.commit()?;
        Ok(written)
    }

    // -- Leases --

    pub fn try_acquire_lease(
        &mut self,
        lock_key: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<LeadershipResult, GenTaskError> {
        let now = Utc::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT holder, expires_at FROM leases WHERE lock_key = ?1",
                [lock_key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        if let Some((current, expires_at)) = existing {
            if current != holder && expires_at > ts(&now) {
                return Ok(LeadershipResult::NotLeader {
                    current_leader: Some(current),
                });
            }
        }

        let token = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO leases (lock_key, holder, token, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(lock_key) DO UPDATE SET holder = excluded.holder,
                token = excluded.token, expires_at = excluded.expires_at",
            params![lock_key, holder, token, ts(&lease_expiry(now, lease))],
        )?;
        tx.commit()?;

        Ok(LeadershipResult::Acquired {
            lease_token: token,
            lease_duration: lease,
        })
    }

    pub fn renew_lease(
        &mut self,
        lock_key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<RenewalResult, GenTaskError> {
        let now = Utc::now();
        let n = self.conn.execute(
            "UPDATE leases SET expires_at = ?1
             WHERE lock_key = ?2 AND token = ?3 AND expires_at > ?4",
            params![ts(&lease_expiry(now, lease)), lock_key, token, ts(&now)],
        )?;
        Ok(if n == 1 {
            RenewalResult::Renewed {
                lease_duration: lease,
            }
        } else {
            RenewalResult::Lost
        })
    }

    pub fn release_lease(&mut self, lock_key: &str, token: &str) -> Result<bool, GenTaskError> {
        let n = self.conn.execute(
            "DELETE FROM leases WHERE lock_key = ?1 AND token = ?2",
            params![lock_key, token],
        )?;
        Ok(n == 1)
    }

    pub fn current_leader(&self, lock_key: &str) -> Result<Option<String>, GenTaskError> {
        Ok(self
            .conn
            .query_row(
                "SELECT holder FROM leases WHERE lock_key = ?1 AND expires_at > ?2",
                params![lock_key, now_ts()],
                |r| r.get(0),
            )
            .optional()?)
    }
}

fn count_in_flight(conn: &Connection, user_id: &str) -> Result<u32, GenTaskError> {
    let n: u32 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE user_id = ?1 AND state IN ('PENDING', 'PROCESSING')",
        [user_id],
        |r| r.get(0),
    )?;
    Ok(n)
}

fn check_in_flight(conn: &Connection, user_id: &str, max: Option<u32>) -> Result<(), GenTaskError> {
    if let Some(max) = max {
        let current = count_in_flight(conn, user_id)?;
        if current >= max {
            return Err(GenTaskError::ConcurrencyLimitExceeded { current, max });
        }
    }
    Ok(())
}

/// Conditional debit plus its ledger entry and journal row. The caller owns
/// the transaction.
fn debit_entry(
    conn: &Connection,
    req: &NewLedgerEntry,
    now: DateTime<Utc>,
) -> Result<LedgerEntry, GenTaskError> {
    let now_s = ts(&now);
    let amount = req.debit();
    let balance = read_balance(conn, &req.user_id)?;

    if amount > 0 {
        let debited = conn.execute(
            "UPDATE users SET balance = balance - ?1, updated_at = ?2
             WHERE id = ?3 AND balance >= ?1",
            params![amount, now_s, req.user_id],
        )?;
        if debited == 0 {
            return Err(GenTaskError::InsufficientCredits {
                required: amount,
                available: balance,
            });
        }
    }

    conn.execute(
        "INSERT INTO ledger_entries
            (id, user_id, task_id, capability, amount, is_free, refunded, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
        params![
            req.id,
            req.user_id,
            req.task_id,
            req.capability,
            amount,
            req.is_free,
            req.description,
            now_s
        ],
    )?;
    if amount > 0 {
        journal(
            conn,
            &req.user_id,
            TransactionKind::Consume,
            -amount,
            balance - amount,
            Some(&req.id),
            &req.description,
            &now_s,
        )?;
    }

    Ok(LedgerEntry {
        id: req.id.clone(),
        user_id: req.user_id.clone(),
        task_id: req.task_id.clone(),
        capability: req.capability.clone(),
        amount,
        is_free: req.is_free,
        refunded: false,
        description: req.description.clone(),
        refund_reason: None,
        created_at: now,
        refunded_at: None,
    })
}

fn insert_task_row(conn: &Connection, task: &Task) -> Result<(), GenTaskError> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
              ?19, ?20, ?21, ?22, ?23)"
        ),
        params![
            task.id,
            task.user_id,
            task.kind.as_str(),
            task.binding.provider,
            task.binding.model,
            task.node_type,
            task.prompt,
            serde_json::to_string(&task.reference_media)?,
            serde_json::to_string(&task.params)?,
            task.state.as_str(),
            task.progress,
            task.result_url,
            serde_json::to_string(&task.extra_results)?,
            task.error_code.map(|c| c.as_str()),
            task.error_message,
            task.ledger_entry_id,
            task.charged,
            task.is_free,
            task.refunded,
            task.external_id,
            ts(&task.created_at),
            ts(&task.updated_at),
            task.completed_at.as_ref().map(ts),
        ],
    )?;
    Ok(())
}

fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

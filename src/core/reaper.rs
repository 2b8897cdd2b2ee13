// src/core/reaper.rs — Zombie reaper
//
// Backstop for tasks whose processing was lost (crash, dropped message,
// provider that never answers). Each failure is guarded on the task still
// being older than the cutoff, so a task that moved in the meantime is left
// alone.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::core::types::{FailureCode, RefundOutcome, TaskFailure};
use crate::infra::config::ReaperConfig;
use crate::infra::errors::GenTaskError;
use crate::infra::leader::{LeaderElector, LeaseGuard};
use crate::store::TaskStore;

/// Lease name shared by every instance; only its holder sweeps.
pub const REAPER_LOCK: &str = "zombie-reaper";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub failed: usize,
    pub refunded: usize,
    pub credits_refunded: i64,
}

pub struct ZombieReaper {
    tasks: Arc<dyn TaskStore>,
    batch_size: u32,
}

impl ZombieReaper {
    pub fn new(tasks: Arc<dyn TaskStore>, batch_size: u32) -> Self {
        Self {
            tasks,
            batch_size: batch_size.max(1),
        }
    }

    /// Fail and refund every in-flight task not updated within `threshold`.
    pub async fn sweep(&self, threshold: Duration) -> Result<SweepReport, GenTaskError> {
        self.sweep_at(threshold, Utc::now()).await
    }

    pub async fn sweep_at(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, GenTaskError> {
        let threshold_chrono = chrono::Duration::from_std(threshold)
            .map_err(|e| GenTaskError::Config(format!("reaper threshold: {e}")))?;
        let cutoff = now - threshold_chrono;
        let failure = TaskFailure::new(
            FailureCode::ZombieTimeout,
            format!("no progress for {}s, presumed lost", threshold.as_secs()),
        );

        let mut report = SweepReport::default();
        loop {
            let page = self.tasks.list_stale(cutoff, self.batch_size).await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            let mut page_failed = 0;

            for task in page {
                report.examined += 1;
                let Some(outcome) = self.tasks.fail_task(&task.id, &failure, Some(cutoff)).await?
                else {
                    tracing::debug!(task_id = %task.id, "Zombie candidate moved on, skipped");
                    continue;
                };
                page_failed += 1;
                report.failed += 1;
                if let Some(RefundOutcome::Refunded { amount, .. }) = outcome.refund {
                    report.refunded += 1;
                    report.credits_refunded += amount;
                }
                tracing::warn!(
                    task_id = %task.id,
                    user_id = %task.user_id,
                    state = %task.state,
                    last_update = %task.updated_at,
                    "Reaped zombie task"
                );
            }

            // Skipped rows stay out of the next page; a short or fruitless
            // page means nothing is left.
            if page_len < self.batch_size as usize || page_failed == 0 {
                break;
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                failed = report.failed,
                refunded = report.refunded,
                credits = report.credits_refunded,
                "Zombie sweep finished"
            );
        }
        Ok(report)
    }
}

/// Sweep on a fixed interval while holding the reaper lease.
pub async fn run_reaper(
    reaper: ZombieReaper,
    elector: Arc<dyn LeaderElector>,
    instance_id: String,
    config: ReaperConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lease = LeaseGuard::new(
        REAPER_LOCK,
        instance_id,
        Duration::from_secs(config.lease_secs),
    );

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(config.initial_delay_secs)) => {}
        _ = shutdown.changed() => return,
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match lease.ensure(elector.as_ref()).await {
                    Ok(true) => {
                        if let Err(e) = reaper.sweep(config.threshold()).await {
                            tracing::error!(error = %e, "Zombie sweep failed");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "Reaper lease check failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Err(e) = lease.release(elector.as_ref()).await {
        tracing::warn!(error = %e, "Reaper lease not released");
    }
    tracing::info!("Reaper stopped");
}

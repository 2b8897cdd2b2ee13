// src/infra/leader.rs — Lease-based leader election
//
// Background jobs that must run on exactly one instance (the zombie reaper)
// acquire a named lease before doing work and renew it while they keep it.

use async_trait::async_trait;
use std::time::Duration;

use crate::infra::errors::GenTaskError;

/// Result of a leadership acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    /// Successfully acquired leadership.
    Acquired {
        /// Lease token that must be used for renewal and release.
        lease_token: String,
        lease_duration: Duration,
    },
    /// Leadership is held by another instance.
    NotLeader { current_leader: Option<String> },
}

impl LeadershipResult {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    pub fn lease_token(&self) -> Option<&str> {
        match self {
            Self::Acquired { lease_token, .. } => Some(lease_token),
            Self::NotLeader { .. } => None,
        }
    }
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    Renewed { lease_duration: Duration },
    /// Lease expired or was taken by another instance.
    Lost,
}

impl RenewalResult {
    pub fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Acquire `lock_key` for `instance_id` unless another instance holds an
    /// unexpired lease. Re-acquiring an own lease issues a fresh token.
    async fn try_acquire(
        &self,
        lock_key: &str,
        instance_id: &str,
        lease: Duration,
    ) -> Result<LeadershipResult, GenTaskError>;

    async fn renew(
        &self,
        lock_key: &str,
        lease_token: &str,
        lease: Duration,
    ) -> Result<RenewalResult, GenTaskError>;

    /// `true` if the lease was held with this token and is now released.
    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool, GenTaskError>;

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>, GenTaskError>;
}

/// Tracks this instance's hold on one lease across ticks.
pub struct LeaseGuard {
    lock_key: String,
    instance_id: String,
    lease: Duration,
    token: Option<String>,
}

impl LeaseGuard {
    pub fn new(lock_key: impl Into<String>, instance_id: impl Into<String>, lease: Duration) -> Self {
        Self {
            lock_key: lock_key.into(),
            instance_id: instance_id.into(),
            lease,
            token: None,
        }
    }

    /// Renew the lease if held, otherwise try to acquire it. Returns whether
    /// this instance is the leader for the coming tick.
    pub async fn ensure(&mut self, elector: &dyn LeaderElector) -> Result<bool, GenTaskError> {
        if let Some(ref token) = self.token {
            if elector
                .renew(&self.lock_key, token, self.lease)
                .await?
                .is_renewed()
            {
                return Ok(true);
            }
            tracing::info!(lock = %self.lock_key, "Lost leadership lease");
            self.token = None;
        }

        match elector
            .try_acquire(&self.lock_key, &self.instance_id, self.lease)
            .await?
        {
            LeadershipResult::Acquired { lease_token, .. } => {
                tracing::info!(lock = %self.lock_key, instance = %self.instance_id, "Acquired leadership lease");
                self.token = Some(lease_token);
                Ok(true)
            }
            LeadershipResult::NotLeader { current_leader } => {
                tracing::debug!(
                    lock = %self.lock_key,
                    leader = current_leader.as_deref().unwrap_or("unknown"),
                    "Not the leader"
                );
                Ok(false)
            }
        }
    }

    /// Give the lease up (orderly shutdown).
    pub async fn release(&mut self, elector: &dyn LeaderElector) -> Result<(), GenTaskError> {
        if let Some(token) = self.token.take() {
            elector.release(&self.lock_key, &token).await?;
        }
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }
}

// src/provider/timeout.rs — Bounded provider calls
//
// Wraps any GenerationProvider so that `generate` and `poll` cannot hang.
// An overrun surfaces as `GenTaskError::Timeout` and goes down the normal
// failure path.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{GenerationProvider, GenerationRequest, Generation, PollStatus};
use crate::core::types::TaskKind;
use crate::infra::errors::GenTaskError;

pub struct TimeoutProvider {
    inner: Arc<dyn GenerationProvider>,
    timeout: Duration,
}

impl TimeoutProvider {
    pub fn new(inner: Arc<dyn GenerationProvider>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn elapsed(&self, call: &str) -> GenTaskError {
        GenTaskError::Timeout {
            operation: format!("{} {call}", self.inner.id()),
            secs: self.timeout.as_secs(),
        }
    }
}

#[async_trait]
impl GenerationProvider for TimeoutProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supports(&self, kind: TaskKind) -> bool {
        self.inner.supports(kind)
    }

    fn allows_partial_batch(&self, kind: TaskKind) -> bool {
        self.inner.allows_partial_batch(kind)
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenTaskError> {
        match tokio::time::timeout(self.timeout, self.inner.generate(request)).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(provider = self.inner.id(), task_id = %request.task_id, "generate timed out");
                Err(self.elapsed("generate"))
            }
        }
    }

    async fn poll(
        &self,
        external_id: &str,
        request: &GenerationRequest,
    ) -> Result<PollStatus, GenTaskError> {
        match tokio::time::timeout(self.timeout, self.inner.poll(external_id, request)).await {
            Ok(res) => res,
            Err(_) => Err(self.elapsed("poll")),
        }
    }
}

// src/core/lifecycle.rs — Task lifecycle manager
//
// Creation runs on the request path: gate, limit, charge and persist in one
// store transaction, then offer the task to the queue without waiting.
// Processing and polling run on the worker pool. Every failure on the
// generation path goes through the same store transition, which refunds the
// task's ledger entry in the same transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::core::concurrency::ConcurrencyLimiter;
use crate::core::entitlement::EntitlementGate;
use crate::core::ledger::CreditLedger;
use crate::core::materializer::ResultMaterializer;
use crate::core::pricing::QuantityParams;
use crate::core::types::{
    CapabilityRef, FailureCode, GenerationParams, ProviderBinding, RefundOutcome, Task,
    TaskFailure, TaskKind, TaskState, TaskSummary, TaskView,
};
use crate::core::worker::{TaskMessage, TaskQueue};
use crate::infra::config::WorkerConfig;
use crate::infra::errors::GenTaskError;
use crate::provider::{
    Generation, GenerationProvider, GenerationRequest, PollStatus, ProviderRegistry, ResultRef,
};
use crate::rules::RuleSource;
use crate::store::{LedgerStore, StoreHandle, TaskStore, UsageStore, UserDirectory};

/// Upper bound on outputs per task.
pub const MAX_QUANTITY: u32 = 10;
pub const DEFAULT_LIST_LIMIT: u32 = 20;
pub const MAX_LIST_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTaskRequest {
    pub user_id: String,
    pub kind: TaskKind,
    pub binding: ProviderBinding,
    pub node_type: Option<String>,
    pub prompt: String,
    pub reference_media: Vec<String>,
    pub params: GenerationParams,
}

impl CreateTaskRequest {
    fn validate(&self) -> Result<(), GenTaskError> {
        if self.user_id.trim().is_empty() {
            return Err(GenTaskError::Validation("user id is required".into()));
        }
        if self.prompt.trim().is_empty() && self.reference_media.is_empty() {
            return Err(GenTaskError::Validation(
                "a prompt or reference media is required".into(),
            ));
        }
        for media in &self.reference_media {
            if url::Url::parse(media).is_err() {
                return Err(GenTaskError::Validation(format!(
                    "reference media '{media}' is not a URL"
                )));
            }
        }
        if let Some(d) = self.params.duration_secs {
            if !d.is_finite() || d <= 0.0 {
                return Err(GenTaskError::Validation(format!(
                    "duration must be positive, got {d}"
                )));
            }
        }
        if let Some(q) = self.params.quantity {
            if q == 0 || q > MAX_QUANTITY {
                return Err(GenTaskError::Validation(format!(
                    "quantity must be between 1 and {MAX_QUANTITY}, got {q}"
                )));
            }
        }
        Ok(())
    }
}

/// Returned synchronously by `create_task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedTask {
    pub task_id: String,
    pub charged: i64,
    pub is_free: bool,
    pub free_remaining: Option<u32>,
}

/// The repositories the manager works against. Tests substitute any of them.
#[derive(Clone)]
pub struct Repositories {
    pub tasks: Arc<dyn TaskStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub usage: Arc<dyn UsageStore>,
    pub users: Arc<dyn UserDirectory>,
    pub rules: Arc<dyn RuleSource>,
}

impl Repositories {
    /// Everything from one store actor, with rules from `rules` (usually a
    /// cache in front of the same store).
    pub fn from_store(store: &StoreHandle, rules: Arc<dyn RuleSource>) -> Self {
        let handle = Arc::new(store.clone());
        Self {
            tasks: handle.clone(),
            ledger: handle.clone(),
            usage: handle.clone(),
            users: handle,
            rules,
        }
    }
}

pub struct TaskManager {
    tasks: Arc<dyn TaskStore>,
    gate: EntitlementGate,
    limiter: ConcurrencyLimiter,
    ledger: CreditLedger,
    providers: ProviderRegistry,
    materializer: ResultMaterializer,
    queue: TaskQueue,
    config: WorkerConfig,
}

impl TaskManager {
    pub fn new(
        repos: Repositories,
        providers: ProviderRegistry,
        materializer: ResultMaterializer,
        queue: TaskQueue,
        config: WorkerConfig,
    ) -> Self {
        Self {
            gate: EntitlementGate::new(repos.users.clone(), repos.usage, repos.rules.clone()),
            limiter: ConcurrencyLimiter::new(
                repos.tasks.clone(),
                repos.users.clone(),
                repos.rules.clone(),
            ),
            ledger: CreditLedger::new(repos.ledger, repos.users, repos.rules),
            tasks: repos.tasks,
            providers,
            materializer,
            queue,
            config,
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn gate(&self) -> &EntitlementGate {
        &self.gate
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Gate, charge and persist a task, then hand it to the workers.
    /// Rejections happen before anything is charged.
    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<CreatedTask, GenTaskError> {
        req.validate()?;
        self.providers.resolve(&req.binding, req.kind)?;

        let capability = CapabilityRef::for_task(&req.binding, req.kind, req.node_type.as_deref());
        let decision = self.gate.check_permission(&req.user_id, &capability).await?;
        decision.ensure_allowed(&capability)?;

        let concurrency = self
            .limiter
            .check_for_tier(&req.user_id, decision.tier)
            .await?;
        concurrency.ensure_allowed()?;

        let task_id = uuid::Uuid::new_v4().to_string();
        let quantity = QuantityParams::from_params(&req.params, &req.prompt);
        let pending = self
            .ledger
            .quote(
                &req.user_id,
                &capability,
                &quantity,
                decision.is_free,
                Some(&task_id),
            )
            .await?;

        let now = Utc::now();
        let task = Task {
            id: task_id.clone(),
            user_id: req.user_id.clone(),
            kind: req.kind,
            binding: req.binding.clone(),
            node_type: req.node_type,
            prompt: req.prompt,
            reference_media: req.reference_media,
            params: req.params,
            state: TaskState::Pending,
            progress: 0,
            result_url: None,
            extra_results: Vec::new(),
            error_code: None,
            error_message: None,
            ledger_entry_id: Some(pending.id.clone()),
            charged: pending.debit(),
            is_free: pending.is_free,
            refunded: false,
            external_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        // Debit and insert commit together; the ceiling is re-checked inside
        let entry = self
            .tasks
            .create_charged_task(pending, task, concurrency.max)
            .await?;

        if let Err(e) = self
            .gate
            .record_usage(&req.user_id, &capability, decision.is_free)
            .await
        {
            tracing::warn!(task_id = %task_id, error = %e, "Usage not recorded");
        }

        tracing::info!(
            task_id = %task_id,
            user_id = %req.user_id,
            provider = %req.binding.provider,
            model = %req.binding.model,
            credits = entry.amount,
            is_free = entry.is_free,
            "Task created"
        );

        // Never wait for queue room here; the poll driver requeues PENDING
        // tasks that missed the queue
        if !self.queue.try_enqueue(TaskMessage::Process(task_id.clone())) {
            tracing::warn!(task_id = %task_id, "Task not queued, left for requeue");
        }

        Ok(CreatedTask {
            task_id,
            charged: entry.amount,
            is_free: entry.is_free,
            free_remaining: decision.free_remaining,
        })
    }

    /// PENDING -> PROCESSING, then call the provider. An asynchronous job
    /// leaves the task PROCESSING with its external id for the poll driver.
    pub async fn process_task(&self, task_id: &str) -> Result<(), GenTaskError> {
        let task = self.load(task_id).await?;
        if task.state != TaskState::Pending {
            tracing::debug!(task_id, state = %task.state, "Skipping process: not pending");
            return Ok(());
        }
        if !self
            .tasks
            .claim_task(task_id, self.config.start_progress)
            .await?
        {
            tracing::debug!(task_id, "Task claimed elsewhere");
            return Ok(());
        }

        let provider = match self.providers.resolve(&task.binding, task.kind) {
            Ok(p) => p,
            Err(e) => return self.fail(task_id, TaskFailure::from_error(&e)).await,
        };

        tracing::info!(task_id, provider = provider.id(), model = %task.binding.model, "Processing task");
        let request = GenerationRequest::from_task(&task);
        match provider.generate(&request).await {
            Ok(Generation::Ready(result)) => self.finish(&task, provider.as_ref(), result).await,
            Ok(Generation::Pending {
                external_id,
                progress,
            }) => {
                let progress = progress
                    .unwrap_or(0)
                    .max(self.config.submitted_progress)
                    .min(99);
                if self
                    .tasks
                    .set_external_id(task_id, &external_id, progress)
                    .await?
                {
                    tracing::info!(task_id, %external_id, "Awaiting provider job");
                } else {
                    tracing::warn!(task_id, %external_id, "Task ended before its job id was recorded");
                }
                Ok(())
            }
            Err(e) => self.fail(task_id, TaskFailure::from_error(&e)).await,
        }
    }

    /// One poll of an asynchronous job. The provider is always asked first,
    /// so a job that finished while it waited for its turn still succeeds.
    /// Transient poll errors wait for the next tick; a job with no progress
    /// for the poll timeout fails.
    pub async fn poll_task(&self, task_id: &str) -> Result<(), GenTaskError> {
        let task = self.load(task_id).await?;
        let external_id = match task.external_id {
            Some(ref id) if task.state == TaskState::Processing => id.clone(),
            _ => {
                tracing::debug!(task_id, state = %task.state, "Skipping poll: no job to poll");
                return Ok(());
            }
        };

        let provider = match self.providers.resolve(&task.binding, task.kind) {
            Ok(p) => p,
            Err(e) => return self.fail(task_id, TaskFailure::from_error(&e)).await,
        };

        let request = GenerationRequest::from_task(&task);
        match provider.poll(&external_id, &request).await {
            Ok(PollStatus::Ready(result)) => self.finish(&task, provider.as_ref(), result).await,
            Ok(PollStatus::Pending { progress }) => {
                if let Some(p) = progress {
                    if self.tasks.update_progress(task_id, p).await? {
                        tracing::debug!(task_id, progress = p, "Progress");
                        return Ok(());
                    }
                }
                self.fail_if_stalled(&task, &external_id).await
            }
            Err(e) if e.is_retriable() => {
                tracing::warn!(task_id, error = %e, "Poll failed, retrying next tick");
                self.fail_if_stalled(&task, &external_id).await
            }
            Err(e) => self.fail(task_id, TaskFailure::from_error(&e)).await,
        }
    }

    async fn fail_if_stalled(&self, task: &Task, external_id: &str) -> Result<(), GenTaskError> {
        let Some(cutoff) = self.poll_cutoff(Utc::now()) else {
            return Ok(());
        };
        if task.updated_at >= cutoff {
            return Ok(());
        }
        let failure = TaskFailure::new(
            FailureCode::Timeout,
            format!(
                "provider job {external_id} made no progress for {}s",
                self.config.poll_timeout_secs
            ),
        );
        self.fail_guarded(&task.id, failure, Some(cutoff)).await
    }

    /// Force a non-terminal task owned by `user_id` to FAILURE (refunded).
    pub async fn cancel_task(&self, user_id: &str, task_id: &str) -> Result<TaskView, GenTaskError> {
        let task = self.owned(user_id, task_id).await?;
        if task.state.is_terminal() {
            return Err(already_terminal(&task));
        }

        let failure = TaskFailure::new(FailureCode::Cancelled, "cancelled by user");
        if self.tasks.fail_task(task_id, &failure, None).await?.is_none() {
            // Finished between the read and the transition
            let task = self.load(task_id).await?;
            return Err(already_terminal(&task));
        }
        tracing::info!(task_id, user_id, "Task cancelled");

        let task = self.load(task_id).await?;
        Ok(TaskView::from(&task))
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskView, GenTaskError> {
        let task = self.load(task_id).await?;
        Ok(TaskView::from(&task))
    }

    /// Like `get_task`, but another user's task is reported as not found.
    pub async fn get_task_for(&self, user_id: &str, task_id: &str) -> Result<TaskView, GenTaskError> {
        let task = self.owned(user_id, task_id).await?;
        Ok(TaskView::from(&task))
    }

    /// Newest first. `limit` defaults to 20 and is capped at 100.
    pub async fn list_tasks(
        &self,
        user_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<TaskSummary>, GenTaskError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let tasks = self.tasks.list_tasks(user_id, limit).await?;
        Ok(tasks.iter().map(TaskSummary::from).collect())
    }

    pub async fn awaiting_poll(&self, limit: u32) -> Result<Vec<Task>, GenTaskError> {
        self.tasks.list_awaiting_poll(limit).await
    }

    /// Re-enqueue PENDING tasks left behind by a previous process.
    pub async fn requeue_pending(&self, limit: u32) -> Result<usize, GenTaskError> {
        self.requeue_pending_before(Utc::now(), limit).await
    }

    /// Re-enqueue PENDING tasks idle for longer than the requeue delay.
    /// Stops at the first full queue; the next tick picks up the rest.
    pub async fn requeue_idle_pending(&self, limit: u32) -> Result<usize, GenTaskError> {
        let Some(before) = chrono::Duration::from_std(Duration::from_secs(self.config.requeue_after_secs))
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return Ok(0);
        };
        self.requeue_pending_before(before, limit).await
    }

    async fn requeue_pending_before(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<usize, GenTaskError> {
        let stranded = self.tasks.list_pending(before, limit).await?;
        let mut queued = 0;
        for task in stranded {
            if !self.queue.try_enqueue(TaskMessage::Process(task.id)) {
                tracing::debug!(queued, "Task queue full, deferring requeue");
                break;
            }
            queued += 1;
        }
        if queued > 0 {
            tracing::info!(queued, "Requeued pending tasks");
        }
        Ok(queued)
    }

    async fn finish(
        &self,
        task: &Task,
        provider: &dyn GenerationProvider,
        result: ResultRef,
    ) -> Result<(), GenTaskError> {
        // Materialization can take longer than a provider call; restart the
        // reaper's window before it begins
        if !self.tasks.touch_task(&task.id).await? {
            tracing::debug!(task_id = %task.id, "Task ended before materialization");
            return Ok(());
        }

        let allow_partial = provider.allows_partial_batch(task.kind);
        let stored = match self
            .materializer
            .materialize_batch(&result, task.kind, allow_partial)
            .await
        {
            Ok(m) => m,
            Err(e) => return self.fail(&task.id, TaskFailure::from_error(&e)).await,
        };

        if self
            .tasks
            .complete_task(&task.id, &stored.primary, &stored.extras)
            .await?
        {
            tracing::info!(
                task_id = %task.id,
                results = 1 + stored.extras.len(),
                failed_items = stored.failed,
                "Task succeeded"
            );
        } else {
            tracing::warn!(task_id = %task.id, "Result discarded: task already terminal");
        }
        Ok(())
    }

    async fn fail(&self, task_id: &str, failure: TaskFailure) -> Result<(), GenTaskError> {
        self.fail_guarded(task_id, failure, None).await
    }

    async fn fail_guarded(
        &self,
        task_id: &str,
        failure: TaskFailure,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<(), GenTaskError> {
        match self.tasks.fail_task(task_id, &failure, stale_before).await? {
            Some(outcome) => {
                let refunded = match outcome.refund {
                    Some(RefundOutcome::Refunded { amount, .. }) => amount,
                    _ => 0,
                };
                tracing::warn!(
                    task_id,
                    code = %failure.code,
                    credits_refunded = refunded,
                    error = %failure.message,
                    "Task failed"
                );
            }
            None => tracing::debug!(task_id, code = %failure.code, "Failure not applied: task already terminal"),
        }
        Ok(())
    }

    fn poll_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let timeout = chrono::Duration::from_std(Duration::from_secs(self.config.poll_timeout_secs)).ok()?;
        now.checked_sub_signed(timeout)
    }

    async fn load(&self, task_id: &str) -> Result<Task, GenTaskError> {
        self.tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| GenTaskError::TaskNotFound(task_id.to_string()))
    }

    async fn owned(&self, user_id: &str, task_id: &str) -> Result<Task, GenTaskError> {
        let task = self.load(task_id).await?;
        if task.user_id != user_id {
            return Err(GenTaskError::TaskNotFound(task_id.to_string()));
        }
        Ok(task)
    }
}

fn already_terminal(task: &Task) -> GenTaskError {
    GenTaskError::AlreadyTerminal {
        id: task.id.clone(),
        state: task.state.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Tier;
    use crate::infra::config::MaterializerConfig;
    use crate::provider::ResultItem;
    use crate::rules::StaticRules;
    use crate::storage::ObjectStorage;
    use crate::store::{spawn_store_server, Database};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct EchoProvider;

    #[async_trait]
    impl GenerationProvider for EchoProvider {
        fn id(&self) -> &str {
            "echo"
        }
        fn name(&self) -> &str {
            "Echo"
        }
        fn supports(&self, kind: TaskKind) -> bool {
            kind == TaskKind::Text
        }
        async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenTaskError> {
            Ok(Generation::Ready(ResultRef::single(ResultItem::text(
                request.prompt.clone(),
            ))))
        }
    }

    struct NullStorage;

    #[async_trait]
    impl ObjectStorage for NullStorage {
        async fn put(&self, key: &str, _bytes: Vec<u8>, _ct: &str) -> Result<String, GenTaskError> {
            Ok(format!("https://store.test/{key}"))
        }
        fn is_durable(&self, url: &str) -> bool {
            url.starts_with("https://store.test/")
        }
    }

    async fn manager() -> (TaskManager, StoreHandle, mpsc::Receiver<TaskMessage>) {
        let db = Database::in_memory().unwrap();
        let (store, _) = spawn_store_server(db.store);
        store.upsert_user("alice", Tier::User, None).await.unwrap();
        let rules = Arc::new(StaticRules::from_toml("").unwrap());
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(EchoProvider));
        let materializer =
            ResultMaterializer::new(Arc::new(NullStorage), MaterializerConfig::default());
        let (queue, rx) = TaskQueue::channel(16);
        let manager = TaskManager::new(
            Repositories::from_store(&store, rules),
            providers,
            materializer,
            queue,
            WorkerConfig::default(),
        );
        (manager, store, rx)
    }

    fn request(prompt: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            user_id: "alice".into(),
            kind: TaskKind::Text,
            binding: ProviderBinding::new("echo", "v1"),
            node_type: None,
            prompt: prompt.into(),
            reference_media: vec![],
            params: GenerationParams::default(),
        }
    }

    #[tokio::test]
    async fn test_create_enqueues_and_process_succeeds() {
        let (manager, _store, mut rx) = manager().await;
        let created = manager.create_task(request("hello")).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            TaskMessage::Process(created.task_id.clone())
        );

        manager.process_task(&created.task_id).await.unwrap();
        let view = manager.get_task(&created.task_id).await.unwrap();
        assert_eq!(view.state, TaskState::Success);
        assert_eq!(view.progress, 100);
        assert!(view.result_url.unwrap().ends_with(".txt"));
        assert!(view.completed_at.is_some());

        // A second delivery of the same message changes nothing
        manager.process_task(&created.task_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_rejects_before_charging() {
        let (manager, store, _rx) = manager().await;

        let mut bad = request("   ");
        assert!(matches!(
            manager.create_task(bad.clone()).await,
            Err(GenTaskError::Validation(_))
        ));
        bad.prompt = "ok".into();
        bad.binding = ProviderBinding::new("nope", "v1");
        assert!(matches!(
            manager.create_task(bad.clone()).await,
            Err(GenTaskError::Validation(_))
        ));
        bad.binding = ProviderBinding::new("echo", "v1");
        bad.kind = TaskKind::Image;
        assert!(matches!(
            manager.create_task(bad.clone()).await,
            Err(GenTaskError::Validation(_))
        ));
        bad.kind = TaskKind::Text;
        bad.params.quantity = Some(MAX_QUANTITY + 1);
        assert!(matches!(
            manager.create_task(bad).await,
            Err(GenTaskError::Validation(_))
        ));

        assert_eq!(manager.list_tasks("alice", None).await.unwrap().len(), 0);
        assert!(store.transactions("alice", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let (manager, _store, _rx) = manager().await;
        let created = manager.create_task(request("hello")).await.unwrap();

        assert!(matches!(
            manager.cancel_task("mallory", &created.task_id).await,
            Err(GenTaskError::TaskNotFound(_))
        ));
        let view = manager.cancel_task("alice", &created.task_id).await.unwrap();
        assert_eq!(view.state, TaskState::Failure);
        assert_eq!(view.error_code, Some(FailureCode::Cancelled));
        assert!(matches!(
            manager.cancel_task("alice", &created.task_id).await,
            Err(GenTaskError::AlreadyTerminal { .. })
        ));

        // The worker arriving late finds nothing to do
        manager.process_task(&created.task_id).await.unwrap();
        let view = manager.get_task(&created.task_id).await.unwrap();
        assert_eq!(view.state, TaskState::Failure);
    }

    #[tokio::test]
    async fn test_get_task_for_hides_other_users() {
        let (manager, _store, _rx) = manager().await;
        let created = manager.create_task(request("hello")).await.unwrap();
        assert!(manager.get_task_for("alice", &created.task_id).await.is_ok());
        assert!(matches!(
            manager.get_task_for("bob", &created.task_id).await,
            Err(GenTaskError::TaskNotFound(_))
        ));
        assert!(matches!(
            manager.get_task("missing").await,
            Err(GenTaskError::TaskNotFound(_))
        ));
    }
}

// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::types::TaskKind;
use crate::infra::errors::GenTaskError;
use crate::infra::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub reaper: ReaperConfig,

    #[serde(default)]
    pub materializer: MaterializerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub rules: RulesConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Overrides `$GENTASK_HOME/data/gentask.db`.
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(paths::db_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Tasks processed at once by this instance.
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub poll_interval_secs: u64,
    /// An asynchronous job still unresolved this long after its last update fails.
    pub poll_timeout_secs: u64,
    pub poll_batch: u32,
    /// A PENDING task idle this long is handed to the queue again.
    pub requeue_after_secs: u64,
    /// Progress reported once a task is claimed.
    pub start_progress: u8,
    /// Progress reported once an asynchronous provider accepted the job.
    pub submitted_progress: u8,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 256,
            poll_interval_secs: 10,
            poll_timeout_secs: 900,
            poll_batch: 100,
            requeue_after_secs: 60,
            start_progress: 10,
            submitted_progress: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub threshold_secs: u64,
    pub initial_delay_secs: u64,
    pub lease_secs: u64,
    pub batch_size: u32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            threshold_secs: 1800,
            initial_delay_secs: 60,
            lease_secs: 600,
            batch_size: 100,
        }
    }
}

impl ReaperConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializerConfig {
    pub image_timeout_secs: u64,
    pub video_timeout_secs: u64,
    pub fetch_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            image_timeout_secs: 60,
            video_timeout_secs: 300,
            fetch_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

impl MaterializerConfig {
    pub fn timeout_for(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::Video => Duration::from_secs(self.video_timeout_secs),
            _ => Duration::from_secs(self.image_timeout_secs),
        }
    }

    /// Longest a single result can take to re-host: every fetch attempt
    /// timing out, plus the backoff between them.
    pub fn worst_case_for(&self, kind: TaskKind) -> Duration {
        let attempts = self.fetch_attempts.max(1);
        let backoff_ms = (1..attempts)
            .map(|a| self.retry_delay_ms.saturating_mul(u64::from(a)))
            .fold(0u64, u64::saturating_add);
        self.timeout_for(kind)
            .saturating_mul(attempts)
            .saturating_add(Duration::from_millis(backoff_ms))
    }

    pub fn worst_case(&self) -> Duration {
        [TaskKind::Image, TaskKind::Video, TaskKind::Text, TaskKind::Storyboard]
            .into_iter()
            .map(|k| self.worst_case_for(k))
            .max()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Overrides `$GENTASK_HOME/data/objects`.
    pub root: Option<PathBuf>,
    /// Base URL that stored keys are served under.
    pub public_base_url: String,
    /// Hosts whose URLs are already durable and are not re-hosted.
    pub durable_hosts: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            public_base_url: "http://127.0.0.1:8700/objects".into(),
            durable_hosts: Vec::new(),
        }
    }
}

impl StorageConfig {
    pub fn resolved_root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(paths::objects_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Static rules file. When unset, rules are read from the database.
    pub file: Option<PathBuf>,
    pub cache_ttl_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            file: None,
            cache_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// Service token expected as `Authorization: Bearer …`.
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".into(),
            port: 8700,
            token: None,
        }
    }
}

/// Which adapter implementation backs a provider entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    OpenaiImages,
    OpenaiChat,
    AsyncJob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Selection key used in provider bindings (`<id>/<model>`).
    pub id: String,
    pub adapter: AdapterKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    /// Task kinds served; empty means the adapter's defaults.
    #[serde(default)]
    pub kinds: Vec<TaskKind>,
    /// Accept a batch where only some items could be materialized.
    #[serde(default)]
    pub partial_batch: bool,
    #[serde(default)]
    pub job: Option<AsyncJobConfig>,
}

fn default_provider_timeout() -> u64 {
    120
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Wire description of a submit-then-poll job API. Pointers are RFC 6901
/// JSON pointers into the provider's responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncJobConfig {
    pub submit_path: String,
    /// `{id}` is replaced with the external job id.
    pub poll_path: String,
    pub id_pointer: String,
    pub status_pointer: String,
    pub progress_pointer: Option<String>,
    /// Either a string or an array of strings.
    pub result_pointer: String,
    pub error_pointer: Option<String>,
    pub success_values: Vec<String>,
    pub failure_values: Vec<String>,
}

impl Default for AsyncJobConfig {
    fn default() -> Self {
        Self {
            submit_path: "/tasks".into(),
            poll_path: "/tasks/{id}".into(),
            id_pointer: "/id".into(),
            status_pointer: "/status".into(),
            progress_pointer: Some("/progress".into()),
            result_pointer: "/output".into(),
            error_pointer: Some("/error".into()),
            success_values: vec!["succeeded".into(), "success".into(), "completed".into()],
            failure_values: vec!["failed".into(), "failure".into(), "cancelled".into()],
        }
    }
}

impl Config {
    /// Load config from file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// The reaper must never race a healthy task. Its window restarts when a
    /// task is claimed, when a job makes progress and when materialization
    /// begins, so the threshold has to exceed the longest stretch between
    /// two of those: a provider call, a silent job plus its last poll, or
    /// re-hosting a result.
    pub fn validate(&self) -> Result<(), GenTaskError> {
        let threshold = Duration::from_secs(self.reaper.threshold_secs);
        let poll_timeout = Duration::from_secs(self.worker.poll_timeout_secs);
        let materialize = self.materializer.worst_case();

        if threshold <= poll_timeout {
            return Err(GenTaskError::Config(format!(
                "reaper.threshold_secs ({}) must exceed worker.poll_timeout_secs ({})",
                self.reaper.threshold_secs, self.worker.poll_timeout_secs
            )));
        }
        if threshold <= materialize {
            return Err(GenTaskError::Config(format!(
                "reaper.threshold_secs ({}) must exceed the materializer worst case ({}s)",
                self.reaper.threshold_secs,
                materialize.as_secs_f64()
            )));
        }
        if self.worker.requeue_after_secs >= self.reaper.threshold_secs {
            return Err(GenTaskError::Config(format!(
                "worker.requeue_after_secs ({}) must be below reaper.threshold_secs ({})",
                self.worker.requeue_after_secs, self.reaper.threshold_secs
            )));
        }
        for p in &self.providers {
            let mut longest = p.timeout();
            if p.adapter == AdapterKind::AsyncJob {
                longest = longest.saturating_add(poll_timeout);
            }
            if threshold <= longest {
                return Err(GenTaskError::Config(format!(
                    "reaper.threshold_secs ({}) must exceed {}s for provider '{}' (timeout_secs {})",
                    self.reaper.threshold_secs,
                    longest.as_secs(),
                    p.id,
                    p.timeout_secs
                )));
            }
            if p.adapter == AdapterKind::AsyncJob && p.base_url.is_none() {
                return Err(GenTaskError::Config(format!(
                    "provider '{}' uses async_job and needs base_url",
                    p.id
                )));
            }
        }
        let mut ids: Vec<&str> = self.providers.iter().map(|p| p.id.as_str()).collect();
        ids.sort_unstable();
        if let Some(w) = ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(GenTaskError::Config(format!(
                "duplicate provider id '{}'",
                w[0]
            )));
        }
        if self.worker.concurrency == 0 {
            return Err(GenTaskError::Config(
                "worker.concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

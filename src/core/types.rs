// src/core/types.rs — Core domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::infra::errors::GenTaskError;

/// What kind of content a task generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Image,
    Video,
    Text,
    Storyboard,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Image => "image",
            TaskKind::Video => "video",
            TaskKind::Text => "text",
            TaskKind::Storyboard => "storyboard",
        }
    }
}

impl FromStr for TaskKind {
    type Err = GenTaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(TaskKind::Image),
            "video" => Ok(TaskKind::Video),
            "text" => Ok(TaskKind::Text),
            "storyboard" => Ok(TaskKind::Storyboard),
            other => Err(GenTaskError::Validation(format!("unknown task kind '{other}'"))),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task state machine: PENDING -> PROCESSING -> {SUCCESS, FAILURE}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Processing,
    Success,
    Failure,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Processing => "PROCESSING",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }

    /// PENDING and PROCESSING both count against the concurrency ceiling.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }
}

impl FromStr for TaskState {
    type Err = GenTaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskState::Pending),
            "PROCESSING" => Ok(TaskState::Processing),
            "SUCCESS" => Ok(TaskState::Success),
            "FAILURE" => Ok(TaskState::Failure),
            other => Err(GenTaskError::Validation(format!("unknown task state '{other}'"))),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended in FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    ProviderError,
    MaterializationError,
    Timeout,
    ZombieTimeout,
    Cancelled,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::ProviderError => "provider_error",
            FailureCode::MaterializationError => "materialization_error",
            FailureCode::Timeout => "timeout",
            FailureCode::ZombieTimeout => "zombie_timeout",
            FailureCode::Cancelled => "cancelled",
        }
    }

    /// Classify an error raised on the generation path. Anything that is not
    /// a materialization or timeout problem is treated as a provider error.
    pub fn from_error(err: &GenTaskError) -> Self {
        match err {
            GenTaskError::Materialization(_) | GenTaskError::Storage(_) => {
                FailureCode::MaterializationError
            }
            GenTaskError::Timeout { .. } => FailureCode::Timeout,
            _ => FailureCode::ProviderError,
        }
    }
}

impl FromStr for FailureCode {
    type Err = GenTaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provider_error" => Ok(FailureCode::ProviderError),
            "materialization_error" => Ok(FailureCode::MaterializationError),
            "timeout" => Ok(FailureCode::Timeout),
            "zombie_timeout" => Ok(FailureCode::ZombieTimeout),
            "cancelled" => Ok(FailureCode::Cancelled),
            other => Err(GenTaskError::Validation(format!("unknown failure code '{other}'"))),
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal failure cause recorded on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: FailureCode,
    pub message: String,
}

impl TaskFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn from_error(err: &GenTaskError) -> Self {
        Self::new(FailureCode::from_error(err), err.to_string())
    }
}

/// Provider + model, resolved once at creation and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderBinding {
    pub provider: String,
    pub model: String,
}

impl ProviderBinding {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse "provider/model". The model part may itself contain slashes.
    pub fn parse(s: &str) -> Option<Self> {
        let (provider, model) = s.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl fmt::Display for ProviderBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// What is being invoked, for rule lookup. Keys are tried most specific first:
/// exact model binding, then node/operation type, then module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityRef {
    pub model: Option<String>,
    pub node_type: Option<String>,
    pub module: Option<String>,
}

impl CapabilityRef {
    /// Capability of a task: the bound model, the optional node type, and the
    /// task kind as module.
    pub fn for_task(binding: &ProviderBinding, kind: TaskKind, node_type: Option<&str>) -> Self {
        Self {
            model: Some(binding.to_string()),
            node_type: node_type.map(str::to_string),
            module: Some(kind.as_str().to_string()),
        }
    }

    pub fn lookup_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(3);
        if let Some(ref m) = self.model {
            keys.push(format!("model:{m}"));
        }
        if let Some(ref n) = self.node_type {
            keys.push(format!("node:{n}"));
        }
        if let Some(ref m) = self.module {
            keys.push(format!("module:{m}"));
        }
        keys
    }

    /// Key that usage counters are tracked under (the most specific one).
    pub fn usage_key(&self) -> String {
        self.lookup_keys()
            .into_iter()
            .next()
            .unwrap_or_else(|| "module:any".to_string())
    }
}

impl fmt::Display for CapabilityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.usage_key())
    }
}

/// Generation parameters. The typed fields feed pricing; `options` is an
/// opaque provider blob the orchestration core never inspects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub kind: TaskKind,
    pub binding: ProviderBinding,
    pub node_type: Option<String>,
    pub prompt: String,
    pub reference_media: Vec<String>,
    pub params: GenerationParams,
    pub state: TaskState,
    pub progress: u8,
    pub result_url: Option<String>,
    pub extra_results: Vec<String>,
    pub error_code: Option<FailureCode>,
    pub error_message: Option<String>,
    pub ledger_entry_id: Option<String>,
    pub charged: i64,
    pub is_free: bool,
    pub refunded: bool,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn capability(&self) -> CapabilityRef {
        CapabilityRef::for_task(&self.binding, self.kind, self.node_type.as_deref())
    }
}

/// What `GetTask` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub id: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub progress: u8,
    pub result_url: Option<String>,
    pub extra_results: Vec<String>,
    pub error_code: Option<FailureCode>,
    pub error_message: Option<String>,
    pub charged: i64,
    pub is_free: bool,
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskView {
    fn from(t: &Task) -> Self {
        Self {
            id: t.id.clone(),
            kind: t.kind,
            state: t.state,
            progress: t.progress,
            result_url: t.result_url.clone(),
            extra_results: t.extra_results.clone(),
            error_code: t.error_code,
            error_message: t.error_message.clone(),
            charged: t.charged,
            is_free: t.is_free,
            refunded: t.refunded,
            created_at: t.created_at,
            completed_at: t.completed_at,
        }
    }
}

/// One row of `ListTasks`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub kind: TaskKind,
    pub binding: String,
    pub state: TaskState,
    pub progress: u8,
    pub result_url: Option<String>,
    pub charged: i64,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskSummary {
    fn from(t: &Task) -> Self {
        Self {
            id: t.id.clone(),
            kind: t.kind,
            binding: t.binding.to_string(),
            state: t.state,
            progress: t.progress,
            result_url: t.result_url.clone(),
            charged: t.charged,
            created_at: t.created_at,
        }
    }
}

/// One credit movement. Debits are recorded as a positive `amount`; reversal
/// flips `refunded` exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    pub task_id: Option<String>,
    pub capability: String,
    pub amount: i64,
    pub is_free: bool,
    pub refunded: bool,
    pub description: String,
    pub refund_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub refunded_at: Option<DateTime<Utc>>,
}

/// Result of a refund attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded { amount: i64, balance: i64 },
    AlreadyRefunded,
}

impl RefundOutcome {
    pub fn is_refunded(&self) -> bool {
        matches!(self, RefundOutcome::Refunded { .. })
    }
}

/// A FAILURE transition that was applied, with the refund that committed
/// alongside it (`None` when the task had no ledger entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailOutcome {
    pub refund: Option<RefundOutcome>,
}

/// Membership tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    User,
    Vip,
    Svip,
    Admin,
    Internal,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::User => "user",
            Tier::Vip => "vip",
            Tier::Svip => "svip",
            Tier::Admin => "admin",
            Tier::Internal => "internal",
        }
    }

    /// Paid membership tiers that lapse back to `User` on expiry.
    pub fn is_membership(&self) -> bool {
        matches!(self, Tier::Vip | Tier::Svip)
    }

    /// Operator tiers bypass permission rules, quotas and concurrency limits.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Tier::Admin | Tier::Internal)
    }
}

impl FromStr for Tier {
    type Err = GenTaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Tier::User),
            "vip" => Ok(Tier::Vip),
            "svip" => Ok(Tier::Svip),
            "admin" => Ok(Tier::Admin),
            "internal" => Ok(Tier::Internal),
            other => Err(GenTaskError::Validation(format!("unknown tier '{other}'"))),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub tier: Tier,
    pub membership_expires_at: Option<DateTime<Utc>>,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Consume,
    Refund,
    Gift,
    Grant,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Consume => "consume",
            TransactionKind::Refund => "refund",
            TransactionKind::Gift => "gift",
            TransactionKind::Grant => "grant",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = GenTaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consume" => Ok(TransactionKind::Consume),
            "refund" => Ok(TransactionKind::Refund),
            "gift" => Ok(TransactionKind::Gift),
            "grant" => Ok(TransactionKind::Grant),
            other => Err(GenTaskError::Validation(format!(
                "unknown transaction kind '{other}'"
            ))),
        }
    }
}

/// Journal row for every balance movement. `amount` is signed from the
/// balance's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: String,
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub balance_after: i64,
    pub entry_id: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Today's usage for one (user, capability).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounters {
    pub used: u32,
    pub free_used: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_parse() {
        let b = ProviderBinding::parse("replicate/stability-ai/sdxl").unwrap();
        assert_eq!(b.provider, "replicate");
        assert_eq!(b.model, "stability-ai/sdxl");
        assert_eq!(b.to_string(), "replicate/stability-ai/sdxl");
        assert!(ProviderBinding::parse("no-slash").is_none());
        assert!(ProviderBinding::parse("/model").is_none());
    }

    #[test]
    fn test_capability_lookup_order() {
        let cap = CapabilityRef::for_task(
            &ProviderBinding::new("openai", "dall-e-3"),
            TaskKind::Image,
            Some("text_to_image"),
        );
        assert_eq!(
            cap.lookup_keys(),
            vec![
                "model:openai/dall-e-3",
                "node:text_to_image",
                "module:image"
            ]
        );
        assert_eq!(cap.usage_key(), "model:openai/dall-e-3");
    }

    #[test]
    fn test_capability_without_model_uses_next_key() {
        let cap = CapabilityRef {
            model: None,
            node_type: Some("upscale".into()),
            module: Some("image".into()),
        };
        assert_eq!(cap.usage_key(), "node:upscale");
        assert_eq!(CapabilityRef::default().usage_key(), "module:any");
    }

    #[test]
    fn test_state_terminality() {
        assert!(TaskState::Pending.is_in_flight());
        assert!(TaskState::Processing.is_in_flight());
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failure.is_terminal());
        assert_eq!("PROCESSING".parse::<TaskState>().unwrap(), TaskState::Processing);
        assert!("processing".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_failure_classification() {
        let e = GenTaskError::Timeout {
            operation: "poll".into(),
            secs: 5,
        };
        assert_eq!(FailureCode::from_error(&e), FailureCode::Timeout);
        let e = GenTaskError::Materialization("404".into());
        assert_eq!(FailureCode::from_error(&e), FailureCode::MaterializationError);
        let e = GenTaskError::Provider {
            provider: "x".into(),
            message: "boom".into(),
            retriable: false,
        };
        let f = TaskFailure::from_error(&e);
        assert_eq!(f.code, FailureCode::ProviderError);
        assert!(f.message.contains("boom"));
    }

    #[test]
    fn test_tier_flags() {
        assert!(Tier::Vip.is_membership());
        assert!(!Tier::Admin.is_membership());
        assert!(Tier::Internal.is_privileged());
        assert_eq!("SVIP".parse::<Tier>().unwrap(), Tier::Svip);
    }

    #[test]
    fn test_params_skip_empty_fields() {
        let p = GenerationParams {
            resolution: Some("1024x1024".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json, serde_json::json!({"resolution": "1024x1024"}));
        let back: GenerationParams = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
    }
}

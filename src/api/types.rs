// src/api/types.rs

use serde::{Deserialize, Serialize};

use crate::core::types::{CreditTransaction, GenerationParams, TaskKind};

/// Request body for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskBody {
    pub kind: TaskKind,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub reference_media: Vec<String>,
    #[serde(default)]
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

/// Balance plus the newest journal rows.
#[derive(Debug, Serialize)]
pub struct CreditsResponse {
    pub user_id: String,
    pub balance: i64,
    pub transactions: Vec<CreditTransaction>,
}

#[derive(Debug, Serialize)]
pub struct DailyGiftResponse {
    /// Credits added; `None` if today's gift was already taken.
    pub granted: Option<i64>,
    pub balance: i64,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub error: String,
}

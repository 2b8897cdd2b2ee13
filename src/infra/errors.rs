// src/infra/errors.rs — Error types for gentask

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenTaskError {
    // Rejections (nothing charged)
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Daily quota exhausted for '{capability}': {used}/{limit}")]
    QuotaExhausted {
        capability: String,
        used: u32,
        limit: u32,
    },

    #[error("Concurrency limit reached: {current}/{max} tasks in flight")]
    ConcurrencyLimitExceeded { current: u32, max: u32 },

    #[error("Insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: i64, available: i64 },

    // Task failures (charged, refunded on the failure path)
    #[error("Provider '{provider}' error: {message}")]
    Provider {
        provider: String,
        message: String,
        retriable: bool,
    },

    #[error("Result materialization failed: {0}")]
    Materialization(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    // Lookups and state
    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    #[error("User '{0}' not found")]
    UserNotFound(String),

    #[error("Ledger entry '{0}' not found")]
    EntryNotFound(String),

    #[error("Task '{id}' is already {state}")]
    AlreadyTerminal { id: String, state: String },

    // Infra
    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GenTaskError {
    /// Stable machine-checkable reason code, surfaced to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            GenTaskError::Validation(_) => "validation",
            GenTaskError::PermissionDenied { .. } => "permission_denied",
            GenTaskError::QuotaExhausted { .. } => "quota_exhausted",
            GenTaskError::ConcurrencyLimitExceeded { .. } => "concurrency_limit_exceeded",
            GenTaskError::InsufficientCredits { .. } => "insufficient_credits",
            GenTaskError::Provider { .. } => "provider_error",
            GenTaskError::Materialization(_) => "materialization_error",
            GenTaskError::Timeout { .. } => "timeout",
            GenTaskError::TaskNotFound(_)
            | GenTaskError::UserNotFound(_)
            | GenTaskError::EntryNotFound(_) => "not_found",
            GenTaskError::AlreadyTerminal { .. } => "already_terminal",
            GenTaskError::Storage(_)
            | GenTaskError::StoreUnavailable(_)
            | GenTaskError::Database(_)
            | GenTaskError::Serialization(_)
            | GenTaskError::Config(_)
            | GenTaskError::Io(_)
            | GenTaskError::Other(_) => "internal",
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GenTaskError::Provider {
                retriable: true,
                ..
            }
        )
    }

    /// True for the outcomes `create_task` rejects before anything is charged.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GenTaskError::Validation(_)
                | GenTaskError::PermissionDenied { .. }
                | GenTaskError::QuotaExhausted { .. }
                | GenTaskError::ConcurrencyLimitExceeded { .. }
                | GenTaskError::InsufficientCredits { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let e = GenTaskError::ConcurrencyLimitExceeded { current: 2, max: 2 };
        assert_eq!(e.code(), "concurrency_limit_exceeded");
        assert!(e.is_rejection());

        let e = GenTaskError::Timeout {
            operation: "generate".into(),
            secs: 30,
        };
        assert_eq!(e.code(), "timeout");
        assert!(!e.is_rejection());
        assert_eq!(e.to_string(), "generate timed out after 30s");
    }

    #[test]
    fn test_retriable_only_for_transient_provider_errors() {
        let transient = GenTaskError::Provider {
            provider: "openai".into(),
            message: "HTTP 503".into(),
            retriable: true,
        };
        let fatal = GenTaskError::Provider {
            provider: "openai".into(),
            message: "HTTP 400".into(),
            retriable: false,
        };
        assert!(transient.is_retriable());
        assert!(!fatal.is_retriable());
        assert!(!GenTaskError::Materialization("gone".into()).is_retriable());
    }
}

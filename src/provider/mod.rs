// src/provider/mod.rs — Generation provider layer

pub mod async_job;
pub mod openai_chat;
pub mod openai_images;
pub mod registry;
pub mod timeout;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::types::{GenerationParams, Task, TaskKind};
use crate::infra::errors::GenTaskError;

pub use registry::ProviderRegistry;
pub use timeout::TimeoutProvider;

/// Translation boundary to one external provider. Adapters never touch the
/// ledger or the task store.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn supports(&self, kind: TaskKind) -> bool;

    /// Whether a batch where only some items could be materialized still
    /// counts as a success for this kind.
    fn allows_partial_batch(&self, _kind: TaskKind) -> bool {
        false
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenTaskError>;

    /// Consult an asynchronous job started by `generate`.
    async fn poll(
        &self,
        _external_id: &str,
        _request: &GenerationRequest,
    ) -> Result<PollStatus, GenTaskError> {
        Err(GenTaskError::Provider {
            provider: self.id().to_string(),
            message: "provider does not support polling".into(),
            retriable: false,
        })
    }
}

/// What an adapter sees of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub task_id: String,
    pub kind: TaskKind,
    pub model: String,
    pub prompt: String,
    pub reference_media: Vec<String>,
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            kind: task.kind,
            model: task.binding.model.clone(),
            prompt: task.prompt.clone(),
            reference_media: task.reference_media.clone(),
            params: task.params.clone(),
        }
    }

    /// Outputs requested, at least one.
    pub fn quantity(&self) -> u32 {
        self.params.quantity.unwrap_or(1).max(1)
    }
}

/// One raw provider output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultItem {
    /// A provider-hosted URL, possibly short-lived.
    Url { url: String },
    /// Content returned in the response body (text providers).
    Inline { content: String, content_type: String },
}

impl ResultItem {
    pub fn url(url: impl Into<String>) -> Self {
        ResultItem::Url { url: url.into() }
    }

    pub fn text(content: impl Into<String>) -> Self {
        ResultItem::Inline {
            content: content.into(),
            content_type: "text/plain; charset=utf-8".into(),
        }
    }
}

/// Raw result of a generation, first item primary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultRef {
    pub items: Vec<ResultItem>,
}

impl ResultRef {
    pub fn new(items: Vec<ResultItem>) -> Self {
        Self { items }
    }

    pub fn single(item: ResultItem) -> Self {
        Self { items: vec![item] }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Ready(ResultRef),
    /// The provider runs the job asynchronously; poll with `external_id`.
    Pending {
        external_id: String,
        progress: Option<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Ready(ResultRef),
    Pending { progress: Option<u8> },
}

pub(crate) fn send_error(provider: &str, e: reqwest::Error) -> GenTaskError {
    GenTaskError::Provider {
        provider: provider.to_string(),
        message: e.to_string(),
        retriable: e.is_timeout() || e.is_connect(),
    }
}

/// Check the status and decode a JSON body.
pub(crate) async fn json_response(
    provider: &str,
    response: reqwest::Response,
) -> Result<serde_json::Value, GenTaskError> {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(GenTaskError::Provider {
            provider: provider.to_string(),
            message: "rate limited (HTTP 429)".into(),
            retriable: true,
        });
    }

    if !status.is_success() {
        let error_body = response.text().await.unwrap_or_default();
        return Err(GenTaskError::Provider {
            provider: provider.to_string(),
            message: format!("HTTP {}: {}", status, error_body),
            retriable: status.is_server_error(),
        });
    }

    response.json().await.map_err(|e| GenTaskError::Provider {
        provider: provider.to_string(),
        message: format!("Failed to parse response: {}", e),
        retriable: false,
    })
}

/// Shallow-merge the opaque provider options into a request body.
pub(crate) fn merge_options(body: &mut serde_json::Value, options: &serde_json::Value) {
    if let (Some(target), Some(extra)) = (body.as_object_mut(), options.as_object()) {
        for (k, v) in extra {
            target.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_options_overrides_fields() {
        let mut body = json!({"model": "m", "n": 1});
        merge_options(&mut body, &json!({"n": 4, "style": "vivid"}));
        assert_eq!(body, json!({"model": "m", "n": 4, "style": "vivid"}));

        let mut body = json!({"model": "m"});
        merge_options(&mut body, &serde_json::Value::Null);
        assert_eq!(body, json!({"model": "m"}));
    }

    #[test]
    fn test_request_quantity_at_least_one() {
        let mut req = GenerationRequest {
            task_id: "t".into(),
            kind: TaskKind::Image,
            model: "m".into(),
            prompt: "p".into(),
            reference_media: vec![],
            params: GenerationParams::default(),
        };
        assert_eq!(req.quantity(), 1);
        req.params.quantity = Some(0);
        assert_eq!(req.quantity(), 1);
        req.params.quantity = Some(4);
        assert_eq!(req.quantity(), 4);
    }

    #[test]
    fn test_result_item_serialization() {
        let item = ResultItem::url("https://x/y.png");
        assert_eq!(
            serde_json::to_value(&item).unwrap(),
            json!({"type": "url", "url": "https://x/y.png"})
        );
    }
}

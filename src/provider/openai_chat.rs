// src/provider/openai_chat.rs — Text and storyboard generation via chat completions

use async_trait::async_trait;

use super::{
    json_response, merge_options, send_error, Generation, GenerationProvider, GenerationRequest,
    ResultItem, ResultRef,
};
use crate::core::types::TaskKind;
use crate::infra::errors::GenTaskError;

const STORYBOARD_SYSTEM: &str = "You write storyboards. Reply with a JSON array of shots, each \
with \"shot\", \"description\" and \"duration_secs\" fields. No prose outside the array.";

pub struct OpenAIChatProvider {
    id: String,
    name: String,
    api_key: Option<String>,
    client: reqwest::Client,
    base_url: String,
}

impl OpenAIChatProvider {
    pub fn new(id: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_base_url(id, api_key, "https://api.openai.com/v1".into())
    }

    pub fn with_base_url(id: impl Into<String>, api_key: Option<String>, base_url: String) -> Self {
        Self {
            id: id.into(),
            name: "OpenAI Chat".into(),
            api_key,
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if request.kind == TaskKind::Storyboard {
            messages.push(serde_json::json!({"role": "system", "content": STORYBOARD_SYSTEM}));
        }
        let mut user = request.prompt.clone();
        for media in &request.reference_media {
            user.push_str("\nReference: ");
            user.push_str(media);
        }
        messages.push(serde_json::json!({"role": "user", "content": user}));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });
        merge_options(&mut body, &request.params.options);
        body
    }
}

fn parse_content(provider: &str, resp: &serde_json::Value) -> Result<String, GenTaskError> {
    match resp["choices"][0]["message"]["content"].as_str() {
        Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
        _ => Err(GenTaskError::Provider {
            provider: provider.to_string(),
            message: "response contained no content".into(),
            retriable: false,
        }),
    }
}

#[async_trait]
impl GenerationProvider for OpenAIChatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, kind: TaskKind) -> bool {
        matches!(kind, TaskKind::Text | TaskKind::Storyboard)
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenTaskError> {
        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&self.body(request));
        if let Some(ref key) = self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(|e| send_error(&self.id, e))?;
        let resp = json_response(&self.id, response).await?;
        let content = parse_content(&self.id, &resp)?;

        let item = if request.kind == TaskKind::Storyboard {
            ResultItem::Inline {
                content,
                content_type: "application/json".into(),
            }
        } else {
            ResultItem::text(content)
        };
        Ok(Generation::Ready(ResultRef::single(item)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::GenerationParams;
    use serde_json::json;

    fn request(kind: TaskKind) -> GenerationRequest {
        GenerationRequest {
            task_id: "t".into(),
            kind,
            model: "gpt-4.1".into(),
            prompt: "a heist in three acts".into(),
            reference_media: vec!["https://x/ref.png".into()],
            params: GenerationParams {
                options: json!({"temperature": 0.2}),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_storyboard_gets_system_prompt() {
        let p = OpenAIChatProvider::new("openai", None);
        let body = p.body(&request(TaskKind::Storyboard));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[1]["content"]
            .as_str()
            .unwrap()
            .ends_with("Reference: https://x/ref.png"));
        assert_eq!(body["temperature"], 0.2);

        let body = p.body(&request(TaskKind::Text));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_content() {
        let resp = json!({"choices": [{"message": {"content": "Once upon a time"}}]});
        assert_eq!(parse_content("openai", &resp).unwrap(), "Once upon a time");
        let empty = json!({"choices": [{"message": {"content": "  "}}]});
        assert!(parse_content("openai", &empty).is_err());
        assert!(parse_content("openai", &json!({})).is_err());
    }
}

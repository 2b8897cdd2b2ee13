// src/provider/openai_images.rs — OpenAI-compatible image generation

use async_trait::async_trait;

use super::{
    json_response, merge_options, send_error, Generation, GenerationProvider, GenerationRequest,
    ResultItem, ResultRef,
};
use crate::core::types::TaskKind;
use crate::infra::errors::GenTaskError;

pub struct OpenAIImagesProvider {
    id: String,
    name: String,
    api_key: Option<String>,
    client: reqwest::Client,
    base_url: String,
    partial_batch: bool,
}

impl OpenAIImagesProvider {
    pub fn new(id: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_base_url(id, api_key, "https://api.openai.com/v1".into())
    }

    pub fn with_base_url(id: impl Into<String>, api_key: Option<String>, base_url: String) -> Self {
        Self {
            id: id.into(),
            name: "OpenAI Images".into(),
            api_key,
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            partial_batch: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_partial_batch(mut self, partial: bool) -> Self {
        self.partial_batch = partial;
        self
    }

    fn body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": request.quantity(),
            "response_format": "url",
        });
        if let Some(size) = request
            .params
            .resolution
            .as_deref()
            .filter(|r| r.contains('x'))
        {
            body["size"] = serde_json::json!(size);
        }
        merge_options(&mut body, &request.params.options);
        body
    }
}

/// Collect `data[].url` from an images response.
fn parse_images(provider: &str, resp: &serde_json::Value) -> Result<ResultRef, GenTaskError> {
    let items: Vec<ResultItem> = resp["data"]
        .as_array()
        .map(|data| {
            data.iter()
                .filter_map(|d| d["url"].as_str())
                .map(ResultItem::url)
                .collect()
        })
        .unwrap_or_default();

    if items.is_empty() {
        return Err(GenTaskError::Provider {
            provider: provider.to_string(),
            message: "response contained no image URLs".into(),
            retriable: false,
        });
    }
    Ok(ResultRef::new(items))
}

#[async_trait]
impl GenerationProvider for OpenAIImagesProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, kind: TaskKind) -> bool {
        kind == TaskKind::Image
    }

    fn allows_partial_batch(&self, _kind: TaskKind) -> bool {
        self.partial_batch
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenTaskError> {
        let mut http = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .json(&self.body(request));
        if let Some(ref key) = self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(|e| send_error(&self.id, e))?;
        let resp = json_response(&self.id, response).await?;
        parse_images(&self.id, &resp).map(Generation::Ready)
    }
}

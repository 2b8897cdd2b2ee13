// src/provider/async_job.rs — Submit-then-poll HTTP job providers
//
// Many video providers accept a job, hand back an id, and report status on a
// separate endpoint. The wire shape differs per vendor, so the fields are
// located with JSON pointers from `AsyncJobConfig`.

use async_trait::async_trait;

use super::{
    json_response, merge_options, send_error, Generation, GenerationProvider, GenerationRequest,
    PollStatus, ResultItem, ResultRef,
};
use crate::core::types::TaskKind;
use crate::infra::config::AsyncJobConfig;
use crate::infra::errors::GenTaskError;

pub struct AsyncJobProvider {
    id: String,
    name: String,
    api_key: Option<String>,
    client: reqwest::Client,
    base_url: String,
    job: AsyncJobConfig,
    kinds: Vec<TaskKind>,
    partial_batch: bool,
}

/// What a status document says about the job.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobState {
    Succeeded(ResultRef),
    Failed(String),
    Running(Option<u8>),
}

impl AsyncJobProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        job: AsyncJobConfig,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            api_key,
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            job,
            kinds: vec![TaskKind::Video],
            partial_batch: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<TaskKind>) -> Self {
        if !kinds.is_empty() {
            self.kinds = kinds;
        }
        self
    }

    pub fn with_partial_batch(mut self, partial: bool) -> Self {
        self.partial_batch = partial;
        self
    }

    fn submit_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let p = &request.params;
        let mut body = serde_json::json!({
            "model": request.model,
            "prompt": request.prompt,
        });
        if !request.reference_media.is_empty() {
            body["reference_media"] = serde_json::json!(request.reference_media);
        }
        if let Some(ref v) = p.aspect_ratio {
            body["aspect_ratio"] = serde_json::json!(v);
        }
        if let Some(ref v) = p.resolution {
            body["resolution"] = serde_json::json!(v);
        }
        if let Some(v) = p.duration_secs {
            body["duration"] = serde_json::json!(v);
        }
        if let Some(ref v) = p.mode {
            body["mode"] = serde_json::json!(v);
        }
        if let Some(v) = p.quantity {
            body["quantity"] = serde_json::json!(v);
        }
        merge_options(&mut body, &p.options);
        body
    }

    fn poll_url(&self, external_id: &str) -> String {
        format!(
            "{}{}",
            self.base_url,
            self.job.poll_path.replace("{id}", external_id)
        )
    }

    fn authorize(&self, http: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key {
            Some(ref key) => http.bearer_auth(key),
            None => http,
        }
    }

    fn job_state(&self, doc: &serde_json::Value) -> JobState {
        let status = doc
            .pointer(&self.job.status_pointer)
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if matches_any(&status, &self.job.success_values) {
            return JobState::Succeeded(extract_results(doc, &self.job.result_pointer));
        }
        if matches_any(&status, &self.job.failure_values) {
            let detail = self
                .job
                .error_pointer
                .as_deref()
                .and_then(|p| doc.pointer(p))
                .map(|v| match v.as_str() {
                    Some(s) => s.to_string(),
                    None => v.to_string(),
                })
                .filter(|s| !s.is_empty() && s != "null");
            let message = match detail {
                Some(d) => format!("job {status}: {d}"),
                None => format!("job {status}"),
            };
            return JobState::Failed(message);
        }

        let progress = self
            .job
            .progress_pointer
            .as_deref()
            .and_then(|p| doc.pointer(p))
            .and_then(|v| v.as_f64())
            .map(normalize_progress);
        JobState::Running(progress)
    }

    fn failed(&self, message: String) -> GenTaskError {
        GenTaskError::Provider {
            provider: self.id.clone(),
            message,
            retriable: false,
        }
    }
}

fn matches_any(status: &str, values: &[String]) -> bool {
    values.iter().any(|v| v.eq_ignore_ascii_case(status))
}

/// Accepts a fraction (0.0–1.0 exclusive) or a percentage. Never reports 100
/// while the job is still running.
fn normalize_progress(v: f64) -> u8 {
    let pct = if v > 0.0 && v < 1.0 { v * 100.0 } else { v };
    pct.clamp(0.0, 99.0) as u8
}

/// The result pointer may name a string, an array of strings, or an array of
/// objects carrying a `url`.
fn extract_results(doc: &serde_json::Value, pointer: &str) -> ResultRef {
    let items = match doc.pointer(pointer) {
        Some(serde_json::Value::String(url)) => vec![ResultItem::url(url.as_str())],
        Some(serde_json::Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str().or_else(|| v["url"].as_str()))
            .map(ResultItem::url)
            .collect(),
        _ => Vec::new(),
    };
    ResultRef::new(items)
}

#[async_trait]
impl GenerationProvider for AsyncJobProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, kind: TaskKind) -> bool {
        self.kinds.contains(&kind)
    }

    fn allows_partial_batch(&self, _kind: TaskKind) -> bool {
        self.partial_batch
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenTaskError> {
        let http = self
            .client
            .post(format!("{}{}", self.base_url, self.job.submit_path))
            .json(&self.submit_body(request));
        let response = self
            .authorize(http)
            .send()
            .await
            .map_err(|e| send_error(&self.id, e))?;
        let doc = json_response(&self.id, response).await?;

        // Some providers finish short jobs inline
        match self.job_state(&doc) {
            JobState::Succeeded(results) if !results.is_empty() => {
                return Ok(Generation::Ready(results))
            }
            JobState::Failed(message) => return Err(self.failed(message)),
            _ => {}
        }

        let external_id = match doc.pointer(&self.job.id_pointer) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                return Err(self.failed(format!(
                    "submit response has no job id at '{}'",
                    self.job.id_pointer
                )))
            }
        };
        tracing::debug!(provider = %self.id, task_id = %request.task_id, %external_id, "Job submitted");
        Ok(Generation::Pending {
            external_id,
            progress: None,
        })
    }

    async fn poll(
        &self,
        external_id: &str,
        _request: &GenerationRequest,
    ) -> Result<PollStatus, GenTaskError> {
        let http = self.client.get(self.poll_url(external_id));
        let response = self
            .authorize(http)
            .send()
            .await
            .map_err(|e| send_error(&self.id, e))?;
        let doc = json_response(&self.id, response).await?;

        match self.job_state(&doc) {
            JobState::Succeeded(results) if results.is_empty() => Err(self.failed(format!(
                "job succeeded without results at '{}'",
                self.job.result_pointer
            ))),
            JobState::Succeeded(results) => Ok(PollStatus::Ready(results)),
            JobState::Failed(message) => Err(self.failed(message)),
            JobState::Running(progress) => Ok(PollStatus::Pending { progress }),
        }
    }
}

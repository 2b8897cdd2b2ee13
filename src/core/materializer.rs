// src/core/materializer.rs — Re-host provider results in durable storage
//
// A task only reaches SUCCESS with URLs that point at our own storage.
// Provider URLs are fetched (with retries on transient failures) and stored
// content-addressed; inline text results are stored directly.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::core::types::TaskKind;
use crate::infra::config::MaterializerConfig;
use crate::infra::errors::GenTaskError;
use crate::provider::{ResultItem, ResultRef};
use crate::storage::{content_type_from_url, object_key, ObjectStorage};

/// Durable URLs for one task, first item primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedResult {
    pub primary: String,
    pub extras: Vec<String>,
    /// Items that could not be stored (partial batches only).
    pub failed: usize,
}

pub struct ResultMaterializer {
    storage: Arc<dyn ObjectStorage>,
    client: reqwest::Client,
    config: MaterializerConfig,
}

impl ResultMaterializer {
    pub fn new(storage: Arc<dyn ObjectStorage>, config: MaterializerConfig) -> Self {
        Self {
            storage,
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Fetch a provider URL and store it. Already durable URLs pass through.
    pub async fn materialize(&self, url: &str, kind: TaskKind) -> Result<String, GenTaskError> {
        if self.storage.is_durable(url) {
            return Ok(url.to_string());
        }
        let (bytes, content_type) = self.fetch(url, self.config.timeout_for(kind)).await?;
        let key = object_key(&bytes, &content_type, Utc::now());
        self.storage.put(&key, bytes, &content_type).await
    }

    pub async fn materialize_item(
        &self,
        item: &ResultItem,
        kind: TaskKind,
    ) -> Result<String, GenTaskError> {
        match item {
            ResultItem::Url { url } => self.materialize(url, kind).await,
            ResultItem::Inline {
                content,
                content_type,
            } => {
                let bytes = content.as_bytes().to_vec();
                let key = object_key(&bytes, content_type, Utc::now());
                self.storage.put(&key, bytes, content_type).await
            }
        }
    }

    /// Materialize every item independently. With `allow_partial`, the batch
    /// succeeds as long as one item was stored; otherwise any failure fails it.
    pub async fn materialize_batch(
        &self,
        result: &ResultRef,
        kind: TaskKind,
        allow_partial: bool,
    ) -> Result<MaterializedResult, GenTaskError> {
        if result.is_empty() {
            return Err(GenTaskError::Materialization(
                "provider returned no results".into(),
            ));
        }

        let outcomes = futures::future::join_all(
            result
                .items
                .iter()
                .map(|item| self.materialize_item(item, kind)),
        )
        .await;

        let total = outcomes.len();
        let mut stored = Vec::with_capacity(total);
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(url) => stored.push(url),
                Err(e) => {
                    tracing::warn!(error = %e, "Result item failed to materialize");
                    first_error.get_or_insert(e);
                }
            }
        }

        let failed = total - stored.len();
        if let Some(err) = first_error {
            if stored.is_empty() || !allow_partial {
                return Err(GenTaskError::Materialization(format!(
                    "{failed} of {total} results failed: {err}"
                )));
            }
        }

        let mut urls = stored.into_iter();
        let primary = urls.next().ok_or_else(|| {
            GenTaskError::Materialization("no result could be stored".into())
        })?;
        Ok(MaterializedResult {
            primary,
            extras: urls.collect(),
            failed,
        })
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<(Vec<u8>, String), GenTaskError> {
        let attempts = self.config.fetch_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.fetch_once(url, timeout).await {
                Ok(fetched) => return Ok(fetched),
                Err((message, transient)) => {
                    tracing::debug!(url, attempt, transient, error = %message, "Result fetch failed");
                    last_error = message;
                    if !transient {
                        break;
                    }
                    if attempt < attempts {
                        let delay = self.config.retry_delay_ms * u64::from(attempt);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        Err(GenTaskError::Materialization(format!(
            "fetch {url}: {last_error}"
        )))
    }

    /// One GET. Errors carry whether a retry could help.
    async fn fetch_once(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<(Vec<u8>, String), (String, bool)> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| (e.to_string(), e.is_timeout() || e.is_connect()))?;

        let status = response.status();
        if !status.is_success() {
            let transient =
                status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            return Err((format!("HTTP {status}"), transient));
        }

        let header_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = match header_type {
            Some(ct) if !ct.starts_with("application/octet-stream") => ct,
            _ => content_type_from_url(url)
                .unwrap_or("application/octet-stream")
                .to_string(),
        };

        let bytes = response
            .bytes()
            .await
            .map_err(|e| (e.to_string(), e.is_timeout()))?;
        if bytes.is_empty() {
            return Err(("empty body".into(), false));
        }
        Ok((bytes.to_vec(), content_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStorage {
        objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    }

    #[async_trait]
    impl ObjectStorage for MemoryStorage {
        async fn put(
            &self,
            key: &str,
            bytes: Vec<u8>,
            content_type: &str,
        ) -> Result<String, GenTaskError> {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (bytes, content_type.to_string()));
            Ok(format!("https://store.test/{key}"))
        }

        fn is_durable(&self, url: &str) -> bool {
            url.starts_with("https://store.test/")
        }
    }

    async fn serve() -> (String, Arc<AtomicUsize>) {
        let flaky_hits = Arc::new(AtomicUsize::new(0));
        let hits = flaky_hits.clone();
        let app = Router::new()
            .route(
                "/ok.png",
                get(|| async { ([(header::CONTENT_TYPE, "image/png")], b"png-bytes".to_vec()) }),
            )
            .route(
                "/untyped.mp4",
                get(|| async { b"mp4-bytes".to_vec() }),
            )
            .route(
                "/flaky.png",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                            StatusCode::SERVICE_UNAVAILABLE.into_response()
                        } else {
                            ([(header::CONTENT_TYPE, "image/png")], b"late".to_vec()).into_response()
                        }
                    }
                }),
            )
            .route("/gone.png", get(|| async { StatusCode::NOT_FOUND }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), flaky_hits)
    }

    fn materializer() -> (ResultMaterializer, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::default());
        let config = MaterializerConfig {
            retry_delay_ms: 10,
            ..Default::default()
        };
        (ResultMaterializer::new(storage.clone(), config), storage)
    }

    #[tokio::test]
    async fn test_fetch_and_store() {
        let (base, _) = serve().await;
        let (m, storage) = materializer();
        let url = m.materialize(&format!("{base}/ok.png"), TaskKind::Image).await.unwrap();
        assert!(url.starts_with("https://store.test/results/"));
        assert!(url.ends_with(".png"));

        let url = m
            .materialize(&format!("{base}/untyped.mp4"), TaskKind::Video)
            .await
            .unwrap();
        assert!(url.ends_with(".mp4"));
        assert_eq!(storage.objects.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_durable_url_passes_through() {
        let (m, storage) = materializer();
        let url = m
            .materialize("https://store.test/results/x.png", TaskKind::Image)
            .await
            .unwrap();
        assert_eq!(url, "https://store.test/results/x.png");
        assert!(storage.objects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (base, hits) = serve().await;
        let (m, _) = materializer();
        m.materialize(&format!("{base}/flaky.png"), TaskKind::Image)
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_found_fails_without_retry() {
        let (base, _) = serve().await;
        let (m, _) = materializer();
        let err = m
            .materialize(&format!("{base}/gone.png"), TaskKind::Image)
            .await
            .unwrap_err();
        assert!(matches!(err, GenTaskError::Materialization(_)));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_partial_batch() {
        let (base, _) = serve().await;
        let (m, _) = materializer();
        let batch = ResultRef::new(vec![
            ResultItem::url(format!("{base}/ok.png")),
            ResultItem::url(format!("{base}/gone.png")),
            ResultItem::text("caption"),
            ResultItem::url(format!("{base}/gone.png")),
            ResultItem::url(format!("{base}/untyped.mp4")),
        ]);

        let partial = m.materialize_batch(&batch, TaskKind::Image, true).await.unwrap();
        assert_eq!(partial.extras.len(), 2);
        assert_eq!(partial.failed, 2);
        assert!(partial.extras[0].ends_with(".txt"));

        let strict = m.materialize_batch(&batch, TaskKind::Image, false).await;
        assert!(matches!(strict, Err(GenTaskError::Materialization(_))));
    }

    #[tokio::test]
    async fn test_fully_failed_batch_fails_even_when_partial_allowed() {
        let (base, _) = serve().await;
        let (m, _) = materializer();
        let batch = ResultRef::new(vec![
            ResultItem::url(format!("{base}/gone.png")),
            ResultItem::url(format!("{base}/gone.png")),
        ]);
        let err = m
            .materialize_batch(&batch, TaskKind::Image, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2 of 2"));
        assert!(m
            .materialize_batch(&ResultRef::default(), TaskKind::Image, true)
            .await
            .is_err());
    }
}

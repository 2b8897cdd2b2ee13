// src/api/mod.rs — Thin HTTP boundary over the task manager

pub mod auth;
pub mod handlers;
pub mod types;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::core::lifecycle::TaskManager;
use crate::infra::config::ApiConfig;
use crate::storage::LocalObjectStorage;
pub use types::CreateTaskBody;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<TaskManager>,
    /// Served under `/objects` when results are stored on local disk.
    pub objects: Option<Arc<LocalObjectStorage>>,
    pub token: Option<String>,
}

/// Build the axum router with all API routes.
pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://localhost:5173"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
            HeaderValue::from_static("http://127.0.0.1:5173"),
        ])
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/api/v1/tasks", post(handlers::create_task))
        .route("/api/v1/tasks", get(handlers::list_tasks))
        .route("/api/v1/tasks/{id}", get(handlers::get_task))
        .route("/api/v1/tasks/{id}/cancel", post(handlers::cancel_task))
        .route("/api/v1/credits", get(handlers::get_credits))
        .route("/api/v1/credits/daily-gift", post(handlers::claim_daily_gift))
        .route("/api/v1/health", get(handlers::health))
        .route("/objects/{*key}", get(handlers::get_object))
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` flips.
pub async fn start_server(
    config: &ApiConfig,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);

    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on http://{addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lifecycle::Repositories;
    use crate::core::materializer::ResultMaterializer;
    use crate::core::worker::TaskQueue;
    use crate::infra::config::{MaterializerConfig, WorkerConfig};
    use crate::provider::ProviderRegistry;
    use crate::rules::StaticRules;
    use crate::store::{spawn_store_server, Database};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_state(token: Option<&str>) -> ApiState {
        let db = Database::in_memory().unwrap();
        let (store, _) = spawn_store_server(db.store);
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(LocalObjectStorage::new(dir.keep(), "http://test/objects"));
        let (queue, _rx) = TaskQueue::channel(4);
        let manager = TaskManager::new(
            Repositories::from_store(&store, Arc::new(StaticRules::default())),
            ProviderRegistry::new(),
            ResultMaterializer::new(objects.clone(), MaterializerConfig::default()),
            queue,
            WorkerConfig::default(),
        );
        ApiState {
            manager: Arc::new(manager),
            objects: Some(objects),
            token: token.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state(None).await);
        let req = Request::builder()
            .uri("/api/v1/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_requires_user_header_and_token() {
        let app = build_router(test_state(Some("s3cret")).await);

        let req = Request::builder()
            .uri("/api/v1/tasks")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/api/v1/tasks")
            .header("authorization", "Bearer wrong")
            .header("x-user-id", "alice")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/api/v1/tasks")
            .header("authorization", "Bearer s3cret")
            .header("x-user-id", "alice")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_objects_route() {
        let state = test_state(None).await;
        let objects = state.objects.clone().unwrap();
        crate::storage::ObjectStorage::put(
            objects.as_ref(),
            "results/a.png",
            b"png".to_vec(),
            "image/png",
        )
        .await
        .unwrap();
        let app = build_router(state);

        let req = Request::builder()
            .uri("/objects/results/a.png")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "image/png");

        let req = Request::builder()
            .uri("/objects/results/missing.png")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

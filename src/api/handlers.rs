// src/api/handlers.rs

use crate::api::{auth, types::*, ApiState};
use crate::core::lifecycle::{CreateTaskRequest, CreatedTask};
use crate::core::types::{ProviderBinding, TaskSummary, TaskView};
use crate::infra::errors::GenTaskError;
use crate::storage::content_type_for_path;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Status code for an error, keyed by its reason code.
pub fn status_for(err: &GenTaskError) -> StatusCode {
    match err.code() {
        "validation" => StatusCode::BAD_REQUEST,
        "permission_denied" => StatusCode::FORBIDDEN,
        "quota_exhausted" | "concurrency_limit_exceeded" => StatusCode::TOO_MANY_REQUESTS,
        "insufficient_credits" => StatusCode::PAYMENT_REQUIRED,
        "not_found" => StatusCode::NOT_FOUND,
        "already_terminal" => StatusCode::CONFLICT,
        "provider_error" | "materialization_error" | "timeout" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: GenTaskError) -> ApiError {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "API request failed");
    }
    (
        status,
        Json(ErrorResponse {
            code: err.code().to_string(),
            error: err.to_string(),
        }),
    )
}

/// POST /api/v1/tasks — Gate, charge and queue a generation task.
pub async fn create_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<CreatedTask>), ApiError> {
    let user_id = auth::caller(&state, &headers)?;

    let request = CreateTaskRequest {
        user_id,
        kind: body.kind,
        binding: ProviderBinding::new(body.provider, body.model),
        node_type: body.node_type,
        prompt: body.prompt,
        reference_media: body.reference_media,
        params: body.params,
    };
    let created = state.manager.create_task(request).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/v1/tasks — The caller's tasks, newest first.
pub async fn list_tasks(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    let user_id = auth::caller(&state, &headers)?;
    let tasks = state
        .manager
        .list_tasks(&user_id, query.limit)
        .await
        .map_err(api_error)?;
    Ok(Json(tasks))
}

/// GET /api/v1/tasks/{id}
pub async fn get_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let user_id = auth::caller(&state, &headers)?;
    let view = state
        .manager
        .get_task_for(&user_id, &id)
        .await
        .map_err(api_error)?;
    Ok(Json(view))
}

/// POST /api/v1/tasks/{id}/cancel — Fail a task that has not finished; refunds its charge.
pub async fn cancel_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let user_id = auth::caller(&state, &headers)?;
    let view = state
        .manager
        .cancel_task(&user_id, &id)
        .await
        .map_err(api_error)?;
    Ok(Json(view))
}

/// GET /api/v1/credits — Balance and recent credit movements.
pub async fn get_credits(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<CreditsResponse>, ApiError> {
    let user_id = auth::caller(&state, &headers)?;
    let ledger = state.manager.ledger();
    let balance = ledger.balance(&user_id).await.map_err(api_error)?;
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let transactions = ledger
        .transactions(&user_id, limit)
        .await
        .map_err(api_error)?;
    Ok(Json(CreditsResponse {
        user_id,
        balance,
        transactions,
    }))
}

/// POST /api/v1/credits/daily-gift — Claim today's top-up.
pub async fn claim_daily_gift(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<DailyGiftResponse>, ApiError> {
    let user_id = auth::caller(&state, &headers)?;
    let ledger = state.manager.ledger();
    let granted = ledger
        .grant_daily_gift(&user_id)
        .await
        .map_err(api_error)?;
    let balance = ledger.balance(&user_id).await.map_err(api_error)?;
    Ok(Json(DailyGiftResponse { granted, balance }))
}

/// GET /objects/{*key} — Serve a locally stored result.
pub async fn get_object(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let Some(ref objects) = state.objects else {
        return Err(object_not_found(&key));
    };
    match objects.get(&key).await {
        Ok(Some(bytes)) => {
            let content_type = content_type_for_path(&key).unwrap_or("application/octet-stream");
            Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
        }
        Ok(None) => Err(object_not_found(&key)),
        // Keys that escape the storage root
        Err(GenTaskError::Storage(msg)) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                code: "validation".into(),
                error: msg,
            }),
        )),
        Err(e) => Err(api_error(e)),
    }
}

fn object_not_found(key: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            code: "not_found".into(),
            error: format!("Object '{key}' not found"),
        }),
    )
}

/// GET /api/v1/health — Simple health check.
pub async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.manager.providers().ids(),
    }))
}

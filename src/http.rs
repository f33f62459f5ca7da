//! HTTP surface: routing, serialization and error translation.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::admin::{CacheStats, GatewaySummary, HealthReport, ModelInfo};
use crate::error::GatewayError;
use crate::limiter::RateLimitStatus;
use crate::pipeline::Gateway;
use crate::types::{CompletionResult, GenerateRequest};
use crate::usage::UsageTotals;

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ClearCacheResponse {
    deleted_count: u64,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/v1/generate", post(generate))
        .route("/v1/health", get(health))
        .route("/v1/models", get(models))
        .route("/v1/usage/:user_id", get(usage))
        .route("/v1/rate-limit/:user_id", get(rate_limit))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/clear", delete(cache_clear))
        .route("/v1/admin/summary", get(admin_summary))
        .with_state(gateway)
}

async fn generate(
    State(gateway): State<Arc<Gateway>>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<CompletionResult>, Response> {
    gateway
        .generate(request)
        .await
        .map(Json)
        .map_err(map_gateway_error)
}

async fn health(State(gateway): State<Arc<Gateway>>) -> (StatusCode, Json<HealthReport>) {
    let report = gateway.health().await;
    let status = if report.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn models(State(gateway): State<Arc<Gateway>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: gateway.models(),
    })
}

async fn usage(
    State(gateway): State<Arc<Gateway>>,
    Path(user_id): Path<String>,
) -> Result<Json<UsageTotals>, Response> {
    match gateway.usage(&user_id).await.map_err(map_gateway_error)? {
        Some(totals) => Ok(Json(totals)),
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no usage recorded for user {user_id}"),
        )),
    }
}

async fn rate_limit(
    State(gateway): State<Arc<Gateway>>,
    Path(user_id): Path<String>,
) -> Result<Json<RateLimitStatus>, Response> {
    gateway
        .rate_limit_status(&user_id)
        .await
        .map(Json)
        .map_err(map_gateway_error)
}

async fn cache_stats(
    State(gateway): State<Arc<Gateway>>,
) -> Result<Json<CacheStats>, Response> {
    gateway.cache_stats().await.map(Json).map_err(map_gateway_error)
}

async fn cache_clear(
    State(gateway): State<Arc<Gateway>>,
) -> Result<Json<ClearCacheResponse>, Response> {
    gateway
        .clear_cache()
        .await
        .map(|deleted_count| Json(ClearCacheResponse { deleted_count }))
        .map_err(map_gateway_error)
}

async fn admin_summary(
    State(gateway): State<Arc<Gateway>>,
) -> Result<Json<GatewaySummary>, Response> {
    gateway.summary().await.map(Json).map_err(map_gateway_error)
}

fn map_gateway_error(err: GatewayError) -> Response {
    match err {
        GatewayError::InvalidInput { reason } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_input", reason)
        }
        GatewayError::UnknownModel { model } => error_response(
            StatusCode::NOT_FOUND,
            "invalid_model",
            format!("unknown model: {model}"),
        ),
        GatewayError::RateLimited {
            window,
            retry_after_s,
        } => {
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_exceeded",
                format!("rate limit exceeded for {window} window"),
            );
            if let Ok(value) = retry_after_s.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
        GatewayError::KvUnavailable { message } => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "kv_unavailable", message)
        }
        GatewayError::Provider { error, attempts } => error_response(
            StatusCode::BAD_GATEWAY,
            "provider_failure",
            format!("provider call failed after {attempts} attempt(s): {error}"),
        ),
        GatewayError::DeadlineExceeded => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "timeout",
            "request deadline exceeded",
        ),
        GatewayError::Internal { .. } => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "internal error",
        ),
    }
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
        .into_response()
}

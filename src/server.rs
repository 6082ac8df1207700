//! HTTP surface for the pipeline.
//!
//! # Endpoints
//!
//! - `GET /health` - liveness
//! - `POST /subscriptions`, `GET|PUT|DELETE /subscriptions/{id}` - subscription CRUD
//! - `POST /ingest/{subscription_id}` - accept an event, returns 202 once queued
//! - `GET /status/{task_id}` - every attempt for a task, oldest first
//! - `GET /subscriptions/{id}/logs` - latest attempts for a subscription

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

use crate::engine::DeliveryEngine;
use crate::error::{IngestError, ServiceError};
use crate::ingest::Ingestor;
use crate::signing::SIGNATURE_HEADER;
use crate::status::StatusService;
use crate::subscriptions::SubscriptionService;
use crate::types::{NewSubscription, SubscriptionId, SubscriptionUpdate, TaskId};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    ingestor: Arc<Ingestor>,
    subscriptions: Arc<SubscriptionService>,
    status: Arc<StatusService>,
}

impl AppState {
    pub fn new(engine: &DeliveryEngine) -> Self {
        Self {
            ingestor: engine.ingestor(),
            subscriptions: engine.subscriptions(),
            status: engine.status(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/subscriptions", post(create_subscription))
        .route(
            "/subscriptions/{id}",
            get(get_subscription).put(update_subscription).delete(delete_subscription),
        )
        .route("/subscriptions/{id}/logs", get(subscription_logs))
        .route("/ingest/{subscription_id}", post(ingest))
        .route("/status/{task_id}", get(task_status))
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::BadRequest(msg) => error_body(StatusCode::BAD_REQUEST, msg),
            IngestError::Unauthorized(msg) => error_body(StatusCode::UNAUTHORIZED, msg),
            IngestError::NotFound => error_body(StatusCode::NOT_FOUND, "Subscription not found"),
            IngestError::Internal(msg) => {
                error!(error = %msg, "ingestion failed");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            ServiceError::Validation(msg) => error_body(StatusCode::BAD_REQUEST, msg),
            ServiceError::NotFound => error_body(StatusCode::NOT_FOUND, "Subscription not found"),
            ServiceError::Store(e) => {
                error!(error = %e, "store request failed");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "up" }))
}

fn parse_subscription_id(raw: &str) -> Result<SubscriptionId, ServiceError> {
    raw.parse()
        .map_err(|_| ServiceError::Validation("Invalid subscription ID".to_string()))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ServiceError> {
    serde_json::from_slice(body).map_err(|e| ServiceError::Validation(e.to_string()))
}

async fn create_subscription(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let req: NewSubscription = parse_body(&body)?;
    let sub = state.subscriptions.create(req).await?;
    Ok((StatusCode::CREATED, Json(sub)).into_response())
}

async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let sub = state.subscriptions.get(parse_subscription_id(&id)?).await?;
    Ok(Json(sub).into_response())
}

async fn update_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let id = parse_subscription_id(&id)?;
    let req: SubscriptionUpdate = parse_body(&body)?;
    let sub = state.subscriptions.update(id, req).await?;
    Ok(Json(sub).into_response())
}

async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServiceError> {
    state.subscriptions.delete(parse_subscription_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn subscription_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let logs = state
        .status
        .recent_logs_for_subscription(parse_subscription_id(&id)?)
        .await?;
    Ok(Json(logs).into_response())
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, ServiceError> {
    let task_id: TaskId = task_id
        .parse()
        .map_err(|_| ServiceError::Validation("Invalid webhook ID".to_string()))?;
    let logs = state.status.logs_for_task(task_id).await?;
    Ok(Json(logs).into_response())
}

/// Accept one event for delivery.
///
/// A non-UTF-8 signature header is treated as absent.
async fn ingest(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, IngestError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match state.ingestor.ingest(&subscription_id, &body, signature).await {
        Ok(task_id) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "queued", "task_id": task_id })),
        )
            .into_response()),
        Err(e) => {
            if !matches!(e, IngestError::Internal(_)) {
                warn!(subscription_id = %subscription_id, error = %e, "event rejected");
            }
            Err(e)
        }
    }
}

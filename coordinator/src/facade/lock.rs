use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use storage::{AcquireOutcome, LockMode, ReleaseOutcome};

use crate::errors::CoreError;

use super::AppState;

#[derive(Deserialize)]
pub struct AcquireRequest {
    pub resource: String,
    pub mode: LockMode,
    pub client_id: String,
    pub timeout_seconds: Option<f64>,
}

#[derive(Deserialize)]
pub struct ReleaseRequest {
    pub resource: String,
    pub client_id: String,
}

#[derive(Serialize)]
pub struct LockResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
}

pub async fn acquire_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AcquireRequest>,
) -> (StatusCode, Json<LockResult>) {
    let outcome = state
        .lock
        .acquire(&req.resource, req.mode, &req.client_id, req.timeout_seconds)
        .await;

    match outcome {
        AcquireOutcome::Granted { lock_id } => (
            StatusCode::OK,
            Json(LockResult {
                success: true,
                message: "granted".to_string(),
                leader_id: None,
                queued: Some(false),
                position: None,
                lock_id: Some(lock_id),
            }),
        ),
        AcquireOutcome::Queued { position } => (
            StatusCode::OK,
            Json(LockResult {
                success: true,
                message: "queued".to_string(),
                leader_id: None,
                queued: Some(true),
                position: Some(position),
                lock_id: None,
            }),
        ),
        AcquireOutcome::NotLeader { leader } => (
            StatusCode::TEMPORARY_REDIRECT,
            Json(LockResult {
                success: false,
                message: CoreError::NotLeader { leader: leader.clone() }.to_string(),
                leader_id: leader,
                queued: None,
                position: None,
                lock_id: None,
            }),
        ),
        AcquireOutcome::Partition => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(LockResult {
                success: false,
                message: CoreError::Partition.to_string(),
                leader_id: None,
                queued: None,
                position: None,
                lock_id: None,
            }),
        ),
        AcquireOutcome::ReplicationFailed => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(LockResult {
                success: false,
                message: CoreError::ReplicationTimeout.to_string(),
                leader_id: None,
                queued: None,
                position: None,
                lock_id: None,
            }),
        ),
    }
}

pub async fn release_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReleaseRequest>,
) -> (StatusCode, Json<LockResult>) {
    let outcome = state.lock.release(&req.resource, &req.client_id).await;

    match outcome {
        ReleaseOutcome::Released => (
            StatusCode::OK,
            Json(LockResult {
                success: true,
                message: "released".to_string(),
                leader_id: None,
                queued: None,
                position: None,
                lock_id: None,
            }),
        ),
        ReleaseOutcome::NotLeader { leader } => (
            StatusCode::TEMPORARY_REDIRECT,
            Json(LockResult {
                success: false,
                message: CoreError::NotLeader { leader: leader.clone() }.to_string(),
                leader_id: leader,
                queued: None,
                position: None,
                lock_id: None,
            }),
        ),
        ReleaseOutcome::NotHolder => (
            StatusCode::BAD_REQUEST,
            Json(LockResult {
                success: false,
                message: CoreError::StateViolation("caller does not hold this lock".to_string()).to_string(),
                leader_id: None,
                queued: None,
                position: None,
                lock_id: None,
            }),
        ),
        ReleaseOutcome::ReplicationFailed => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(LockResult {
                success: false,
                message: CoreError::ReplicationTimeout.to_string(),
                leader_id: None,
                queued: None,
                position: None,
                lock_id: None,
            }),
        ),
    }
}

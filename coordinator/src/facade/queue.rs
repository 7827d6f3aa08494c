use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use storage::InFlightMessage;

use super::AppState;

#[derive(Deserialize)]
pub struct EnqueueRequest {
    pub queue: String,
    pub payload: serde_json::Value,
}

#[derive(Serialize)]
pub struct EnqueueReply {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Deserialize)]
pub struct QueueNameRequest {
    pub queue: String,
}

#[derive(Serialize)]
pub struct DequeueReply {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<InFlightMessage>,
}

#[derive(Deserialize)]
pub struct AckRequest {
    pub id: String,
}

#[derive(Serialize)]
pub struct AckReply {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct QueueStatusReply {
    pub queue_name: String,
    pub size: usize,
    pub in_flight: usize,
    pub node_id: String,
}

pub async fn enqueue_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnqueueRequest>,
) -> (StatusCode, Json<EnqueueReply>) {
    match state.ring.get_node(&req.queue) {
        Some(owner) if owner == state.node_id => match state.queue.enqueue(&req.queue, req.payload).await {
            Ok(id) => (StatusCode::OK, Json(EnqueueReply { status: "ok", id: Some(id) })),
            Err(err) => {
                tracing::error!(?err, "local enqueue failed");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(EnqueueReply { status: "error", id: None }))
            }
        },
        Some(owner) => match state.transport.enqueue_remote(owner, &req.queue, req.payload).await {
            Some(id) => (StatusCode::OK, Json(EnqueueReply { status: "ok", id: Some(id) })),
            None => (StatusCode::BAD_GATEWAY, Json(EnqueueReply { status: "error", id: None })),
        },
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(EnqueueReply { status: "error", id: None }),
        ),
    }
}

pub async fn dequeue_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueueNameRequest>,
) -> (StatusCode, Json<DequeueReply>) {
    match state.ring.get_node(&req.queue) {
        Some(owner) if owner == state.node_id => {
            let message = state.queue.dequeue(&req.queue);
            (StatusCode::OK, Json(DequeueReply { status: "ok", message }))
        }
        Some(owner) => match state.transport.dequeue_remote(owner, &req.queue).await {
            Some(message) => (StatusCode::OK, Json(DequeueReply { status: "ok", message })),
            None => (StatusCode::BAD_GATEWAY, Json(DequeueReply { status: "error", message: None })),
        },
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(DequeueReply { status: "error", message: None }),
        ),
    }
}

/// Acknowledges a message. Must be sent to the owning node -- the caller's responsibility, per
/// SPEC_FULL.md §4.5, since only the node that served the dequeue has the in-flight entry.
pub async fn ack_handler(State(state): State<Arc<AppState>>, Json(req): Json<AckRequest>) -> (StatusCode, Json<AckReply>) {
    match state.queue.ack(&req.id).await {
        Ok(true) => (StatusCode::OK, Json(AckReply { status: "ok" })),
        Ok(false) => (StatusCode::BAD_REQUEST, Json(AckReply { status: "unknown_message" })),
        Err(err) => {
            tracing::error!(?err, "ack failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(AckReply { status: "error" }))
        }
    }
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueueNameRequest>,
) -> (StatusCode, Json<QueueStatusReply>) {
    match state.ring.get_node(&req.queue) {
        Some(owner) if owner == state.node_id => (
            StatusCode::OK,
            Json(QueueStatusReply {
                queue_name: req.queue.clone(),
                size: state.queue.queue_size(&req.queue),
                in_flight: state.queue.in_flight_count(),
                node_id: state.node_id.clone(),
            }),
        ),
        Some(owner) => match state.transport.queue_status_remote(owner, &req.queue).await {
            Some(reply) => (
                StatusCode::OK,
                Json(QueueStatusReply {
                    queue_name: reply.queue_name,
                    size: reply.size,
                    in_flight: reply.in_flight,
                    node_id: reply.node_id,
                }),
            ),
            None => (
                StatusCode::BAD_GATEWAY,
                Json(QueueStatusReply {
                    queue_name: req.queue,
                    size: 0,
                    in_flight: 0,
                    node_id: owner.to_string(),
                }),
            ),
        },
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(QueueStatusReply {
                queue_name: req.queue,
                size: 0,
                in_flight: 0,
                node_id: state.node_id.clone(),
            }),
        ),
    }
}

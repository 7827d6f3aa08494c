//! The shared `/internal/message` ingress (SPEC_FULL.md §6.2): every peer RPC, regardless of which
//! service it belongs to, lands here and is dispatched by its `type` tag.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::transport::Envelope;

use super::AppState;

pub async fn internal_message_handler(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<Envelope>,
) -> (StatusCode, Json<serde_json::Value>) {
    let body = match envelope {
        Envelope::RequestVote(req) => {
            let reply = state.lock.raft().handle_request_vote(req).await;
            serde_json::to_value(reply).unwrap()
        }
        Envelope::AppendEntries(req) => {
            // Every valid AppendEntries is a heartbeat from the sender's perspective, whether or
            // not it carries new entries -- feed the phi-accrual detector (SPEC_FULL.md §4.7)
            // regardless of what Raft itself decides to do with the RPC.
            state.failure_detector.record_heartbeat(&req.leader_id);
            let reply = state.lock.raft().handle_append_entries(req).await;
            serde_json::to_value(reply).unwrap()
        }
        Envelope::Enqueue { queue, payload } => match state.queue.enqueue(&queue, payload).await {
            Ok(id) => json!({"status": "ok", "id": id}),
            Err(err) => {
                tracing::error!(?err, "remote enqueue failed");
                json!({"status": "error"})
            }
        },
        Envelope::Dequeue { queue } => {
            let message = state.queue.dequeue(&queue);
            json!({"status": "ok", "message": message})
        }
        Envelope::QueueStatus { queue } => json!({
            "queue_name": queue,
            "size": state.queue.queue_size(&queue),
            "in_flight": state.queue.in_flight_count(),
            "node_id": state.node_id,
        }),
        Envelope::CacheReadRequest { key, .. } => match state.cache.handle_read_request(&key).await {
            Some(remote) => json!({"status": "ok", "has_data": true, "data": remote.data, "state": remote.state}),
            None => json!({"status": "ok", "has_data": false}),
        },
        Envelope::CacheInvalidate { key, .. } => {
            state.cache.handle_invalidate(&key).await;
            json!({"status": "ok"})
        }
        Envelope::CacheStatus { key } => {
            let status = state.cache.handle_status(&key);
            serde_json::to_value(status).unwrap()
        }
    };

    (StatusCode::OK, Json(body))
}

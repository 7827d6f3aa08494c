//! Thin `axum` routers, one per hosted service, each translating a request into a core call and
//! rendering the core's result object (SPEC_FULL.md §6.4). The cores stay fully unit-testable
//! without a server; this module is connective tissue only.

pub mod cache;
pub mod internal;
pub mod lock;
pub mod queue;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use storage::{CacheNode, ConsistentHashRing, InMemoryBackingStore, LockStateMachine, QueueShard};

use crate::failure_detector::FailureDetectorRegistry;
use crate::transport::PeerTransport;

pub struct AppState {
    pub node_id: String,
    pub lock: Arc<LockStateMachine<PeerTransport>>,
    pub queue: Arc<QueueShard>,
    pub cache: Arc<CacheNode<PeerTransport, InMemoryBackingStore>>,
    pub ring: ConsistentHashRing,
    pub transport: Arc<PeerTransport>,
    pub failure_detector: Arc<FailureDetectorRegistry>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/lock/acquire", post(lock::acquire_handler))
        .route("/lock/release", post(lock::release_handler))
        .route("/queue/enqueue", post(queue::enqueue_handler))
        .route("/queue/dequeue", post(queue::dequeue_handler))
        .route("/queue/ack", post(queue::ack_handler))
        .route("/queue/status", post(queue::status_handler))
        .route("/cache/read", post(cache::read_handler))
        .route("/cache/write", post(cache::write_handler))
        .route("/cache/status", get(cache::status_handler))
        .route("/internal/message", post(internal::internal_message_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Ambient status endpoint (SPEC_FULL.md §4.9): the counters named across §3/§4.6, plus which
/// peers the phi-accrual detector currently suspects. Not the out-of-scope "metrics dashboard" --
/// just the plain numbers a caller would otherwise have to scrape from logs.
async fn metrics(axum::extract::State(state): axum::extract::State<Arc<AppState>>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "node_id": state.node_id,
        "lock": {
            "active_locks": state.lock.active_lock_count(),
            "waiting": state.lock.waiting_count(),
            "deadlock_count": state.lock.deadlock_count(),
            "is_leader": state.lock.raft().is_leader(),
        },
        "cache": state.cache.status(),
        "suspected_peers": state.failure_detector.suspected(),
    }))
}

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;

#[derive(Deserialize)]
pub struct ReadRequest {
    pub key: String,
}

#[derive(Serialize)]
pub struct ReadReply {
    pub status: &'static str,
    pub data: serde_json::Value,
}

#[derive(Deserialize)]
pub struct WriteRequest {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Serialize)]
pub struct WriteReply {
    pub status: &'static str,
}

pub async fn read_handler(State(state): State<Arc<AppState>>, Json(req): Json<ReadRequest>) -> Json<ReadReply> {
    let data = state.cache.read(&req.key).await;
    Json(ReadReply { status: "ok", data })
}

pub async fn write_handler(State(state): State<Arc<AppState>>, Json(req): Json<WriteRequest>) -> Json<WriteReply> {
    state.cache.write(&req.key, req.value).await;
    Json(WriteReply { status: "ok" })
}

#[derive(Deserialize)]
pub struct StatusQuery {
    pub key: Option<String>,
}

pub async fn status_handler(State(state): State<Arc<AppState>>, Query(query): Query<StatusQuery>) -> (StatusCode, Json<serde_json::Value>) {
    match query.key {
        Some(key) => {
            let status = state.cache.handle_status(&key);
            (StatusCode::OK, Json(serde_json::to_value(status).unwrap()))
        }
        None => (StatusCode::OK, Json(serde_json::to_value(state.cache.status()).unwrap())),
    }
}

//! Administrative control surface

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use super::AppState;
use crate::registry::{RecordSnapshot, StreamKey};

/// One row of the stream index: the record plus its artifact freshness
#[derive(Debug, Serialize)]
pub struct StreamIndexEntry {
    #[serde(flatten)]
    pub record: RecordSnapshot,
    /// Whether the artifact tree currently passes the freshness check
    pub fresh: bool,
    pub last_segment_age_secs: Option<u64>,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let active = state.registry.count().await;
    Json(json!({
        "status": "healthy",
        "active_streams": active,
    }))
}

/// `GET /streams`: index of known streams with freshness
pub async fn list_streams(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut streams = Vec::new();
    for record in state.registry.list().await {
        streams.push(index_entry(&state, record).await);
    }
    Json(json!({ "streams": streams }))
}

/// `GET /streams/:key`: one record, 404 if unknown
pub async fn get_stream(State(state): State<AppState>, Path(raw_key): Path<String>) -> Response {
    let Ok(key) = StreamKey::parse(&raw_key) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match state.registry.get(&key).await {
        Some(record) => Json(index_entry(&state, record).await).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `POST /streams/:key/stop`: operator-forced drain
pub async fn stop_stream(State(state): State<AppState>, Path(raw_key): Path<String>) -> Response {
    let Ok(key) = StreamKey::parse(&raw_key) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match state.controller.force_stop(&key).await {
        Ok(()) => {
            tracing::info!(stream = %key, "Operator stop");
            Json(json!({ "status": "stopped", "key": key })).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn index_entry(
    state: &AppState,
    record: std::sync::Arc<crate::registry::StreamRecord>,
) -> StreamIndexEntry {
    let report = state
        .health
        .scan(record.key(), record.ladder().len())
        .await;

    StreamIndexEntry {
        record: record.snapshot(),
        fresh: report.active,
        last_segment_age_secs: report.last_segment_age.map(|age| age.as_secs()),
    }
}

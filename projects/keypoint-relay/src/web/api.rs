use crate::pipeline::types::PipelineStats;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Serialize)]
pub struct HealthInfo {
    pub running: bool,
}

/// Counters and stage timings for the running relay.
pub async fn get_status(State(stats): State<Arc<PipelineStats>>) -> Json<serde_json::Value> {
    Json(stats.to_status_json())
}

pub async fn get_health(
    State(stats): State<Arc<PipelineStats>>,
) -> (StatusCode, Json<HealthInfo>) {
    let running = stats.is_running.load(Ordering::Relaxed);
    let code = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthInfo { running }))
}

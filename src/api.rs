// src/api.rs
// Control surface for the pipeline: lifecycle, tracked partitions, poll
// interval, plus read endpoints over the in-process snapshot. This is the
// only surface external callers (the control-panel UI) use.

use std::collections::BTreeSet;
use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::model::{Insight, Item};
use crate::pipeline::{Pipeline, StatusReport};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status))
        .route("/control/start", post(start))
        .route("/control/stop", post(stop))
        .route("/control/partitions", post(set_partitions))
        .route("/control/interval", post(set_interval))
        .route("/items", get(items))
        .route("/insights", get(insights))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.pipeline.status().await)
}

#[derive(serde::Serialize)]
struct ControlResp {
    changed: bool,
    is_running: bool,
}

async fn start(State(state): State<AppState>) -> Json<ControlResp> {
    let changed = state.pipeline.start();
    Json(ControlResp {
        changed,
        is_running: state.pipeline.is_running(),
    })
}

async fn stop(State(state): State<AppState>) -> Json<ControlResp> {
    let changed = state.pipeline.stop();
    Json(ControlResp {
        changed,
        is_running: state.pipeline.is_running(),
    })
}

#[derive(serde::Deserialize)]
struct PartitionsReq {
    partitions: Vec<String>,
}

async fn set_partitions(
    State(state): State<AppState>,
    Json(body): Json<PartitionsReq>,
) -> Json<StatusReport> {
    let set: BTreeSet<String> = body
        .partitions
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    state.pipeline.set_tracked_partitions(set);
    Json(state.pipeline.status().await)
}

#[derive(serde::Deserialize)]
struct IntervalReq {
    interval_ms: u64,
}

async fn set_interval(
    State(state): State<AppState>,
    Json(body): Json<IntervalReq>,
) -> Json<StatusReport> {
    state.pipeline.set_poll_interval_ms(body.interval_ms);
    Json(state.pipeline.status().await)
}

fn limit_from(q: &HashMap<String, String>) -> usize {
    q.get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50)
        .min(500)
}

async fn items(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Vec<Item>> {
    Json(state.pipeline.snapshot().items_last_n(limit_from(&q)))
}

/// Insight arrival order can differ from item discovery order because
/// generation latency varies; readers sort by `created_at` here.
async fn insights(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Vec<Insight>> {
    let mut out = state.pipeline.snapshot().insights_last_n(limit_from(&q));
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(out)
}

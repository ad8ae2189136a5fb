//! `/api/devices`, `/api/activity` (C3, C12 §6).

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::activity::ActivityEntry;
use crate::state::AppState;

pub async fn list_devices(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!(state.registry.snapshot_device_states().await))
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    #[serde(default)]
    since: u64,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    200
}

pub async fn list_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Json<Vec<ActivityEntry>> {
    Json(state.activity.read_since(query.since, query.limit).await)
}

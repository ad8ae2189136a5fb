//! `/api/groups` CRUD (C8 §6).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::groups::{Group, GroupPatch};
use crate::state::AppState;

pub async fn list_groups(State(state): State<AppState>) -> Json<Vec<Group>> {
    Json(state.groups.list().await)
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    device_udids: Vec<String>,
    #[serde(default)]
    script_path: Option<String>,
}

pub async fn create_group(
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<Group>, StatusCode> {
    state
        .groups
        .create(req.name, req.device_udids, req.script_path)
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

pub async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Group>, StatusCode> {
    state.groups.get(&id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

pub async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<GroupPatch>,
) -> Result<Json<Group>, StatusCode> {
    state
        .groups
        .update(&id, patch)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn delete_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let removed = state.groups.delete(&id).await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Deserialize)]
pub struct ScriptOverridesRequest {
    script_name: String,
    overrides: Value,
}

pub async fn set_script_overrides(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ScriptOverridesRequest>,
) -> Result<StatusCode, StatusCode> {
    let found = state
        .groups
        .set_script_overrides(&id, req.script_name, req.overrides)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if found {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

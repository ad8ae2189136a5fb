//! `/api/update/*` (C10 §6).

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::state::AppState;
use crate::updater::apply::is_containerized;
use crate::updater::{UpdateError, UpdateStage, UpdateStateRecord};

/// Give the response carrying this JSON body time to actually reach the
/// client before the process exits.
const EXIT_DELAY: Duration = Duration::from_millis(1200);

fn map_update_error(e: UpdateError) -> StatusCode {
    match e {
        UpdateError::InvalidTransition { .. } => StatusCode::CONFLICT,
        UpdateError::Manifest(_) | UpdateError::Archive(_) | UpdateError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub async fn status(State(state): State<AppState>) -> Json<UpdateStateRecord> {
    Json(state.updater.snapshot().await)
}

pub async fn check(State(state): State<AppState>) -> Result<Json<UpdateStateRecord>, StatusCode> {
    state.updater.check().await.map(Json).map_err(map_update_error)
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    os: String,
    arch: String,
}

pub async fn download(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<UpdateStateRecord>, StatusCode> {
    state.updater.download(&req.os, &req.arch).await.map(Json).map_err(map_update_error)
}

pub async fn cancel_download(State(state): State<AppState>) -> Result<Json<UpdateStateRecord>, StatusCode> {
    state.updater.cancel_download().await.map(Json).map_err(map_update_error)
}

/// After a successful native (non-containerized) apply, the detached
/// `-update-worker` helper is waiting for this process to exit before it
/// safely renames the binary/frontend directory into place (§4.9) — exit
/// shortly after the response is flushed so its 30s wait budget isn't spent
/// on a server that just sits there.
pub async fn apply(State(state): State<AppState>) -> Result<Json<UpdateStateRecord>, StatusCode> {
    let current_exe = std::env::current_exe().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let record = state.updater.apply(&current_exe).await.map_err(map_update_error)?;

    if record.stage == UpdateStage::Replaced && !is_containerized() {
        tokio::spawn(async {
            tokio::time::sleep(EXIT_DELAY).await;
            std::process::exit(0);
        });
    }

    Ok(Json(record))
}

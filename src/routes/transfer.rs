//! `/api/transfer/*` (C7 §6): mint push/pull tokens and stream the
//! corresponding download/upload bodies.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::state::AppState;
use crate::transfer::TransferError;

fn map_transfer_error(e: TransferError) -> StatusCode {
    match e {
        TransferError::NotFound => StatusCode::NOT_FOUND,
        TransferError::Expired => StatusCode::GONE,
        TransferError::AlreadyConsumed => StatusCode::CONFLICT,
        TransferError::InvalidPath => StatusCode::BAD_REQUEST,
        TransferError::Io => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    #[serde(rename = "deviceSN")]
    device_udid: String,
    category: String,
    path: String,
    #[serde(rename = "targetPath")]
    target_path: String,
    #[serde(default, rename = "sharedSourceId")]
    shared_source_id: Option<String>,
}

pub async fn push_to_device(
    State(state): State<AppState>,
    Json(req): Json<PushRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let minted = state
        .transfer
        .mint_push(req.device_udid, &req.category, &req.path, req.target_path, req.shared_source_id)
        .await
        .map_err(map_transfer_error)?;
    Ok(Json(minted))
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    #[serde(rename = "deviceSN")]
    device_udid: String,
    #[serde(rename = "sourcePath")]
    source_path: String,
    category: String,
    path: String,
}

#[derive(Debug, serde::Serialize)]
pub struct PullMinted {
    token: String,
}

pub async fn pull_from_device(
    State(state): State<AppState>,
    Json(req): Json<PullRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let token = state
        .transfer
        .mint_pull(req.device_udid, req.source_path, &req.category, &req.path)
        .await
        .map_err(map_transfer_error)?;
    Ok(Json(PullMinted { token }))
}

pub async fn download(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, StatusCode> {
    let (path, size) = state.transfer.claim_download(&token).await.map_err(map_transfer_error)?;
    let file = tokio::fs::File::open(&path).await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    Ok((
        [
            (axum::http::header::CONTENT_LENGTH, size.to_string()),
            (axum::http::header::CONTENT_TYPE, "application/octet-stream".to_string()),
        ],
        body,
    )
        .into_response())
}

pub async fn upload(
    State(state): State<AppState>,
    Path(token): Path<String>,
    request: axum::extract::Request,
) -> Result<StatusCode, StatusCode> {
    let dest = state.transfer.claim_upload(&token).await.map_err(map_transfer_error)?;
    let stream = request
        .into_body()
        .into_data_stream()
        .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let reader = StreamReader::new(stream);
    state
        .transfer
        .store_upload(&dest, reader)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(StatusCode::NO_CONTENT)
}

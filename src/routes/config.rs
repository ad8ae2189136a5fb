//! `/api/config`, `/api/health`, `/api/download-bind-script` (C2, C11 §6).

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::signer::Signer;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PublicConfig {
    version: String,
    listen: String,
    ping_interval: u64,
    ping_timeout: u64,
    has_password: bool,
    turn_enabled: bool,
    update_channel: String,
}

pub async fn get_config(State(state): State<AppState>) -> Json<PublicConfig> {
    Json(PublicConfig {
        version: crate::state::current_version(),
        listen: state.config.listen.clone(),
        ping_interval: state.config.ping_interval,
        ping_timeout: state.config.ping_timeout,
        has_password: !state.config.passhash.is_empty(),
        turn_enabled: state.config.turn.enabled,
        update_channel: state.config.update.channel.clone(),
    })
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    password: String,
}

pub async fn set_password(
    State(state): State<AppState>,
    Json(req): Json<SetPasswordRequest>,
) -> Result<StatusCode, StatusCode> {
    let passhash = Signer::hash_password(&req.password);
    let mut updated = (*state.config).clone();
    updated.passhash = passhash;
    let save_path = updated.default_save_path();
    updated.save(&save_path).await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// A minimal `.bind` script: the device-side agent curls this once to learn
/// the server address and the password hash it should sign with — it is
/// deliberately whitelisted from signature verification (see `auth.rs`)
/// since a brand-new device has no credential yet.
pub async fn download_bind_script(State(state): State<AppState>) -> Response {
    let script = format!(
        "#!/bin/sh\n# xxtc-hub bind script\nexport XXTC_SERVER=\"{}\"\nexport XXTC_PASSHASH=\"{}\"\n",
        state.config.listen, state.config.passhash,
    );
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        script,
    )
        .into_response()
}

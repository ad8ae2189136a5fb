//! `/api/turn/credentials` (C9 §6).

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::state::AppState;
use crate::turn::TurnCredential;

pub async fn credentials(State(state): State<AppState>) -> Result<Json<TurnCredential>, StatusCode> {
    state.turn.issue_credential("controller").await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

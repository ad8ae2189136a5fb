//! HTTP Front End (C11): route assembly, signature middleware, static asset
//! serving, and CORS. Grounded on the teacher's `main.rs::build_router`.

mod auth;
mod config;
mod devices;
mod groups;
mod transfer;
mod turn;
mod update;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::ws::ws_handler;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(config::health))
        .route("/download-bind-script", get(config::download_bind_script))
        .route("/config", get(config::get_config))
        .route("/config/password", post(config::set_password))
        .route("/devices", get(devices::list_devices))
        .route("/activity", get(devices::list_activity))
        .route("/groups", get(groups::list_groups).post(groups::create_group))
        .route(
            "/groups/{id}",
            get(groups::get_group).patch(groups::update_group).delete(groups::delete_group),
        )
        .route("/groups/{id}/script-overrides", post(groups::set_script_overrides))
        .route("/transfer/push-to-device", post(transfer::push_to_device))
        .route("/transfer/pull-from-device", post(transfer::pull_from_device))
        .route("/transfer/download/{token}", get(transfer::download))
        .route("/transfer/upload/{token}", put(transfer::upload))
        .route("/update/status", get(update::status))
        .route("/update/check", post(update::check))
        .route("/update/download", post(update::download))
        .route("/update/download/cancel", post(update::cancel_download))
        .route("/update/apply", post(update::apply))
        .route("/turn/credentials", get(turn::credentials))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_signature));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws_handler))
        .nest("/api", api)
        .fallback_service(ServeDir::new(&state.config.frontend_dir))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

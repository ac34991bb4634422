//! HTTP surface: static UI, session validation, HLS artifacts, health

pub mod error;
pub mod health;
pub mod session;
pub mod video;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use cinesync_core::service::{AuthStore, StateCore, VideoCatalog};
use cinesync_core::Config;

use crate::ws::SyncHub;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<AuthStore>,
    pub state: Arc<StateCore>,
    pub catalog: Arc<VideoCatalog>,
    pub hub: Arc<SyncHub>,
    pub started_at: Instant,
}

/// Build the full router: API routes first, the static UI as fallback.
pub fn create_router(state: AppState) -> Router {
    let ui_dir = state.config.server.ui_dir.clone();
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/validate-session", post(session::validate_session))
        .route("/video/{stream}/{*subpath}", get(video::serve_video))
        .route("/ws", get(crate::ws::ws_handler))
        .fallback_service(ServeDir::new(ui_dir).append_index_html_on_directories(true))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

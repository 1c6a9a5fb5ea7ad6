//! Router and shared application state.

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use windlass::Store;

use crate::routes::{health_handler, reject_handler, resolve_handler};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

/// Build the control-plane router.
pub fn build_app(store: Store) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/awakeables/:id/resolve", post(resolve_handler))
        .route("/awakeables/:id/reject", post(reject_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

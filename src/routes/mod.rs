//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. The API is
//! unauthenticated and meant for the local network, like the upstream
//! switches it drives.

pub mod groups;
pub mod health;
pub mod switch;

use axum::{routing::get, Router};
use tower::Layer;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// All routes with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/lightgroups", get(groups::list_groups))
        .route("/switch/on", get(switch::switch_on))
        .route("/switch/off", get(switch::switch_off))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The router wrapped so that `/lightgroups/` and `/lightgroups` are the same
/// route. Path normalization has to run before routing, hence outside the
/// router.
pub fn app(state: AppState) -> NormalizePath<Router> {
    NormalizePathLayer::trim_trailing_slash().layer(router(state))
}

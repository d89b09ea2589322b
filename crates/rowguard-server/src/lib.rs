//! # rowguard-server
//!
//! HTTP sidecar for rowguard. Every request passes the tenant boundary, picks
//! up a propagated policy marker if its caller sent one and the boundary
//! trusts that header, and then runs inside its own request context.
//!
//! Routes:
//! - `GET /healthz`: liveness, exempt from tenant binding by default
//! - `GET /v1/context`: the tenant, caller and marker state the request sees
//! - `POST /v1/rewrite`: rewrite a SQL batch for the request's context

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use state::AppState;

/// Build the application router.
///
/// The boundary runs first and installs the request context; the marker
/// header is applied inside it.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/v1/context", get(handlers::context))
        .route("/v1/rewrite", post(handlers::rewrite))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::propagation::accept_marker_header,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::boundary::enforce_boundary,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

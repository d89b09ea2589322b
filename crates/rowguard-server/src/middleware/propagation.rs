//! Cross-process policy marker propagation.
//!
//! Only the innermost marker's "disabled" state crosses a process boundary,
//! as a single header. The receiving side turns it back into a marker for
//! that one request, but only when `boundary.trust_marker_header` is set:
//! the header switches every rule off, so it must never be accepted from
//! clients outside the trusted network.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use rowguard_core::PolicyMarker;
use rowguard_rls::{with_marker, RequestContext};

use crate::state::AppState;

pub const DATA_PERMISSION_ENABLE_HEADER: &str = "data-permission-enable";

/// Header to attach to an outbound call made from the current context.
///
/// `None` unless the innermost marker disables rules.
pub fn outbound_marker_header() -> Option<(HeaderName, HeaderValue)> {
    let disabled = RequestContext::current().is_some_and(|ctx| ctx.rules_disabled());
    disabled.then(|| {
        (
            HeaderName::from_static(DATA_PERMISSION_ENABLE_HEADER),
            HeaderValue::from_static("false"),
        )
    })
}

/// Add the marker header to an outbound request's headers.
pub fn propagate_marker(headers: &mut HeaderMap) {
    match outbound_marker_header() {
        Some((name, value)) => {
            headers.insert(name, value);
        }
        None => {
            headers.remove(DATA_PERMISSION_ENABLE_HEADER);
        }
    }
}

/// Whether the headers ask for rules to be disabled.
pub fn marker_header_disables(headers: &HeaderMap) -> bool {
    headers
        .get(DATA_PERMISSION_ENABLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("false"))
}

/// Axum middleware pushing a disabled marker for requests that carry
/// `data-permission-enable: false`. The marker is popped when the handler
/// returns. Ignored unless the boundary trusts the header.
pub async fn accept_marker_header(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if !marker_header_disables(req.headers()) {
        return next.run(req).await;
    }

    if state.enforcer.config().trust_marker_header {
        tracing::debug!(path = %req.uri().path(), "rules disabled by caller");
        with_marker(PolicyMarker::disabled(), next.run(req)).await
    } else {
        tracing::warn!(
            path = %req.uri().path(),
            "untrusted {} header ignored",
            DATA_PERMISSION_ENABLE_HEADER
        );
        next.run(req).await
    }
}

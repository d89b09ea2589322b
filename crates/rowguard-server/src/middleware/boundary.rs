use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use rowguard_core::{Caller, CallerId};
use rowguard_rls::{BoundaryEnforcer, InboundTenancy};

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the authenticated caller's id, set by the gateway.
pub const CALLER_ID_HEADER: &str = "x-caller-id";
/// Header carrying the authenticated caller's own tenant.
pub const CALLER_TENANT_HEADER: &str = "x-caller-tenant-id";
/// Comma separated permissions of the authenticated caller.
pub const CALLER_PERMISSIONS_HEADER: &str = "x-caller-permissions";

/// Axum middleware enforcing the tenant boundary.
///
/// Rejected requests never reach the handler. Admitted requests run inside a
/// fresh request context, so nothing bound here outlives the request.
pub async fn enforce_boundary(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = req.headers();
    let boundary = state.enforcer.config();

    let inbound = InboundTenancy {
        path: req.uri().path().to_string(),
        caller: extract_caller(headers, &state.enforcer)?,
        tenant: header_value(headers, &boundary.tenant_header),
        visit_tenant: header_value(headers, &boundary.visit_tenant_header),
    };

    let admission = state.enforcer.admit(inbound)?;
    Ok(admission.run(next.run(req)).await)
}

/// Read the caller identity forwarded by the gateway.
///
/// No caller id header means an anonymous request. A caller id without a
/// caller tenant is malformed.
pub fn extract_caller(
    headers: &HeaderMap,
    enforcer: &BoundaryEnforcer,
) -> Result<Option<Caller>, ApiError> {
    let Some(raw_id) = header_value(headers, CALLER_ID_HEADER) else {
        return Ok(None);
    };
    let id = raw_id
        .parse::<i64>()
        .map_err(|_| ApiError::bad_header(CALLER_ID_HEADER, "not an integer"))?;

    let raw_tenant = header_value(headers, CALLER_TENANT_HEADER)
        .ok_or_else(|| ApiError::bad_header(CALLER_TENANT_HEADER, "required with x-caller-id"))?;
    let tenant_id = enforcer.parse_tenant(&raw_tenant)?;

    let permissions: BTreeSet<String> = header_value(headers, CALLER_PERMISSIONS_HEADER)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(Some(Caller {
        id: CallerId(id),
        tenant_id,
        permissions,
    }))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let v = headers.get(name).and_then(|h| h.to_str().ok())?;
    let s = v.trim();
    if s.is_empty() {
        return None;
    }
    Some(s.to_string())
}

use std::sync::Arc;

use axum::{extract::State, Json};
use rowguard_rls::{InjectionExplanation, RequestContext};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "service": "rowguard-server" }))
}

/// What the current request sees of its context.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextView {
    pub tenant_id: Option<String>,
    pub caller_id: Option<i64>,
    pub rules_enabled: bool,
    pub marker_depth: usize,
}

pub async fn context() -> Result<Json<ContextView>, ApiError> {
    let ctx = current_context()?;
    Ok(Json(ContextView {
        tenant_id: ctx.tenant_id().map(|t| t.to_string()),
        caller_id: ctx.caller().map(|c| c.id.0),
        rules_enabled: !ctx.rules_disabled(),
        marker_depth: ctx.markers().len(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RewriteRequest {
    pub sql: String,
    /// Component the statement is issued from; selects a declared marker.
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
}

pub async fn rewrite(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RewriteRequest>,
) -> Result<Json<InjectionExplanation>, ApiError> {
    let ctx = current_context()?;
    let explain = state.injector.explain(&body.sql, &ctx);

    let explanation = match body.component.as_deref() {
        Some(component) => {
            let operation = body.operation.as_deref().unwrap_or_default();
            state.catalog.run(component, operation, explain).await?
        }
        None => explain.await?,
    };
    Ok(Json(explanation))
}

fn current_context() -> Result<Arc<RequestContext>, ApiError> {
    RequestContext::current()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("no request context installed")))
}

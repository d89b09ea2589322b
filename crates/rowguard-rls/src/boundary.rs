//! Inbound tenant boundary.
//!
//! Decides, before any statement is rewritten, which tenant a request runs
//! as. The decision is transport independent: the HTTP layer only extracts
//! the raw inputs into an [`InboundTenancy`] and turns a [`BoundaryError`]
//! into a response.

use std::future::Future;
use std::sync::Arc;

use rowguard_core::{BoundaryConfig, Caller, CallerId, PolicyMarker, TenantId, TenantIdType};
use thiserror::Error;

use crate::context::RequestContext;

/// Reasons a request is turned away at the boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoundaryError {
    #[error("tenant id required for {path}")]
    MissingTenant { path: String },

    #[error("invalid tenant id: {reason}")]
    InvalidTenant { reason: String },

    #[error("caller {caller_id} of tenant {caller_tenant} may not act in tenant {requested}")]
    TenantMismatch {
        caller_id: CallerId,
        caller_tenant: TenantId,
        requested: TenantId,
    },

    #[error("visiting tenant {tenant} requires an authenticated caller with the visit permission")]
    VisitDenied {
        caller_id: Option<CallerId>,
        tenant: TenantId,
    },
}

impl BoundaryError {
    /// Whether this is a permission problem rather than a malformed request.
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            BoundaryError::TenantMismatch { .. } | BoundaryError::VisitDenied { .. }
        )
    }
}

/// Raw tenancy inputs of one inbound request.
#[derive(Debug, Clone, Default)]
pub struct InboundTenancy {
    pub path: String,
    pub caller: Option<Caller>,
    /// Tenant id bound by the transport (tenant header).
    pub tenant: Option<String>,
    /// Tenant the caller asks to visit (visiting-tenant header).
    pub visit_tenant: Option<String>,
}

/// Outcome of a successful boundary check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub caller: Option<Caller>,
    /// Tenant bound for the request, before any visit override.
    pub tenant_id: Option<TenantId>,
    /// Tenant the request temporarily acts in.
    pub visiting: Option<TenantId>,
    /// No tenant is available on an exempt route; rules are switched off.
    pub ignore_tenant: bool,
}

impl Admission {
    /// Run the request future inside a fresh context carrying this admission.
    ///
    /// The visit override and the exempt-route marker are released when the
    /// future completes or is dropped.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        let ctx = Arc::new(RequestContext::new(self.caller, self.tenant_id));
        let _visit = self.visiting.map(|tenant| ctx.override_tenant(tenant));
        let _ignore = self
            .ignore_tenant
            .then(|| ctx.enter(PolicyMarker::disabled()));
        Arc::clone(&ctx).run(fut).await
    }
}

/// Validates tenant binding and cross-tenant visits.
#[derive(Debug, Clone)]
pub struct BoundaryEnforcer {
    config: BoundaryConfig,
    id_type: TenantIdType,
}

impl BoundaryEnforcer {
    pub fn new(config: BoundaryConfig, id_type: TenantIdType) -> Self {
        Self { config, id_type }
    }

    pub fn config(&self) -> &BoundaryConfig {
        &self.config
    }

    /// Parse a raw tenant id according to the configured id type.
    pub fn parse_tenant(&self, raw: &str) -> Result<TenantId, BoundaryError> {
        self.id_type
            .parse(raw)
            .map_err(|reason| BoundaryError::InvalidTenant { reason })
    }

    pub fn admit(&self, inbound: InboundTenancy) -> Result<Admission, BoundaryError> {
        let tenant = inbound
            .tenant
            .as_deref()
            .map(|raw| self.parse_tenant(raw))
            .transpose()?;
        let visit = inbound
            .visit_tenant
            .as_deref()
            .map(|raw| self.parse_tenant(raw))
            .transpose()?;

        let result = match inbound.caller {
            Some(caller) => self.admit_caller(caller, tenant, visit),
            None => self.admit_anonymous(&inbound.path, tenant, visit),
        };

        match &result {
            Ok(admission) => tracing::debug!(
                path = %inbound.path,
                tenant = ?admission.tenant_id,
                visiting = ?admission.visiting,
                ignore_tenant = admission.ignore_tenant,
                "request admitted"
            ),
            Err(err) => tracing::warn!(path = %inbound.path, error = %err, "request rejected at boundary"),
        }
        result
    }

    fn admit_caller(
        &self,
        caller: Caller,
        tenant: Option<TenantId>,
        visit: Option<TenantId>,
    ) -> Result<Admission, BoundaryError> {
        let may_visit = caller.has_permission(&self.config.visit_permission);

        if let Some(visit) = visit {
            if !may_visit {
                return Err(BoundaryError::VisitDenied {
                    caller_id: Some(caller.id),
                    tenant: visit,
                });
            }
            let own = caller.tenant_id.clone();
            return Ok(Admission {
                caller: Some(caller),
                tenant_id: Some(own),
                visiting: Some(visit),
                ignore_tenant: false,
            });
        }

        let own = caller.tenant_id.clone();
        let visiting = match tenant {
            Some(bound) if bound != own => {
                if !may_visit {
                    return Err(BoundaryError::TenantMismatch {
                        caller_id: caller.id,
                        caller_tenant: own,
                        requested: bound,
                    });
                }
                Some(bound)
            }
            _ => None,
        };

        Ok(Admission {
            caller: Some(caller),
            tenant_id: Some(own),
            visiting,
            ignore_tenant: false,
        })
    }

    fn admit_anonymous(
        &self,
        path: &str,
        tenant: Option<TenantId>,
        visit: Option<TenantId>,
    ) -> Result<Admission, BoundaryError> {
        if let Some(visit) = visit {
            return Err(BoundaryError::VisitDenied {
                caller_id: None,
                tenant: visit,
            });
        }

        match tenant {
            Some(tenant) => Ok(Admission {
                caller: None,
                tenant_id: Some(tenant),
                visiting: None,
                ignore_tenant: false,
            }),
            None if self.config.is_exempt(path) => Ok(Admission {
                caller: None,
                tenant_id: None,
                visiting: None,
                ignore_tenant: true,
            }),
            None => Err(BoundaryError::MissingTenant {
                path: path.to_string(),
            }),
        }
    }
}

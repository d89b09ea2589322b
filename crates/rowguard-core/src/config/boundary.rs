//! Inbound boundary configuration.
//!
//! Names the headers carrying tenant information and lists the routes that
//! may be served without a tenant.

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Configuration for the inbound tenant boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryConfig {
    /// Header carrying the tenant id bound to the request.
    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,

    /// Header carrying the tenant a privileged caller wants to visit.
    #[serde(default = "default_visit_tenant_header")]
    pub visit_tenant_header: String,

    /// Permission a caller needs to act inside another tenant.
    #[serde(default = "default_visit_permission")]
    pub visit_permission: String,

    /// Routes served without a tenant. A trailing `*` matches any suffix.
    #[serde(default = "default_exempt_routes")]
    pub exempt_routes: Vec<String>,

    /// Honour an inbound `data-permission-enable: false` header.
    ///
    /// Only enable this when every inbound request comes from trusted
    /// services, or the gateway strips the header from external traffic.
    #[serde(default)]
    pub trust_marker_header: bool,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            tenant_header: default_tenant_header(),
            visit_tenant_header: default_visit_tenant_header(),
            visit_permission: default_visit_permission(),
            exempt_routes: default_exempt_routes(),
            trust_marker_header: false,
        }
    }
}

impl BoundaryConfig {
    /// Check whether a request path is exempt from tenant binding.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_routes.iter().any(|route| match route.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == route,
        })
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.tenant_header.eq_ignore_ascii_case(&self.visit_tenant_header) {
            return Err(ConfigError::Config(
                "boundary.tenant_header and boundary.visit_tenant_header must differ".to_string(),
            ));
        }
        if let Some(route) = self.exempt_routes.iter().find(|r| !r.starts_with('/')) {
            return Err(ConfigError::Config(format!(
                "exempt route '{}' must start with '/'",
                route
            )));
        }
        Ok(())
    }
}

// Default value functions
fn default_tenant_header() -> String {
    "tenant-id".to_string()
}

fn default_visit_tenant_header() -> String {
    "visit-tenant-id".to_string()
}

fn default_visit_permission() -> String {
    "system:tenant:visit".to_string()
}

fn default_exempt_routes() -> Vec<String> {
    vec!["/healthz".to_string()]
}

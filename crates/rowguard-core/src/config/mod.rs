//! Configuration types for rowguard.
//!
//! All configuration is loaded from a single YAML file (`rowguard.yaml`) into
//! a [`RowguardConfig`]. Every section is optional and falls back to defaults.
//!
//! # Sections
//!
//! - **tenancy**: tenant column per table and tables exempt from tenant scoping
//! - **data_scope**: department / owner columns per table
//! - **boundary**: inbound header names, visit permission and exempt routes
//! - **markers**: declarative policy markers per component and operation
//! - **scopes**: static scope snapshots per caller id (for the built-in provider)
//! - **server**: HTTP sidecar settings

pub mod boundary;
pub mod data_scope;
pub mod markers;
pub mod tenancy;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::ScopeSnapshot;

pub use boundary::BoundaryConfig;
pub use data_scope::{DataScopeConfig, TableScopeColumns};
pub use markers::MarkerConfig;
pub use tenancy::{TableTenancyConfig, TenancyConfig, TenantIdConfig, TenantIdType};

/// Complete rowguard configuration loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowguardConfig {
    /// SQL dialect used to parse outgoing statements.
    #[serde(default)]
    pub dialect: SqlDialectKind,

    /// Tenant isolation configuration.
    #[serde(default)]
    pub tenancy: TenancyConfig,

    /// Department / owner scoping configuration.
    #[serde(default)]
    pub data_scope: DataScopeConfig,

    /// Inbound boundary configuration.
    #[serde(default)]
    pub boundary: BoundaryConfig,

    /// Declared policy markers.
    #[serde(default)]
    pub markers: MarkerConfig,

    /// Static scope snapshots keyed by caller id.
    #[serde(default)]
    pub scopes: BTreeMap<i64, ScopeSnapshot>,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
}

/// SQL dialect selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialectKind {
    #[default]
    Postgres,
    Mysql,
}

/// HTTP sidecar settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address, e.g. "0.0.0.0:8080"
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RowguardConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content and validate it.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tenancy.validate()?;
        self.data_scope.validate()?;
        self.boundary.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
dialect: mysql
tenancy:
  tenant_id:
    type: integer
  default_column: tenant_id
  tables:
    t_order: {}
    t_user:
      tenant_column: org_id
    t_dict:
      global: true
  global_tables: [t_area]
data_scope:
  tables:
    t_order:
      dept_column: dept_id
      user_column: user_id
boundary:
  exempt_routes: ["/healthz", "/v1/public/*"]
markers:
  components:
    ReportJob:
      enabled: false
  operations:
    "ReportJob::summary":
      enabled: true
scopes:
  42:
    dept_ids: [10, 20]
    can_see_self: true
server:
  bind: "127.0.0.1:9000"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = RowguardConfig::from_yaml(FULL).unwrap();
        assert_eq!(config.dialect, SqlDialectKind::Mysql);
        assert_eq!(config.tenancy.tenant_id.id_type, TenantIdType::Integer);
        assert_eq!(config.tenancy.get_tenant_column("t_user"), Some("org_id"));
        assert!(config.tenancy.is_global_table("t_dict"));
        assert!(config.tenancy.is_global_table("t_area"));
        assert_eq!(
            config.data_scope.columns_for("t_order").and_then(|c| c.dept_column.as_deref()),
            Some("dept_id")
        );
        assert!(config.boundary.is_exempt("/v1/public/ping"));
        assert!(!config.markers.components["ReportJob"].enabled);
        assert_eq!(config.scopes[&42].dept_ids.len(), 2);
        assert_eq!(config.server.bind, "127.0.0.1:9000");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RowguardConfig::from_yaml("{}").unwrap();
        assert_eq!(config.dialect, SqlDialectKind::Postgres);
        assert_eq!(config.tenancy.default_column, "tenant_id");
        assert_eq!(config.boundary.tenant_header, "tenant-id");
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert!(config.scopes.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let config = RowguardConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tenancy.governed_tables().count(), 2);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = RowguardConfig::from_file("/nonexistent/rowguard.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_scope_table_without_columns_rejected() {
        let yaml = r#"
data_scope:
  tables:
    t_audit: {}
"#;
        let err = RowguardConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Config(msg) if msg.contains("t_audit")));
    }
}

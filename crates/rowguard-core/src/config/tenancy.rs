//! Tenancy configuration for multi-tenant databases.
//!
//! This module defines which tables are tenant-scoped, which column holds the
//! tenant id in each of them, and which tables are global.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::ConfigError;
use crate::TenantId;

/// Configuration for tenant isolation.
///
/// Only tables listed under `tables` are governed by the tenant rule. A
/// listed table without an explicit column uses `default_column`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenancyConfig {
    /// Tenant identifier configuration.
    #[serde(default)]
    pub tenant_id: TenantIdConfig,

    /// Default column name for tenant isolation.
    /// Used when not overridden per-table.
    #[serde(default = "default_tenant_column")]
    pub default_column: String,

    /// Per-table tenant column configuration.
    #[serde(default)]
    pub tables: HashMap<String, TableTenancyConfig>,

    /// Tables that are global (no tenant scoping applied).
    #[serde(default)]
    pub global_tables: Vec<String>,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            tenant_id: TenantIdConfig::default(),
            default_column: default_tenant_column(),
            tables: HashMap::new(),
            global_tables: Vec::new(),
        }
    }
}

/// Tenant identifier type configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantIdConfig {
    /// Type of tenant identifier (uuid, integer, string).
    #[serde(default, rename = "type")]
    pub id_type: TenantIdType,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// How tenant ids are validated and rendered into SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantIdType {
    /// Rendered as a quoted string literal.
    #[default]
    String,
    /// Rendered as a numeric literal; must parse as `i64`.
    Integer,
    /// Rendered as a quoted string literal in canonical hyphenated form.
    Uuid,
}

impl TenantIdType {
    /// Validate raw header/config input as a tenant id of this type.
    pub fn parse(&self, raw: &str) -> Result<TenantId, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("tenant id is empty".to_string());
        }
        match self {
            TenantIdType::String => Ok(TenantId::new(raw)),
            TenantIdType::Integer => raw
                .parse::<i64>()
                .map(|_| TenantId::new(raw))
                .map_err(|_| format!("tenant id '{}' is not an integer", raw)),
            TenantIdType::Uuid => Uuid::parse_str(raw)
                .map(|u| TenantId::new(u.hyphenated().to_string()))
                .map_err(|e| format!("tenant id '{}' is not a UUID: {}", raw, e)),
        }
    }
}

/// Per-table tenancy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableTenancyConfig {
    /// The column name used for tenant isolation in this table.
    #[serde(default)]
    pub tenant_column: Option<String>,

    /// Column name alias (for compatibility).
    #[serde(default)]
    pub column: Option<String>,

    /// Whether this is a global table (no tenant scoping).
    #[serde(default)]
    pub global: bool,
}

impl TableTenancyConfig {
    /// Get the effective tenant column name.
    pub fn get_column(&self) -> Option<&str> {
        self.tenant_column.as_deref().or(self.column.as_deref())
    }
}

impl TenancyConfig {
    /// Get the tenant column for a given table.
    ///
    /// Returns None if the table is not tenant-scoped, either because it is
    /// not configured or because it is global.
    pub fn get_tenant_column(&self, table_name: &str) -> Option<&str> {
        if self.is_global_table(table_name) {
            return None;
        }

        self.tables
            .get(table_name)
            .map(|table_config| table_config.get_column().unwrap_or(&self.default_column))
    }

    /// Check if a table is global (no tenant scoping).
    pub fn is_global_table(&self, table_name: &str) -> bool {
        if self.global_tables.iter().any(|t| t == table_name) {
            return true;
        }

        self.tables
            .get(table_name)
            .map(|table_config| table_config.global)
            .unwrap_or(false)
    }

    /// Tables carrying a tenant column, i.e. every configured non-global table.
    pub fn governed_tables(&self) -> impl Iterator<Item = &str> {
        self.tables
            .keys()
            .map(String::as_str)
            .filter(|table| !self.is_global_table(table))
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.default_column.trim().is_empty() {
            return Err(ConfigError::Config(
                "tenancy.default_column must not be empty".to_string(),
            ));
        }
        for (table, config) in &self.tables {
            if config.global && config.get_column().is_some() {
                return Err(ConfigError::Config(format!(
                    "tenancy table '{}' is global but also declares a tenant column",
                    table
                )));
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_tenant_column() -> String {
    "tenant_id".to_string()
}

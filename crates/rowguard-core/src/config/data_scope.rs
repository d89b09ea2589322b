//! Department / owner scoping configuration.
//!
//! Each listed table may expose a department column, an owner (user) column,
//! or both. The data-scope rule uses these to restrict rows to the departments
//! a caller may see and to the caller's own rows.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::ConfigError;

/// Configuration for department / owner row scoping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataScopeConfig {
    /// Per-table scoping columns.
    #[serde(default)]
    pub tables: HashMap<String, TableScopeColumns>,
}

/// Scoping columns of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableScopeColumns {
    /// Column holding the owning department id.
    #[serde(default)]
    pub dept_column: Option<String>,

    /// Column holding the owning user id.
    #[serde(default)]
    pub user_column: Option<String>,
}

impl TableScopeColumns {
    pub fn dept(column: impl Into<String>) -> Self {
        Self {
            dept_column: Some(column.into()),
            user_column: None,
        }
    }

    pub fn user(column: impl Into<String>) -> Self {
        Self {
            dept_column: None,
            user_column: Some(column.into()),
        }
    }

    pub fn with_user(mut self, column: impl Into<String>) -> Self {
        self.user_column = Some(column.into());
        self
    }
}

impl DataScopeConfig {
    /// Scoping columns for a table, if the table is scoped.
    pub fn columns_for(&self, table_name: &str) -> Option<&TableScopeColumns> {
        self.tables.get(table_name)
    }

    /// Register scoping columns for a table.
    pub fn insert(&mut self, table_name: impl Into<String>, columns: TableScopeColumns) {
        self.tables.insert(table_name.into(), columns);
    }

    /// A scoped table must name at least one column; otherwise no caller
    /// short of all-access could ever see a row of it.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let mut empty: Vec<&str> = self
            .tables
            .iter()
            .filter(|(_, c)| c.dept_column.is_none() && c.user_column.is_none())
            .map(|(t, _)| t.as_str())
            .collect();
        if empty.is_empty() {
            return Ok(());
        }
        empty.sort_unstable();
        Err(ConfigError::Config(format!(
            "data_scope tables without dept_column or user_column: {}",
            empty.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_lookup() {
        let mut config = DataScopeConfig::default();
        config.insert("t_order", TableScopeColumns::dept("dept_id").with_user("user_id"));
        config.insert("t_note", TableScopeColumns::user("creator"));

        let order = config.columns_for("t_order").unwrap();
        assert_eq!(order.dept_column.as_deref(), Some("dept_id"));
        assert_eq!(order.user_column.as_deref(), Some("user_id"));
        assert_eq!(config.columns_for("t_note").unwrap().dept_column, None);
        assert!(config.columns_for("t_other").is_none());
        assert!(config.validate().is_ok());
    }
}

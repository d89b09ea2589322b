//! Tenant isolation rule.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use rowguard_core::{TenancyConfig, TenantId, TenantIdType};

use crate::context::RequestContext;
use crate::error::RlsError;
use crate::parser::{normalize_table_name, TableReference};
use crate::predicate::{ColumnRef, Predicate, SqlValue};
use crate::rule::DataRule;

/// Restricts every governed table to the tenant bound to the request.
#[derive(Debug, Clone)]
pub struct TenantRule {
    columns: HashMap<String, String>,
    exempt: HashSet<String>,
    id_type: TenantIdType,
}

impl TenantRule {
    pub const NAME: &'static str = "tenant";

    pub fn from_config(config: &TenancyConfig) -> Self {
        let columns = config
            .governed_tables()
            .filter_map(|table| {
                config
                    .get_tenant_column(table)
                    .map(|column| (normalize_table_name(table), column.to_string()))
            })
            .collect();

        let exempt = config
            .global_tables
            .iter()
            .map(|t| normalize_table_name(t))
            .chain(
                config
                    .tables
                    .iter()
                    .filter(|(_, t)| t.global)
                    .map(|(name, _)| normalize_table_name(name)),
            )
            .collect();

        Self {
            columns,
            exempt,
            id_type: config.tenant_id.id_type,
        }
    }

    /// Tenant column of a table, if the table is tenant-scoped.
    pub fn column_for(&self, table_name: &str) -> Option<&str> {
        let table = normalize_table_name(table_name);
        if self.exempt.contains(&table) {
            return None;
        }
        self.columns.get(&table).map(String::as_str)
    }

    fn value_of(&self, tenant: &TenantId) -> Result<SqlValue, RlsError> {
        match self.id_type {
            TenantIdType::Integer => tenant
                .as_str()
                .parse::<i64>()
                .map(SqlValue::Integer)
                .map_err(|_| {
                    RlsError::Internal(anyhow::anyhow!(
                        "bound tenant id '{}' is not an integer",
                        tenant
                    ))
                }),
            TenantIdType::String | TenantIdType::Uuid => Ok(SqlValue::Text(tenant.to_string())),
        }
    }
}

#[async_trait]
impl DataRule for TenantRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn governed_tables(&self) -> BTreeSet<String> {
        self.columns
            .keys()
            .filter(|t| !self.exempt.contains(*t))
            .cloned()
            .collect()
    }

    async fn expression_for(
        &self,
        table: &TableReference,
        ctx: &RequestContext,
    ) -> Result<Option<Predicate>, RlsError> {
        if ctx.rules_disabled() {
            return Ok(None);
        }
        let Some(column) = self.column_for(&table.name) else {
            return Ok(None);
        };

        let tenant = ctx.tenant_id().ok_or_else(|| RlsError::MissingTenant {
            table: table.table_name(),
        })?;
        let value = self.value_of(&tenant)?;

        tracing::debug!(table = %table.name, column, tenant = %tenant, "tenant predicate");
        Ok(Some(Predicate::equals(
            ColumnRef::qualified(table.qualifier(), column),
            value,
        )))
    }
}

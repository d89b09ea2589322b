//! Data rule SPI and the rule registry.
//!
//! Rules are registered once at startup through [`RuleRegistryBuilder`]; the
//! built [`RuleRegistry`] is immutable and shared by `Arc`, so rewrite-time
//! lookups take no locks.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::RlsError;
use crate::parser::{normalize_table_name, TableReference};
use crate::predicate::Predicate;

/// A unit of row-level policy.
///
/// `expression_for` returns `Ok(None)` when the rule places no restriction on
/// the table in the given context, and `Ok(Some(Predicate::AlwaysFalse))` when
/// no row may be seen.
#[async_trait]
pub trait DataRule: Send + Sync {
    /// Stable name used by marker include/exclude lists and in logs.
    fn name(&self) -> &str;

    /// Unqualified, lower-cased names of the tables this rule governs.
    fn governed_tables(&self) -> BTreeSet<String>;

    async fn expression_for(
        &self,
        table: &TableReference,
        ctx: &RequestContext,
    ) -> Result<Option<Predicate>, RlsError>;
}

/// Collects rules before the registry is frozen.
#[derive(Default)]
pub struct RuleRegistryBuilder {
    rules: Vec<Arc<dyn DataRule>>,
}

impl RuleRegistryBuilder {
    pub fn register(mut self, rule: Arc<dyn DataRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn build(self) -> RuleRegistry {
        let mut seen = HashSet::new();
        let mut by_table: HashMap<String, Vec<usize>> = HashMap::new();

        for (index, rule) in self.rules.iter().enumerate() {
            if !seen.insert(rule.name().to_string()) {
                tracing::warn!(rule = rule.name(), "rule name registered more than once");
            }
            for table in rule.governed_tables() {
                by_table
                    .entry(normalize_table_name(&table))
                    .or_default()
                    .push(index);
            }
        }

        tracing::info!(
            rules = self.rules.len(),
            tables = by_table.len(),
            "rule registry built"
        );

        RuleRegistry {
            rules: self.rules,
            by_table,
        }
    }
}

/// Immutable set of registered rules, indexed by governed table.
#[derive(Default)]
pub struct RuleRegistry {
    rules: Vec<Arc<dyn DataRule>>,
    by_table: HashMap<String, Vec<usize>>,
}

impl RuleRegistry {
    pub fn builder() -> RuleRegistryBuilder {
        RuleRegistryBuilder::default()
    }

    /// Rules governing a table, in registration order.
    pub fn rules_for(&self, table_name: &str) -> Vec<&Arc<dyn DataRule>> {
        self.by_table
            .get(&normalize_table_name(table_name))
            .map(|indices| indices.iter().map(|&i| &self.rules[i]).collect())
            .unwrap_or_default()
    }

    pub fn is_governed(&self, table_name: &str) -> bool {
        self.by_table
            .contains_key(&normalize_table_name(table_name))
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Compose the predicate every applicable rule contributes for a table.
    ///
    /// Rules are asked in registration order. `None` results are skipped, an
    /// `AlwaysFalse` result short-circuits, and the rest are AND-ed in order.
    /// A disabled innermost marker yields no predicate at all.
    pub async fn compose(
        &self,
        table: &TableReference,
        ctx: &RequestContext,
    ) -> Result<Option<Predicate>, RlsError> {
        let marker = ctx.marker();
        if marker.as_ref().is_some_and(|m| !m.enabled) {
            tracing::debug!(table = %table.name, "rules disabled by policy marker");
            return Ok(None);
        }

        let mut parts = Vec::new();
        for rule in self.rules_for(&table.name) {
            if let Some(marker) = &marker {
                if !marker.applies_to(rule.name()) {
                    tracing::debug!(table = %table.name, rule = rule.name(), "rule filtered by marker");
                    continue;
                }
            }

            match rule.expression_for(table, ctx).await? {
                None => {}
                Some(Predicate::AlwaysFalse) => {
                    tracing::debug!(table = %table.name, rule = rule.name(), "rule denies all rows");
                    return Ok(Some(Predicate::AlwaysFalse));
                }
                Some(predicate) => parts.push(predicate),
            }
        }

        Ok(Predicate::all(parts))
    }
}

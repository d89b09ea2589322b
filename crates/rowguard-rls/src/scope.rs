//! Department / owner data-scope rule.
//!
//! Rows are visible when they belong to one of the caller's departments or,
//! if the caller may see their own rows, when the caller owns them. The
//! caller's scope is fetched from a [`ScopeProvider`] once per request.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use rowguard_core::{CallerId, DataScopeConfig, ScopeSnapshot, TableScopeColumns};

use crate::context::RequestContext;
use crate::error::RlsError;
use crate::parser::{normalize_table_name, TableReference};
use crate::predicate::{ColumnRef, Predicate, SqlValue};
use crate::rule::DataRule;

/// Source of caller scope snapshots (usually a remote permission service).
///
/// `Ok(None)` means the service knows nothing about the caller; callers of
/// the provider treat that the same as a failure.
#[async_trait]
pub trait ScopeProvider: Send + Sync {
    async fn scope_snapshot(&self, caller_id: CallerId) -> anyhow::Result<Option<ScopeSnapshot>>;
}

/// Provider serving snapshots from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticScopeProvider {
    scopes: BTreeMap<i64, ScopeSnapshot>,
}

impl StaticScopeProvider {
    pub fn new(scopes: BTreeMap<i64, ScopeSnapshot>) -> Self {
        Self { scopes }
    }

    pub fn with_scope(mut self, caller_id: i64, scope: ScopeSnapshot) -> Self {
        self.scopes.insert(caller_id, scope);
        self
    }
}

#[async_trait]
impl ScopeProvider for StaticScopeProvider {
    async fn scope_snapshot(&self, caller_id: CallerId) -> anyhow::Result<Option<ScopeSnapshot>> {
        Ok(self.scopes.get(&caller_id.0).cloned())
    }
}

/// Hybrid department / owner rule.
pub struct DataScopeRule {
    columns: HashMap<String, TableScopeColumns>,
    provider: Arc<dyn ScopeProvider>,
}

impl DataScopeRule {
    pub const NAME: &'static str = "data_scope";

    pub fn new(config: &DataScopeConfig, provider: Arc<dyn ScopeProvider>) -> Self {
        let columns = config
            .tables
            .iter()
            .map(|(table, columns)| (normalize_table_name(table), columns.clone()))
            .collect();
        Self { columns, provider }
    }

    async fn snapshot<'a>(
        &self,
        table: &TableReference,
        ctx: &'a RequestContext,
    ) -> Result<(CallerId, &'a ScopeSnapshot), RlsError> {
        let caller_id = ctx
            .caller()
            .map(|c| c.id)
            .ok_or_else(|| RlsError::MissingCaller {
                table: table.table_name(),
            })?;

        let snapshot = ctx
            .scope_snapshot(|| async {
                tracing::debug!(caller_id = %caller_id, "fetching scope snapshot");
                match self.provider.scope_snapshot(caller_id).await {
                    Ok(Some(snapshot)) => Ok(snapshot),
                    Ok(None) => Err("no scope data for caller".to_string()),
                    Err(err) => Err(format!("{:#}", err)),
                }
            })
            .await
            .map_err(|reason| RlsError::ScopeUnavailable {
                caller_id,
                table: table.table_name(),
                reason,
            })?;

        Ok((caller_id, snapshot))
    }
}

#[async_trait]
impl DataRule for DataScopeRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn governed_tables(&self) -> BTreeSet<String> {
        self.columns.keys().cloned().collect()
    }

    async fn expression_for(
        &self,
        table: &TableReference,
        ctx: &RequestContext,
    ) -> Result<Option<Predicate>, RlsError> {
        let Some(columns) = self.columns.get(&table.table_name()) else {
            return Ok(None);
        };
        let (caller_id, scope) = self.snapshot(table, ctx).await?;

        if scope.all_access {
            return Ok(None);
        }
        if scope.is_empty() {
            return Ok(Some(Predicate::AlwaysFalse));
        }

        let qualifier = table.qualifier();
        let dept = match &columns.dept_column {
            Some(column) if !scope.dept_ids.is_empty() => Some(Predicate::in_list(
                ColumnRef::qualified(qualifier.clone(), column),
                scope.dept_ids.iter().copied().map(SqlValue::Integer),
            )),
            _ => None,
        };
        let user = match &columns.user_column {
            Some(column) if scope.can_see_self => Some(Predicate::equals(
                ColumnRef::qualified(qualifier, column),
                caller_id.0,
            )),
            _ => None,
        };

        let predicate = match (dept, user) {
            (Some(dept), Some(user)) => Predicate::Or(vec![dept, user]),
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => {
                tracing::warn!(
                    caller_id = %caller_id,
                    table = %table.table_name(),
                    dept_column = columns.dept_column.as_deref(),
                    user_column = columns.user_column.as_deref(),
                    "scope has no column to filter on; denying all rows"
                );
                Predicate::AlwaysFalse
            }
        };
        Ok(Some(predicate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rowguard_core::Caller;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        inner: StaticScopeProvider,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScopeProvider for CountingProvider {
        async fn scope_snapshot(
            &self,
            caller_id: CallerId,
        ) -> anyhow::Result<Option<ScopeSnapshot>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.scope_snapshot(caller_id).await
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ScopeProvider for FailingProvider {
        async fn scope_snapshot(&self, _: CallerId) -> anyhow::Result<Option<ScopeSnapshot>> {
            anyhow::bail!("permission service unreachable")
        }
    }

    fn config() -> DataScopeConfig {
        let mut config = DataScopeConfig::default();
        config.insert(
            "t_order",
            TableScopeColumns::dept("dept_id").with_user("user_id"),
        );
        config.insert("t_dept_only", TableScopeColumns::dept("dept_id"));
        config.insert("t_note", TableScopeColumns::user("creator"));
        config
    }

    fn rule_with(scope: ScopeSnapshot) -> DataScopeRule {
        let provider = StaticScopeProvider::default().with_scope(42, scope);
        DataScopeRule::new(&config(), Arc::new(provider))
    }

    async fn predicate_for(rule: &DataScopeRule, table: &str) -> Option<Predicate> {
        let ctx = RequestContext::for_caller(Caller::new(42, "A"));
        rule.expression_for(&TableReference::new(table, None), &ctx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_all_access_contributes_nothing() {
        let rule = rule_with(ScopeSnapshot::all());
        assert_eq!(predicate_for(&rule, "t_order").await, None);
    }

    #[tokio::test]
    async fn test_empty_scope_denies_everything() {
        let rule = rule_with(ScopeSnapshot::depts([]));
        assert_eq!(
            predicate_for(&rule, "t_order").await,
            Some(Predicate::AlwaysFalse)
        );
    }

    #[tokio::test]
    async fn test_dept_or_self() {
        let rule = rule_with(ScopeSnapshot::depts([10, 20]).with_self());
        let predicate = predicate_for(&rule, "t_order").await.unwrap();
        assert_eq!(
            predicate.to_string(),
            "(t_order.dept_id IN (10, 20) OR t_order.user_id = 42)"
        );
    }

    #[tokio::test]
    async fn test_single_axis() {
        let rule = rule_with(ScopeSnapshot::depts([10]));
        let predicate = predicate_for(&rule, "t_order").await.unwrap();
        assert_eq!(predicate.to_string(), "t_order.dept_id IN (10)");

        let rule = rule_with(ScopeSnapshot::depts([]).with_self());
        let predicate = predicate_for(&rule, "t_order").await.unwrap();
        assert_eq!(predicate.to_string(), "t_order.user_id = 42");
    }

    #[tokio::test]
    async fn test_missing_column_for_scope_denies() {
        // Only self is visible, but the table has no owner column.
        let rule = rule_with(ScopeSnapshot::depts([]).with_self());
        assert_eq!(
            predicate_for(&rule, "t_dept_only").await,
            Some(Predicate::AlwaysFalse)
        );

        // Only departments are visible, but the table has no dept column.
        let rule = rule_with(ScopeSnapshot::depts([10]));
        assert_eq!(
            predicate_for(&rule, "t_note").await,
            Some(Predicate::AlwaysFalse)
        );
    }

    #[tokio::test]
    async fn test_snapshot_fetched_once_per_request() {
        let provider = Arc::new(CountingProvider {
            inner: StaticScopeProvider::default().with_scope(42, ScopeSnapshot::depts([10])),
            calls: AtomicUsize::new(0),
        });
        let rule = DataScopeRule::new(&config(), provider.clone());

        let ctx = RequestContext::for_caller(Caller::new(42, "A"));
        for table in ["t_order", "t_dept_only", "t_order"] {
            rule.expression_for(&TableReference::new(table, None), &ctx)
                .await
                .unwrap();
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // A new request fetches again.
        let next = RequestContext::for_caller(Caller::new(42, "A"));
        rule.expression_for(&TableReference::new("t_order", None), &next)
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_scope_is_an_error() {
        let rule = DataScopeRule::new(&config(), Arc::new(FailingProvider));
        let ctx = RequestContext::for_caller(Caller::new(42, "A"));
        let err = rule
            .expression_for(&TableReference::new("t_order", None), &ctx)
            .await
            .unwrap_err();
        match err {
            RlsError::ScopeUnavailable {
                caller_id, table, ..
            } => {
                assert_eq!(caller_id, CallerId(42));
                assert_eq!(table, "t_order");
            }
            other => panic!("unexpected error: {other}"),
        }

        let unknown = DataScopeRule::new(&config(), Arc::new(StaticScopeProvider::default()));
        let err = unknown
            .expression_for(&TableReference::new("t_order", None), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, RlsError::ScopeUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_anonymous_caller_is_an_error() {
        let rule = rule_with(ScopeSnapshot::all());
        let ctx = RequestContext::anonymous(None);
        let err = rule
            .expression_for(&TableReference::new("t_order", None), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, RlsError::MissingCaller { .. }));
    }
}

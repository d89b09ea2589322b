//! RLS predicate injection.
//!
//! Rewriting happens in three steps:
//!
//! 1. every table the statement touches is collected (and unsupported shapes
//!    are rejected) by [`SqlAnalyzer::extract_tables`];
//! 2. each distinct `(table, alias)` pair is composed against the
//!    [`RuleRegistry`] in the request's context;
//! 3. the predicates are patched into the AST: into the WHERE clause of the
//!    SELECT / UPDATE / DELETE owning the table, or into the ON condition when
//!    the table sits on the nullable side of a LEFT JOIN.
//!
//! Step 3 is checked against step 1: if a scoped table could not be patched
//! the statement is refused rather than sent unfiltered.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use rowguard_core::{RowguardConfig, SqlDialectKind};
use serde::Serialize;
use sqlparser::ast::{
    BinaryOperator, Expr, FromTable, Ident, JoinConstraint, JoinOperator, Query, SetExpr,
    Statement, TableFactor, TableWithJoins, Value, VisitMut, VisitorMut,
};

use crate::context::RequestContext;
use crate::error::RlsError;
use crate::parser::{CteScope, SqlAnalyzer, TableReference};
use crate::predicate::Predicate;
use crate::rule::RuleRegistry;
use crate::scope::{DataScopeRule, ScopeProvider};
use crate::tenant::TenantRule;

type TableKey = (String, Option<Ident>);

/// Injects RLS (Row-Level Security) predicates into SQL statements.
#[derive(Clone)]
pub struct RlsInjector {
    analyzer: SqlAnalyzer,
    registry: Arc<RuleRegistry>,
}

impl RlsInjector {
    /// Create an injector over a built rule registry (PostgreSQL dialect).
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self {
            analyzer: SqlAnalyzer::new(),
            registry,
        }
    }

    pub fn with_dialect(mut self, dialect: SqlDialectKind) -> Self {
        self.analyzer = SqlAnalyzer::with_dialect(dialect);
        self
    }

    /// Build the standard rule set: tenant isolation first, then data scope.
    pub fn from_config(config: &RowguardConfig, provider: Arc<dyn ScopeProvider>) -> Self {
        let registry = RuleRegistry::builder()
            .register(Arc::new(TenantRule::from_config(&config.tenancy)))
            .register(Arc::new(DataScopeRule::new(&config.data_scope, provider)))
            .build();
        Self::new(Arc::new(registry)).with_dialect(config.dialect)
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn analyzer(&self) -> &SqlAnalyzer {
        &self.analyzer
    }

    /// Rewrite one parsed statement for the given request.
    ///
    /// Takes the statement by value so the same AST cannot be rewritten twice.
    pub async fn rewrite(
        &self,
        mut stmt: Statement,
        ctx: &RequestContext,
    ) -> Result<RewrittenStatement, RlsError> {
        self.check_statement(&stmt)?;

        let tables = self.analyzer.extract_tables(&stmt)?;

        let mut predicates: HashMap<TableKey, Predicate> = HashMap::new();
        let mut composed: HashMap<TableKey, Option<Predicate>> = HashMap::new();
        let mut scoped = Vec::new();
        let mut expected = 0;
        for table in &tables {
            let key = (table.name.clone(), table.alias.clone());
            let predicate = match composed.get(&key) {
                Some(cached) => cached.clone(),
                None => {
                    let predicate = self.registry.compose(table, ctx).await?;
                    composed.insert(key.clone(), predicate.clone());
                    if let Some(predicate) = &predicate {
                        tracing::debug!(
                            table = %table.name,
                            operation = ?table.operation,
                            predicate = %predicate,
                            "table scoped"
                        );
                        predicates.insert(key, predicate.clone());
                        scoped.push(ScopedTable {
                            table: table.clone(),
                            predicate: predicate.clone(),
                        });
                    }
                    predicate
                }
            };
            if predicate.is_some() {
                expected += 1;
            }
        }

        if !predicates.is_empty() {
            let mut patcher = PredicatePatcher {
                predicates: &predicates,
                ctes: CteScope::default(),
                applied: 0,
            };
            let _ = stmt.visit(&mut patcher);
            if patcher.applied != expected {
                tracing::error!(
                    expected,
                    applied = patcher.applied,
                    "scoped table could not be patched"
                );
                return Err(RlsError::unsupported(
                    "table reference in a position that cannot be filtered",
                ));
            }
        }

        Ok(RewrittenStatement {
            statement: stmt,
            scoped,
        })
    }

    /// Parse a SQL batch and rewrite every statement in it.
    pub async fn inject(&self, sql: &str, ctx: &RequestContext) -> Result<InjectionResult, RlsError> {
        let statements = self.analyzer.parse(sql)?;

        if statements.is_empty() {
            return Ok(InjectionResult {
                original_sql: sql.to_string(),
                rewritten_sql: sql.to_string(),
                tables_scoped: vec![],
                predicates_added: vec![],
            });
        }

        let mut rewritten = Vec::with_capacity(statements.len());
        let mut tables_scoped = Vec::new();
        let mut predicates_added = Vec::new();
        for stmt in statements {
            let result = self.rewrite(stmt, ctx).await?;
            for scoped in result.scoped() {
                let name = scoped.table.table_name();
                if !tables_scoped.contains(&name) {
                    tables_scoped.push(name);
                }
                predicates_added.push(scoped.predicate.to_string());
            }
            rewritten.push(result.to_string());
        }

        let rewritten_sql = rewritten.join("; ");
        tracing::debug!(original = sql, rewritten = %rewritten_sql, "statement rewritten");

        Ok(InjectionResult {
            original_sql: sql.to_string(),
            rewritten_sql,
            tables_scoped,
            predicates_added,
        })
    }

    /// Explain what predicates would be injected, along with the tenant used.
    pub async fn explain(
        &self,
        sql: &str,
        ctx: &RequestContext,
    ) -> Result<InjectionExplanation, RlsError> {
        let result = self.inject(sql, ctx).await?;

        Ok(InjectionExplanation {
            original_sql: result.original_sql,
            rewritten_sql: result.rewritten_sql,
            tables_scoped: result.tables_scoped,
            predicates_added: result.predicates_added,
            tenant_id: ctx.tenant_id().map(|t| t.to_string()),
        })
    }

    fn check_statement(&self, stmt: &Statement) -> Result<(), RlsError> {
        if self.analyzer.is_ddl(stmt) {
            return Err(RlsError::DdlNotAllowed {
                statement: stmt.to_string(),
            });
        }

        match stmt {
            Statement::Query(_) | Statement::Insert(_) => Ok(()),
            Statement::Update(update) => {
                if update.from.is_some() {
                    return Err(RlsError::unsupported("UPDATE ... FROM"));
                }
                Ok(())
            }
            Statement::Delete(delete) => {
                if delete.using.is_some() {
                    return Err(RlsError::unsupported("DELETE ... USING"));
                }
                if !delete.tables.is_empty() {
                    return Err(RlsError::unsupported("multi-table DELETE"));
                }
                Ok(())
            }
            other => Err(RlsError::unsupported(format!("statement `{}`", other))),
        }
    }
}

/// A table that received a predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedTable {
    pub table: TableReference,
    pub predicate: Predicate,
}

/// A statement after rewriting. It cannot be passed to
/// [`RlsInjector::rewrite`] again.
#[derive(Debug, Clone)]
pub struct RewrittenStatement {
    statement: Statement,
    scoped: Vec<ScopedTable>,
}

impl RewrittenStatement {
    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    pub fn scoped(&self) -> &[ScopedTable] {
        &self.scoped
    }

    pub fn into_statement(self) -> Statement {
        self.statement
    }
}

impl fmt::Display for RewrittenStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.statement, f)
    }
}

/// Result of RLS injection.
#[derive(Debug, Clone, Serialize)]
pub struct InjectionResult {
    /// The original SQL statement.
    pub original_sql: String,
    /// The rewritten SQL with RLS predicates.
    pub rewritten_sql: String,
    /// Tables that were scoped.
    pub tables_scoped: Vec<String>,
    /// The predicates that were added.
    pub predicates_added: Vec<String>,
}

/// Explanation of RLS injection.
#[derive(Debug, Clone, Serialize)]
pub struct InjectionExplanation {
    /// The original SQL statement.
    pub original_sql: String,
    /// The rewritten SQL with RLS predicates.
    pub rewritten_sql: String,
    /// Tables that were scoped.
    pub tables_scoped: Vec<String>,
    /// Predicates that were added.
    pub predicates_added: Vec<String>,
    /// The tenant bound while rewriting.
    pub tenant_id: Option<String>,
}

struct PredicatePatcher<'a> {
    predicates: &'a HashMap<TableKey, Predicate>,
    ctes: CteScope,
    applied: usize,
}

impl PredicatePatcher<'_> {
    fn patch_set_expr(&mut self, body: &mut SetExpr) {
        match body {
            SetExpr::Select(select) => {
                let mut parts = Vec::new();
                for twj in &mut select.from {
                    self.patch_table_with_joins(twj, &mut parts);
                }
                select.selection = and_onto(select.selection.take(), parts);
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.patch_set_expr(left);
                self.patch_set_expr(right);
            }
            // Nested queries are patched on their own visit.
            _ => {}
        }
    }

    fn patch_table_with_joins(&mut self, twj: &mut TableWithJoins, sink: &mut Vec<Expr>) {
        self.patch_factor(&mut twj.relation, sink);
        for join in &mut twj.joins {
            match nullable_side_condition(&mut join.join_operator) {
                Some(on) => {
                    let mut parts = Vec::new();
                    self.patch_factor(&mut join.relation, &mut parts);
                    if !parts.is_empty() {
                        let existing = std::mem::replace(on, Expr::value(Value::Null));
                        if let Some(combined) = and_onto(Some(existing), parts) {
                            *on = combined;
                        }
                    }
                }
                None => self.patch_factor(&mut join.relation, sink),
            }
        }
    }

    fn patch_factor(&mut self, factor: &mut TableFactor, sink: &mut Vec<Expr>) {
        match factor {
            TableFactor::Table { name, .. } if self.ctes.is_cte(name) => {}
            TableFactor::Table { name, alias, .. } => {
                let key = (name.to_string(), alias.as_ref().map(|a| a.name.clone()));
                if let Some(predicate) = self.predicates.get(&key) {
                    sink.push(predicate.to_expr());
                    self.applied += 1;
                }
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.patch_table_with_joins(table_with_joins, sink),
            _ => {}
        }
    }
}

impl VisitorMut for PredicatePatcher<'_> {
    type Break = Infallible;

    fn pre_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        self.ctes.enter(query);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        self.patch_set_expr(&mut query.body);
        self.ctes.leave(query);
        ControlFlow::Continue(())
    }

    fn post_visit_statement(&mut self, statement: &mut Statement) -> ControlFlow<Self::Break> {
        match statement {
            Statement::Update(update) => {
                let mut parts = Vec::new();
                self.patch_table_with_joins(&mut update.table, &mut parts);
                update.selection = and_onto(update.selection.take(), parts);
            }
            Statement::Delete(delete) => {
                let tables = match &mut delete.from {
                    FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => {
                        tables
                    }
                };
                let mut parts = Vec::new();
                for twj in tables {
                    self.patch_table_with_joins(twj, &mut parts);
                }
                delete.selection = and_onto(delete.selection.take(), parts);
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// The ON condition of a join whose right side may come back as NULLs.
fn nullable_side_condition(op: &mut JoinOperator) -> Option<&mut Expr> {
    match op {
        JoinOperator::Left(JoinConstraint::On(expr))
        | JoinOperator::LeftOuter(JoinConstraint::On(expr)) => Some(expr),
        _ => None,
    }
}

/// AND `parts` onto an existing filter, keeping a top-level OR intact.
fn and_onto(existing: Option<Expr>, parts: Vec<Expr>) -> Option<Expr> {
    existing
        .map(parenthesize_or)
        .into_iter()
        .chain(parts)
        .reduce(|left, right| Expr::BinaryOp {
            left: Box::new(left),
            op: BinaryOperator::And,
            right: Box::new(right),
        })
}

fn parenthesize_or(expr: Expr) -> Expr {
    match expr {
        Expr::BinaryOp {
            op: BinaryOperator::Or | BinaryOperator::Xor,
            ..
        } => Expr::Nested(Box::new(expr)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::StaticScopeProvider;
    use pretty_assertions::assert_eq;
    use rowguard_core::{
        Caller, PolicyMarker, ScopeSnapshot, TableScopeColumns, TableTenancyConfig, TenantId,
    };

    fn config() -> RowguardConfig {
        let mut config = RowguardConfig::default();
        for table in ["t_order", "t_user"] {
            config
                .tenancy
                .tables
                .insert(table.to_string(), TableTenancyConfig::default());
        }
        config
            .data_scope
            .insert("t_order", TableScopeColumns::dept("dept_id"));
        config
    }

    fn injector(scope: ScopeSnapshot) -> RlsInjector {
        let provider = StaticScopeProvider::default().with_scope(42, scope);
        RlsInjector::from_config(&config(), Arc::new(provider))
    }

    fn caller_ctx() -> RequestContext {
        RequestContext::for_caller(Caller::new(42, "A"))
    }

    #[tokio::test]
    async fn test_simple_select_injection() {
        let result = injector(ScopeSnapshot::depts([10]))
            .inject("SELECT * FROM t_order", &caller_ctx())
            .await
            .unwrap();

        assert_eq!(
            result.rewritten_sql,
            "SELECT * FROM t_order WHERE t_order.tenant_id = 'A' AND t_order.dept_id IN (10)"
        );
        assert_eq!(result.tables_scoped, vec!["t_order".to_string()]);
    }

    #[tokio::test]
    async fn test_existing_or_is_parenthesized() {
        let result = injector(ScopeSnapshot::all())
            .inject(
                "SELECT * FROM t_user WHERE status = 1 OR status = 2",
                &caller_ctx(),
            )
            .await
            .unwrap();

        assert_eq!(
            result.rewritten_sql,
            "SELECT * FROM t_user WHERE (status = 1 OR status = 2) AND t_user.tenant_id = 'A'"
        );
    }

    #[tokio::test]
    async fn test_join_uses_each_alias() {
        let result = injector(ScopeSnapshot::all())
            .inject(
                "SELECT o.id FROM t_order AS o INNER JOIN t_user AS u ON o.user_id = u.id",
                &caller_ctx(),
            )
            .await
            .unwrap();

        assert_eq!(
            result.rewritten_sql,
            "SELECT o.id FROM t_order AS o INNER JOIN t_user AS u ON o.user_id = u.id \
             WHERE o.tenant_id = 'A' AND u.tenant_id = 'A'"
        );
    }

    #[tokio::test]
    async fn test_left_join_filters_in_on_clause() {
        let result = injector(ScopeSnapshot::all())
            .inject(
                "SELECT * FROM t_order AS o LEFT JOIN t_user AS u ON o.user_id = u.id",
                &caller_ctx(),
            )
            .await
            .unwrap();

        assert_eq!(
            result.rewritten_sql,
            "SELECT * FROM t_order AS o LEFT JOIN t_user AS u \
             ON o.user_id = u.id AND u.tenant_id = 'A' WHERE o.tenant_id = 'A'"
        );
    }

    #[tokio::test]
    async fn test_quoted_alias_is_referenced_quoted() {
        let result = injector(ScopeSnapshot::depts([10]))
            .inject(r#"SELECT * FROM t_order AS "O""#, &caller_ctx())
            .await
            .unwrap();

        assert_eq!(
            result.rewritten_sql,
            r#"SELECT * FROM t_order AS "O" WHERE "O".tenant_id = 'A' AND "O".dept_id IN (10)"#
        );
    }

    #[tokio::test]
    async fn test_cte_references_are_not_scoped() {
        let injector = injector(ScopeSnapshot::all());

        let sql = "WITH t_user AS (SELECT id FROM t_dict) SELECT id FROM t_user";
        let result = injector.inject(sql, &caller_ctx()).await.unwrap();
        assert_eq!(result.rewritten_sql, sql);
        assert!(result.tables_scoped.is_empty());

        // The stored table inside the CTE body is still filtered.
        let result = injector
            .inject(
                "WITH t_user AS (SELECT id FROM t_user WHERE id > 1) SELECT id FROM t_user",
                &caller_ctx(),
            )
            .await
            .unwrap();
        assert_eq!(
            result.rewritten_sql,
            "WITH t_user AS (SELECT id FROM t_user WHERE id > 1 AND t_user.tenant_id = 'A') \
             SELECT id FROM t_user"
        );
    }

    #[tokio::test]
    async fn test_subquery_is_scoped_in_place() {
        let result = injector(ScopeSnapshot::all())
            .inject(
                "SELECT * FROM t_dict WHERE id IN (SELECT dict_id FROM t_user)",
                &caller_ctx(),
            )
            .await
            .unwrap();

        assert_eq!(
            result.rewritten_sql,
            "SELECT * FROM t_dict WHERE id IN (SELECT dict_id FROM t_user WHERE t_user.tenant_id = 'A')"
        );
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let injector = injector(ScopeSnapshot::all());
        let ctx = caller_ctx();

        let result = injector
            .inject("UPDATE t_user SET name = 'x' WHERE id = 1", &ctx)
            .await
            .unwrap();
        assert_eq!(
            result.rewritten_sql,
            "UPDATE t_user SET name = 'x' WHERE id = 1 AND t_user.tenant_id = 'A'"
        );

        let result = injector
            .inject("DELETE FROM t_user WHERE id = 1", &ctx)
            .await
            .unwrap();
        assert_eq!(
            result.rewritten_sql,
            "DELETE FROM t_user WHERE id = 1 AND t_user.tenant_id = 'A'"
        );
    }

    #[tokio::test]
    async fn test_insert_target_untouched_source_scoped() {
        let injector = injector(ScopeSnapshot::all());
        let ctx = caller_ctx();

        let result = injector
            .inject("INSERT INTO t_user (id, name) VALUES (1, 'x')", &ctx)
            .await
            .unwrap();
        assert_eq!(result.rewritten_sql, result.original_sql);
        assert!(result.predicates_added.is_empty());

        let result = injector
            .inject("INSERT INTO t_archive SELECT * FROM t_user", &ctx)
            .await
            .unwrap();
        assert_eq!(
            result.rewritten_sql,
            "INSERT INTO t_archive SELECT * FROM t_user WHERE t_user.tenant_id = 'A'"
        );
    }

    #[tokio::test]
    async fn test_disabled_marker_leaves_statement_unchanged() {
        let injector = injector(ScopeSnapshot::depts([10]));
        let ctx = Arc::new(caller_ctx());
        let _off = ctx.enter(PolicyMarker::disabled());

        let result = injector.inject("SELECT * FROM t_order", &ctx).await.unwrap();
        assert_eq!(result.rewritten_sql, "SELECT * FROM t_order");
    }

    #[tokio::test]
    async fn test_rejected_statements() {
        let injector = injector(ScopeSnapshot::all());
        let ctx = caller_ctx();

        let err = injector.inject("DROP TABLE t_user", &ctx).await.unwrap_err();
        assert!(matches!(err, RlsError::DdlNotAllowed { .. }));

        for sql in [
            "UPDATE t_user SET name = d.name FROM t_dict d WHERE d.id = t_user.dict_id",
            "DELETE FROM t_user USING t_dict WHERE t_dict.id = t_user.dict_id",
            "SELECT * FROM generate_series(1, 10)",
            "COMMIT",
        ] {
            let err = injector.inject(sql, &ctx).await.unwrap_err();
            assert!(
                matches!(err, RlsError::UnsupportedStatement { .. }),
                "{sql}: {err}"
            );
        }

        let err = injector.inject("SELEC * FROM", &ctx).await.unwrap_err();
        assert!(matches!(err, RlsError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_explain_reports_tenant() {
        let ctx = RequestContext::anonymous(Some(TenantId::new("B")));
        let explanation = injector(ScopeSnapshot::all())
            .explain("SELECT * FROM t_user", &ctx)
            .await
            .unwrap();
        assert_eq!(explanation.tenant_id.as_deref(), Some("B"));
        assert_eq!(explanation.predicates_added, vec!["t_user.tenant_id = 'B'"]);
    }

    #[test]
    fn test_and_onto() {
        let a = Predicate::AlwaysFalse.to_expr();
        assert_eq!(and_onto(None, vec![]), None);
        assert_eq!(and_onto(Some(a.clone()), vec![]), Some(a.clone()));
        assert_eq!(
            and_onto(None, vec![a.clone(), a]).unwrap().to_string(),
            "1 = 0 AND 1 = 0"
        );
    }
}

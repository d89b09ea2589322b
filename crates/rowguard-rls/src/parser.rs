//! SQL parsing and analysis.

use std::ops::ControlFlow;

use rowguard_core::SqlDialectKind;
use sqlparser::ast::{
    Ident, ObjectName, ObjectNamePart, Query, SetExpr, Statement, TableFactor, Visit, Visitor,
};
use sqlparser::dialect::{MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

use crate::error::RlsError;

/// Analyzes SQL statements to extract table references.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlAnalyzer {
    dialect: SqlDialectKind,
}

impl SqlAnalyzer {
    /// Create a new SQL analyzer using the PostgreSQL dialect.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a SQL analyzer for the given dialect.
    pub fn with_dialect(dialect: SqlDialectKind) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> SqlDialectKind {
        self.dialect
    }

    /// Parse a SQL string into statements.
    pub fn parse(&self, sql: &str) -> Result<Vec<Statement>, RlsError> {
        let parsed = match self.dialect {
            SqlDialectKind::Postgres => Parser::parse_sql(&PostgreSqlDialect {}, sql),
            SqlDialectKind::Mysql => Parser::parse_sql(&MySqlDialect {}, sql),
        };
        parsed.map_err(|e| RlsError::ParseError(e.to_string()))
    }

    /// Extract every table a statement reads or modifies, including tables in
    /// joins, derived tables, CTEs and subqueries.
    ///
    /// Fails on shapes whose rows cannot be attributed to a named table, such
    /// as table functions, `TABLE t` or data-modifying CTEs.
    pub fn extract_tables(&self, stmt: &Statement) -> Result<Vec<TableReference>, RlsError> {
        let mut collector = TableCollector {
            operation: self.get_operation(stmt),
            query_depth: 0,
            statement_depth: 0,
            ctes: CteScope::default(),
            tables: Vec::new(),
        };
        match stmt.visit(&mut collector) {
            ControlFlow::Continue(()) => Ok(collector.tables),
            ControlFlow::Break(err) => Err(err),
        }
    }

    /// Check if a statement is a DDL statement.
    pub fn is_ddl(&self, stmt: &Statement) -> bool {
        matches!(
            stmt,
            Statement::CreateTable { .. }
                | Statement::AlterTable { .. }
                | Statement::Drop { .. }
                | Statement::Truncate { .. }
                | Statement::CreateIndex { .. }
                | Statement::CreateView { .. }
        )
    }

    /// Get the type of SQL operation.
    pub fn get_operation(&self, stmt: &Statement) -> SqlOperation {
        match stmt {
            Statement::Query(_) => SqlOperation::Select,
            Statement::Insert { .. } => SqlOperation::Insert,
            Statement::Update { .. } => SqlOperation::Update,
            Statement::Delete(_) => SqlOperation::Delete,
            _ if self.is_ddl(stmt) => SqlOperation::Ddl,
            _ => SqlOperation::Other,
        }
    }
}

struct TableCollector {
    operation: SqlOperation,
    query_depth: usize,
    statement_depth: usize,
    ctes: CteScope,
    tables: Vec<TableReference>,
}

impl TableCollector {
    fn check_set_expr(body: &SetExpr) -> Result<(), RlsError> {
        match body {
            SetExpr::Select(_) | SetExpr::Query(_) | SetExpr::Values(_) => Ok(()),
            SetExpr::SetOperation { left, right, .. } => {
                Self::check_set_expr(left)?;
                Self::check_set_expr(right)
            }
            other => Err(RlsError::unsupported(format!("query body `{}`", other))),
        }
    }
}

impl Visitor for TableCollector {
    type Break = RlsError;

    fn pre_visit_statement(&mut self, _statement: &Statement) -> ControlFlow<Self::Break> {
        self.statement_depth += 1;
        if self.statement_depth > 1 {
            return ControlFlow::Break(RlsError::unsupported(
                "data-modifying statement nested inside a query",
            ));
        }
        ControlFlow::Continue(())
    }

    fn post_visit_statement(&mut self, _statement: &Statement) -> ControlFlow<Self::Break> {
        self.statement_depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Err(err) = Self::check_set_expr(&query.body) {
            return ControlFlow::Break(err);
        }
        self.ctes.enter(query);
        self.query_depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.ctes.leave(query);
        self.query_depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Table { args: Some(_), .. } => ControlFlow::Break(
                RlsError::unsupported(format!("table function `{}`", table_factor)),
            ),
            // A CTE's own body is collected where it is defined.
            TableFactor::Table { name, .. } if self.ctes.is_cte(name) => ControlFlow::Continue(()),
            TableFactor::Table { name, alias, .. } => {
                // Tables inside a query of an UPDATE/DELETE/INSERT are only read.
                let operation = if self.query_depth > 0 {
                    SqlOperation::Select
                } else {
                    self.operation
                };
                self.tables.push(TableReference {
                    name: name.to_string(),
                    name_parts: name_idents(name),
                    alias: alias.as_ref().map(|a| a.name.clone()),
                    operation,
                });
                ControlFlow::Continue(())
            }
            TableFactor::Derived { .. } | TableFactor::NestedJoin { .. } => {
                ControlFlow::Continue(())
            }
            other => ControlFlow::Break(RlsError::unsupported(format!(
                "table source `{}`",
                other
            ))),
        }
    }
}

/// CTE names visible at the current point of a query traversal.
///
/// A non-recursive CTE is visible to the CTEs after it and to the query body,
/// never to its own body, so `WITH t_user AS (SELECT * FROM t_user)` still
/// reads the real `t_user` inside the CTE.
#[derive(Debug, Default)]
pub(crate) struct CteScope {
    frames: Vec<CteFrame>,
}

#[derive(Debug, Default)]
struct CteFrame {
    bodies: Vec<*const Query>,
    names: Vec<Ident>,
    recursive: bool,
    visible: usize,
}

impl CteFrame {
    fn body_index(&self, query: &Query) -> Option<usize> {
        self.bodies.iter().position(|body| std::ptr::eq(*body, query))
    }
}

impl CteScope {
    /// Call when a query is entered, before any of its parts are visited.
    pub(crate) fn enter(&mut self, query: &Query) {
        if let Some(frame) = self.frames.last_mut() {
            if let Some(index) = frame.body_index(query) {
                frame.visible = if frame.recursive { frame.names.len() } else { index };
            }
        }

        let frame = match &query.with {
            Some(with) => CteFrame {
                bodies: with
                    .cte_tables
                    .iter()
                    .map(|cte| &*cte.query as *const Query)
                    .collect(),
                names: with.cte_tables.iter().map(|cte| cte.alias.name.clone()).collect(),
                recursive: with.recursive,
                visible: if with.recursive { with.cte_tables.len() } else { 0 },
            },
            None => CteFrame::default(),
        };
        self.frames.push(frame);
    }

    /// Call when a query has been fully visited.
    pub(crate) fn leave(&mut self, query: &Query) {
        self.frames.pop();
        if let Some(frame) = self.frames.last_mut() {
            if let Some(index) = frame.body_index(query) {
                frame.visible = if frame.recursive { frame.names.len() } else { index + 1 };
            }
        }
    }

    /// Whether `name` refers to a CTE rather than a stored table.
    pub(crate) fn is_cte(&self, name: &ObjectName) -> bool {
        let [ObjectNamePart::Identifier(ident)] = name.0.as_slice() else {
            return false;
        };
        self.frames.iter().any(|frame| {
            frame.names[..frame.visible]
                .iter()
                .any(|cte| same_ident(cte, ident))
        })
    }
}

/// Compare identifiers the way the database resolves them: unquoted ones
/// case-insensitively, quoted ones exactly.
fn same_ident(a: &Ident, b: &Ident) -> bool {
    match (a.quote_style, b.quote_style) {
        (None, None) => a.value.eq_ignore_ascii_case(&b.value),
        _ => a.value == b.value,
    }
}

fn name_idents(name: &ObjectName) -> Vec<Ident> {
    name.0
        .iter()
        .filter_map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident.clone()),
            _ => None,
        })
        .collect()
}

/// Strip schema qualification and quoting from a table name and lower-case it.
///
/// `"Public"."T_Order"` and `t_order` both normalize to `t_order`.
pub fn normalize_table_name(name: &str) -> String {
    let last = name.rsplit('.').next().unwrap_or(name);
    last.trim_matches(|c| matches!(c, '"' | '`' | '[' | ']'))
        .to_lowercase()
}

/// A reference to a table in a SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReference {
    /// The table name as written (possibly schema-qualified).
    pub name: String,
    /// The parts of `name`, quote style included.
    pub name_parts: Vec<Ident>,
    /// Optional alias, quote style included.
    pub alias: Option<Ident>,
    /// The operation being performed on this table.
    pub operation: SqlOperation,
}

impl TableReference {
    pub fn new(name: impl Into<String>, alias: Option<&str>) -> Self {
        let name = name.into();
        Self {
            name_parts: name.split('.').map(Ident::new).collect(),
            name,
            alias: alias.map(Ident::new),
            operation: SqlOperation::Select,
        }
    }

    /// Unqualified, lower-cased table name used for rule lookup.
    pub fn table_name(&self) -> String {
        normalize_table_name(&self.name)
    }

    /// Prefix for column references: the alias if present, else the name as written.
    pub fn qualifier(&self) -> Vec<Ident> {
        match &self.alias {
            Some(alias) => vec![alias.clone()],
            None => self.name_parts.clone(),
        }
    }
}

/// Types of SQL operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}

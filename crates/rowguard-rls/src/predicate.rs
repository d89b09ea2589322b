//! Row filter predicates produced by data rules.
//!
//! A rule returns `Option<Predicate>`: `None` means "no restriction", while
//! [`Predicate::AlwaysFalse`] means "no row is visible". Predicates are kept in
//! this small tree form so they can be composed, inspected and evaluated before
//! being lowered into a `sqlparser` expression.

use std::collections::HashMap;
use std::fmt;
use std::iter;

use serde::{Deserialize, Serialize};
use sqlparser::ast::{BinaryOperator, Expr, Ident, Value};

/// A literal operand of a predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Integer(i64),
    Text(String),
}

impl SqlValue {
    pub fn to_expr(&self) -> Expr {
        match self {
            SqlValue::Integer(n) => Expr::value(Value::Number(n.to_string(), false)),
            SqlValue::Text(s) => Expr::value(Value::SingleQuotedString(s.clone())),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

/// A column, optionally qualified by a table alias or name.
///
/// Identifiers keep their quote style so a quoted alias such as `"O"` is
/// referenced exactly as it was declared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub qualifier: Vec<Ident>,
    pub column: Ident,
}

impl ColumnRef {
    pub fn bare(column: impl Into<String>) -> Self {
        Self {
            qualifier: Vec::new(),
            column: Ident::new(column),
        }
    }

    pub fn qualified(
        qualifier: impl IntoIterator<Item = Ident>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            qualifier: qualifier.into_iter().collect(),
            column: Ident::new(column),
        }
    }

    pub fn to_expr(&self) -> Expr {
        if self.qualifier.is_empty() {
            return Expr::Identifier(self.column.clone());
        }
        Expr::CompoundIdentifier(
            self.qualifier
                .iter()
                .cloned()
                .chain(iter::once(self.column.clone()))
                .collect(),
        )
    }
}

/// Row values keyed by column name, used to evaluate predicates in memory.
pub type Row = HashMap<String, SqlValue>;

/// A boolean row filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Matches no row.
    AlwaysFalse,
    Equals { column: ColumnRef, value: SqlValue },
    In { column: ColumnRef, values: Vec<SqlValue> },
    Or(Vec<Predicate>),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn equals(column: ColumnRef, value: impl Into<SqlValue>) -> Self {
        Predicate::Equals {
            column,
            value: value.into(),
        }
    }

    pub fn in_list(column: ColumnRef, values: impl IntoIterator<Item = SqlValue>) -> Self {
        Predicate::In {
            column,
            values: values.into_iter().collect(),
        }
    }

    /// AND-compose predicates in order.
    ///
    /// `AlwaysFalse` dominates; an empty input yields no restriction.
    pub fn all(parts: Vec<Predicate>) -> Option<Predicate> {
        if parts.iter().any(|p| matches!(p, Predicate::AlwaysFalse)) {
            return Some(Predicate::AlwaysFalse);
        }
        let mut parts = parts;
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Predicate::And(parts)),
        }
    }

    /// Lower into a `sqlparser` expression.
    ///
    /// OR groups are always parenthesized so the result can be AND-ed onto
    /// any other filter without changing its meaning.
    pub fn to_expr(&self) -> Expr {
        match self {
            Predicate::AlwaysFalse => always_false_expr(),
            Predicate::Equals { column, value } => Expr::BinaryOp {
                left: Box::new(column.to_expr()),
                op: BinaryOperator::Eq,
                right: Box::new(value.to_expr()),
            },
            Predicate::In { values, .. } if values.is_empty() => always_false_expr(),
            Predicate::In { column, values } => Expr::InList {
                expr: Box::new(column.to_expr()),
                list: values.iter().map(SqlValue::to_expr).collect(),
                negated: false,
            },
            Predicate::Or(parts) => match fold(parts, BinaryOperator::Or) {
                Some(expr) => Expr::Nested(Box::new(expr)),
                None => always_false_expr(),
            },
            Predicate::And(parts) => fold(parts, BinaryOperator::And).unwrap_or_else(|| {
                Expr::value(Value::Boolean(true))
            }),
        }
    }

    /// Evaluate against an in-memory row. Missing columns never match.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::AlwaysFalse => false,
            Predicate::Equals { column, value } => row.get(&column.column.value) == Some(value),
            Predicate::In { column, values } => row
                .get(&column.column.value)
                .is_some_and(|v| values.contains(v)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(row)),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(row)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_expr())
    }
}

fn fold(parts: &[Predicate], op: BinaryOperator) -> Option<Expr> {
    parts
        .iter()
        .map(Predicate::to_expr)
        .reduce(|left, right| Expr::BinaryOp {
            left: Box::new(left),
            op: op.clone(),
            right: Box::new(right),
        })
}

fn always_false_expr() -> Expr {
    Expr::BinaryOp {
        left: Box::new(Expr::value(Value::Number("1".to_string(), false))),
        op: BinaryOperator::Eq,
        right: Box::new(Expr::value(Value::Number("0".to_string(), false))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(pairs: &[(&str, SqlValue)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_render_equals_and_in() {
        let eq = Predicate::equals(ColumnRef::qualified([Ident::new("o")], "tenant_id"), "A");
        assert_eq!(eq.to_string(), "o.tenant_id = 'A'");

        let list = Predicate::in_list(
            ColumnRef::bare("dept_id"),
            [SqlValue::Integer(10), SqlValue::Integer(20)],
        );
        assert_eq!(list.to_string(), "dept_id IN (10, 20)");
    }

    #[test]
    fn test_quoted_qualifier_keeps_quotes() {
        let eq = Predicate::equals(
            ColumnRef::qualified([Ident::with_quote('"', "O")], "tenant_id"),
            "A",
        );
        assert_eq!(eq.to_string(), "\"O\".tenant_id = 'A'");
    }

    #[test]
    fn test_or_is_parenthesized() {
        let or = Predicate::Or(vec![
            Predicate::in_list(ColumnRef::bare("dept_id"), [SqlValue::Integer(10)]),
            Predicate::equals(ColumnRef::bare("user_id"), 42i64),
        ]);
        let and = Predicate::And(vec![
            Predicate::equals(ColumnRef::bare("tenant_id"), "A"),
            or,
        ]);
        assert_eq!(
            and.to_string(),
            "tenant_id = 'A' AND (dept_id IN (10) OR user_id = 42)"
        );
    }

    #[test]
    fn test_all_composition() {
        assert_eq!(Predicate::all(vec![]), None);

        let single = Predicate::equals(ColumnRef::bare("a"), 1i64);
        assert_eq!(Predicate::all(vec![single.clone()]), Some(single.clone()));

        let dominated = Predicate::all(vec![single.clone(), Predicate::AlwaysFalse]);
        assert_eq!(dominated, Some(Predicate::AlwaysFalse));
    }

    #[test]
    fn test_always_false_renders_and_matches_nothing() {
        assert_eq!(Predicate::AlwaysFalse.to_string(), "1 = 0");
        assert!(!Predicate::AlwaysFalse.matches(&row(&[("dept_id", SqlValue::Integer(10))])));

        let empty_in = Predicate::in_list(ColumnRef::bare("dept_id"), []);
        assert_eq!(empty_in.to_string(), "1 = 0");
    }

    #[test]
    fn test_matches_rows() {
        let predicate = Predicate::Or(vec![
            Predicate::in_list(
                ColumnRef::bare("dept_id"),
                [SqlValue::Integer(10), SqlValue::Integer(20)],
            ),
            Predicate::equals(ColumnRef::bare("user_id"), 42i64),
        ]);

        let kept = row(&[
            ("dept_id", SqlValue::Integer(10)),
            ("user_id", SqlValue::Integer(1)),
        ]);
        let own = row(&[
            ("dept_id", SqlValue::Integer(99)),
            ("user_id", SqlValue::Integer(42)),
        ]);
        let other = row(&[
            ("dept_id", SqlValue::Integer(99)),
            ("user_id", SqlValue::Integer(1)),
        ]);

        assert!(predicate.matches(&kept));
        assert!(predicate.matches(&own));
        assert!(!predicate.matches(&other));
        assert!(!predicate.matches(&row(&[])));
    }

    #[test]
    fn test_sql_value_json() {
        let values: Vec<SqlValue> = serde_json::from_str(r#"[10, "A"]"#).unwrap();
        assert_eq!(
            values,
            vec![SqlValue::Integer(10), SqlValue::Text("A".to_string())]
        );
    }
}

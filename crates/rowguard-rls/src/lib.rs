//! # rowguard-rls
//!
//! Row-level data-access policy for SQL statements.
//!
//! This crate provides functionality to:
//! - Parse SQL statements using `sqlparser` and find every table they touch
//! - Carry a per-request context (tenant, caller, policy markers, scope
//!   snapshot) across nested calls and spawned tasks
//! - Compose the predicates of all registered data rules for each table
//! - Patch those predicates into the statement before it executes
//! - Validate tenant binding at the inbound boundary
//!
//! ## How It Works
//!
//! For a caller of tenant `A` who may see department `10`:
//!
//! **Before:**
//! ```sql
//! SELECT * FROM t_order
//! ```
//!
//! **After:**
//! ```sql
//! SELECT * FROM t_order WHERE t_order.tenant_id = 'A' AND t_order.dept_id IN (10)
//! ```
//!
//! ## Supported Operations
//!
//! | Operation | RLS Behavior |
//! |-----------|--------------|
//! | `SELECT`  | AND predicates onto each SELECT's `WHERE` |
//! | `JOIN`    | Every joined table filtered by its own alias; LEFT JOIN tables in `ON` |
//! | `UPDATE`  | AND predicates onto `WHERE` |
//! | `DELETE`  | AND predicates onto `WHERE` |
//! | `INSERT`  | Target untouched; a `SELECT` source is filtered |
//! | DDL       | Rejected |

pub mod boundary;
pub mod context;
pub mod error;
pub mod injector;
pub mod markers;
pub mod parser;
pub mod predicate;
pub mod rule;
pub mod scope;
pub mod tenant;

pub use boundary::{Admission, BoundaryEnforcer, BoundaryError, InboundTenancy};
pub use context::{spawn_with_context, with_marker, MarkerGuard, MarkerStack, RequestContext, TenantOverride};
pub use error::RlsError;
pub use injector::{InjectionExplanation, InjectionResult, RewrittenStatement, RlsInjector, ScopedTable};
pub use markers::MarkerCatalog;
pub use parser::{SqlAnalyzer, SqlOperation, TableReference};
pub use predicate::{ColumnRef, Predicate, Row, SqlValue};
pub use rule::{DataRule, RuleRegistry, RuleRegistryBuilder};
pub use scope::{DataScopeRule, ScopeProvider, StaticScopeProvider};
pub use tenant::TenantRule;

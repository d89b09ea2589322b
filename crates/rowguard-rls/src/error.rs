//! Error types for the RLS crate.

use rowguard_core::CallerId;
use thiserror::Error;

/// Errors that can occur while rewriting a statement.
///
/// None of these mean "access denied": a caller who may see nothing gets an
/// always-false predicate instead. An error means the statement could not be
/// scoped safely and must not run.
#[derive(Debug, Error)]
pub enum RlsError {
    /// SQL parsing failed.
    #[error("failed to parse SQL: {0}")]
    ParseError(String),

    /// DDL statement is not allowed.
    #[error("DDL statement not allowed: {statement}")]
    DdlNotAllowed { statement: String },

    /// Statement shape the rewriter cannot scope.
    #[error("cannot scope statement: {reason}")]
    UnsupportedStatement { reason: String },

    /// A tenant-scoped table was queried without a bound tenant.
    #[error("tenant value required for table {table} but none is bound")]
    MissingTenant { table: String },

    /// A caller-scoped table was queried without an authenticated caller.
    #[error("caller required for table {table} but none is bound")]
    MissingCaller { table: String },

    /// The caller's data scope could not be resolved.
    #[error("data scope unavailable for caller {caller_id} on table {table}: {reason}")]
    ScopeUnavailable {
        caller_id: CallerId,
        table: String,
        reason: String,
    },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RlsError {
    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        RlsError::UnsupportedStatement {
            reason: reason.into(),
        }
    }
}

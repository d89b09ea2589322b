use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// Configuration types shared across all rowguard crates
pub mod config;

// Re-export commonly used config types for convenience
pub use config::{
    BoundaryConfig, ConfigError, DataScopeConfig, MarkerConfig, RowguardConfig, ServerConfig,
    SqlDialectKind, TableScopeColumns, TableTenancyConfig, TenancyConfig, TenantIdConfig,
    TenantIdType,
};

/// Identifier of a tenant, kept in its textual form.
///
/// How the id is rendered into SQL (quoted or numeric) is decided by
/// [`TenantIdType`], not by the id itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of an authenticated caller (user).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(pub i64);

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The authenticated caller as handed over by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: CallerId,
    /// The tenant the caller belongs to.
    pub tenant_id: TenantId,
    /// Permission strings granted to the caller (e.g. `system:tenant:visit`).
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl Caller {
    pub fn new(id: i64, tenant_id: impl Into<String>) -> Self {
        Self {
            id: CallerId(id),
            tenant_id: TenantId::new(tenant_id),
            permissions: BTreeSet::new(),
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// Resolved data scope of one caller.
///
/// Produced by the external permission service and cached for the lifetime
/// of a single request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    /// Caller may see every row; no department or personal restriction applies.
    #[serde(default)]
    pub all_access: bool,
    /// Departments whose rows the caller may see.
    #[serde(default)]
    pub dept_ids: BTreeSet<i64>,
    /// Caller may see rows they own personally.
    #[serde(default)]
    pub can_see_self: bool,
}

impl ScopeSnapshot {
    pub fn all() -> Self {
        Self {
            all_access: true,
            ..Self::default()
        }
    }

    pub fn depts(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            all_access: false,
            dept_ids: ids.into_iter().collect(),
            can_see_self: false,
        }
    }

    pub fn with_self(mut self) -> Self {
        self.can_see_self = true;
        self
    }

    /// True when neither a department nor the caller's own rows are visible.
    pub fn is_empty(&self) -> bool {
        !self.all_access && self.dept_ids.is_empty() && !self.can_see_self
    }
}

/// Declarative toggle deciding whether data rules apply during a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMarker {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When non-empty, only the named rules apply.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_rules: Vec<String>,
    /// Rules that never apply while this marker is active.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_rules: Vec<String>,
}

impl Default for PolicyMarker {
    fn default() -> Self {
        Self::enabled()
    }
}

impl PolicyMarker {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            include_rules: Vec::new(),
            exclude_rules: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::enabled()
        }
    }

    pub fn including(mut self, rule: impl Into<String>) -> Self {
        self.include_rules.push(rule.into());
        self
    }

    pub fn excluding(mut self, rule: impl Into<String>) -> Self {
        self.exclude_rules.push(rule.into());
        self
    }

    /// Whether the rule with the given name applies under this marker.
    pub fn applies_to(&self, rule: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.include_rules.is_empty() && !self.include_rules.iter().any(|r| r == rule) {
            return false;
        }
        !self.exclude_rules.iter().any(|r| r == rule)
    }
}

fn default_true() -> bool {
    true
}

//! Declared policy markers.
//!
//! Markers can be attached to a whole component (every operation of it) or
//! to a single operation, keyed as `Component::operation`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::PolicyMarker;

/// Policy markers declared in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkerConfig {
    /// Markers applying to every operation of a component.
    #[serde(default)]
    pub components: HashMap<String, PolicyMarker>,

    /// Markers applying to one operation, keyed `Component::operation`.
    #[serde(default)]
    pub operations: HashMap<String, PolicyMarker>,
}

impl MarkerConfig {
    /// Key under which an operation-level marker is declared.
    pub fn operation_key(component: &str, operation: &str) -> String {
        format!("{}::{}", component, operation)
    }
}

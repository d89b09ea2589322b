//! Declared policy markers and their memoized lookup.
//!
//! A marker may be declared on a component (applies to all of its operations)
//! or on a single operation. Resolution prefers the operation-level
//! declaration and caches the outcome per `(component, operation)`, including
//! the outcome "no marker".

use std::collections::HashMap;
use std::future::Future;
use std::sync::{PoisonError, RwLock};

use rowguard_core::{MarkerConfig, PolicyMarker};

use crate::context::with_marker;

type CacheKey = (String, String);

/// Registry of declared markers.
#[derive(Debug, Default)]
pub struct MarkerCatalog {
    components: HashMap<String, PolicyMarker>,
    operations: HashMap<CacheKey, PolicyMarker>,
    resolved: RwLock<HashMap<CacheKey, Option<PolicyMarker>>>,
}

impl MarkerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the catalog from the `markers` configuration section.
    ///
    /// Operation keys without a `Component::` prefix are ignored with a
    /// warning.
    pub fn from_config(config: &MarkerConfig) -> Self {
        let mut catalog = Self::new();
        for (component, marker) in &config.components {
            catalog.declare_component(component.clone(), marker.clone());
        }
        for (key, marker) in &config.operations {
            match key.split_once("::") {
                Some((component, operation)) => {
                    catalog.declare_operation(component, operation, marker.clone());
                }
                None => {
                    tracing::warn!(key = %key, "operation marker key must be Component::operation");
                }
            }
        }
        catalog
    }

    pub fn declare_component(&mut self, component: impl Into<String>, marker: PolicyMarker) {
        self.components.insert(component.into(), marker);
        self.clear_resolved();
    }

    pub fn declare_operation(
        &mut self,
        component: impl Into<String>,
        operation: impl Into<String>,
        marker: PolicyMarker,
    ) {
        self.operations
            .insert((component.into(), operation.into()), marker);
        self.clear_resolved();
    }

    /// Marker in effect for an operation, if any was declared.
    pub fn resolve(&self, component: &str, operation: &str) -> Option<PolicyMarker> {
        let key = (component.to_string(), operation.to_string());
        if let Some(hit) = self
            .resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return hit.clone();
        }

        let marker = self
            .operations
            .get(&key)
            .or_else(|| self.components.get(component))
            .cloned();
        tracing::debug!(
            component,
            operation,
            enabled = marker.as_ref().map(|m| m.enabled),
            "resolved policy marker"
        );

        self.resolved
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, marker.clone());
        marker
    }

    /// Run an operation under its declared marker, or unchanged if none is
    /// declared.
    pub async fn run<F: Future>(&self, component: &str, operation: &str, fut: F) -> F::Output {
        match self.resolve(component, operation) {
            Some(marker) => with_marker(marker, fut).await,
            None => fut.await,
        }
    }

    /// Number of memoized lookups.
    pub fn resolved_len(&self) -> usize {
        self.resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn clear_resolved(&mut self) {
        self.resolved
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

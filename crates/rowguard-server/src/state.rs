use std::sync::Arc;

use rowguard_core::RowguardConfig;
use rowguard_rls::{BoundaryEnforcer, MarkerCatalog, RlsInjector, ScopeProvider, StaticScopeProvider};

/// Shared application state.
///
/// Everything here is built once at startup and only read afterwards.
pub struct AppState {
    pub enforcer: BoundaryEnforcer,
    pub injector: RlsInjector,
    pub catalog: MarkerCatalog,
}

impl AppState {
    /// Build state serving scope snapshots from the `scopes` config section.
    pub fn from_config(config: RowguardConfig) -> Self {
        let provider = Arc::new(StaticScopeProvider::new(config.scopes.clone()));
        Self::with_provider(&config, provider)
    }

    pub fn with_provider(config: &RowguardConfig, provider: Arc<dyn ScopeProvider>) -> Self {
        let enforcer =
            BoundaryEnforcer::new(config.boundary.clone(), config.tenancy.tenant_id.id_type);
        let injector = RlsInjector::from_config(config, provider);
        let catalog = MarkerCatalog::from_config(&config.markers);

        tracing::info!(
            rules = ?injector.registry().rule_names(),
            dialect = ?config.dialect,
            "rowguard state initialised"
        );

        Self {
            enforcer,
            injector,
            catalog,
        }
    }
}

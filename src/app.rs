// src/app.rs
use std::sync::Arc;

use anyhow::{Context, Error};
use tracing::info;

use crate::{
    bus::EventBus,
    config::{ConfigError, CoreConfig},
    flow::{default_edges, FlowRouter},
    module::{DependencyResolver, ModuleDescriptor, NoopModule},
    orchestrator::{default_probes, BootReport, Orchestrator, OrchestratorError},
    state::StateStore,
};

/// The tracker's feature modules, by load priority.
pub fn standard_modules() -> Vec<ModuleDescriptor> {
    vec![
        ModuleDescriptor::new("energy", 1),
        ModuleDescriptor::new("social", 1),
        ModuleDescriptor::new("charts", 2).depends_on(["energy", "social"]),
        ModuleDescriptor::new("insights", 3).depends_on(["energy", "social"]),
        ModuleDescriptor::new("notifications", 4).depends_on(["insights"]),
        ModuleDescriptor::new("ai", 5).depends_on(["insights"]),
        ModuleDescriptor::new("sync", 6),
        ModuleDescriptor::new("pwa", 7),
    ]
}

/// Composition root: owns one instance of every core component.
pub struct App {
    config: CoreConfig,
    bus: Arc<EventBus>,
    state: Arc<StateStore>,
    resolver: Arc<DependencyResolver>,
    router: Arc<FlowRouter>,
    orchestrator: Arc<Orchestrator>,
}

impl App {
    /// Build and wire the components. Nothing is registered yet.
    pub fn new(config: CoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let bus = EventBus::new(config.history_capacity, config.max_emit_depth);
        let state = StateStore::new(bus.clone());
        let resolver = DependencyResolver::new(bus.clone(), config.critical_priority);
        let router = FlowRouter::new(bus.clone(), config.network_targets.iter().cloned());
        router.attach();
        let orchestrator = Orchestrator::new(
            bus.clone(),
            state.clone(),
            resolver.clone(),
            router.clone(),
            config.clone(),
        );

        Ok(Self {
            config,
            bus,
            state,
            resolver,
            router,
            orchestrator,
        })
    }

    /// `new` plus the standard modules (as no-op initializers), the default
    /// flow edges and the default integration probes.
    pub fn with_defaults(config: CoreConfig) -> Result<Self, Error> {
        let app = Self::new(config)?;

        for descriptor in standard_modules() {
            let name = descriptor.name.clone();
            app.resolver
                .register_module(descriptor, Arc::new(NoopModule))
                .with_context(|| format!("registering module {}", name))?;
        }
        for edge in default_edges() {
            let id = edge.id();
            app.router
                .register_flow(edge)
                .with_context(|| format!("registering flow {}", id))?;
        }
        for probe in default_probes() {
            app.orchestrator.add_probe(probe);
        }
        Ok(app)
    }

    pub async fn start(&self) -> Result<BootReport, OrchestratorError> {
        info!("starting battery core");
        self.orchestrator.initialize().await
    }

    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
        self.router.detach();
        info!("battery core stopped");
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        &self.resolver
    }

    pub fn router(&self) -> &Arc<FlowRouter> {
        &self.router
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = CoreConfig {
            max_emit_depth: 0,
            ..CoreConfig::default()
        };
        assert!(App::new(config).is_err());
    }

    #[test]
    fn test_standard_modules_resolve() {
        let app = App::with_defaults(CoreConfig::default()).unwrap();
        let order = app.resolver().resolve_order().unwrap();
        assert_eq!(order.len(), standard_modules().len());
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("energy") < pos("charts"));
        assert!(pos("insights") < pos("notifications"));
        assert_eq!(app.router().active_flow_count(), default_edges().len());
    }

    #[test]
    fn test_shutdown_detaches_router() {
        let app = App::new(CoreConfig::default()).unwrap();
        let before = app.bus().listener_count(&Topic::Wildcard);
        assert!(before >= 1);
        app.shutdown();
        assert_eq!(app.bus().listener_count(&Topic::Wildcard), 0);
    }
}

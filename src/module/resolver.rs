// src/module/resolver.rs

use std::{
    collections::{HashMap, HashSet},
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::FutureExt;
use petgraph::{graphmap::DiGraphMap, visit::Dfs};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    bus::{panic_message, EventBus},
    event::{ErrorKind, ErrorReport, EventKind},
};

use super::descriptor::{FeatureModule, ModuleContext, ModuleDescriptor, ModuleState};

const RESOLVER_SOURCE: &str = "resolver";

pub const DEFAULT_CRITICAL_PRIORITY: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolverError {
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },
    #[error("module `{0}` is not registered")]
    UnknownModule(String),
    #[error("module `{module}` depends on unregistered module `{dependency}`")]
    MissingDependency { module: String, dependency: String },
    #[error("invalid module descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("module `{0}` is disabled")]
    ModuleDisabled(String),
    #[error("module `{module}` cannot load before `{dependency}` is loaded")]
    DependencyNotLoaded { module: String, dependency: String },
    #[error("module `{module}` failed to load: {reason}")]
    ModuleLoadFailed { module: String, reason: String },
    #[error("critical module `{module}` failed to load: {reason}")]
    CriticalModuleLoadFailure { module: String, reason: String },
}

/// Result of one pass of the loading loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub order: Vec<String>,
    pub loaded: Vec<String>,
    /// (module, reason) for every non-critical module that did not load
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub loaded_count: usize,
    pub total_count: usize,
    pub critical_loaded: bool,
}

struct ModuleEntry {
    descriptor: ModuleDescriptor,
    module: Arc<dyn FeatureModule>,
    state: ModuleState,
}

#[derive(Default)]
struct ResolverInner {
    /// registration order
    modules: Vec<ModuleEntry>,
    index_of: HashMap<String, usize>,
    /// load order
    loaded: Vec<String>,
}

impl ResolverInner {
    fn entry(&self, name: &str) -> Option<&ModuleEntry> {
        self.index_of.get(name).map(|&i| &self.modules[i])
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut ModuleEntry> {
        match self.index_of.get(name) {
            Some(&i) => Some(&mut self.modules[i]),
            None => None,
        }
    }

    fn set_state(&mut self, name: &str, state: ModuleState) {
        if let Some(entry) = self.entry_mut(name) {
            entry.state = state;
        }
    }
}

/// Registry of feature modules; computes a dependency-respecting load order
/// and drives the sequential loading loop.
pub struct DependencyResolver {
    inner: Mutex<ResolverInner>,
    bus: Arc<EventBus>,
    critical_priority: i32,
}

impl DependencyResolver {
    pub fn new(bus: Arc<EventBus>, critical_priority: i32) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ResolverInner::default()),
            bus,
            critical_priority,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ResolverInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) a module. Replacing resets it to `Registered`.
    pub fn register_module(
        &self,
        descriptor: ModuleDescriptor,
        module: Arc<dyn FeatureModule>,
    ) -> Result<(), ResolverError> {
        let name = descriptor.name.trim().to_string();
        if name.is_empty() {
            return Err(ResolverError::InvalidDescriptor("module name is empty".into()));
        }

        let mut inner = self.lock();
        let entry = ModuleEntry {
            state: if descriptor.enabled {
                ModuleState::Registered
            } else {
                ModuleState::Disabled
            },
            descriptor: ModuleDescriptor { name: name.clone(), ..descriptor },
            module,
        };
        match inner.index_of.get(&name).copied() {
            Some(i) => {
                inner.modules[i] = entry;
                inner.loaded.retain(|n| n != &name);
                info!(module = %name, "module re-registered");
            }
            None => {
                let i = inner.modules.len();
                inner.modules.push(entry);
                inner.index_of.insert(name.clone(), i);
                debug!(module = %name, "module registered");
            }
        }
        Ok(())
    }

    pub fn is_critical(&self, name: &str) -> bool {
        self.lock()
            .entry(name)
            .map(|e| e.descriptor.priority <= self.critical_priority)
            .unwrap_or(false)
    }

    pub fn critical_priority(&self) -> i32 {
        self.critical_priority
    }

    /// Topological load order over the enabled modules.
    ///
    /// Descriptors are visited by ascending priority (registration order breaks
    /// ties); each visit recurses into its dependencies first and appends the
    /// module in post-order. Disabled dependencies are skipped here; their
    /// dependents fail later with `DependencyNotLoaded`.
    pub fn resolve_order(&self) -> Result<Vec<String>, ResolverError> {
        let inner = self.lock();

        let mut roots: Vec<&ModuleDescriptor> = inner
            .modules
            .iter()
            .map(|e| &e.descriptor)
            .filter(|d| d.enabled)
            .collect();
        roots.sort_by_key(|d| d.priority);

        let mut order = Vec::with_capacity(roots.len());
        let mut visited = HashSet::new();
        let mut visiting = Vec::new();
        for descriptor in roots {
            visit(&inner, &descriptor.name, &mut visiting, &mut visited, &mut order)?;
        }
        Ok(order)
    }

    /// Cycle and registration check without loading anything.
    pub fn validate(&self) -> Result<(), ResolverError> {
        self.resolve_order().map(|_| ())
    }

    /// dependency → dependent graph over every registered module.
    fn dependency_graph(inner: &ResolverInner) -> DiGraphMap<&str, ()> {
        let mut graph = DiGraphMap::new();
        for entry in &inner.modules {
            graph.add_node(entry.descriptor.name.as_str());
            for dep in &entry.descriptor.dependencies {
                graph.add_edge(dep.as_str(), entry.descriptor.name.as_str(), ());
            }
        }
        graph
    }

    /// Every module that depends on `name`, directly or transitively.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let inner = self.lock();
        let graph = Self::dependency_graph(&inner);
        if !graph.contains_node(name) {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut dfs = Dfs::new(&graph, name);
        while let Some(node) = dfs.next(&graph) {
            if node != name {
                out.push(node.to_string());
            }
        }
        out
    }

    /// Run the loading loop over the resolved order, strictly one module at a time.
    ///
    /// A failing module at or below the critical priority aborts the loop; any
    /// other failure is logged and the loop continues without it.
    pub async fn initialize_all(&self, ctx: &ModuleContext) -> Result<LoadReport, ResolverError> {
        let order = self.resolve_order()?;
        info!(order = ?order, "loading modules");

        let mut report = LoadReport {
            order: order.clone(),
            ..Default::default()
        };

        for name in order {
            if self.is_loaded(&name) {
                report.loaded.push(name);
                continue;
            }
            match self.load_one(&name, ctx).await {
                Ok(()) => report.loaded.push(name),
                Err(err) => {
                    let reason = match &err {
                        ResolverError::ModuleLoadFailed { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    };
                    let critical = self.is_critical(&name);
                    self.report_failure(&name, &reason, critical);
                    if critical {
                        error!(module = %name, %reason, "critical module failed, aborting boot");
                        return Err(ResolverError::CriticalModuleLoadFailure { module: name, reason });
                    }
                    warn!(module = %name, %reason, "module failed to load, continuing without it");
                    report.failed.push((name, reason));
                }
            }
        }

        info!(loaded = report.loaded.len(), failed = report.failed.len(), "module loading finished");
        Ok(report)
    }

    /// Load one enabled module whose dependencies are already loaded.
    /// Loading an already loaded module is a no-op.
    pub async fn load_module(&self, name: &str, ctx: &ModuleContext) -> Result<(), ResolverError> {
        if self.is_loaded(name) {
            return Ok(());
        }
        let result = self.load_one(name, ctx).await;
        if let Err(err) = &result {
            self.report_failure(name, &err.to_string(), self.is_critical(name));
        }
        result
    }

    async fn load_one(&self, name: &str, ctx: &ModuleContext) -> Result<(), ResolverError> {
        // 1) precondition checks + mark Loading, then release the lock
        let module = {
            let mut inner = self.lock();
            let entry = inner
                .entry(name)
                .ok_or_else(|| ResolverError::UnknownModule(name.to_string()))?;
            if !entry.descriptor.enabled {
                return Err(ResolverError::ModuleDisabled(name.to_string()));
            }
            let missing = entry
                .descriptor
                .dependencies
                .iter()
                .find(|d| !inner.loaded.contains(*d))
                .cloned();
            let module = entry.module.clone();
            if let Some(dependency) = missing {
                let err = ResolverError::DependencyNotLoaded {
                    module: name.to_string(),
                    dependency,
                };
                inner.set_state(name, ModuleState::Failed(err.to_string()));
                return Err(err);
            }
            inner.set_state(name, ModuleState::Loading);
            module
        };

        // 2) the module's own initializer
        debug!(module = %name, "initializing module");
        let outcome = AssertUnwindSafe(module.initialize(ctx)).catch_unwind().await;
        let outcome = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("{:#}", err)),
            Err(panic) => Err(format!("initializer panicked: {}", panic_message(panic.as_ref()))),
        };

        // 3) record the outcome
        match outcome {
            Ok(()) => {
                let priority = {
                    let mut inner = self.lock();
                    inner.set_state(name, ModuleState::Loaded);
                    if !inner.loaded.iter().any(|n| n == name) {
                        inner.loaded.push(name.to_string());
                    }
                    inner.entry(name).map(|e| e.descriptor.priority)
                };
                info!(module = %name, "module loaded");
                self.bus.emit(
                    EventKind::FeatureReady(name.to_string()),
                    json!({ "module": name, "priority": priority }),
                    RESOLVER_SOURCE,
                );
                Ok(())
            }
            Err(reason) => {
                self.lock().set_state(name, ModuleState::Failed(reason.clone()));
                Err(ResolverError::ModuleLoadFailed {
                    module: name.to_string(),
                    reason,
                })
            }
        }
    }

    fn report_failure(&self, name: &str, reason: &str, critical: bool) {
        self.bus.emit(
            EventKind::FeatureFailed(name.to_string()),
            json!({ "module": name, "reason": reason, "critical": critical }),
            RESOLVER_SOURCE,
        );
        let report = ErrorReport::new(ErrorKind::FeatureLoad, reason)
            .with_context(json!({ "module": name, "critical": critical }));
        self.bus.emit(EventKind::ErrorOccurred, report.to_value(), RESOLVER_SOURCE);
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.lock().loaded.iter().any(|n| n == name)
    }

    /// Mark a module enabled again. It stays unloaded until the next loading pass.
    pub fn enable(&self, name: &str) -> Result<(), ResolverError> {
        let mut inner = self.lock();
        let entry = inner
            .entry_mut(name)
            .ok_or_else(|| ResolverError::UnknownModule(name.to_string()))?;
        entry.descriptor.enabled = true;
        if entry.state == ModuleState::Disabled {
            entry.state = ModuleState::Registered;
        }
        debug!(module = %name, "module enabled");
        Ok(())
    }

    /// Disable a module and drop it from the loaded set.
    pub fn disable(&self, name: &str) -> Result<(), ResolverError> {
        {
            let mut inner = self.lock();
            let entry = inner
                .entry_mut(name)
                .ok_or_else(|| ResolverError::UnknownModule(name.to_string()))?;
            entry.descriptor.enabled = false;
            entry.state = ModuleState::Disabled;
            inner.loaded.retain(|n| n != name);
        }
        let still_loaded: Vec<String> = self
            .dependents_of(name)
            .into_iter()
            .filter(|d| self.is_loaded(d))
            .collect();
        if !still_loaded.is_empty() {
            warn!(module = %name, dependents = ?still_loaded, "disabled a module other loaded modules depend on");
        }
        info!(module = %name, "module disabled");
        self.bus.emit(
            EventKind::FeatureDisabled(name.to_string()),
            json!({ "module": name }),
            RESOLVER_SOURCE,
        );
        Ok(())
    }

    pub fn get_readiness(&self) -> Readiness {
        let inner = self.lock();
        let enabled: Vec<&ModuleDescriptor> = inner
            .modules
            .iter()
            .map(|e| &e.descriptor)
            .filter(|d| d.enabled)
            .collect();
        let critical_loaded = enabled
            .iter()
            .filter(|d| d.priority <= self.critical_priority)
            .all(|d| inner.loaded.contains(&d.name));
        Readiness {
            loaded_count: inner.loaded.len(),
            total_count: enabled.len(),
            critical_loaded,
        }
    }

    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.lock().entry(name).map(|e| e.state.clone())
    }

    pub fn loaded_modules(&self) -> Vec<String> {
        self.lock().loaded.clone()
    }

    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        self.lock().modules.iter().map(|e| e.descriptor.clone()).collect()
    }
}

fn visit(
    inner: &ResolverInner,
    name: &str,
    visiting: &mut Vec<String>,
    visited: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> Result<(), ResolverError> {
    if visited.contains(name) {
        return Ok(());
    }
    if let Some(pos) = visiting.iter().position(|n| n == name) {
        let mut path: Vec<String> = visiting[pos..].to_vec();
        path.push(name.to_string());
        return Err(ResolverError::CycleDetected { path });
    }

    let entry = inner
        .entry(name)
        .ok_or_else(|| ResolverError::UnknownModule(name.to_string()))?;
    if !entry.descriptor.enabled {
        return Ok(());
    }

    visiting.push(name.to_string());
    for dep in &entry.descriptor.dependencies {
        if inner.entry(dep).is_none() {
            return Err(ResolverError::MissingDependency {
                module: name.to_string(),
                dependency: dep.clone(),
            });
        }
        visit(inner, dep, visiting, visited, order)?;
    }
    visiting.pop();

    visited.insert(name.to_string());
    order.push(name.to_string());
    Ok(())
}

impl fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("DependencyResolver")
            .field("modules", &inner.modules.iter().map(|e| (&e.descriptor.name, &e.state)).collect::<Vec<_>>())
            .field("loaded", &inner.loaded)
            .field("critical_priority", &self.critical_priority)
            .finish()
    }
}

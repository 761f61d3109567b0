// src/module/descriptor.rs

use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{bus::EventBus, state::StateStore};

/// Static registration record for a loadable feature module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleDescriptor {
    /// Unique key.
    pub name: String,
    #[serde(default = "ModuleDescriptor::default_enabled")]
    pub enabled: bool,
    /// Names of the modules that must be loaded first, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Lower loads earlier and is more critical.
    pub priority: i32,
}

impl ModuleDescriptor {
    fn default_enabled() -> bool {
        true
    }

    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            dependencies: Vec::new(),
            priority,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Per-module lifecycle: `Registered → Loading → {Loaded | Failed}`, `Loaded → Disabled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ModuleState {
    Registered,
    Loading,
    Loaded,
    Failed(String),
    Disabled,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Registered => f.write_str("registered"),
            ModuleState::Loading => f.write_str("loading"),
            ModuleState::Loaded => f.write_str("loaded"),
            ModuleState::Failed(reason) => write!(f, "failed: {}", reason),
            ModuleState::Disabled => f.write_str("disabled"),
        }
    }
}

/// What a module gets to work with while initializing.
#[derive(Clone, Debug)]
pub struct ModuleContext {
    bus: Arc<EventBus>,
    state: Arc<StateStore>,
}

impl ModuleContext {
    pub fn new(bus: Arc<EventBus>, state: Arc<StateStore>) -> Self {
        Self { bus, state }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }
}

/// A feature the resolver can boot.
///
/// The resolver emits `feature:<name>-ready` once `initialize` returns `Ok`.
#[async_trait]
pub trait FeatureModule: Send + Sync {
    async fn initialize(&self, ctx: &ModuleContext) -> anyhow::Result<()>;
}

/// A module with nothing to initialize.
#[derive(Debug, Clone, Default)]
pub struct NoopModule;

#[async_trait]
impl FeatureModule for NoopModule {
    async fn initialize(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}

type InitFn = dyn Fn(ModuleContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Adapts an async closure into a `FeatureModule`.
pub struct FnModule {
    init: Box<InitFn>,
}

impl FnModule {
    pub fn new<F, Fut>(f: F) -> Arc<Self>
    where
        F: Fn(ModuleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(FnModule {
            init: Box::new(move |ctx| f(ctx).boxed()),
        })
    }
}

#[async_trait]
impl FeatureModule for FnModule {
    async fn initialize(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        (self.init)(ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depends_on_dedups_in_order() {
        let d = ModuleDescriptor::new("charts", 2).depends_on(["energy", "social", "energy"]);
        assert_eq!(d.dependencies, vec!["energy".to_string(), "social".to_string()]);
        assert!(d.enabled);
        assert!(!d.clone().disabled().enabled);
    }

    #[test]
    fn test_descriptor_deserialize_defaults() {
        let d: ModuleDescriptor = serde_json::from_str(r#"{"name":"energy","priority":1}"#).unwrap();
        assert!(d.enabled);
        assert!(d.dependencies.is_empty());
    }
}

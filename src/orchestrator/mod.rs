// src/orchestrator/mod.rs

pub mod consistency;
pub mod probe;
pub mod recovery;

use std::{
    collections::HashSet,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Instant,
};

use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::{
    bus::{panic_message, EventBus, Subscription, Topic},
    config::CoreConfig,
    event::{ErrorKind, ErrorReport, Event, EventKind, RecoveryKind},
    flow::FlowRouter,
    module::{DependencyResolver, LoadReport, ModuleContext, ResolverError},
    state::StateStore,
};

use consistency::{ConsistencyChecker, ConsistencyMonitor, ConsistencyReport};
use probe::{run_probe, IntegrationProbe, ProbeFailure};
use recovery::ErrorClassifier;

pub use consistency::check_counts;
pub use probe::default_probes;
pub use recovery::{classify, RecoveryHook};

const ORCHESTRATOR_SOURCE: &str = "orchestrator";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error("integration verification failed: {}", .failed.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    IntegrationVerificationFailed { failed: Vec<ProbeFailure> },
}

impl OrchestratorError {
    /// Names of the failed probes, if this is a verification failure.
    pub fn failed_probes(&self) -> Vec<&str> {
        match self {
            OrchestratorError::IntegrationVerificationFailed { failed } => {
                failed.iter().map(|f| f.probe.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Successful boot summary, shared by every `initialize` caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootReport {
    pub load: LoadReport,
    pub probes_passed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Warning,
    Error,
}

/// Derived on demand; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IntegrationStatus {
    pub initialized: bool,
    pub loaded_module_count: usize,
    pub active_flow_count: usize,
    pub health: Health,
}

pub type ActivationFn = Arc<dyn Fn(&ModuleContext) -> anyhow::Result<()> + Send + Sync>;

struct Activation {
    name: String,
    requires: Vec<String>,
    callback: ActivationFn,
    fired: bool,
}

#[derive(Default)]
struct ActivationState {
    ready: HashSet<String>,
    activations: Vec<Activation>,
}

impl ActivationState {
    /// Mark every unfired activation whose modules are all ready as fired and hand it out.
    fn take_due(&mut self) -> Vec<(String, ActivationFn)> {
        let ready = &self.ready;
        self.activations
            .iter_mut()
            .filter(|a| !a.fired && a.requires.iter().all(|r| ready.contains(r)))
            .map(|a| {
                a.fired = true;
                (a.name.clone(), a.callback.clone())
            })
            .collect()
    }
}

/// Top-level coordinator: boots the modules, verifies cross-module flows,
/// runs the consistency monitor and classifies errors.
pub struct Orchestrator {
    bus: Arc<EventBus>,
    state: Arc<StateStore>,
    resolver: Arc<DependencyResolver>,
    router: Arc<FlowRouter>,
    config: CoreConfig,
    probes: Mutex<Vec<IntegrationProbe>>,
    boot: OnceCell<Result<BootReport, OrchestratorError>>,
    checker: Arc<ConsistencyChecker>,
    monitor: Mutex<Option<ConsistencyMonitor>>,
    classifier: Arc<ErrorClassifier>,
    activations: Mutex<ActivationState>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        state: Arc<StateStore>,
        resolver: Arc<DependencyResolver>,
        router: Arc<FlowRouter>,
        config: CoreConfig,
    ) -> Arc<Self> {
        let checker = ConsistencyChecker::new(bus.clone(), state.clone(), config.max_insights_per_entry);
        let classifier = ErrorClassifier::new(bus.clone());
        let orchestrator = Arc::new(Self {
            bus,
            state,
            resolver,
            router,
            config,
            probes: Mutex::new(Vec::new()),
            boot: OnceCell::new(),
            checker,
            monitor: Mutex::new(None),
            classifier,
            activations: Mutex::new(ActivationState::default()),
            subscriptions: Mutex::new(Vec::new()),
        });
        orchestrator.attach();
        orchestrator
    }

    fn attach(self: &Arc<Self>) {
        self.classifier.attach();

        let weak: Weak<Self> = Arc::downgrade(self);
        let sub = self.bus.subscribe(Topic::Wildcard, move |event: &Event| {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.on_lifecycle_event(event);
            }
            Ok(())
        });
        lock(&self.subscriptions).push(sub);
    }

    pub fn context(&self) -> ModuleContext {
        ModuleContext::new(self.bus.clone(), self.state.clone())
    }

    pub fn add_probe(&self, probe: IntegrationProbe) {
        lock(&self.probes).push(probe);
    }

    pub fn register_recovery_hook<F>(&self, kind: RecoveryKind, hook: F)
    where
        F: Fn(&ErrorReport) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.classifier.register_hook(kind, hook);
    }

    /// Run `callback` once every module in `requires` has reported ready.
    /// It runs again if one of them is disabled and comes back.
    pub fn register_activation<I, S, F>(&self, name: impl Into<String>, requires: I, callback: F)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&ModuleContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let due = {
            let mut state = lock(&self.activations);
            state.activations.push(Activation {
                name: name.into(),
                requires: requires.into_iter().map(Into::into).collect(),
                callback: Arc::new(callback),
                fired: false,
            });
            state.take_due()
        };
        self.fire(due);
    }

    fn on_lifecycle_event(&self, event: &Event) {
        let due = match event.kind() {
            EventKind::FeatureReady(name) => {
                let mut state = lock(&self.activations);
                state.ready.insert(name.clone());
                state.take_due()
            }
            EventKind::FeatureDisabled(name) => {
                let mut state = lock(&self.activations);
                state.ready.remove(name);
                for a in state.activations.iter_mut() {
                    if a.requires.iter().any(|r| r == name) {
                        a.fired = false;
                    }
                }
                Vec::new()
            }
            _ => Vec::new(),
        };
        self.fire(due);
    }

    fn fire(&self, due: Vec<(String, ActivationFn)>) {
        let ctx = self.context();
        for (name, callback) in due {
            let outcome = match catch_unwind(AssertUnwindSafe(|| callback(&ctx))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(format!("{:#}", err)),
                Err(panic) => Err(format!("activation panicked: {}", panic_message(panic.as_ref()))),
            };
            match outcome {
                Ok(()) => {
                    info!(activation = %name, "activation fired");
                    self.bus
                        .emit(EventKind::FeatureActivated(name.clone()), json!({ "activation": name }), ORCHESTRATOR_SOURCE);
                }
                Err(reason) => {
                    error!(activation = %name, %reason, "activation failed");
                    let report = ErrorReport::new(ErrorKind::FeatureLoad, reason)
                        .with_context(json!({ "activation": name }));
                    self.bus.emit(EventKind::ErrorOccurred, report.to_value(), ORCHESTRATOR_SOURCE);
                }
            }
        }
    }

    /// Boot once. Concurrent and repeated callers share the first attempt
    /// and all observe its outcome, failures included.
    pub async fn initialize(&self) -> Result<BootReport, OrchestratorError> {
        self.boot.get_or_init(|| self.boot_sequence()).await.clone()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.boot.get(), Some(Ok(_)))
    }

    async fn boot_sequence(&self) -> Result<BootReport, OrchestratorError> {
        let started = Instant::now();
        info!("orchestrator boot starting");

        let result = self.boot_steps().await;
        match &result {
            Ok(report) => {
                info!(
                    loaded = report.load.loaded.len(),
                    failed = report.load.failed.len(),
                    elapsed = ?started.elapsed(),
                    "integration complete"
                );
                self.bus.emit(
                    EventKind::SystemReady,
                    json!({
                        "loaded": report.load.loaded,
                        "failed": report.load.failed.iter().map(|(m, _)| m).collect::<Vec<_>>(),
                        "probes": report.probes_passed,
                        "elapsed_ms": started.elapsed().as_millis() as u64,
                    }),
                    ORCHESTRATOR_SOURCE,
                );
            }
            Err(err) => {
                error!(error = %err, "orchestrator boot failed");
                self.bus
                    .emit(EventKind::SystemFailed, json!({ "error": err.to_string() }), ORCHESTRATOR_SOURCE);
            }
        }
        result
    }

    async fn boot_steps(&self) -> Result<BootReport, OrchestratorError> {
        // 1) graph check before anything loads
        self.resolver.validate()?;

        // 2) sequential loading loop
        let load = self.resolver.initialize_all(&self.context()).await?;

        // 3) integration probes, concurrently
        let probes = lock(&self.probes).clone();
        let timeout = self.config.probe_timeout();
        let outcomes = join_all(probes.iter().map(|p| run_probe(&self.bus, p, timeout))).await;

        let mut passed = Vec::new();
        let mut failed = Vec::new();
        for (probe, outcome) in probes.iter().zip(outcomes) {
            match outcome {
                Ok(_) => passed.push(probe.name.clone()),
                Err(failure) => failed.push(failure),
            }
        }
        if !failed.is_empty() {
            warn!(failed = ?failed, "integration probes failed");
            return Err(OrchestratorError::IntegrationVerificationFailed { failed });
        }

        // 4) background consistency checks
        self.start_monitor();

        Ok(BootReport {
            load,
            probes_passed: passed,
        })
    }

    fn start_monitor(&self) {
        let mut slot = lock(&self.monitor);
        if slot.is_some() {
            return;
        }
        *slot = Some(ConsistencyMonitor::start(
            &self.bus,
            self.checker.clone(),
            self.config.consistency_interval(),
            self.config.consistency_debounce(),
        ));
    }

    /// Disable, pause, enable and reload one module.
    pub async fn reinitialize_module(&self, name: &str) -> Result<(), OrchestratorError> {
        info!(module = %name, "reinitializing module");
        self.resolver.disable(name)?;
        tokio::time::sleep(self.config.reinit_pause()).await;
        self.resolver.enable(name)?;
        self.resolver.load_module(name, &self.context()).await?;
        self.bus.emit(
            EventKind::FeatureReinitialized(name.to_string()),
            json!({ "module": name }),
            ORCHESTRATOR_SOURCE,
        );
        Ok(())
    }

    /// Run the consistency check right now, outside the schedule.
    pub fn check_consistency(&self) -> ConsistencyReport {
        self.checker.run()
    }

    pub fn last_consistency_report(&self) -> Option<ConsistencyReport> {
        self.checker.last_report()
    }

    pub fn get_status(&self) -> IntegrationStatus {
        let initialized = self.is_initialized();
        let readiness = self.resolver.get_readiness();
        let consistent = self.last_consistency_report().map(|r| r.consistent).unwrap_or(true);

        let health = if !initialized || !readiness.critical_loaded {
            Health::Error
        } else if readiness.loaded_count >= readiness.total_count && consistent {
            Health::Healthy
        } else {
            Health::Warning
        };

        IntegrationStatus {
            initialized,
            loaded_module_count: readiness.loaded_count,
            active_flow_count: self.router.active_flow_count(),
            health,
        }
    }

    /// Stop background checks and drop bus listeners.
    pub fn shutdown(&self) {
        if let Some(monitor) = lock(&self.monitor).take() {
            monitor.stop();
        }
        for sub in lock(&self.subscriptions).drain(..) {
            sub.unsubscribe();
        }
        self.classifier.detach();
        info!("orchestrator shut down");
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("status", &self.get_status())
            .field("probes", &lock(&self.probes).len())
            .finish()
    }
}

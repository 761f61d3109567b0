// src/flow/router.rs

use std::{
    collections::HashSet,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::{
    bus::{panic_message, EventBus, Subscription, Topic},
    event::{ErrorKind, ErrorReport, Event, EventKind},
};

use super::{
    definition::load_flow_specs,
    edge::{edge_id, EdgeTransform, FlowEdge, FlowInfo, FlowTarget},
};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("no flow edge {from}→{to}")]
    UnknownEdge { from: String, to: String },
    #[error("invalid flow edge: {0}")]
    InvalidEdge(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// What one `process` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowOutcome {
    /// targets that received a `flow:<target>` event, in delivery order
    pub delivered: Vec<String>,
    /// (edge id, reason) for every edge that failed
    pub failed: Vec<(String, String)>,
}

/// Registry of `source → target` edges. Routed payloads are emitted on the bus
/// as `flow:<target>` with source `flow:<edge source>`.
pub struct FlowRouter {
    /// registration order is processing order
    edges: Mutex<Vec<FlowEdge>>,
    /// fallback transforms keyed by (source, target category)
    global_transforms: DashMap<(String, String), EdgeTransform>,
    network_targets: HashSet<String>,
    online: AtomicBool,
    bus: Arc<EventBus>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl FlowRouter {
    pub fn new<I, S>(bus: Arc<EventBus>, network_targets: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            edges: Mutex::new(Vec::new()),
            global_transforms: DashMap::new(),
            network_targets: network_targets.into_iter().map(Into::into).collect(),
            online: AtomicBool::new(true),
            bus,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    fn edges(&self) -> MutexGuard<'_, Vec<FlowEdge>> {
        self.edges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert keyed by `source→target`. A replaced edge keeps its position.
    pub fn register_flow(&self, edge: FlowEdge) -> Result<(), FlowError> {
        if edge.source.trim().is_empty() {
            return Err(FlowError::InvalidEdge("source is empty".into()));
        }
        if let FlowTarget::Module(name) = &edge.target {
            if name.trim().is_empty() {
                return Err(FlowError::InvalidEdge(format!("empty target for source {}", edge.source)));
            }
        }

        let id = edge.id();
        let mut edges = self.edges();
        match edges.iter_mut().find(|e| e.id() == id) {
            Some(existing) => {
                *existing = edge;
                debug!(edge = %id, "flow edge replaced");
            }
            None => {
                edges.push(edge);
                debug!(edge = %id, "flow edge registered");
            }
        }
        Ok(())
    }

    /// Register every edge listed in a JSON or YAML flow file. Returns the
    /// number of edges read.
    pub fn load_flows_from_file(&self, path: impl AsRef<Path>) -> Result<usize, FlowError> {
        let specs = load_flow_specs(path.as_ref())?;
        let count = specs.len();
        for spec in specs {
            self.register_flow(spec.into_edge())?;
        }
        info!(path = %path.as_ref().display(), count, "flow file loaded");
        Ok(count)
    }

    /// Fallback transform for edges without their own, keyed by the edge
    /// source and the category of its target.
    pub fn register_global_transform(
        &self,
        source: impl Into<String>,
        target_category: impl Into<String>,
        transform: impl Into<EdgeTransform>,
    ) {
        self.global_transforms
            .insert((source.into(), target_category.into()), transform.into());
    }

    /// Route `data` along every enabled edge leaving `source`.
    ///
    /// Each edge is isolated: a failing transform is reported as a
    /// `data-flow` error and the remaining edges still run.
    pub fn process(&self, source: &str, data: &Value) -> FlowOutcome {
        // snapshot under the lock, deliver without it
        let (matching, registered_targets): (Vec<FlowEdge>, Vec<String>) = {
            let edges = self.edges();
            let matching = edges.iter().filter(|e| e.enabled && e.source == source).cloned().collect();
            let mut targets: Vec<String> = Vec::new();
            for edge in edges.iter() {
                if let FlowTarget::Module(name) = &edge.target {
                    if !targets.contains(name) {
                        targets.push(name.clone());
                    }
                }
            }
            (matching, targets)
        };

        let mut outcome = FlowOutcome::default();
        if matching.is_empty() {
            trace!(%source, "no enabled flow edges");
            return outcome;
        }

        for edge in matching {
            let id = edge.id();
            match self.transform(&edge, data) {
                Ok(payload) => {
                    let targets: Vec<String> = match &edge.target {
                        FlowTarget::Module(name) => vec![name.clone()],
                        FlowTarget::All => registered_targets
                            .iter()
                            .filter(|t| t.as_str() != source)
                            .cloned()
                            .collect(),
                    };
                    for target in targets {
                        self.bus.emit(
                            EventKind::DataFlow(target.clone()),
                            payload.clone(),
                            format!("flow:{}", source),
                        );
                        outcome.delivered.push(target);
                    }
                }
                Err(reason) => {
                    warn!(edge = %id, %reason, "flow edge failed");
                    let report = ErrorReport::new(ErrorKind::DataFlow, reason.clone()).with_context(json!({
                        "edge": id,
                        "source": edge.source,
                        "target": edge.target,
                    }));
                    self.bus.emit(EventKind::ErrorOccurred, report.to_value(), "router");
                    outcome.failed.push((id, reason));
                }
            }
        }
        outcome
    }

    fn transform(&self, edge: &FlowEdge, data: &Value) -> Result<Value, String> {
        let global;
        let transform = match &edge.transform {
            Some(t) => Some(t),
            None => {
                let key = (edge.source.clone(), edge.target.category().to_string());
                global = self.global_transforms.get(&key).map(|t| t.value().clone());
                global.as_ref()
            }
        };
        let Some(transform) = transform else {
            return Ok(data.clone());
        };

        match catch_unwind(AssertUnwindSafe(|| transform.apply(data))) {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(err)) => Err(format!("{:#}", err)),
            Err(panic) => Err(format!("transform panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    fn set_enabled(&self, source: &str, target: &str, enabled: bool) -> Result<(), FlowError> {
        let id = edge_id(source, target);
        let mut edges = self.edges();
        let edge = edges.iter_mut().find(|e| e.id() == id).ok_or_else(|| FlowError::UnknownEdge {
            from: source.to_string(),
            to: target.to_string(),
        })?;
        edge.enabled = enabled;
        debug!(edge = %id, enabled, "flow edge toggled");
        Ok(())
    }

    pub fn enable(&self, source: &str, target: &str) -> Result<(), FlowError> {
        self.set_enabled(source, target, true)
    }

    pub fn disable(&self, source: &str, target: &str) -> Result<(), FlowError> {
        self.set_enabled(source, target, false)
    }

    /// Every registered edge, enabled or not, in registration order.
    pub fn get_active_flows(&self) -> Vec<FlowInfo> {
        self.edges().iter().map(FlowInfo::from).collect()
    }

    pub fn active_flow_count(&self) -> usize {
        self.edges().iter().filter(|e| e.enabled).count()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn is_network_target(&self, target: &FlowTarget) -> bool {
        self.network_targets.contains(target.as_str()) || self.network_targets.contains(target.category())
    }

    /// Disable every edge whose target needs connectivity.
    pub fn on_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        let mut disabled = Vec::new();
        for edge in self.edges().iter_mut() {
            if self.is_network_target(&edge.target) && edge.enabled {
                edge.enabled = false;
                disabled.push(edge.id());
            }
        }
        info!(edges = ?disabled, "offline: network flows disabled");
    }

    /// Re-enable every registered edge, including ones disabled by hand
    /// before going offline.
    pub fn on_online(&self) {
        self.online.store(true, Ordering::SeqCst);
        let mut edges = self.edges();
        for edge in edges.iter_mut() {
            edge.enabled = true;
        }
        info!(count = edges.len(), "online: all flows enabled");
    }

    /// Wire the router to the bus: domain events feed `process`,
    /// connectivity events toggle network edges. Attaching twice is a no-op.
    pub fn attach(self: &Arc<Self>) {
        let mut subs = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        if !subs.is_empty() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let sub = self.bus.subscribe(Topic::Wildcard, move |event: &Event| {
            let Some(router) = weak.upgrade() else {
                return Ok(());
            };
            router.on_event(event);
            Ok(())
        });
        subs.push(sub);
        debug!("flow router attached to bus");
    }

    pub fn detach(&self) {
        let subs = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        for sub in subs {
            sub.unsubscribe();
        }
    }

    fn on_event(&self, event: &Event) {
        match event.kind() {
            EventKind::ConnectivityOffline => self.on_offline(),
            EventKind::ConnectivityOnline => self.on_online(),
            kind => {
                if let Some(source) = kind.flow_source() {
                    self.process(source, event.data());
                }
            }
        }
    }
}

impl fmt::Debug for FlowRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRouter")
            .field("edges", &self.get_active_flows())
            .field("network_targets", &self.network_targets)
            .field("online", &self.is_online())
            .finish()
    }
}

impl Drop for FlowRouter {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::mapper::{Mapper, ScriptMapper};
    use std::sync::Mutex as StdMutex;

    fn setup() -> (Arc<EventBus>, Arc<FlowRouter>) {
        let bus = EventBus::with_defaults();
        let router = FlowRouter::new(bus.clone(), ["ai", "calendar", "sync"]);
        (bus, router)
    }

    fn received(bus: &Arc<EventBus>, target: &str) -> Vec<Value> {
        bus.get_history_by_kind(&EventKind::DataFlow(target.into()))
            .iter()
            .map(|e| e.data().clone())
            .collect()
    }

    #[test]
    fn test_only_enabled_edges_route() {
        let (bus, router) = setup();
        router.register_flow(FlowEdge::new("energy", "charts")).unwrap();
        router.register_flow(FlowEdge::new("energy", "insights")).unwrap();
        router.register_flow(FlowEdge::new("energy", "ai").disabled()).unwrap();

        let outcome = router.process("energy", &json!({ "level": 4 }));
        assert_eq!(outcome.delivered, vec!["charts", "insights"]);
        assert_eq!(received(&bus, "charts"), vec![json!({ "level": 4 })]);
        assert!(received(&bus, "ai").is_empty());
        let flow_event = &bus.get_history_by_kind(&EventKind::DataFlow("charts".into()))[0];
        assert_eq!(flow_event.source(), "flow:energy");
    }

    #[test]
    fn test_register_is_upsert() {
        let (_bus, router) = setup();
        router.register_flow(FlowEdge::new("energy", "charts")).unwrap();
        router.register_flow(FlowEdge::new("energy", "insights")).unwrap();
        router
            .register_flow(FlowEdge::new("energy", "charts").with_fn(|v| Ok(v.clone())))
            .unwrap();
        let flows = router.get_active_flows();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].id, "energy→charts");
        assert!(flows[0].has_transform);
        assert!(router.register_flow(FlowEdge::new(" ", "charts")).is_err());
    }

    #[test]
    fn test_failing_transform_is_isolated() {
        let (bus, router) = setup();
        router
            .register_flow(FlowEdge::new("social", "charts").with_fn(|_| anyhow::bail!("bad shape")))
            .unwrap();
        router
            .register_flow(FlowEdge::new("social", "ai").with_fn(|_| panic!("exploded")))
            .unwrap();
        router.register_flow(FlowEdge::new("social", "insights")).unwrap();

        let outcome = router.process("social", &json!({}));
        assert_eq!(outcome.delivered, vec!["insights"]);
        assert_eq!(outcome.failed.len(), 2);
        assert!(outcome.failed[1].1.contains("exploded"));

        let errors = bus.get_history_by_kind(&EventKind::ErrorOccurred);
        assert_eq!(errors.len(), 2);
        let report = ErrorReport::from_value(errors[0].data());
        assert_eq!(report.kind, ErrorKind::DataFlow);
        assert_eq!(report.context["edge"], "social→charts");
    }

    #[test]
    fn test_global_transform_by_category() {
        let (bus, router) = setup();
        router.register_flow(FlowEdge::new("energy", "charts-weekly")).unwrap();
        router
            .register_flow(FlowEdge::new("energy", "charts-daily").with_fn(|_| Ok(json!("own"))))
            .unwrap();
        router.register_global_transform(
            "energy",
            "charts",
            Mapper::Script(ScriptMapper::new(r#"{ "point": {{level}} }"#)),
        );

        router.process("energy", &json!({ "level": 9 }));
        assert_eq!(received(&bus, "charts-weekly"), vec![json!({ "point": 9 })]);
        assert_eq!(received(&bus, "charts-daily"), vec![json!("own")]);
    }

    #[test]
    fn test_broadcast_reaches_other_registered_targets() {
        let (bus, router) = setup();
        router.register_flow(FlowEdge::new("energy", "charts")).unwrap();
        router.register_flow(FlowEdge::new("energy", "sync")).unwrap();
        router.register_flow(FlowEdge::new("insights", "notifications")).unwrap();
        router.register_flow(FlowEdge::new("sync", FlowTarget::All)).unwrap();

        let outcome = router.process("sync", &json!({ "pulled": 3 }));
        assert_eq!(outcome.delivered, vec!["charts", "notifications"]);
        assert!(received(&bus, "sync").is_empty());
    }

    #[test]
    fn test_offline_online_reenables_everything() {
        let (_bus, router) = setup();
        router.register_flow(FlowEdge::new("energy", "charts")).unwrap();
        router.register_flow(FlowEdge::new("energy", "ai")).unwrap();
        router.register_flow(FlowEdge::new("energy", "ai-coach")).unwrap();
        router.register_flow(FlowEdge::new("social", "insights")).unwrap();
        router.disable("social", "insights").unwrap();

        router.on_offline();
        assert!(!router.is_online());
        let enabled: Vec<String> = router
            .get_active_flows()
            .into_iter()
            .filter(|f| f.enabled)
            .map(|f| f.id)
            .collect();
        assert_eq!(enabled, vec!["energy→charts"]);

        router.on_online();
        // manual disable before going offline is overridden too
        assert!(router.get_active_flows().iter().all(|f| f.enabled));
        assert_eq!(router.active_flow_count(), 4);
    }

    #[test]
    fn test_toggle_unknown_edge() {
        let (_bus, router) = setup();
        assert!(matches!(
            router.enable("energy", "nowhere"),
            Err(FlowError::UnknownEdge { .. })
        ));
    }

    #[test]
    fn test_attach_routes_bus_events() {
        let (bus, router) = setup();
        router.register_flow(FlowEdge::new("energy", "charts")).unwrap();
        router.register_flow(FlowEdge::new("energy", "ai")).unwrap();
        router.attach();
        router.attach();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_in = seen.clone();
        let _sub = bus.subscribe(EventKind::DataFlow("charts".into()), move |e: &Event| {
            seen_in.lock().unwrap().push(e.data().clone());
            Ok(())
        });

        bus.emit(EventKind::EntryLogged(crate::event::Collection::Energy), json!({ "id": "1" }), "test");
        assert_eq!(seen.lock().unwrap().len(), 1);

        bus.emit(EventKind::ConnectivityOffline, json!({}), "test");
        assert!(!router.is_online());
        bus.emit(EventKind::EntryLogged(crate::event::Collection::Energy), json!({ "id": "2" }), "test");
        assert_eq!(received(&bus, "ai").len(), 1);

        bus.emit(EventKind::ConnectivityOnline, json!({}), "test");
        assert!(router.is_online());

        router.detach();
        bus.emit(EventKind::EntryLogged(crate::event::Collection::Energy), json!({ "id": "3" }), "test");
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}

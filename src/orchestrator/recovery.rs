// src/orchestrator/recovery.rs

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError, Weak},
};

use dashmap::DashMap;
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    bus::{panic_message, EventBus, Subscription},
    event::{ErrorKind, ErrorReport, Event, EventKind, RecoveryKind},
};

const RECOVERY_SOURCE: &str = "recovery";

/// Host-supplied remediation, run after the recovery notice is emitted.
pub type RecoveryHook = Arc<dyn Fn(&ErrorReport) -> anyhow::Result<()> + Send + Sync>;

pub fn classify(kind: &ErrorKind) -> Option<RecoveryKind> {
    match kind {
        ErrorKind::DataFlow => Some(RecoveryKind::DataFlow),
        ErrorKind::FeatureLoad => Some(RecoveryKind::FeatureLoad),
        ErrorKind::DataConsistency => Some(RecoveryKind::DataConsistency),
        ErrorKind::Other(_) => None,
    }
}

/// Relabels every `error:occurred` as a recovery notice (or as unclassified).
/// It retries nothing by itself; hooks are where remediation goes.
pub struct ErrorClassifier {
    bus: Arc<EventBus>,
    hooks: DashMap<RecoveryKind, Vec<RecoveryHook>>,
    subscription: Mutex<Option<Subscription>>,
}

impl ErrorClassifier {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            hooks: DashMap::new(),
            subscription: Mutex::new(None),
        })
    }

    pub fn register_hook<F>(&self, kind: RecoveryKind, hook: F)
    where
        F: Fn(&ErrorReport) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.entry(kind).or_default().push(Arc::new(hook));
    }

    pub fn attach(self: &Arc<Self>) {
        let mut slot = self.subscription.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(self.bus.subscribe(EventKind::ErrorOccurred, move |event: &Event| {
            if let Some(classifier) = weak.upgrade() {
                classifier.handle(event);
            }
            Ok(())
        }));
    }

    pub fn detach(&self) {
        if let Some(sub) = self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sub.unsubscribe();
        }
    }

    /// Classify one error event. Returns the recovery kind it was filed under.
    pub fn handle(&self, event: &Event) -> Option<RecoveryKind> {
        let report = ErrorReport::from_value(event.data());
        let Some(kind) = classify(&report.kind) else {
            warn!(
                kind = report.kind.as_str(),
                message = %report.message,
                origin = event.source(),
                "unclassified error"
            );
            self.bus.emit(
                EventKind::ErrorUnclassified,
                json!({ "error": report.to_value(), "origin": event.source() }),
                RECOVERY_SOURCE,
            );
            return None;
        };

        info!(kind = kind.as_str(), message = %report.message, "recovery attempt");
        self.bus.emit(
            EventKind::RecoveryAttempt(kind),
            json!({ "error": report.to_value(), "origin": event.source() }),
            RECOVERY_SOURCE,
        );

        let hooks: Vec<RecoveryHook> = self.hooks.get(&kind).map(|h| h.value().clone()).unwrap_or_default();
        for hook in hooks {
            match catch_unwind(AssertUnwindSafe(|| hook(&report))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(kind = kind.as_str(), error = %err, "recovery hook failed"),
                Err(panic) => error!(
                    kind = kind.as_str(),
                    panic = %panic_message(panic.as_ref()),
                    "recovery hook panicked"
                ),
            }
        }
        Some(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<EventBus>, Arc<ErrorClassifier>) {
        let bus = EventBus::with_defaults();
        let classifier = ErrorClassifier::new(bus.clone());
        classifier.attach();
        (bus, classifier)
    }

    fn raise(bus: &EventBus, kind: ErrorKind) {
        bus.emit(EventKind::ErrorOccurred, ErrorReport::new(kind, "boom").to_value(), "test");
    }

    #[test]
    fn test_each_known_type_is_relabelled() {
        let (bus, _classifier) = setup();
        raise(&bus, ErrorKind::DataFlow);
        raise(&bus, ErrorKind::FeatureLoad);
        raise(&bus, ErrorKind::DataConsistency);
        for kind in [RecoveryKind::DataFlow, RecoveryKind::FeatureLoad, RecoveryKind::DataConsistency] {
            assert_eq!(bus.get_history_by_kind(&EventKind::RecoveryAttempt(kind)).len(), 1);
        }
        assert!(bus.get_history_by_kind(&EventKind::ErrorUnclassified).is_empty());
    }

    #[test]
    fn test_type_alone_is_enough_to_classify() {
        let (bus, _classifier) = setup();
        bus.emit(
            EventKind::ErrorOccurred,
            json!({ "type": "data-flow", "edge": "energy→ai" }),
            "host",
        );
        assert_eq!(
            bus.get_history_by_kind(&EventKind::RecoveryAttempt(RecoveryKind::DataFlow)).len(),
            1
        );
        assert!(bus.get_history_by_kind(&EventKind::ErrorUnclassified).is_empty());
    }

    #[test]
    fn test_unknown_and_malformed_errors_are_unclassified() {
        let (bus, _classifier) = setup();
        raise(&bus, ErrorKind::Other("network".into()));
        bus.emit(EventKind::ErrorOccurred, json!("not a report"), "test");
        assert_eq!(bus.get_history_by_kind(&EventKind::ErrorUnclassified).len(), 2);
    }

    #[test]
    fn test_hooks_run_for_their_kind_only() {
        let (bus, classifier) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        classifier.register_hook(RecoveryKind::DataFlow, move |report| {
            assert_eq!(report.message, "boom");
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        classifier.register_hook(RecoveryKind::DataFlow, |_| anyhow::bail!("hook failed"));

        raise(&bus, ErrorKind::DataFlow);
        raise(&bus, ErrorKind::FeatureLoad);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        classifier.detach();
        raise(&bus, ErrorKind::DataFlow);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

// src/orchestrator/probe.rs

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, warn};

use crate::{
    bus::EventBus,
    event::{Collection, Event, EventKind},
};

const PROBE_SOURCE: &str = "integration-probe";

/// Emits `trigger` and waits for `expect` to show up on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationProbe {
    pub name: String,
    pub trigger: EventKind,
    pub payload: Value,
    pub expect: EventKind,
}

impl IntegrationProbe {
    pub fn new(name: impl Into<String>, trigger: EventKind, expect: EventKind) -> Self {
        let name = name.into();
        Self {
            payload: json!({ "probe": true, "id": format!("probe-{}", name) }),
            name,
            trigger,
            expect,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeFailure {
    pub probe: String,
    pub reason: String,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.probe, self.reason)
    }
}

/// energy entry reaches the charts, social entry reaches the insights, and
/// the bus delivers at all.
pub fn default_probes() -> Vec<IntegrationProbe> {
    vec![
        IntegrationProbe::new(
            "energy-chart-flow",
            EventKind::EntryLogged(Collection::Energy),
            EventKind::DataFlow("charts".into()),
        ),
        IntegrationProbe::new(
            "social-insight-flow",
            EventKind::EntryLogged(Collection::Social),
            EventKind::DataFlow("insights".into()),
        ),
        IntegrationProbe::new(
            "event-bus",
            EventKind::custom("integration:ping"),
            EventKind::custom("integration:ping"),
        ),
    ]
}

/// Run one probe. Returns how long the expected event took to arrive.
pub async fn run_probe(
    bus: &Arc<EventBus>,
    probe: &IntegrationProbe,
    timeout: Duration,
) -> Result<Duration, ProbeFailure> {
    let (tx, rx) = oneshot::channel::<()>();
    let tx = Mutex::new(Some(tx));
    let sub = bus.subscribe(probe.expect.clone(), move |_event: &Event| {
        if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
        Ok(())
    });

    let started = Instant::now();
    debug!(probe = %probe.name, trigger = %probe.trigger, expect = %probe.expect, "probe started");
    bus.emit(probe.trigger.clone(), probe.payload.clone(), PROBE_SOURCE);

    let outcome = tokio::time::timeout(timeout, rx).await;
    sub.unsubscribe();

    match outcome {
        Ok(Ok(())) => {
            let elapsed = started.elapsed();
            debug!(probe = %probe.name, ?elapsed, "probe passed");
            Ok(elapsed)
        }
        Ok(Err(_)) => Err(ProbeFailure {
            probe: probe.name.clone(),
            reason: "listener dropped".into(),
        }),
        Err(_) => {
            warn!(probe = %probe.name, ?timeout, expect = %probe.expect, "probe timed out");
            Err(ProbeFailure {
                probe: probe.name.clone(),
                reason: format!("no {} within {:?}", probe.expect, timeout),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_probe_passes_on_bare_bus() {
        let bus = EventBus::with_defaults();
        let probes = default_probes();
        let probe = &probes[2];
        run_probe(&bus, probe, Duration::from_millis(50)).await.unwrap();
        assert_eq!(bus.listener_count(&probe.expect.clone().into()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_probe_times_out_without_router() {
        let bus = EventBus::with_defaults();
        let probes = default_probes();
        let probe = &probes[0];
        let err = run_probe(&bus, probe, Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.probe, "energy-chart-flow");
        assert!(err.reason.contains("flow:charts"));
    }

    #[tokio::test]
    async fn test_probe_passes_when_downstream_answers() {
        let bus = EventBus::with_defaults();
        let relay = Arc::downgrade(&bus);
        let _sub = bus.subscribe(EventKind::EntryLogged(Collection::Social), move |e: &Event| {
            if let Some(bus) = relay.upgrade() {
                bus.emit(EventKind::DataFlow("insights".into()), e.data().clone(), "test");
            }
            Ok(())
        });
        run_probe(&bus, &default_probes()[1], Duration::from_millis(50)).await.unwrap();
    }
}

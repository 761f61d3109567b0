// src/orchestrator/consistency.rs

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, sleep, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bus::{EventBus, Subscription, Topic},
    event::{ErrorKind, ErrorReport, Event, EventKind},
    state::{RecordCounts, StateStore},
};

const CONSISTENCY_SOURCE: &str = "consistency";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub counts: RecordCounts,
    pub consistent: bool,
    pub violations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Aggregate-count invariant: when any entries exist, insights stay within
/// `max_insights_per_entry` per entry. Counts are unsigned, so they are
/// never negative.
pub fn check_counts(counts: RecordCounts, max_insights_per_entry: usize) -> ConsistencyReport {
    let mut violations = Vec::new();
    let entries = counts.entries();
    if entries > 0 {
        let bound = entries.saturating_mul(max_insights_per_entry);
        if counts.insights > bound {
            violations.push(format!(
                "{} insights for {} entries exceeds {} per entry",
                counts.insights, entries, max_insights_per_entry
            ));
        }
    }
    ConsistencyReport {
        counts,
        consistent: violations.is_empty(),
        violations,
        checked_at: Utc::now(),
    }
}

/// Runs the check against the store and publishes the outcome.
pub struct ConsistencyChecker {
    bus: Arc<EventBus>,
    state: Arc<StateStore>,
    max_insights_per_entry: usize,
    last: Mutex<Option<ConsistencyReport>>,
}

impl ConsistencyChecker {
    pub fn new(bus: Arc<EventBus>, state: Arc<StateStore>, max_insights_per_entry: usize) -> Arc<Self> {
        Arc::new(Self {
            bus,
            state,
            max_insights_per_entry,
            last: Mutex::new(None),
        })
    }

    pub fn run(&self) -> ConsistencyReport {
        let report = check_counts(self.state.counts(), self.max_insights_per_entry);
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());

        self.bus.emit(
            EventKind::ConsistencyChecked,
            json!({ "consistent": report.consistent, "counts": report.counts }),
            CONSISTENCY_SOURCE,
        );
        if !report.consistent {
            warn!(violations = ?report.violations, "consistency warning");
            self.bus.emit(
                EventKind::ConsistencyWarning,
                json!({ "violations": report.violations, "counts": report.counts }),
                CONSISTENCY_SOURCE,
            );
            let error = ErrorReport::new(ErrorKind::DataConsistency, report.violations.join("; "))
                .with_context(json!({ "counts": report.counts }));
            self.bus.emit(EventKind::ErrorOccurred, error.to_value(), CONSISTENCY_SOURCE);
        } else {
            debug!(counts = ?report.counts, "consistency ok");
        }
        report
    }

    pub fn last_report(&self) -> Option<ConsistencyReport> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Owns the scheduled consistency checks: a fixed-interval one and a
/// debounced one fed by bus activity. Stopping (or dropping) cancels both.
pub struct ConsistencyMonitor {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    activity: Subscription,
}

impl ConsistencyMonitor {
    /// Must be called from inside a tokio runtime.
    pub fn start(
        bus: &Arc<EventBus>,
        checker: Arc<ConsistencyChecker>,
        every: Duration,
        debounce: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel::<()>();

        // monitoring output never counts as activity, or every check would
        // schedule the next one
        let activity = bus.subscribe(Topic::Wildcard, move |event: &Event| {
            if !event.kind().is_monitoring() {
                let _ = tx.send(());
            }
            Ok(())
        });

        let handles = vec![
            tokio::spawn(periodic_loop(checker.clone(), every, token.clone())),
            tokio::spawn(debounced_loop(checker, debounce, rx, token.clone())),
        ];
        info!(?every, ?debounce, "consistency monitor started");

        Self {
            token,
            handles,
            activity,
        }
    }

    pub fn stop(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.activity.unsubscribe();
        self.token.cancel();
        for handle in &self.handles {
            handle.abort();
        }
        info!("consistency monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for ConsistencyMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ConsistencyMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsistencyMonitor")
            .field("running", &self.is_running())
            .finish()
    }
}

async fn periodic_loop(checker: Arc<ConsistencyChecker>, every: Duration, token: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                checker.run();
            }
        }
    }
}

async fn debounced_loop(
    checker: Arc<ConsistencyChecker>,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<()>,
    token: CancellationToken,
) {
    loop {
        // 1) wait for the first burst signal
        tokio::select! {
            _ = token.cancelled() => return,
            msg = rx.recv() => if msg.is_none() { return },
        }

        // 2) extend the quiet period while activity keeps coming
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                msg = rx.recv() => if msg.is_none() { return },
                _ = sleep(debounce) => {
                    checker.run();
                    break;
                }
            }
        }
    }
}

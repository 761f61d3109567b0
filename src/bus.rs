// src/bus.rs

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    thread::{self, ThreadId},
};

use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::event::{Event, EventKind, SharedEvent};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_MAX_EMIT_DEPTH: usize = 16;

/// A listener gets every matching event. Returning `Err` (or panicking) is
/// logged and never stops delivery to the remaining listeners.
pub type Listener = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// What a subscription listens to: one kind, or everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Kind(EventKind),
    Wildcard,
}

impl From<EventKind> for Topic {
    fn from(kind: EventKind) -> Self {
        Topic::Kind(kind.normalized())
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        if name == "*" {
            Topic::Wildcard
        } else {
            Topic::Kind(EventKind::from(name))
        }
    }
}

/// Marks one active delivery of `bus` on the current thread.
struct DepthGuard<'a> {
    bus: &'a EventBus,
    thread: ThreadId,
}

impl<'a> DepthGuard<'a> {
    fn enter(bus: &'a EventBus) -> Self {
        let thread = thread::current().id();
        *bus.lock_depths().entry(thread).or_insert(0) += 1;
        DepthGuard { bus, thread }
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        let mut depths = self.bus.lock_depths();
        if let Some(depth) = depths.get_mut(&self.thread) {
            *depth = depth.saturating_sub(1);
            if *depth == 0 {
                depths.remove(&self.thread);
            }
        }
    }
}

fn normalized_topic(topic: &Topic) -> Topic {
    match topic {
        Topic::Kind(kind) => Topic::Kind(kind.clone().normalized()),
        Topic::Wildcard => Topic::Wildcard,
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct BusInner {
    listeners: HashMap<Topic, Vec<(u64, Listener)>>,
    history: VecDeque<SharedEvent>,
    next_id: u64,
}

/// Synchronous publish/subscribe hub with a bounded history.
///
/// `emit` delivers to the exact-kind listeners in subscription order, then to
/// the wildcard listeners. A listener may emit again; nested emits run
/// immediately until `max_depth` nested deliveries are active on the thread,
/// after which they are queued and drained by the outermost emit.
pub struct EventBus {
    inner: Mutex<BusInner>,
    pending: Mutex<VecDeque<SharedEvent>>,
    /// Active deliveries per thread.
    depths: Mutex<HashMap<ThreadId, usize>>,
    capacity: usize,
    max_depth: usize,
}

impl EventBus {
    pub fn new(capacity: usize, max_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner {
                listeners: HashMap::new(),
                history: VecDeque::with_capacity(capacity.min(1024)),
                next_id: 0,
            }),
            pending: Mutex::new(VecDeque::new()),
            depths: Mutex::new(HashMap::new()),
            capacity,
            max_depth: max_depth.max(1),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_MAX_EMIT_DEPTH)
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<SharedEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_depths(&self) -> MutexGuard<'_, HashMap<ThreadId, usize>> {
        self.depths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_depth(&self) -> usize {
        self.lock_depths().get(&thread::current().id()).copied().unwrap_or(0)
    }

    /// Register `listener` for `topic`. The returned handle unsubscribes; it is idempotent.
    pub fn subscribe<F>(self: &Arc<Self>, topic: impl Into<Topic>, listener: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let topic = normalized_topic(&topic.into());
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .listeners
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        debug!(?topic, id, "listener subscribed");
        Subscription {
            bus: Arc::downgrade(self),
            topic,
            id,
        }
    }

    /// Shorthand for a wildcard subscription.
    pub fn subscribe_all<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Topic::Wildcard, listener)
    }

    fn remove(&self, topic: &Topic, id: u64) -> bool {
        let mut inner = self.lock();
        let Some(bucket) = inner.listeners.get_mut(topic) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|(lid, _)| *lid != id);
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            inner.listeners.remove(topic);
        }
        removed
    }

    /// Emit an event and deliver it synchronously. Returns the event as recorded.
    pub fn emit(&self, kind: EventKind, data: Value, source: impl Into<String>) -> SharedEvent {
        let event = Arc::new(Event::new(kind, data, source));
        let depth = self.current_depth();

        if depth >= self.max_depth {
            warn!(
                kind = %event.kind(),
                depth,
                "emit nested too deeply, deferring until the outer emit completes"
            );
            self.lock_pending().push_back(event.clone());
            return event;
        }

        self.dispatch(event.clone());

        if depth == 0 {
            self.drain_pending();
        }
        event
    }

    fn dispatch(&self, event: SharedEvent) {
        // 1) record + snapshot the listeners under the lock
        let listeners: Vec<Listener> = {
            let mut inner = self.lock();
            if self.capacity > 0 {
                while inner.history.len() >= self.capacity {
                    inner.history.pop_front();
                }
                inner.history.push_back(event.clone());
            }
            let exact = inner
                .listeners
                .get(&Topic::Kind(event.kind().clone()))
                .into_iter()
                .flatten();
            let wildcard = inner.listeners.get(&Topic::Wildcard).into_iter().flatten();
            exact.chain(wildcard).map(|(_, l)| l.clone()).collect()
        };

        trace!(
            target: "event",
            kind = %event.kind(),
            source = event.source(),
            id = event.id(),
            listeners = listeners.len(),
            "emit"
        );

        // 2) lock released: listeners may subscribe, unsubscribe or emit
        let _depth = DepthGuard::enter(self);
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(kind = %event.kind(), error = %err, "event listener failed");
                }
                Err(panic) => {
                    error!(
                        kind = %event.kind(),
                        panic = %panic_message(panic.as_ref()),
                        "event listener panicked"
                    );
                }
            }
        }
    }

    fn drain_pending(&self) {
        loop {
            let next = self.lock_pending().pop_front();
            match next {
                Some(event) => self.dispatch(event),
                None => break,
            }
        }
    }

    pub fn get_history(&self) -> Vec<SharedEvent> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn get_history_by_kind(&self, kind: &EventKind) -> Vec<SharedEvent> {
        let kind = kind.clone().normalized();
        self.lock()
            .history
            .iter()
            .filter(|e| e.kind() == &kind)
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    pub fn listener_count(&self, topic: &Topic) -> usize {
        let topic = normalized_topic(topic);
        self.lock().listeners.get(&topic).map(Vec::len).unwrap_or(0)
    }

    /// Whether a bucket currently exists for `topic`. Buckets are freed with their last listener.
    pub fn has_bucket(&self, topic: &Topic) -> bool {
        let topic = normalized_topic(topic);
        self.lock().listeners.contains_key(&topic)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("max_depth", &self.max_depth)
            .field("topics", &inner.listeners.len())
            .field("history_len", &inner.history.len())
            .finish()
    }
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    bus: Weak<EventBus>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    /// Remove the listener. Calling it again, or after the bus is gone, is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(&self.topic, self.id) {
                debug!(topic = ?self.topic, id = self.id, "listener unsubscribed");
            }
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

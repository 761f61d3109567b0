// src/state.rs

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    bus::{panic_message, EventBus},
    event::{Collection, EventKind},
};

const STATE_SOURCE: &str = "state";

/// One tracked record (an energy reading, a social-battery log, a stored insight).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Entry {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl Entry {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            recorded_at: Utc::now(),
            data,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "recorded_at": self.recorded_at,
            "data": self.data,
        })
    }
}

/// Snapshot of the application state.
///
/// Collections are shared with the store until the next write touches them,
/// so snapshots are cheap and never observe later mutations.
#[derive(Debug, Clone, Serialize)]
pub struct AppState {
    pub energy: Arc<Vec<Entry>>,
    pub social: Arc<Vec<Entry>>,
    pub insights: Arc<Vec<Entry>>,
    pub is_online: bool,
    pub current_view: String,
    pub preferences: Arc<Map<String, Value>>,
    /// Bumped on every successful mutation.
    pub version: u64,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            energy: Arc::new(Vec::new()),
            social: Arc::new(Vec::new()),
            insights: Arc::new(Vec::new()),
            is_online: true,
            current_view: "dashboard".to_string(),
            preferences: Arc::new(Map::new()),
            version: 0,
        }
    }
}

impl AppState {
    pub fn collection(&self, collection: Collection) -> &Arc<Vec<Entry>> {
        match collection {
            Collection::Energy => &self.energy,
            Collection::Social => &self.social,
            Collection::Insights => &self.insights,
        }
    }

    fn collection_mut(&mut self, collection: Collection) -> &mut Vec<Entry> {
        let slot = match collection {
            Collection::Energy => &mut self.energy,
            Collection::Social => &mut self.social,
            Collection::Insights => &mut self.insights,
        };
        Arc::make_mut(slot)
    }

    pub fn counts(&self) -> RecordCounts {
        RecordCounts {
            energy: self.energy.len(),
            social: self.social.len(),
            insights: self.insights.len(),
        }
    }
}

/// Aggregate record counts, the input of the consistency check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RecordCounts {
    pub energy: usize,
    pub social: usize,
    pub insights: usize,
}

impl RecordCounts {
    pub fn entries(&self) -> usize {
        self.energy + self.social
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("entry in `{0}` has no id")]
    MissingId(Collection),
    #[error("entry `{id}` already exists in `{collection}`")]
    DuplicateId { collection: Collection, id: String },
    #[error("entry `{id}` not found in `{collection}`")]
    NotFound { collection: Collection, id: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type StateListener = Arc<dyn Fn(&AppState) + Send + Sync>;

struct StoreInner {
    state: AppState,
    listeners: Vec<(u64, StateListener)>,
    next_id: u64,
}

/// Canonical in-memory application state.
///
/// Every mutator mutates, then notifies state listeners with a fresh
/// snapshot, then emits the derived domain event on the bus.
pub struct StateStore {
    inner: Mutex<StoreInner>,
    bus: Arc<EventBus>,
}

impl StateStore {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Self::with_state(bus, AppState::default())
    }

    /// Start from a previously persisted state (hydration by a persistence collaborator).
    pub fn with_state(bus: Arc<EventBus>, state: AppState) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StoreInner {
                state,
                listeners: Vec::new(),
                next_id: 0,
            }),
            bus,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_state(&self) -> AppState {
        self.lock().state.clone()
    }

    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> StateSubscription
    where
        F: Fn(&AppState) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.listeners.push((id, Arc::new(listener)));
        StateSubscription {
            store: Arc::downgrade(self),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Apply `mutate` under the lock; on success notify listeners and emit `event`.
    fn commit<T>(
        &self,
        mutate: impl FnOnce(&mut AppState) -> Result<(T, Option<(EventKind, Value)>), StateError>,
    ) -> Result<T, StateError> {
        // 1) mutate + snapshot under the lock
        let (out, event, snapshot, listeners) = {
            let mut inner = self.lock();
            let (out, event) = mutate(&mut inner.state)?;
            inner.state.version += 1;
            let listeners: Vec<StateListener> = inner.listeners.iter().map(|(_, l)| l.clone()).collect();
            (out, event, inner.state.clone(), listeners)
        };

        // 2) notify state listeners
        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&snapshot))) {
                error!(panic = %panic_message(panic.as_ref()), "state listener panicked");
            }
        }

        // 3) derived domain event
        if let Some((kind, data)) = event {
            self.bus.emit(kind, data, STATE_SOURCE);
        }
        Ok(out)
    }

    pub fn add_entry(&self, collection: Collection, entry: Entry) -> Result<(), StateError> {
        if entry.id.trim().is_empty() {
            return Err(StateError::MissingId(collection));
        }
        debug!(%collection, id = %entry.id, "adding entry");
        self.commit(|state| {
            let items = state.collection_mut(collection);
            if items.iter().any(|e| e.id == entry.id) {
                return Err(StateError::DuplicateId {
                    collection,
                    id: entry.id.clone(),
                });
            }
            let payload = entry.to_value();
            items.push(entry);
            Ok(((), Some((EventKind::EntryLogged(collection), payload))))
        })
    }

    /// Merge `patch` into the entry's data. Object patches merge key by key,
    /// anything else replaces the data wholesale.
    pub fn update_entry(&self, collection: Collection, id: &str, patch: Value) -> Result<Entry, StateError> {
        if id.trim().is_empty() {
            return Err(StateError::MissingId(collection));
        }
        self.commit(|state| {
            let items = state.collection_mut(collection);
            let entry = items
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| StateError::NotFound {
                    collection,
                    id: id.to_string(),
                })?;
            match (&mut entry.data, patch) {
                (Value::Object(current), Value::Object(changes)) => {
                    for (k, v) in changes {
                        current.insert(k, v);
                    }
                }
                (data, replacement) => *data = replacement,
            }
            let updated = entry.clone();
            let payload = updated.to_value();
            Ok((updated, Some((EventKind::EntryUpdated(collection), payload))))
        })
    }

    pub fn delete_entry(&self, collection: Collection, id: &str) -> Result<Entry, StateError> {
        if id.trim().is_empty() {
            return Err(StateError::MissingId(collection));
        }
        self.commit(|state| {
            let items = state.collection_mut(collection);
            let pos = items
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| StateError::NotFound {
                    collection,
                    id: id.to_string(),
                })?;
            let removed = items.remove(pos);
            let payload = json!({ "id": removed.id });
            Ok((removed, Some((EventKind::EntryDeleted(collection), payload))))
        })
    }

    pub fn count(&self, collection: Collection) -> usize {
        self.lock().state.collection(collection).len()
    }

    pub fn entries(&self, collection: Collection) -> Arc<Vec<Entry>> {
        self.lock().state.collection(collection).clone()
    }

    pub fn counts(&self) -> RecordCounts {
        self.lock().state.counts()
    }

    /// Flip the connectivity flag. Emits `app:online`/`app:offline` only on change.
    pub fn set_online(&self, online: bool) -> Result<(), StateError> {
        self.commit(|state| {
            let changed = state.is_online != online;
            state.is_online = online;
            let event = changed.then(|| {
                let kind = if online {
                    EventKind::ConnectivityOnline
                } else {
                    EventKind::ConnectivityOffline
                };
                (kind, json!({ "online": online }))
            });
            Ok(((), event))
        })
    }

    pub fn set_view(&self, view: impl Into<String>) -> Result<(), StateError> {
        let view = view.into();
        if view.trim().is_empty() {
            return Err(StateError::Invalid {
                field: "view",
                reason: "view name is empty".to_string(),
            });
        }
        self.commit(|state| {
            let previous = std::mem::replace(&mut state.current_view, view.clone());
            Ok(((), Some((EventKind::NavigationChanged, json!({ "from": previous, "to": view })))))
        })
    }

    pub fn update_preferences(&self, changes: Map<String, Value>) -> Result<(), StateError> {
        self.commit(|state| {
            let prefs = Arc::make_mut(&mut state.preferences);
            for (k, v) in changes.iter() {
                prefs.insert(k.clone(), v.clone());
            }
            Ok(((), Some((EventKind::PreferencesUpdated, Value::Object(changes)))))
        })
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("StateStore")
            .field("counts", &inner.state.counts())
            .field("version", &inner.state.version)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

/// Handle returned by `StateStore::subscribe`; `unsubscribe` is idempotent.
#[derive(Debug, Clone)]
pub struct StateSubscription {
    store: Weak<StateStore>,
    id: u64,
}

impl StateSubscription {
    pub fn unsubscribe(&self) {
        if let Some(store) = self.store.upgrade() {
            store.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

// src/event.rs

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The tracked domain collections held by the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Energy,
    Social,
    Insights,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Energy, Collection::Social, Collection::Insights];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Energy => "energy",
            Collection::Social => "social",
            Collection::Insights => "insights",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "energy" => Some(Collection::Energy),
            "social" => Some(Collection::Social),
            "insights" => Some(Collection::Insights),
            _ => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which recovery path the classifier picked for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryKind {
    DataFlow,
    FeatureLoad,
    DataConsistency,
}

impl RecoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryKind::DataFlow => "data-flow",
            RecoveryKind::FeatureLoad => "feature-load",
            RecoveryKind::DataConsistency => "data-consistency",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "data-flow" => Some(RecoveryKind::DataFlow),
            "feature-load" => Some(RecoveryKind::FeatureLoad),
            "data-consistency" => Some(RecoveryKind::DataConsistency),
            _ => None,
        }
    }
}

/// Every event the core emits or listens for.
///
/// The canonical wire name of each kind (its `Display` output) is what
/// collaborators see; `EventKind::from(&str)` maps a name back to its
/// variant, falling back to `Custom` for names the core does not know.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    EntryLogged(Collection),
    EntryUpdated(Collection),
    EntryDeleted(Collection),
    ChartDataUpdated,
    ChartViewChanged,
    InsightGenerated,
    ConnectivityOnline,
    ConnectivityOffline,
    AppInstalled,
    NavigationChanged,
    PreferencesUpdated,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    ErrorOccurred,
    ErrorUnclassified,
    RecoveryAttempt(RecoveryKind),
    FeatureReady(String),
    FeatureFailed(String),
    FeatureDisabled(String),
    FeatureReinitialized(String),
    FeatureActivated(String),
    /// A payload routed by the data-flow router to the named target.
    DataFlow(String),
    ConsistencyChecked,
    ConsistencyWarning,
    SystemReady,
    SystemFailed,
    /// Any other name. Built directly it may carry a known name; the bus
    /// normalises it before matching.
    Custom(String),
}

impl EventKind {
    /// Build a kind from a free-form name, normalising known names to their variant.
    pub fn custom(name: impl AsRef<str>) -> Self {
        EventKind::from(name.as_ref())
    }

    /// Map a `Custom` carrying a known name onto its variant.
    pub fn normalized(self) -> Self {
        match self {
            EventKind::Custom(name) => EventKind::from(name),
            other => other,
        }
    }

    /// The data-flow source fed by this event, if the router should see it.
    pub fn flow_source(&self) -> Option<&'static str> {
        match self {
            EventKind::EntryLogged(c) | EventKind::EntryUpdated(c) | EventKind::EntryDeleted(c) => {
                Some(c.as_str())
            }
            EventKind::ChartDataUpdated => Some("charts"),
            EventKind::SyncCompleted => Some("sync"),
            _ => None,
        }
    }

    /// Events produced by monitoring itself; they never count as user activity.
    pub fn is_monitoring(&self) -> bool {
        matches!(
            self,
            EventKind::ConsistencyChecked
                | EventKind::ConsistencyWarning
                | EventKind::ErrorOccurred
                | EventKind::ErrorUnclassified
                | EventKind::RecoveryAttempt(_)
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::EntryLogged(c) => write!(f, "{}:logged", c),
            EventKind::EntryUpdated(c) => write!(f, "{}:updated", c),
            EventKind::EntryDeleted(c) => write!(f, "{}:deleted", c),
            EventKind::ChartDataUpdated => f.write_str("chart:data-updated"),
            EventKind::ChartViewChanged => f.write_str("chart:view-changed"),
            EventKind::InsightGenerated => f.write_str("insight:generated"),
            EventKind::ConnectivityOnline => f.write_str("app:online"),
            EventKind::ConnectivityOffline => f.write_str("app:offline"),
            EventKind::AppInstalled => f.write_str("app:installed"),
            EventKind::NavigationChanged => f.write_str("navigation:changed"),
            EventKind::PreferencesUpdated => f.write_str("preferences:updated"),
            EventKind::SyncStarted => f.write_str("sync:start"),
            EventKind::SyncCompleted => f.write_str("sync:complete"),
            EventKind::SyncFailed => f.write_str("sync:error"),
            EventKind::ErrorOccurred => f.write_str("error:occurred"),
            EventKind::ErrorUnclassified => f.write_str("error:unclassified"),
            EventKind::RecoveryAttempt(k) => write!(f, "recovery:{}-attempt", k.as_str()),
            EventKind::FeatureReady(n) => write!(f, "feature:{}-ready", n),
            EventKind::FeatureFailed(n) => write!(f, "feature:{}-failed", n),
            EventKind::FeatureDisabled(n) => write!(f, "feature:{}-disabled", n),
            EventKind::FeatureReinitialized(n) => write!(f, "feature:{}-reinitialized", n),
            EventKind::FeatureActivated(n) => write!(f, "activation:{}", n),
            EventKind::DataFlow(t) => write!(f, "flow:{}", t),
            EventKind::ConsistencyChecked => f.write_str("integration:consistency-checked"),
            EventKind::ConsistencyWarning => f.write_str("integration:consistency-warning"),
            EventKind::SystemReady => f.write_str("integration:complete"),
            EventKind::SystemFailed => f.write_str("integration:failed"),
            EventKind::Custom(name) => f.write_str(name),
        }
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        let fixed = match name {
            "chart:data-updated" => Some(EventKind::ChartDataUpdated),
            "chart:view-changed" => Some(EventKind::ChartViewChanged),
            "insight:generated" => Some(EventKind::InsightGenerated),
            "app:online" => Some(EventKind::ConnectivityOnline),
            "app:offline" => Some(EventKind::ConnectivityOffline),
            "app:installed" => Some(EventKind::AppInstalled),
            "navigation:changed" => Some(EventKind::NavigationChanged),
            "preferences:updated" => Some(EventKind::PreferencesUpdated),
            "sync:start" => Some(EventKind::SyncStarted),
            "sync:complete" => Some(EventKind::SyncCompleted),
            "sync:error" => Some(EventKind::SyncFailed),
            "error:occurred" => Some(EventKind::ErrorOccurred),
            "error:unclassified" => Some(EventKind::ErrorUnclassified),
            "integration:consistency-checked" => Some(EventKind::ConsistencyChecked),
            "integration:consistency-warning" => Some(EventKind::ConsistencyWarning),
            "integration:complete" => Some(EventKind::SystemReady),
            "integration:failed" => Some(EventKind::SystemFailed),
            _ => None,
        };
        if let Some(kind) = fixed {
            return kind;
        }

        if let Some(rest) = name.strip_prefix("feature:") {
            let suffixes: [(&str, fn(String) -> EventKind); 4] = [
                ("-ready", EventKind::FeatureReady),
                ("-failed", EventKind::FeatureFailed),
                ("-disabled", EventKind::FeatureDisabled),
                ("-reinitialized", EventKind::FeatureReinitialized),
            ];
            for (suffix, build) in suffixes {
                if let Some(module) = rest.strip_suffix(suffix) {
                    if !module.is_empty() {
                        return build(module.to_string());
                    }
                }
            }
        }
        if let Some(target) = name.strip_prefix("flow:") {
            if !target.is_empty() {
                return EventKind::DataFlow(target.to_string());
            }
        }
        if let Some(activation) = name.strip_prefix("activation:") {
            if !activation.is_empty() {
                return EventKind::FeatureActivated(activation.to_string());
            }
        }
        if let Some(kind) = name
            .strip_prefix("recovery:")
            .and_then(|r| r.strip_suffix("-attempt"))
            .and_then(RecoveryKind::parse)
        {
            return EventKind::RecoveryAttempt(kind);
        }
        if let Some((collection, action)) = name.split_once(':') {
            if let Some(c) = Collection::parse(collection) {
                match action {
                    "logged" => return EventKind::EntryLogged(c),
                    "updated" => return EventKind::EntryUpdated(c),
                    "deleted" => return EventKind::EntryDeleted(c),
                    _ => {}
                }
            }
        }
        EventKind::Custom(name.to_string())
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        EventKind::from(name.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.to_string()
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(EventKind::from(name))
    }
}

/// An emitted event. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: String,
    #[serde(rename = "type")]
    kind: EventKind,
    data: Value,
    source: String,
    timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, data: Value, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.normalized(),
            data,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The envelope as seen by wildcard listeners: `{type, data, source, timestamp}`.
    pub fn envelope(&self) -> Value {
        json!({
            "type": self.kind.to_string(),
            "data": self.data,
            "source": self.source,
            "timestamp": self.timestamp,
        })
    }
}

pub type SharedEvent = Arc<Event>;

/// Discriminator carried by every `error:occurred` payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DataFlow,
    FeatureLoad,
    DataConsistency,
    Other(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::DataFlow => "data-flow",
            ErrorKind::FeatureLoad => "feature-load",
            ErrorKind::DataConsistency => "data-consistency",
            ErrorKind::Other(other) => other,
        }
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "data-flow" => ErrorKind::DataFlow,
            "feature-load" => ErrorKind::FeatureLoad,
            "data-consistency" => ErrorKind::DataConsistency,
            _ => ErrorKind::Other(value),
        }
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(ErrorKind::from(String::deserialize(deserializer)?))
    }
}

/// Payload of an `error:occurred` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "type": self.kind.as_str(), "message": self.message }))
    }

    /// Reads a report back out of an event payload. Only `type` is needed to
    /// classify it; payloads missing a `type` are unclassified.
    pub fn from_value(value: &Value) -> Self {
        match serde_json::from_value::<ErrorReport>(value.clone()) {
            Ok(report) => report,
            Err(_) => ErrorReport {
                kind: ErrorKind::from(
                    value
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                ),
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                context: value.clone(),
            },
        }
    }
}

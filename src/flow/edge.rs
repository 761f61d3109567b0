use std::{fmt, sync::Arc};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::mapper::Mapper;

/// Name of the broadcast target in flow files.
pub const BROADCAST_TARGET: &str = "all";

pub type TransformFn = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

/// Where an edge delivers its payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlowTarget {
    Module(String),
    /// Every other distinct module target registered in the router.
    All,
}

impl FlowTarget {
    pub fn as_str(&self) -> &str {
        match self {
            FlowTarget::Module(name) => name,
            FlowTarget::All => BROADCAST_TARGET,
        }
    }

    /// `charts-weekly` → `charts`.
    pub fn category(&self) -> &str {
        let name = self.as_str();
        name.split_once('-').map(|(head, _)| head).unwrap_or(name)
    }
}

impl From<&str> for FlowTarget {
    fn from(name: &str) -> Self {
        if name == BROADCAST_TARGET {
            FlowTarget::All
        } else {
            FlowTarget::Module(name.to_string())
        }
    }
}

impl From<String> for FlowTarget {
    fn from(name: String) -> Self {
        FlowTarget::from(name.as_str())
    }
}

impl From<FlowTarget> for String {
    fn from(target: FlowTarget) -> Self {
        target.as_str().to_string()
    }
}

impl fmt::Display for FlowTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FlowTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FlowTarget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(FlowTarget::from(String::deserialize(deserializer)?))
    }
}

impl JsonSchema for FlowTarget {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "FlowTarget".into()
    }

    fn json_schema(generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
        let mut schema = String::json_schema(generator);
        schema.insert(
            "description".to_string(),
            Value::String(format!("module name, or \"{}\" to broadcast", BROADCAST_TARGET)),
        );
        schema
    }
}

/// Transform attached to a single edge.
#[derive(Clone)]
pub enum EdgeTransform {
    Mapper(Mapper),
    Function(TransformFn),
}

impl EdgeTransform {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        EdgeTransform::Function(Arc::new(f))
    }

    pub fn apply(&self, data: &Value) -> anyhow::Result<Value> {
        match self {
            EdgeTransform::Mapper(mapper) => Ok(mapper.apply(data)?),
            EdgeTransform::Function(f) => f(data),
        }
    }

    pub fn as_mapper(&self) -> Option<&Mapper> {
        match self {
            EdgeTransform::Mapper(mapper) => Some(mapper),
            EdgeTransform::Function(_) => None,
        }
    }
}

impl From<Mapper> for EdgeTransform {
    fn from(mapper: Mapper) -> Self {
        EdgeTransform::Mapper(mapper)
    }
}

impl fmt::Debug for EdgeTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeTransform::Mapper(m) => f.debug_tuple("Mapper").field(m).finish(),
            EdgeTransform::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// A `source → target` routing rule. Edges are never removed, only toggled.
#[derive(Debug, Clone)]
pub struct FlowEdge {
    pub source: String,
    pub target: FlowTarget,
    pub transform: Option<EdgeTransform>,
    pub enabled: bool,
}

impl FlowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<FlowTarget>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            transform: None,
            enabled: true,
        }
    }

    pub fn with_transform(mut self, transform: impl Into<EdgeTransform>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    pub fn with_fn<F>(self, f: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.with_transform(EdgeTransform::function(f))
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn id(&self) -> String {
        edge_id(&self.source, self.target.as_str())
    }
}

pub fn edge_id(source: &str, target: &str) -> String {
    format!("{}→{}", source, target)
}

/// Read-only view of an edge, as returned by `get_active_flows`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInfo {
    pub id: String,
    pub source: String,
    pub target: FlowTarget,
    pub enabled: bool,
    pub has_transform: bool,
}

impl From<&FlowEdge> for FlowInfo {
    fn from(edge: &FlowEdge) -> Self {
        Self {
            id: edge.id(),
            source: edge.source.clone(),
            target: edge.target.clone(),
            enabled: edge.enabled,
            has_transform: edge.transform.is_some(),
        }
    }
}

// src/flow/definition.rs

use std::{fs, path::Path};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    edge::{FlowEdge, FlowTarget},
    mapper::{Mapper, RenameMapper, SourceField},
    router::FlowError,
};

/// On-disk form of an edge. Only declarative transforms can be written down.
///
/// ```yaml
/// - source: energy
///   target: charts
///   transform:
///     type: rename
///     fields:
///       value: { key: /data/level }
/// - source: sync
///   target: all
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowSpec {
    pub source: String,
    pub target: FlowTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Mapper>,
    #[serde(default = "FlowSpec::default_enabled")]
    pub enabled: bool,
}

impl FlowSpec {
    fn default_enabled() -> bool {
        true
    }

    pub fn into_edge(self) -> FlowEdge {
        FlowEdge {
            source: self.source,
            target: self.target,
            transform: self.transform.map(Into::into),
            enabled: self.enabled,
        }
    }
}

impl TryFrom<&FlowEdge> for FlowSpec {
    type Error = FlowError;

    fn try_from(edge: &FlowEdge) -> Result<Self, Self::Error> {
        let transform = match &edge.transform {
            None => None,
            Some(t) => Some(t.as_mapper().cloned().ok_or_else(|| {
                FlowError::InvalidEdge(format!("edge {} has a function transform", edge.id()))
            })?),
        };
        Ok(FlowSpec {
            source: edge.source.clone(),
            target: edge.target.clone(),
            transform,
            enabled: edge.enabled,
        })
    }
}

enum FileFormat {
    Json,
    Yaml,
}

fn format_of(path: &Path) -> Result<FileFormat, FlowError> {
    let ext = path
        .extension()
        .and_then(|os| os.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match ext.as_str() {
        "json" => Ok(FileFormat::Json),
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        other => Err(FlowError::Serialization(format!(
            "unsupported extension “{}” (expected .json, .yaml or .yml)",
            other
        ))),
    }
}

/// Read a list of flow specs from a `.json`, `.yaml` or `.yml` file.
pub fn load_flow_specs(path: impl AsRef<Path>) -> Result<Vec<FlowSpec>, FlowError> {
    let path = path.as_ref();
    let format = format_of(path)?;
    let contents = fs::read_to_string(path)
        .map_err(|e| FlowError::Io(format!("read error on {}: {}", path.display(), e)))?;

    let specs: Vec<FlowSpec> = match format {
        FileFormat::Json => serde_json::from_str(&contents)
            .map_err(|e| FlowError::Serialization(format!("JSON parse error: {}", e)))?,
        FileFormat::Yaml => serde_yaml_bw::from_str(&contents)
            .map_err(|e| FlowError::Serialization(format!("YAML parse error: {}", e)))?,
    };

    if let Some(bad) = specs.iter().find(|s| s.source.trim().is_empty()) {
        return Err(FlowError::InvalidEdge(format!("empty source for target {}", bad.target)));
    }
    Ok(specs)
}

pub fn save_flow_specs(path: impl AsRef<Path>, specs: &[FlowSpec]) -> Result<(), FlowError> {
    let path = path.as_ref();
    let contents = match format_of(path)? {
        FileFormat::Json => {
            serde_json::to_string_pretty(specs).map_err(|e| FlowError::Serialization(e.to_string()))?
        }
        FileFormat::Yaml => serde_yaml_bw::to_string(specs).map_err(|e| FlowError::Serialization(e.to_string()))?,
    };
    fs::write(path, contents).map_err(|e| FlowError::Io(e.to_string()))
}

fn chart_point() -> Mapper {
    Mapper::Rename(RenameMapper::new([
        ("id", SourceField::new("id")),
        ("at", SourceField::new("recorded_at")),
        ("value", SourceField::new("/data/level")),
        ("mood", SourceField::new("/data/mood").or_default(json!("neutral"))),
    ]))
}

/// The tracker's standard wiring.
pub fn default_edges() -> Vec<FlowEdge> {
    vec![
        FlowEdge::new("energy", "charts").with_transform(chart_point()),
        FlowEdge::new("social", "charts").with_transform(chart_point()),
        FlowEdge::new("energy", "insights"),
        FlowEdge::new("social", "insights"),
        FlowEdge::new("insights", "notifications"),
        FlowEdge::new("energy", "ai"),
        FlowEdge::new("sync", FlowTarget::All),
    ]
}

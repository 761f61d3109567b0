use std::collections::BTreeMap;

use handlebars::Handlebars;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("required field `{0}` missing from payload")]
    MissingField(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("template did not render valid JSON: {0}")]
    InvalidOutput(String),
}

/// Declarative payload transform, usable wherever an edge accepts a transform.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mapper {
    Copy(CopyMapper),
    Rename(RenameMapper),
    Script(ScriptMapper),
}

impl Mapper {
    pub fn apply(&self, payload: &Value) -> Result<Value, MapperError> {
        match self {
            Mapper::Copy(m) => m.apply(payload),
            Mapper::Rename(m) => m.apply(payload),
            Mapper::Script(m) => m.apply(payload),
        }
    }
}

/// Look a key up in the payload. Keys containing `/` are JSON pointers
/// (`data/level` and `/data/level` are the same key).
fn lookup<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    if key.contains('/') {
        if key.starts_with('/') {
            payload.pointer(key)
        } else {
            payload.pointer(&format!("/{}", key))
        }
    } else {
        payload.get(key)
    }
}

/// Output field name of a pointer key: its last segment.
fn field_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Copies selected fields out of the payload, with an optional default
/// when a field is absent.
///
/// # Example
/// ```json
/// { "type": "copy", "fields": ["id", "/data/level", { "mood": "neutral" }] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CopyMapper {
    pub fields: Vec<CopyKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum CopyKey {
    Key(String),
    WithDefault(BTreeMap<String, Value>),
}

impl CopyKey {
    pub fn extract(&self) -> Option<(&str, Option<&Value>)> {
        match self {
            CopyKey::Key(k) => Some((k.as_str(), None)),
            CopyKey::WithDefault(map) => map.iter().next().map(|(k, v)| (k.as_str(), Some(v))),
        }
    }
}

impl CopyMapper {
    pub fn apply(&self, payload: &Value) -> Result<Value, MapperError> {
        let mut out = Map::new();
        for key in &self.fields {
            let Some((k, default)) = key.extract() else {
                continue;
            };
            if let Some(v) = lookup(payload, k).or(default) {
                out.insert(field_name(k).to_string(), v.clone());
            }
        }
        Ok(Value::Object(out))
    }
}

/// Builds a new object whose fields are taken from (possibly nested) payload
/// fields under other names.
///
/// # Example
/// ```json
/// {
///   "type": "rename",
///   "fields": {
///     "value": { "key": "/data/level" },
///     "at": { "key": "recorded_at", "required": true },
///     "mood": { "key": "/data/mood", "default": "neutral" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RenameMapper {
    pub fields: BTreeMap<String, SourceField>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SourceField {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

impl SourceField {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            default: None,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn or_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

impl RenameMapper {
    pub fn new<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, SourceField)>,
        K: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn apply(&self, payload: &Value) -> Result<Value, MapperError> {
        let mut out = Map::new();
        for (out_key, source) in &self.fields {
            match lookup(payload, &source.key).or(source.default.as_ref()) {
                Some(v) => {
                    out.insert(out_key.clone(), v.clone());
                }
                None if source.required => return Err(MapperError::MissingField(source.key.clone())),
                None => {}
            }
        }
        Ok(Value::Object(out))
    }
}

/// Handlebars template rendered against the payload; the rendered text
/// must be JSON.
///
/// Object payloads expose their fields directly; anything else is
/// available as `root`, e.g.
/// ```json
/// { "type": "script", "template": "{ \"level\": {{root.[0].data.level}} }" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ScriptMapper {
    pub template: String,
}

impl ScriptMapper {
    pub fn new(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }

    pub fn apply(&self, payload: &Value) -> Result<Value, MapperError> {
        let ctx = if payload.is_object() {
            payload.clone()
        } else {
            json!({ "root": payload })
        };

        let mut hbs = Handlebars::new();
        hbs.set_strict_mode(false);
        let rendered = hbs
            .render_template(&self.template, &ctx)
            .map_err(|e| MapperError::Template(e.to_string()))?;
        serde_json::from_str::<Value>(&rendered).map_err(|e| MapperError::InvalidOutput(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Value {
        json!({
            "id": "e1",
            "recorded_at": "2025-05-14T16:30:00Z",
            "data": { "level": 7, "tags": ["gym"] }
        })
    }

    #[test]
    fn test_copy_mapper_with_pointer_and_defaults() {
        let mapper: Mapper = serde_json::from_value(json!({
            "type": "copy",
            "fields": ["id", "/data/level", "data/missing", { "mood": "neutral" }, { "id": "unused" }]
        }))
        .unwrap();

        let out = mapper.apply(&entry()).unwrap();
        assert_eq!(out, json!({ "id": "e1", "level": 7, "mood": "neutral" }));
    }

    #[test]
    fn test_rename_mapper() {
        let mapper = RenameMapper::new([
            ("value", SourceField::new("/data/level")),
            ("at", SourceField::new("recorded_at").required()),
            ("mood", SourceField::new("/data/mood").or_default(json!("neutral"))),
            ("note", SourceField::new("/data/note")),
        ]);
        let out = mapper.apply(&entry()).unwrap();
        assert_eq!(out["value"], 7);
        assert_eq!(out["at"], "2025-05-14T16:30:00Z");
        assert_eq!(out["mood"], "neutral");
        assert!(out.get("note").is_none());
    }

    #[test]
    fn test_rename_mapper_required_field_missing() {
        let mapper = RenameMapper::new([("value", SourceField::new("/data/level").required())]);
        let err = mapper.apply(&json!({ "id": "x" })).unwrap_err();
        assert!(matches!(err, MapperError::MissingField(ref k) if k == "/data/level"));
    }

    #[test]
    fn test_script_mapper_renders_json() {
        let mapper = ScriptMapper::new(r#"{ "summary": "{{id}} at level {{data.level}}", "level": {{data.level}} }"#);
        let out = mapper.apply(&entry()).unwrap();
        assert_eq!(out["summary"], "e1 at level 7");
        assert_eq!(out["level"], 7);
    }

    #[test]
    fn test_script_mapper_array_payload_is_root() {
        let mapper = Mapper::Script(ScriptMapper::new(r#"{ "first": {{root.[0].data.level}} }"#));
        let out = mapper.apply(&json!([entry()])).unwrap();
        assert_eq!(out["first"], 7);
    }

    #[test]
    fn test_script_mapper_errors() {
        let bad_json = ScriptMapper::new("not json {{id}}");
        assert!(matches!(bad_json.apply(&entry()), Err(MapperError::InvalidOutput(_))));

        let bad_template = ScriptMapper::new("{{#unclosed");
        assert!(matches!(bad_template.apply(&entry()), Err(MapperError::Template(_))));
    }
}

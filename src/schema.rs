// src/schema.rs

use std::{fs, path::Path};

use anyhow::{Context, Error};
use schemars::schema_for;

use crate::{config::CoreConfig, flow::FlowSpec, module::ModuleDescriptor};

/// Write JSON schemas for the files a host hands to the core:
/// `config.schema.json`, `flows.schema.json` and `modules.schema.json`.
pub fn write_schema(out_dir: impl AsRef<Path>) -> Result<(), Error> {
    let out_dir = out_dir.as_ref();
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let config_schema = schema_for!(CoreConfig);
    fs::write(
        out_dir.join("config.schema.json"),
        serde_json::to_string_pretty(&config_schema)?,
    )?;

    let flows_schema = schema_for!(Vec<FlowSpec>);
    fs::write(
        out_dir.join("flows.schema.json"),
        serde_json::to_string_pretty(&flows_schema)?,
    )?;

    let modules_schema = schema_for!(Vec<ModuleDescriptor>);
    fs::write(
        out_dir.join("modules.schema.json"),
        serde_json::to_string_pretty(&modules_schema)?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_write_schema_files() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(dir.path().join("schemas")).unwrap();

        let config: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("schemas/config.schema.json")).unwrap()).unwrap();
        assert!(config["properties"]["network_targets"].is_object());

        let flows: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("schemas/flows.schema.json")).unwrap()).unwrap();
        assert_eq!(flows["type"], "array");
        assert!(dir.path().join("schemas/modules.schema.json").exists());
    }
}

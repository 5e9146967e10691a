//! Config loading with JSON-schema validation.

use std::path::Path;

use jsonschema::JSONSchema;

use super::Config;
use crate::error::{Error, Result};

/// Load the YAML config at `path`, validate it against the JSON schema at
/// `schema_path`, and parse it into the typed `Config`.
///
/// Each stage reports its own failure so a bad deploy is attributable to
/// the file, the schema, or the document shape.
pub fn load_and_validate(path: &Path, schema_path: &Path) -> Result<Config> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read config {}: {e}", path.display())))?;

    let raw: serde_json::Value = serde_yaml::from_str(&data)
        .map_err(|e| Error::Config(format!("invalid YAML: {e}")))?;

    let schema_data = std::fs::read_to_string(schema_path).map_err(|e| {
        Error::Config(format!(
            "failed to read schema {}: {e}",
            schema_path.display()
        ))
    })?;
    let schema_json: serde_json::Value = serde_json::from_str(&schema_data)
        .map_err(|e| Error::Config(format!("failed to parse schema: {e}")))?;

    let compiled = JSONSchema::compile(&schema_json)
        .map_err(|e| Error::Config(format!("failed to compile schema: {e}")))?;

    if let Err(errors) = compiled.validate(&raw) {
        let detail = errors
            .map(|e| format!("{}: {e}", e.instance_path))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(Error::Config(format!("config validation failed: {detail}")));
    }

    let config: Config = serde_yaml::from_str(&data)
        .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

    Ok(config)
}

//! Workflow definition parsing and filesystem operations.
//!
//! Definitions are authored as JSON (the editor's native format) or YAML.
//! Parsing only checks the shape; structural validation happens in the
//! compiler.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use weaver_types::workflow::WorkflowDefinition;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    /// JSON/YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid definition: {0}")]
    Invalid(String),

    #[error("unsupported definition format '{0}' (expected .json, .yaml or .yml)")]
    UnsupportedFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialization format of a definition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Json,
    Yaml,
}

impl DefinitionFormat {
    pub fn from_path(path: &Path) -> Result<Self, DefinitionError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(DefinitionFormat::Json),
            Some("yaml" | "yml") => Ok(DefinitionFormat::Yaml),
            other => Err(DefinitionError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn parse_definition_json(json: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    check_shape(&def)?;
    Ok(def)
}

pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    check_shape(&def)?;
    Ok(def)
}

pub fn parse_definition(content: &str, format: DefinitionFormat) -> Result<WorkflowDefinition, DefinitionError> {
    match format {
        DefinitionFormat::Json => parse_definition_json(content),
        DefinitionFormat::Yaml => parse_definition_yaml(content),
    }
}

pub fn serialize_definition(def: &WorkflowDefinition, format: DefinitionFormat) -> Result<String, DefinitionError> {
    match format {
        DefinitionFormat::Json => {
            serde_json::to_string_pretty(def).map_err(|e| DefinitionError::Parse(e.to_string()))
        }
        DefinitionFormat::Yaml => {
            serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
        }
    }
}

fn check_shape(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.trim().is_empty() {
        return Err(DefinitionError::Invalid("workflow name must not be empty".to_string()));
    }
    if def.entry_point.trim().is_empty() {
        return Err(DefinitionError::Invalid("entryPoint must not be empty".to_string()));
    }
    Ok(())
}

/// Content hash of a definition, used as the plan cache key.
///
/// Computed over the canonical JSON form, so formatting and key order in the
/// source file do not matter.
pub fn definition_hash(def: &WorkflowDefinition) -> String {
    let canonical = serde_json::to_vec(def).unwrap_or_default();
    format!("{:x}", Sha256::digest(&canonical))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a definition, picking the format from the file extension.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let format = DefinitionFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)?;
    parse_definition(&content, format)
}

/// Save a definition; creates parent directories if they don't exist.
pub fn save_definition_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let format = DefinitionFormat::from_path(path)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_definition(def, format)?)?;
    Ok(())
}

/// Every parseable definition file directly under `dir`, sorted by path.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_definitions(dir: &Path) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !dir.exists() {
        return Ok(results);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || DefinitionFormat::from_path(&path).is_err() {
            continue;
        }
        match load_definition_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable definition file"),
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

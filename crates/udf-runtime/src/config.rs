//! Manager configuration parsing.
//!
//! The manager consumes an already-parsed JSON document; anything beyond
//! the recognized keys in a UDF entry passes through verbatim as that
//! UDF's config object.

use crate::error::RuntimeError;

const DEFAULT_MAX_JOBS: usize = 20;
const DEFAULT_MAX_WORKERS: usize = 4;

/// How a UDF entry is bound at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdfKind {
    /// Shared object on the library search path.
    Native,
    /// CPython module defining a `Udf` class.
    Python,
}

/// One entry of the `udfs` array.
#[derive(Debug, Clone)]
pub struct UdfConfig {
    pub kind: UdfKind,
    /// Library name for native UDFs, dotted module path for Python UDFs.
    pub name: String,
    /// The full entry object, handed to the UDF at initialization.
    pub params: serde_json::Value,
}

/// Parsed manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub udfs: Vec<UdfConfig>,
    /// Bound on pending jobs in the thread pool.
    pub max_jobs: usize,
    /// Number of pool worker threads.
    pub max_workers: usize,
}

impl ManagerConfig {
    /// Parse the manager's configuration document.
    pub fn from_json(doc: &serde_json::Value) -> Result<Self, RuntimeError> {
        let udfs = doc
            .get("udfs")
            .ok_or_else(|| RuntimeError::ConfigInvalid("missing \"udfs\" array".to_string()))?
            .as_array()
            .ok_or_else(|| RuntimeError::ConfigInvalid("\"udfs\" must be an array".to_string()))?
            .iter()
            .map(parse_udf_entry)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            udfs,
            max_jobs: positive_or_default(doc, "max_jobs", DEFAULT_MAX_JOBS)?,
            max_workers: positive_or_default(doc, "max_workers", DEFAULT_MAX_WORKERS)?,
        })
    }
}

fn parse_udf_entry(entry: &serde_json::Value) -> Result<UdfConfig, RuntimeError> {
    if !entry.is_object() {
        return Err(RuntimeError::ConfigInvalid(
            "UDF configurations must be objects".to_string(),
        ));
    }
    let name = entry
        .get("name")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| {
            RuntimeError::ConfigInvalid("UDF entry requires a string \"name\"".to_string())
        })?;
    let kind = match entry.get("type").and_then(serde_json::Value::as_str) {
        Some("native") => UdfKind::Native,
        Some("python") => UdfKind::Python,
        Some(other) => {
            return Err(RuntimeError::ConfigInvalid(format!(
                "unknown UDF type {other:?} for {name:?}"
            )));
        }
        None => {
            return Err(RuntimeError::ConfigInvalid(format!(
                "UDF {name:?} requires a string \"type\""
            )));
        }
    };
    Ok(UdfConfig {
        kind,
        name: name.to_string(),
        params: entry.clone(),
    })
}

fn positive_or_default(
    doc: &serde_json::Value,
    key: &str,
    default: usize,
) -> Result<usize, RuntimeError> {
    match doc.get(key) {
        None => Ok(default),
        Some(value) => match value.as_u64() {
            Some(v) if v > 0 => Ok(v as usize),
            _ => Err(RuntimeError::ConfigInvalid(format!(
                "\"{key}\" must be a positive integer"
            ))),
        },
    }
}

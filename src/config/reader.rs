//! Hierarchical configuration document.
//!
//! Provider definitions are nested (`catalog.providers.pulumi.<id>.*`) so they are
//! read from a JSON document rather than flat environment variables. Keys accept
//! dotted paths; errors report the full path from the document root.

use std::{fs, path::Path};

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while reading the configuration document.
#[derive(Debug, Error)]
pub enum ConfigReadError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("configuration file {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("missing required config value at '{key}'")]
    Missing { key: String },
    #[error("invalid type at '{key}', expected {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("invalid config value at '{key}': {message}")]
    Invalid { key: String, message: String },
}

/// Read-only view over one node of the configuration document.
#[derive(Debug, Clone)]
pub struct ConfigReader {
    data: Map<String, Value>,
    prefix: String,
}

impl ConfigReader {
    /// Wraps a parsed JSON value. Non-object roots are treated as an empty document.
    pub fn from_value(value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            data,
            prefix: String::new(),
        }
    }

    /// Parses a JSON document from a string.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigReadError> {
        let value = serde_json::from_str(raw).map_err(|source| ConfigReadError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        Ok(Self::from_value(value))
    }

    /// Loads and parses a JSON document from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigReadError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|source| ConfigReadError::Io {
            path: display.clone(),
            source,
        })?;
        let value = serde_json::from_str(&raw).map_err(|source| ConfigReadError::Parse {
            path: display,
            source,
        })?;
        Ok(Self::from_value(value))
    }

    /// Whether a value (of any type, other than null) exists at `key`.
    pub fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some_and(|value| !value.is_null())
    }

    /// Child keys of this node, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    /// Path of this node from the document root (empty for the root).
    pub fn path(&self) -> &str {
        &self.prefix
    }

    /// Full path of `key` relative to the document root.
    pub fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.prefix, key)
        }
    }

    pub fn get_string(&self, key: &str) -> Result<String, ConfigReadError> {
        self.get_optional_string(key)?
            .ok_or_else(|| ConfigReadError::Missing {
                key: self.full_key(key),
            })
    }

    pub fn get_optional_string(&self, key: &str) -> Result<Option<String>, ConfigReadError> {
        match self.lookup(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(other) => Err(self.type_mismatch(key, "string", other)),
        }
    }

    pub fn get_optional_number(&self, key: &str) -> Result<Option<f64>, ConfigReadError> {
        match self.lookup(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(number)) => Ok(number.as_f64()),
            Some(other) => Err(self.type_mismatch(key, "number", other)),
        }
    }

    pub fn get_config(&self, key: &str) -> Result<ConfigReader, ConfigReadError> {
        self.get_optional_config(key)?
            .ok_or_else(|| ConfigReadError::Missing {
                key: self.full_key(key),
            })
    }

    pub fn get_optional_config(&self, key: &str) -> Result<Option<ConfigReader>, ConfigReadError> {
        match self.lookup(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) => Ok(Some(ConfigReader {
                data: map.clone(),
                prefix: self.full_key(key),
            })),
            Some(other) => Err(self.type_mismatch(key, "object", other)),
        }
    }

    /// Direct child object named exactly `key`; dots in `key` are not path separators.
    pub fn child(&self, key: &str) -> Result<ConfigReader, ConfigReadError> {
        match self.data.get(key) {
            None | Some(Value::Null) => Err(ConfigReadError::Missing {
                key: self.full_key(key),
            }),
            Some(Value::Object(map)) => Ok(ConfigReader {
                data: map.clone(),
                prefix: self.full_key(key),
            }),
            Some(other) => Err(self.type_mismatch(key, "object", other)),
        }
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        let mut parts = key.split('.');
        let first = parts.next()?;
        let mut current = self.data.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    fn type_mismatch(&self, key: &str, expected: &'static str, actual: &Value) -> ConfigReadError {
        ConfigReadError::TypeMismatch {
            key: self.full_key(key),
            expected,
            actual: value_kind(actual),
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

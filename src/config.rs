//! Project configuration loading and merging.
//!
//! Thin glue: plugin descriptors contribute defaults, the project's
//! `config.toml` or `config.json` overrides them, and the merged value is
//! exposed through the `config` capability namespace.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{Error, Result};

/// JSON config file name at the project root.
pub const CONFIG_JSON: &str = "config.json";

/// TOML config file name at the project root.
pub const CONFIG_TOML: &str = "config.toml";

/// The merged project configuration.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    merged: Value,
}

impl ProjectConfig {
    /// An empty configuration.
    pub fn empty() -> Self {
        Self {
            merged: Value::Object(serde_json::Map::new()),
        }
    }

    /// Path of the config file the project uses, if any.
    ///
    /// TOML wins when both are present.
    pub fn file_for(project_root: &Path) -> Option<PathBuf> {
        let toml_path = project_root.join(CONFIG_TOML);
        if toml_path.exists() {
            return Some(toml_path);
        }
        let json_path = project_root.join(CONFIG_JSON);
        if json_path.exists() {
            return Some(json_path);
        }
        None
    }

    /// Load the project's config file; empty when none exists.
    pub fn load(project_root: &Path) -> Result<Self> {
        let Some(path) = Self::file_for(project_root) else {
            return Ok(Self::empty());
        };
        let content = std::fs::read_to_string(&path)?;

        let value = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            let parsed: toml::Value = toml::from_str(&content)
                .map_err(|e| Error::ManifestParse(e.to_string()))?;
            serde_json::to_value(parsed)?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::ManifestParse(e.to_string()))?
        };

        if !value.is_object() {
            return Err(Error::ManifestParse(
                "project config must be a table at the top level".into(),
            ));
        }
        Ok(Self { merged: value })
    }

    /// Merge a plugin's default config under its ident.
    ///
    /// Existing user settings always win over defaults.
    pub fn merge_defaults(&mut self, ident: &str, defaults: &Value) {
        if defaults.is_null() {
            return;
        }
        let Some(root) = self.merged.as_object_mut() else {
            return;
        };
        match root.get_mut(ident) {
            Some(existing) => overlay_missing(existing, defaults),
            None => {
                root.insert(ident.to_string(), defaults.clone());
            }
        }
    }

    /// The merged configuration value.
    pub fn value(&self) -> &Value {
        &self.merged
    }
}

/// Fill in keys from `defaults` that `target` does not set, recursively.
fn overlay_missing(target: &mut Value, defaults: &Value) {
    let (Some(target), Some(defaults)) = (target.as_object_mut(), defaults.as_object()) else {
        return;
    };
    for (key, default) in defaults {
        match target.get_mut(key) {
            Some(existing) => overlay_missing(existing, default),
            None => {
                target.insert(key.clone(), default.clone());
            }
        }
    }
}

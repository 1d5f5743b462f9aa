//! Plugin-facing seams: compile handlers, entry points, and transforms.
//!
//! Per-language compilation logic is opaque to the engine. An installed
//! plugin contributes three things: an entry point that registers compile
//! handlers keyed by file extension, a descriptor enumerating the extensions
//! it handles plus its default configuration, and (for library builds) an
//! optional transform producing one build-manifest entry per generated file.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::HandlerRegistry;

/// Descriptor file name inside a plugin installation.
pub const DESCRIPTOR_FILE: &str = "plugin.json";

/// Build manifest written into a library plugin by a library-mode build.
pub const BUILD_MANIFEST_FILE: &str = "build.json";

/// Value a plugin exports to other plugins via the `lang` namespace.
pub type PluginExports = Arc<dyn Any + Send + Sync>;

/// A single output file produced by a compile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    /// Output path, relative to the project root.
    pub path: PathBuf,
    /// File contents.
    pub contents: Vec<u8>,
}

impl GeneratedFile {
    /// Create a generated file.
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// Collects everything one compile pass produces for one source file.
#[derive(Debug, Default)]
pub struct Emitter {
    pending: Vec<GeneratedFile>,
}

impl Emitter {
    /// Create an empty emitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an output file for the current source file.
    pub fn emit(&mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.pending.push(GeneratedFile::new(path, contents));
    }

    /// Number of queued outputs.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drain the queued outputs.
    pub fn take(&mut self) -> Vec<GeneratedFile> {
        std::mem::take(&mut self.pending)
    }
}

/// Opaque per-extension compilation logic.
pub trait CompileHandler: Send + Sync {
    /// Compile one source file, emitting its outputs.
    fn compile(&self, source: &Path, emit: &mut Emitter) -> Result<()>;
}

impl<F> CompileHandler for F
where
    F: Fn(&Path, &mut Emitter) -> Result<()> + Send + Sync,
{
    fn compile(&self, source: &Path, emit: &mut Emitter) -> Result<()> {
        self(source, emit)
    }
}

/// Context handed to a library transform for one recorded source file.
#[derive(Debug)]
pub struct TransformContext<'a> {
    /// Source path relative to the source directory.
    pub source: &'a Path,
    /// Recorded outputs for this source: output path -> content hash.
    pub outputs: &'a BTreeMap<String, String>,
    /// Project root.
    pub root: &'a Path,
    /// Source file extension (with leading dot).
    pub extension: &'a str,
}

/// Produces one build-manifest entry per recorded source file.
pub trait Transform: Send + Sync {
    /// Transform a recorded source file into its manifest entry.
    fn transform(&self, ctx: &TransformContext<'_>) -> serde_json::Value;
}

impl<F> Transform for F
where
    F: Fn(&TransformContext<'_>) -> serde_json::Value + Send + Sync,
{
    fn transform(&self, ctx: &TransformContext<'_>) -> serde_json::Value {
        self(ctx)
    }
}

/// Entry point of an installed plugin.
///
/// Invoked at most once per run; registers the plugin's compile handlers and
/// returns its exported value.
pub trait PluginEntry: Send + Sync {
    /// Load the plugin into the given handler registry.
    fn load(&self, handlers: &HandlerRegistry) -> Result<PluginExports>;
}

impl<F> PluginEntry for F
where
    F: Fn(&HandlerRegistry) -> Result<PluginExports> + Send + Sync,
{
    fn load(&self, handlers: &HandlerRegistry) -> Result<PluginExports> {
        self(handlers)
    }
}

/// Metadata shipped inside a plugin installation (`plugin.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Plugin ident.
    pub name: String,
    /// File extensions (with leading dot) this plugin handles.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Default configuration merged under the plugin's config namespace.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl PluginDescriptor {
    /// Minimal descriptor for a plugin with no shipped metadata.
    pub fn minimal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extensions: Vec::new(),
            config: serde_json::Value::Null,
        }
    }

    /// Read the descriptor from an installation directory.
    pub fn read(install_dir: &Path) -> Result<Self> {
        let path = install_dir.join(DESCRIPTOR_FILE);
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Write the descriptor into an installation directory.
    pub fn write(&self, install_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(install_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(install_dir.join(DESCRIPTOR_FILE), content)?;
        Ok(())
    }
}

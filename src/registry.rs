//! Registries for loaded plugins, compile handlers, and transforms.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::manifest::PluginKind;
use crate::plugin::{CompileHandler, PluginDescriptor, PluginExports, Transform};

/// Extension-keyed table of compile handlers.
///
/// Entry points register their handlers here; the orchestrator looks up the
/// handler for each source file by extension.
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn CompileHandler>>,
}

impl HandlerRegistry {
    /// Create an empty handler registry.
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler for an extension (with leading dot).
    pub fn register(&self, extension: impl Into<String>, handler: Arc<dyn CompileHandler>) {
        self.handlers.insert(extension.into(), handler);
    }

    /// Look up the handler for an extension.
    pub fn get(&self, extension: &str) -> Option<Arc<dyn CompileHandler>> {
        self.handlers.get(extension).map(|h| h.clone())
    }

    /// Check whether an extension has a handler.
    pub fn contains(&self, extension: &str) -> bool {
        self.handlers.contains_key(extension)
    }

    /// All registered extensions.
    pub fn extensions(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("extensions", &self.extensions())
            .finish()
    }
}

/// A plugin that has been loaded into the current run.
#[derive(Clone)]
pub struct LoadedPlugin {
    /// Short plugin ident.
    pub ident: String,
    /// Language or library.
    pub kind: PluginKind,
    /// Installation directory on disk.
    pub install_path: PathBuf,
    /// Descriptor read from the installation.
    pub descriptor: PluginDescriptor,
    /// Value the plugin exports to other plugins.
    pub exports: PluginExports,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("ident", &self.ident)
            .field("kind", &self.kind)
            .field("install_path", &self.install_path)
            .finish()
    }
}

/// Table of loaded plugins plus their handler and transform registrations.
pub struct LanguageRegistry {
    plugins: DashMap<String, LoadedPlugin>,
    handlers: HandlerRegistry,
    transforms: DashMap<String, Arc<dyn Transform>>,
}

impl LanguageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            plugins: DashMap::new(),
            handlers: HandlerRegistry::new(),
            transforms: DashMap::new(),
        }
    }

    /// The shared handler registry.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Record a loaded plugin. Loading is at-most-once per run; a duplicate
    /// insert indicates a loader bug and is rejected.
    pub fn register(&self, plugin: LoadedPlugin) -> Result<()> {
        if self.plugins.contains_key(&plugin.ident) {
            return Err(Error::user(format!(
                "plugin already loaded: {}",
                plugin.ident
            )));
        }
        self.plugins.insert(plugin.ident.clone(), plugin);
        Ok(())
    }

    /// Check whether a plugin has been loaded.
    pub fn contains(&self, ident: &str) -> bool {
        self.plugins.contains_key(ident)
    }

    /// Get a loaded plugin by ident.
    pub fn get(&self, ident: &str) -> Option<LoadedPlugin> {
        self.plugins.get(ident).map(|p| p.clone())
    }

    /// Idents of all loaded plugins.
    pub fn idents(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.key().clone()).collect()
    }

    /// Number of loaded plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugins are loaded.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Bind a transform to an extension (library builds).
    pub fn register_transform(&self, extension: impl Into<String>, transform: Arc<dyn Transform>) {
        self.transforms.insert(extension.into(), transform);
    }

    /// Look up the transform for an extension.
    pub fn transform(&self, extension: &str) -> Option<Arc<dyn Transform>> {
        self.transforms.get(extension).map(|t| t.clone())
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LanguageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageRegistry")
            .field("plugins", &self.plugins.len())
            .field("handlers", &self.handlers.len())
            .field("transforms", &self.transforms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Emitter;
    use std::path::Path;

    fn noop_plugin(ident: &str) -> LoadedPlugin {
        LoadedPlugin {
            ident: ident.to_string(),
            kind: PluginKind::Language,
            install_path: PathBuf::from("/tmp/unused"),
            descriptor: PluginDescriptor::minimal(ident),
            exports: Arc::new(()),
        }
    }

    #[test]
    fn test_handler_lookup() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(
            ".mcs",
            Arc::new(|_: &Path, _: &mut Emitter| -> Result<()> { Ok(()) }),
        );

        assert!(registry.contains(".mcs"));
        assert!(registry.get(".mcs").is_some());
        assert!(registry.get(".other").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_plugin_rejected() {
        let registry = LanguageRegistry::new();
        registry.register(noop_plugin("script")).unwrap();
        assert!(registry.register(noop_plugin("script")).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_transform_binding() {
        let registry = LanguageRegistry::new();
        registry.register_transform(
            ".mcs",
            Arc::new(|ctx: &crate::plugin::TransformContext<'_>| {
                serde_json::json!(ctx.outputs.len())
            }),
        );

        assert!(registry.transform(".mcs").is_some());
        assert!(registry.transform(".txt").is_none());
    }
}

//! Plugin loading: entry-point dispatch, load ordering, and lazy loads.
//!
//! The embedding host registers an entry point per plugin ident; the loader
//! wires resolved installations to those entry points. Loading is memoized
//! (at most once per run) and honors `load_after` ordering recursively.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::capability::{Capability, CapabilityRegistry};
use crate::error::{Error, Result};
use crate::plugin::{PluginDescriptor, PluginEntry, Transform};
use crate::registry::{LanguageRegistry, LoadedPlugin};
use crate::resolver::ResolvedPlugin;

/// Reserved capability namespace for lazy plugin loads.
pub const LANG_NAMESPACE: &str = "lang";

/// Loads resolved plugins through host-registered entry points.
pub struct PluginLoader {
    registry: Arc<LanguageRegistry>,
    entries: DashMap<String, Arc<dyn PluginEntry>>,
    transform_libs: DashMap<String, Arc<dyn Transform>>,
    resolved: parking_lot::RwLock<Vec<ResolvedPlugin>>,
}

impl PluginLoader {
    /// Create a loader feeding the given registry.
    pub fn new(registry: Arc<LanguageRegistry>) -> Self {
        Self {
            registry,
            entries: DashMap::new(),
            transform_libs: DashMap::new(),
            resolved: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// The registry loaded plugins land in.
    pub fn registry(&self) -> &Arc<LanguageRegistry> {
        &self.registry
    }

    /// Register the entry point for a plugin ident.
    pub fn register_entry(&self, ident: impl Into<String>, entry: Arc<dyn PluginEntry>) {
        self.entries.insert(ident.into(), entry);
    }

    /// Register the transform library for a plugin ident.
    pub fn register_transform_lib(&self, ident: impl Into<String>, transform: Arc<dyn Transform>) {
        self.transform_libs.insert(ident.into(), transform);
    }

    /// Make a set of resolved installations known to the loader.
    pub fn set_resolved(&self, plugins: Vec<ResolvedPlugin>) {
        *self.resolved.write() = plugins;
    }

    /// Whether an ident names a known (resolved) plugin.
    pub fn is_known(&self, ident: &str) -> bool {
        self.find_resolved(ident).is_some()
    }

    /// Load one plugin, with its `load_after` dependencies first.
    ///
    /// Memoized: a plugin loads at most once per run no matter how many
    /// times it is requested.
    pub fn load(&self, ident: &str) -> Result<LoadedPlugin> {
        let mut visited = HashSet::new();
        self.load_inner(ident, &mut visited)
    }

    /// Load every known plugin in manifest order.
    pub fn load_all(&self) -> Result<()> {
        let idents: Vec<String> = self
            .resolved
            .read()
            .iter()
            .map(|p| p.reference.ident().to_string())
            .collect();
        for ident in idents {
            self.load(&ident)?;
        }
        Ok(())
    }

    /// Read the descriptor of every known plugin without loading it.
    ///
    /// Used to seed the config capability before any entry point runs.
    pub fn descriptors(&self) -> Vec<(String, PluginDescriptor)> {
        self.resolved
            .read()
            .iter()
            .map(|plugin| {
                let ident = plugin.reference.ident().to_string();
                let descriptor = PluginDescriptor::read(&plugin.install_path)
                    .unwrap_or_else(|_| PluginDescriptor::minimal(&ident));
                (ident, descriptor)
            })
            .collect()
    }

    /// Bind every known plugin's transform library to its extensions.
    ///
    /// A plugin without a registered transform library logs a warning and is
    /// skipped; its files are silently omitted from the build manifest.
    pub fn load_transforms(&self) {
        for plugin in self.resolved.read().iter() {
            let ident = plugin.reference.ident();
            let Some(transform) = self.transform_libs.get(ident).map(|t| t.clone()) else {
                tracing::warn!("found no transformers for {}", ident);
                continue;
            };
            let descriptor = PluginDescriptor::read(&plugin.install_path)
                .unwrap_or_else(|_| PluginDescriptor::minimal(ident));
            for extension in &descriptor.extensions {
                self.registry
                    .register_transform(extension.clone(), transform.clone());
            }
        }
    }

    /// Register the reserved `lang` namespace on a capability registry.
    ///
    /// `lang/<name>` lazily loads a recognized-but-unloaded plugin before
    /// returning its exports; a bare `lang` request lists loaded idents.
    pub fn register_lang_namespace(self: Arc<Self>, capabilities: &CapabilityRegistry) {
        let loader = self;
        capabilities.register(LANG_NAMESPACE, true, move |path| {
            match path.split('/').nth(1).filter(|n| !n.is_empty()) {
                Some(name) => {
                    let plugin = loader.load(name).map_err(|e| Error::Capability {
                        path: path.to_string(),
                        message: e.to_string(),
                    })?;
                    Ok(Capability::Service(plugin.exports))
                }
                None => Ok(Capability::Data(serde_json::json!(
                    loader.registry.idents()
                ))),
            }
        });
    }

    // Helper methods

    fn find_resolved(&self, ident: &str) -> Option<ResolvedPlugin> {
        self.resolved
            .read()
            .iter()
            .find(|p| p.reference.ident() == ident || p.reference.repo_name() == ident)
            .cloned()
    }

    fn load_inner(&self, ident: &str, visited: &mut HashSet<String>) -> Result<LoadedPlugin> {
        let resolved = self
            .find_resolved(ident)
            .ok_or_else(|| Error::PluginNotFound(ident.to_string()))?;
        let ident = resolved.reference.ident().to_string();

        if let Some(loaded) = self.registry.get(&ident) {
            return Ok(loaded);
        }
        if !visited.insert(ident.clone()) {
            return Err(Error::user(format!(
                "load_after cycle involving '{}'",
                ident
            )));
        }

        for dep in &resolved.reference.load_after {
            self.load_inner(dep, visited)?;
        }

        let descriptor = match PluginDescriptor::read(&resolved.install_path) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                tracing::warn!("plugin '{}' ships no descriptor", ident);
                PluginDescriptor::minimal(&ident)
            }
        };

        let entry = self
            .entries
            .get(&ident)
            .map(|e| e.clone())
            .ok_or_else(|| Error::MissingEntryPoint(ident.clone()))?;

        tracing::debug!("loading plugin {}", ident);
        let exports = entry.load(self.registry.handlers())?;

        let plugin = LoadedPlugin {
            ident,
            kind: resolved.kind,
            install_path: resolved.install_path,
            descriptor,
            exports,
        };
        self.registry.register(plugin.clone())?;
        Ok(plugin)
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("entries", &self.entries.len())
            .field("resolved", &self.resolved.read().len())
            .field("loaded", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{PluginKind, PluginReference};
    use crate::registry::HandlerRegistry;
    use crate::resolver::Revision;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    fn resolved(reference: PluginReference) -> ResolvedPlugin {
        ResolvedPlugin {
            reference,
            kind: PluginKind::Language,
            revision: Revision::Local,
            install_path: PathBuf::from("/nonexistent"),
        }
    }

    fn tracking_entry(
        ident: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn PluginEntry> {
        Arc::new(
            move |_: &HandlerRegistry| -> Result<crate::plugin::PluginExports> {
                order.lock().push(ident);
                Ok(Arc::new(ident))
            },
        )
    }

    fn loader_with(refs: Vec<PluginReference>) -> (Arc<PluginLoader>, Arc<Mutex<Vec<&'static str>>>) {
        let registry = Arc::new(LanguageRegistry::new());
        let loader = Arc::new(PluginLoader::new(registry));
        loader.set_resolved(refs.into_iter().map(resolved).collect());
        (loader, Arc::new(Mutex::new(Vec::new())))
    }

    #[test]
    fn test_load_after_ordering() {
        let (loader, order) = loader_with(vec![
            PluginReference::vcs("lang-a/stable", "acme").with_load_after("lang-b"),
            PluginReference::vcs("lang-b/stable", "acme"),
        ]);
        loader.register_entry("a", tracking_entry("a", order.clone()));
        loader.register_entry("b", tracking_entry("b", order.clone()));

        loader.load("a").unwrap();
        assert_eq!(*order.lock(), vec!["b", "a"]);
    }

    #[test]
    fn test_shared_dependency_loads_exactly_once() {
        let (loader, order) = loader_with(vec![
            PluginReference::vcs("lang-a/stable", "acme").with_load_after("lang-b"),
            PluginReference::vcs("lang-b/stable", "acme"),
            PluginReference::vcs("lang-c/stable", "acme").with_load_after("lang-b"),
        ]);
        loader.register_entry("a", tracking_entry("a", order.clone()));
        loader.register_entry("b", tracking_entry("b", order.clone()));
        loader.register_entry("c", tracking_entry("c", order.clone()));

        loader.load_all().unwrap();
        assert_eq!(*order.lock(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_load_is_memoized() {
        let (loader, order) = loader_with(vec![PluginReference::vcs("lang-a/stable", "acme")]);
        loader.register_entry("a", tracking_entry("a", order.clone()));

        loader.load("a").unwrap();
        loader.load("a").unwrap();
        loader.load("lang-a").unwrap();
        assert_eq!(order.lock().len(), 1);
    }

    #[test]
    fn test_unknown_plugin_fails() {
        let (loader, _) = loader_with(vec![]);
        assert!(matches!(
            loader.load("ghost"),
            Err(Error::PluginNotFound(_))
        ));
    }

    #[test]
    fn test_missing_entry_point_fails() {
        let (loader, _) = loader_with(vec![PluginReference::vcs("lang-a/stable", "acme")]);
        assert!(matches!(
            loader.load("a"),
            Err(Error::MissingEntryPoint(_))
        ));
    }

    #[test]
    fn test_load_after_cycle_detected() {
        let (loader, order) = loader_with(vec![
            PluginReference::vcs("lang-a/stable", "acme").with_load_after("lang-b"),
            PluginReference::vcs("lang-b/stable", "acme").with_load_after("lang-a"),
        ]);
        loader.register_entry("a", tracking_entry("a", order.clone()));
        loader.register_entry("b", tracking_entry("b", order));

        assert!(loader.load("a").is_err());
    }

    #[test]
    fn test_lang_namespace_lazy_load() {
        let (loader, order) = loader_with(vec![PluginReference::vcs("lang-a/stable", "acme")]);
        loader.register_entry("a", tracking_entry("a", order.clone()));

        let capabilities = CapabilityRegistry::new();
        loader.clone().register_lang_namespace(&capabilities);

        // Nothing loads until the first reference.
        assert!(order.lock().is_empty());

        let value = capabilities.request("lang/a").unwrap();
        assert!(value.service::<&'static str>().is_some());
        assert_eq!(order.lock().len(), 1);

        // Second request hits the memoized load.
        capabilities.request("lang/a").unwrap();
        assert_eq!(order.lock().len(), 1);
    }
}

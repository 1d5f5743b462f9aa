//! Capability registry: namespace-based routing for shared services.
//!
//! Plugin code requests named capabilities (`config`, `store`, `lang/<name>`,
//! ...) through a single routing table instead of reaching into the host's
//! module resolution. Each namespace owns a resolver; `terminal` namespaces
//! return their value as-is, non-terminal ones allow dotted-path drill-down
//! into structured data.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};

/// A resolved capability value.
#[derive(Clone)]
pub enum Capability {
    /// Opaque service object, returned unchanged (terminal namespaces).
    Service(Arc<dyn Any + Send + Sync>),
    /// Structured data supporting path traversal.
    Data(serde_json::Value),
}

impl Capability {
    /// Downcast a service capability to a concrete type.
    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Service(v) => v.clone().downcast::<T>().ok(),
            Self::Data(_) => None,
        }
    }

    /// Borrow the structured data of a non-terminal capability.
    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Data(v) => Some(v),
            Self::Service(_) => None,
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service(_) => f.write_str("Capability::Service(..)"),
            Self::Data(v) => write!(f, "Capability::Data({})", v),
        }
    }
}

type ResolveFn = Box<dyn Fn(&str) -> Result<Capability> + Send + Sync>;

struct CapabilityEntry {
    resolve: ResolveFn,
    terminal: bool,
}

/// Namespace-keyed capability routing table.
///
/// Process-wide: initialized once before any plugin code runs and never torn
/// down mid-run.
pub struct CapabilityRegistry {
    entries: DashMap<String, CapabilityEntry>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a namespace with a resolver.
    ///
    /// The resolver receives the full request path, so an entry can
    /// special-case sub-paths. `terminal` entries return the resolved value
    /// unchanged; non-terminal entries must resolve to [`Capability::Data`]
    /// and the remaining path segments are walked as successive lookups.
    pub fn register<F>(&self, namespace: impl Into<String>, terminal: bool, resolve: F)
    where
        F: Fn(&str) -> Result<Capability> + Send + Sync + 'static,
    {
        self.entries.insert(
            namespace.into(),
            CapabilityEntry {
                resolve: Box::new(resolve),
                terminal,
            },
        );
    }

    /// Register a fixed structured value under a non-terminal namespace.
    pub fn register_data(&self, namespace: impl Into<String>, value: serde_json::Value) {
        self.register(namespace, false, move |_| Ok(Capability::Data(value.clone())));
    }

    /// Register an opaque service under a terminal namespace.
    pub fn register_service(
        &self,
        namespace: impl Into<String>,
        service: Arc<dyn Any + Send + Sync>,
    ) {
        self.register(namespace, true, move |_| {
            Ok(Capability::Service(service.clone()))
        });
    }

    /// Check whether a namespace is registered.
    pub fn contains(&self, namespace: &str) -> bool {
        self.entries.contains_key(namespace)
    }

    /// All registered namespaces.
    pub fn namespaces(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Resolve a capability request.
    ///
    /// An unknown first segment yields [`Error::UnknownNamespace`], which
    /// callers treat as "pass through to normal resolution". A resolver
    /// failure logs the full set of registered namespaces and their
    /// resolvable shapes before the error is returned; that diagnostic dump
    /// is part of the contract.
    pub fn request(&self, path: &str) -> Result<Capability> {
        let mut segments = path.split('/');
        let namespace = segments.next().unwrap_or_default();

        let entry = match self.entries.get(namespace) {
            Some(entry) => entry,
            None => return Err(Error::UnknownNamespace(path.to_string())),
        };

        let resolved = (entry.resolve)(path);
        let terminal = entry.terminal;
        drop(entry);

        let value = match resolved {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("failed to resolve capability '{}' ({})", path, e);
                self.dump_shapes();
                return Err(e);
            }
        };

        if terminal {
            return Ok(value);
        }

        let mut current = match value {
            Capability::Data(v) => v,
            Capability::Service(_) => {
                let err = Error::Capability {
                    path: path.to_string(),
                    message: "non-terminal namespace resolved to an opaque service".into(),
                };
                tracing::error!("{}", err);
                self.dump_shapes();
                return Err(err);
            }
        };

        for segment in segments {
            match current.get(segment) {
                Some(next) => current = next.clone(),
                None => {
                    let err = Error::Capability {
                        path: path.to_string(),
                        message: format!("no member '{}'", segment),
                    };
                    tracing::error!("{}", err);
                    self.dump_shapes();
                    return Err(err);
                }
            }
        }

        Ok(Capability::Data(current))
    }

    /// Log every registered namespace and its resolvable shape.
    fn dump_shapes(&self) {
        tracing::error!("-------------------[capability namespaces]-------------------");
        for entry in self.entries.iter() {
            let namespace = entry.key();
            if entry.terminal {
                tracing::error!("{} -> <service>", namespace);
                continue;
            }
            match (entry.resolve)(namespace) {
                Ok(Capability::Data(value)) => log_shape(namespace, &value),
                Ok(Capability::Service(_)) => {
                    tracing::error!("{} -> <service>", namespace)
                }
                Err(e) => tracing::error!("{} -> <unresolvable: {}>", namespace, e),
            }
        }
        tracing::error!("--------------------------------------------------------------");
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("namespaces", &self.entries.len())
            .finish()
    }
}

fn log_shape(prefix: &str, value: &serde_json::Value) {
    tracing::error!("{}", prefix);
    if let serde_json::Value::Object(map) = value {
        for (key, child) in map {
            log_shape(&format!("{}/{}", prefix, key), child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_namespace_traversal() {
        let registry = CapabilityRegistry::new();
        registry.register_data(
            "config",
            json!({ "global": { "debounce": 100, "pool": 32 } }),
        );

        let value = registry.request("config/global/debounce").unwrap();
        assert_eq!(value.data(), Some(&json!(100)));

        let whole = registry.request("config").unwrap();
        assert!(whole.data().unwrap().get("global").is_some());
    }

    #[test]
    fn test_unknown_namespace_passes_through() {
        let registry = CapabilityRegistry::new();
        let result = registry.request("serde_json/something");
        assert!(matches!(result, Err(Error::UnknownNamespace(_))));
    }

    #[test]
    fn test_missing_member_fails() {
        let registry = CapabilityRegistry::new();
        registry.register_data("config", json!({ "a": 1 }));
        let result = registry.request("config/b");
        assert!(matches!(result, Err(Error::Capability { .. })));
    }

    #[test]
    fn test_terminal_service_returned_unchanged() {
        struct Logger {
            name: &'static str,
        }

        let registry = CapabilityRegistry::new();
        registry.register_service("logger", Arc::new(Logger { name: "root" }));

        // Terminal: sub-path is not traversed, the service comes back as-is.
        let value = registry.request("logger/ignored/path").unwrap();
        let logger = value.service::<Logger>().unwrap();
        assert_eq!(logger.name, "root");
    }

    #[test]
    fn test_resolver_sees_full_path() {
        let registry = CapabilityRegistry::new();
        registry.register("echo", true, |path| {
            Ok(Capability::Data(json!(path)))
        });

        let value = registry.request("echo/a/b").unwrap();
        assert_eq!(value.data(), Some(&json!("echo/a/b")));
    }

    #[test]
    fn test_resolver_error_propagates() {
        let registry = CapabilityRegistry::new();
        registry.register("broken", false, |path| {
            Err(Error::Capability {
                path: path.to_string(),
                message: "always fails".into(),
            })
        });

        assert!(registry.request("broken/x").is_err());
    }
}

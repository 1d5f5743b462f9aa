//! # langforge
//!
//! Pluggable incremental build engine: source files under a project tree are
//! compiled by externally-supplied language plugins into generated
//! artifacts, with incremental rebuilds, file watching, and remote plugin
//! resolution and caching.
//!
//! This crate provides:
//! - **Plugin Resolution** - Pin manifest references to immutable revisions
//!   and cache their content locally
//! - **Capability Registry** - Namespace-routed access to shared services,
//!   with lazy plugin loads under `lang/<name>`
//! - **Virtual File System** - Per-source output records with content-hash
//!   diffing, bounded-pool writes, and stale-output cleanup
//! - **Build Orchestration** - Full and incremental builds with pre/post
//!   hooks and severity-classified error recovery
//! - **Watch Pipeline** - Filesystem events become compile tasks, with
//!   drop-not-queue admission control and an optional debounce window
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use langforge::{BuildRuntime, PluginLoader, RuntimeConfig};
//!
//! // Resolve and install the project's plugins.
//! let resolved = resolver.install_manifest(&manifest, &mut build_library)?;
//! loader.set_resolved(resolved);
//! loader.load_all()?;
//!
//! // Build the tree once.
//! let runtime = BuildRuntime::new(config, &loader, store, project_config);
//! runtime.rebuild_all()?;
//! runtime.shutdown()?;
//! ```
//!
//! ## Feature Flags
//!
//! - `watch` (default): Enable the filesystem watch pipeline

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod capability;
mod catalog;
mod config;
mod error;
mod hooks;
mod loader;
mod manifest;
mod plugin;
mod registry;
mod resolver;
mod runtime;
mod store;
mod vfs;

#[cfg(feature = "watch")]
mod watcher;

pub use capability::{Capability, CapabilityRegistry};
pub use catalog::{Catalog, CatalogClient, DEFAULT_CATALOG_BASE};
pub use config::{ProjectConfig, CONFIG_JSON, CONFIG_TOML};
pub use error::{Error, Result, Severity};
pub use hooks::{BuildEvents, BuildHooks, DispatchableEvent, HookCompletion, HookContext};
pub use loader::{PluginLoader, LANG_NAMESPACE};
pub use manifest::{
    PluginKind, PluginReference, ProjectManifest, Remote, PROJECT_MANIFEST_FILE,
    PROJECT_STATE_DIR,
};
pub use plugin::{
    CompileHandler, Emitter, GeneratedFile, PluginDescriptor, PluginEntry, PluginExports,
    Transform, TransformContext, BUILD_MANIFEST_FILE, DESCRIPTOR_FILE,
};
pub use registry::{HandlerRegistry, LanguageRegistry, LoadedPlugin};
pub use resolver::{
    LibraryBuilder, Resolution, ResolvedPlugin, Resolver, ResolverConfig, Revision,
};
pub use runtime::{BuildRuntime, BuildTask, RuntimeConfig, Trigger};
pub use store::{CrossRunStore, CROSS_RUN_FILE, LAST_UPDATE_KEY, VFS_KEY};
pub use vfs::{
    hash_bytes, OutputRecord, ReconcileStats, VfsConfig, VirtualFs, DEFAULT_POOL_SIZE,
};

#[cfg(feature = "watch")]
pub use watcher::{
    AdmissionGate, WatchConfig, WatchPipeline, WatcherKind, DEFAULT_DEBOUNCE,
};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

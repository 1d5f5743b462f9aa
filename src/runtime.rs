//! Build orchestration: full rebuilds, incremental tasks, watch glue, and
//! library build manifests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::capability::{Capability, CapabilityRegistry};
use crate::error::{Error, Result, Severity};
use crate::hooks::{BuildEvents, BuildHooks, HookContext};
use crate::loader::PluginLoader;
use crate::plugin::{Emitter, TransformContext, BUILD_MANIFEST_FILE};
use crate::registry::LanguageRegistry;
use crate::store::CrossRunStore;
use crate::vfs::{ReconcileStats, VfsConfig, VirtualFs, DEFAULT_POOL_SIZE};

/// What caused a compile task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Part of the initial full build.
    Initial,
    /// A watched file changed.
    Change,
    /// A watched file was removed.
    Remove,
}

/// An ephemeral per-file task, discarded after handling.
#[derive(Debug, Clone)]
pub struct BuildTask {
    /// What caused the task.
    pub trigger: Trigger,
    /// The source file to compile.
    pub source_path: PathBuf,
}

impl BuildTask {
    /// Create a task.
    pub fn new(trigger: Trigger, source_path: impl Into<PathBuf>) -> Self {
        Self {
            trigger,
            source_path: source_path.into(),
        }
    }
}

/// Configuration for the build runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Project root; output record keys are relative to it.
    pub project_root: PathBuf,
    /// Source tree to walk and watch.
    pub src_dir: PathBuf,
    /// Library mode: record outputs without writing them, emit a build manifest.
    pub library_mode: bool,
    /// Write pool width.
    pub pool_size: usize,
}

impl RuntimeConfig {
    /// Create a configuration rooted at a project directory.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            src_dir: project_root.join("src"),
            project_root,
            library_mode: false,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    /// Override the source directory.
    pub fn with_src_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.src_dir = dir.into();
        self
    }

    /// Enable library mode.
    pub fn with_library_mode(mut self, library: bool) -> Self {
        self.library_mode = library;
        self
    }

    /// Set the write pool width.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }
}

/// The process-scoped build context.
///
/// Owns the task lifecycle, hook dispatch order, and the virtual file
/// system; constructed once per run with explicit init and shutdown points.
pub struct BuildRuntime {
    config: RuntimeConfig,
    registry: Arc<LanguageRegistry>,
    capabilities: Arc<CapabilityRegistry>,
    vfs: Mutex<VirtualFs>,
    store: Arc<CrossRunStore>,
    hooks: BuildHooks,
    events: BuildEvents,
    project_config: serde_json::Value,
}

impl BuildRuntime {
    /// Create a runtime and wire the shared capability namespaces.
    pub fn new(
        config: RuntimeConfig,
        loader: &Arc<PluginLoader>,
        store: Arc<CrossRunStore>,
        project_config: serde_json::Value,
    ) -> Self {
        let vfs_config = VfsConfig::new(&config.project_root)
            .with_pool_size(config.pool_size)
            .with_dry_run(config.library_mode);
        let vfs = VirtualFs::from_store(vfs_config, &store);

        let capabilities = Arc::new(CapabilityRegistry::new());
        let config_value = project_config.clone();
        capabilities.register("config", false, move |_| {
            Ok(Capability::Data(config_value.clone()))
        });
        capabilities.register_service("store", store.clone());
        loader.clone().register_lang_namespace(&capabilities);

        Self {
            registry: loader.registry().clone(),
            config,
            capabilities,
            vfs: Mutex::new(vfs),
            store,
            hooks: BuildHooks::new(),
            events: BuildEvents::new(),
            project_config,
        }
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The loaded-plugin registry.
    pub fn registry(&self) -> &Arc<LanguageRegistry> {
        &self.registry
    }

    /// The capability registry.
    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    /// The cross-run store.
    pub fn store(&self) -> &Arc<CrossRunStore> {
        &self.store
    }

    /// Mutable access to the hook set, for setup before the first build.
    pub fn hooks_mut(&mut self) -> &mut BuildHooks {
        &mut self.hooks
    }

    /// Mutable access to the event set, for setup before the first build.
    pub fn events_mut(&mut self) -> &mut BuildEvents {
        &mut self.events
    }

    /// Record for one source file (project-relative), if any.
    pub fn output_record(&self, source: &Path) -> Option<crate::vfs::OutputRecord> {
        self.vfs.lock().record(source).cloned()
    }

    /// Walk the source tree and compile every file, strictly in walk order.
    ///
    /// Each file's compile-then-diff sequence completes before the next file
    /// starts. Task-scoped errors are reported and skipped; Critical errors
    /// abort the pass.
    pub fn rebuild_all(&self) -> Result<()> {
        let start = Instant::now();
        if !self.config.src_dir.is_dir() {
            return Err(Error::MissingSourceDir(self.config.src_dir.clone()));
        }

        self.hooks.run_pre_build(&self.project_config);

        let mut files = Vec::new();
        collect_files(&self.config.src_dir, &mut files)?;
        for file in &files {
            self.run_task(&BuildTask::new(Trigger::Initial, file))?;
        }

        self.events
            .on_build_complete
            .dispatch(&HookContext::project(self.project_config.clone()));
        self.hooks.run_post_build(true, &self.project_config);

        tracing::info!(
            "finished project build in {:.3}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }

    /// Handle one watch-triggered task, with pre/post hooks around it.
    ///
    /// All error kinds are reported here so a watch session survives failed
    /// builds; the returned severity lets callers decide to exit.
    pub fn handle_task(&self, task: &BuildTask) -> Option<Severity> {
        self.hooks.run_pre_build(&self.project_config);
        let outcome = self.run_task(task);
        self.hooks.run_post_build(outcome.is_ok(), &self.project_config);

        match outcome {
            Ok(()) => None,
            Err(e) => {
                tracing::error!("failed to build file {}: {}", task.source_path.display(), e);
                Some(e.severity())
            }
        }
    }

    /// Run one task: compile, diff, and recover from task-scoped errors.
    ///
    /// Returns `Err` only for Critical failures.
    pub fn run_task(&self, task: &BuildTask) -> Result<()> {
        self.events.before_build_start.dispatch(&HookContext::file(
            task.source_path.clone(),
            self.project_config.clone(),
        ));

        if task.trigger == Trigger::Remove {
            // Drop the removed source's outputs, then rebuild from scratch:
            // removal changes the authoritative key space in ways a
            // single-file diff cannot express.
            self.vfs.lock().reconcile(&task.source_path, Vec::new())?;
            tracing::info!("rebuilding project.");
            self.vfs.lock().flush();
            self.rebuild_all()?;
            tracing::info!("done rebuilding project!");
            return Ok(());
        }

        let start = Instant::now();
        let shown = task
            .source_path
            .strip_prefix(&self.config.src_dir)
            .unwrap_or(&task.source_path);
        tracing::info!("build file: {}", shown.display());

        match self.compile_one(&task.source_path) {
            Ok(stats) => {
                tracing::info!(
                    "finished task in {:.3}ms ({} written, {} deleted, {} unchanged)",
                    start.elapsed().as_secs_f64() * 1000.0,
                    stats.written,
                    stats.deleted,
                    stats.unchanged
                );
                Ok(())
            }
            Err(e) if e.is_task_scoped() => {
                tracing::error!("{}", e);
                tracing::info!("task failed!");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// After a library-mode build, write the aggregate build manifest.
    ///
    /// Every recorded file runs through the transform bound to its
    /// extension; extensions without a transform are silently omitted.
    pub fn write_build_manifest(&self) -> Result<PathBuf> {
        tracing::info!("running transforms on library");
        let vfs = self.vfs.lock();
        let mut manifest = serde_json::Map::new();

        for (source_key, outputs) in vfs.records() {
            let source_abs = self.config.project_root.join(source_key);
            let extension = dotted_extension(&source_abs);
            let Some(transform) = self.registry.transform(&extension) else {
                continue;
            };
            let relative = source_abs
                .strip_prefix(&self.config.src_dir)
                .unwrap_or(&source_abs)
                .to_path_buf();
            let ctx = TransformContext {
                source: &relative,
                outputs,
                root: &self.config.project_root,
                extension: &extension,
            };
            manifest.insert(
                relative.to_string_lossy().replace('\\', "/"),
                transform.transform(&ctx),
            );
        }

        let path = self.config.project_root.join(BUILD_MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_string(&serde_json::Value::Object(manifest))?)?;
        tracing::info!("done running transforms on library");
        Ok(path)
    }

    /// Maintenance sweep plus persistence; the runtime's teardown point.
    ///
    /// Library builds keep their record in memory only: a child build must
    /// not clobber the plugin project's own cross-run state.
    pub fn shutdown(&self) -> Result<()> {
        let mut vfs = self.vfs.lock();
        vfs.sweep_missing_sources()?;
        if !self.config.library_mode {
            vfs.persist_into(&self.store)?;
            self.store.save_on_exit()?;
        }
        Ok(())
    }

    // Helper methods

    fn compile_one(&self, source: &Path) -> Result<ReconcileStats> {
        let extension = dotted_extension(source);
        let handler = self
            .registry
            .handlers()
            .get(&extension)
            .ok_or(Error::UnknownExtension(extension.clone()))?;

        let mut emitter = Emitter::new();
        handler.compile(source, &mut emitter)?;
        self.vfs.lock().reconcile(source, emitter.take())
    }
}

impl std::fmt::Debug for BuildRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRuntime")
            .field("config", &self.config)
            .field("plugins", &self.registry.len())
            .finish()
    }
}

/// File extension with a leading dot; empty when the path has none.
fn dotted_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default()
}

/// Depth-first collection of regular files, in sorted walk order.
fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();

    for entry in entries {
        if entry.is_dir() {
            collect_files(&entry, files)?;
        } else {
            files.push(entry);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{PluginKind, PluginReference};
    use crate::plugin::PluginExports;
    use crate::registry::HandlerRegistry;
    use crate::resolver::{ResolvedPlugin, Revision};
    use serde_json::json;

    /// Runtime with one loaded language turning `.mcs` sources into a JSON
    /// output per line.
    fn runtime_with_line_compiler(project_root: &Path) -> BuildRuntime {
        let registry = Arc::new(LanguageRegistry::new());
        let loader = Arc::new(PluginLoader::new(registry));
        loader.set_resolved(vec![ResolvedPlugin {
            reference: PluginReference::local("lang-lines", "/unused"),
            kind: PluginKind::Language,
            revision: Revision::Local,
            install_path: PathBuf::from("/unused"),
        }]);

        let out_root = project_root.to_path_buf();
        loader.register_entry(
            "lines",
            Arc::new(move |handlers: &HandlerRegistry| -> Result<PluginExports> {
                let out_root = out_root.clone();
                handlers.register(
                    ".mcs",
                    Arc::new(move |source: &Path, emit: &mut Emitter| -> Result<()> {
                        let stem = source.file_stem().unwrap().to_string_lossy().to_string();
                        let content = std::fs::read_to_string(source)?;
                        for (i, line) in content.lines().enumerate() {
                            emit.emit(
                                out_root.join(format!("out/{}/{}.json", stem, i)),
                                format!("{:?}", line).into_bytes(),
                            );
                        }
                        Ok(())
                    }),
                );
                Ok(Arc::new(()))
            }),
        );
        loader.load_all().unwrap();

        let store = Arc::new(CrossRunStore::load(project_root).unwrap());
        BuildRuntime::new(
            RuntimeConfig::new(project_root),
            &loader,
            store,
            json!({}),
        )
    }

    fn write_source(root: &Path, name: &str, content: &str) {
        let path = root.join("src").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_full_rebuild_compiles_tree() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "a.mcs", "one\ntwo");
        write_source(dir.path(), "nested/b.mcs", "three");

        let runtime = runtime_with_line_compiler(dir.path());
        runtime.rebuild_all().unwrap();

        assert!(dir.path().join("out/a/0.json").exists());
        assert!(dir.path().join("out/a/1.json").exists());
        assert!(dir.path().join("out/b/0.json").exists());
    }

    #[test]
    fn test_rebuild_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "a.mcs", "one");

        let runtime = runtime_with_line_compiler(dir.path());
        runtime.rebuild_all().unwrap();
        let before = runtime.output_record(Path::new("src/a.mcs")).unwrap();

        runtime.rebuild_all().unwrap();
        let after = runtime.output_record(Path::new("src/a.mcs")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_recorded_outputs_exist_with_matching_hashes() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "a.mcs", "one\ntwo");

        let runtime = runtime_with_line_compiler(dir.path());
        runtime.rebuild_all().unwrap();

        let record = runtime.output_record(Path::new("src/a.mcs")).unwrap();
        assert!(!record.is_empty());
        for (output, hash) in &record {
            let on_disk = std::fs::read(dir.path().join(output)).unwrap();
            assert_eq!(&crate::vfs::hash_bytes(&on_disk), hash);
        }
    }

    #[test]
    fn test_missing_source_dir_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with_line_compiler(dir.path());
        // No src/ directory was created.
        assert!(matches!(
            runtime.rebuild_all(),
            Err(Error::MissingSourceDir(_))
        ));
    }

    #[test]
    fn test_unknown_extension_skips_file() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "a.mcs", "one");
        write_source(dir.path(), "readme.txt", "not compiled");

        let runtime = runtime_with_line_compiler(dir.path());
        // The .txt file is reported and skipped; the pass still succeeds.
        runtime.rebuild_all().unwrap();
        assert!(dir.path().join("out/a/0.json").exists());
        assert!(runtime.output_record(Path::new("src/readme.txt")).is_none());
    }

    #[test]
    fn test_change_task_rewrites_only_changed_output() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "a.mcs", "one\ntwo");

        let runtime = runtime_with_line_compiler(dir.path());
        runtime.rebuild_all().unwrap();

        write_source(dir.path(), "a.mcs", "one\nTWO");
        let source = dir.path().join("src/a.mcs");
        assert!(runtime
            .handle_task(&BuildTask::new(Trigger::Change, &source))
            .is_none());

        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/a/1.json")).unwrap(),
            "\"TWO\""
        );
    }

    #[test]
    fn test_remove_trigger_flushes_and_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "a.mcs", "one");
        write_source(dir.path(), "b.mcs", "two");

        let runtime = runtime_with_line_compiler(dir.path());
        runtime.rebuild_all().unwrap();
        assert!(dir.path().join("out/a/0.json").exists());

        let removed = dir.path().join("src/a.mcs");
        std::fs::remove_file(&removed).unwrap();
        assert!(runtime
            .handle_task(&BuildTask::new(Trigger::Remove, &removed))
            .is_none());

        // The removed source's outputs are gone and the rebuilt record only
        // covers the surviving tree.
        assert!(!dir.path().join("out/a/0.json").exists());
        assert!(dir.path().join("out/b/0.json").exists());
        assert!(runtime.output_record(Path::new("src/a.mcs")).is_none());
        assert!(runtime.output_record(Path::new("src/b.mcs")).is_some());
    }

    #[test]
    fn test_deleted_source_outputs_pruned_after_sweep() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "a.mcs", "one");

        let runtime = runtime_with_line_compiler(dir.path());
        runtime.rebuild_all().unwrap();
        assert!(dir.path().join("out/a/0.json").exists());

        std::fs::remove_file(dir.path().join("src/a.mcs")).unwrap();
        runtime.shutdown().unwrap();

        assert!(!dir.path().join("out/a/0.json").exists());
        // Emptied directories pruned up to, but not including, the root.
        assert!(!dir.path().join("out/a").exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_shutdown_persists_vfs_into_store() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "a.mcs", "one");

        {
            let runtime = runtime_with_line_compiler(dir.path());
            runtime.rebuild_all().unwrap();
            runtime.shutdown().unwrap();
        }

        // A fresh runtime restores the record and sees nothing to redo.
        write_source(dir.path(), "a.mcs", "one");
        let runtime = runtime_with_line_compiler(dir.path());
        let record = runtime.output_record(Path::new("src/a.mcs")).unwrap();
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn test_library_mode_writes_manifest_not_outputs() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "a.mcs", "one\ntwo");

        let registry = Arc::new(LanguageRegistry::new());
        let loader = Arc::new(PluginLoader::new(registry));
        loader.set_resolved(vec![ResolvedPlugin {
            reference: PluginReference::local("lang-lines", "/unused"),
            kind: PluginKind::Language,
            revision: Revision::Local,
            install_path: PathBuf::from("/unused"),
        }]);
        let out_root = dir.path().to_path_buf();
        loader.register_entry(
            "lines",
            Arc::new(move |handlers: &HandlerRegistry| -> Result<PluginExports> {
                let out_root = out_root.clone();
                handlers.register(
                    ".mcs",
                    Arc::new(move |source: &Path, emit: &mut Emitter| -> Result<()> {
                        let content = std::fs::read_to_string(source)?;
                        emit.emit(
                            out_root.join("out/a.json"),
                            format!("{}", content.lines().count()).into_bytes(),
                        );
                        Ok(())
                    }),
                );
                Ok(Arc::new(()))
            }),
        );
        loader.load_all().unwrap();
        loader.registry().register_transform(
            ".mcs",
            Arc::new(|ctx: &TransformContext<'_>| json!({ "outputs": ctx.outputs.len() })),
        );

        let store = Arc::new(CrossRunStore::load(dir.path()).unwrap());
        let runtime = BuildRuntime::new(
            RuntimeConfig::new(dir.path()).with_library_mode(true),
            &loader,
            store,
            json!({}),
        );

        runtime.rebuild_all().unwrap();
        // Dry-run: no outputs on disk.
        assert!(!dir.path().join("out/a.json").exists());

        let manifest_path = runtime.write_build_manifest().unwrap();
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["a.mcs"]["outputs"], json!(1));
    }

    #[test]
    fn test_capability_namespaces_wired() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with_line_compiler(dir.path());

        assert!(runtime.capabilities().contains("config"));
        assert!(runtime.capabilities().contains("store"));
        assert!(runtime.capabilities().contains("lang"));

        let store = runtime.capabilities().request("store").unwrap();
        assert!(store.service::<CrossRunStore>().is_some());
    }
}

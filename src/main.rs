//! langforge CLI: resolve plugins, build once or watch, manage the manifest.

use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use langforge::{
    BuildRuntime, CatalogClient, CrossRunStore, Error, LanguageRegistry, PluginKind,
    PluginLoader, ProjectConfig, ProjectManifest, Resolver, ResolverConfig, Result,
    RuntimeConfig, DEFAULT_POOL_SIZE,
};

#[cfg(feature = "watch")]
use langforge::{WatchConfig, WatchPipeline, WatcherKind};

/// Pluggable incremental build engine.
#[derive(Parser)]
#[command(name = "langforge", version, about, long_about = None)]
struct Cli {
    /// Skip all network resolution and reuse cached plugins.
    #[arg(long, global = true)]
    offline: bool,

    /// Write pool width for generated outputs.
    #[arg(long, global = true, value_name = "N")]
    io_pool_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single full build.
    Build {
        /// Build as a library, producing a build manifest.
        #[arg(long, value_name = "NAME")]
        lib: Option<String>,
    },

    /// Run a full build, then rebuild on file changes.
    #[cfg(feature = "watch")]
    Watch {
        /// Use the polling watcher with a debounce window.
        #[arg(long)]
        alt_watcher: bool,

        /// Debounce window in milliseconds.
        #[arg(long, value_name = "MS", default_value_t = 100)]
        debounce_ms: u64,
    },

    /// Validate a plugin against the remote catalog and add it to the project.
    Add {
        /// Plugin kind.
        kind: AddKind,
        /// Published plugin name.
        name: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AddKind {
    /// A compiler language plugin.
    Lang,
    /// A library plugin.
    Lib,
}

impl From<AddKind> for PluginKind {
    fn from(kind: AddKind) -> Self {
        match kind {
            AddKind::Lang => PluginKind::Language,
            AddKind::Lib => PluginKind::Library,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let project_root = std::env::current_dir()?;
    let pool_size = pool_size(cli.io_pool_size)?;

    match cli.command {
        Commands::Build { lib } => cmd_build(&project_root, cli.offline, pool_size, lib),
        #[cfg(feature = "watch")]
        Commands::Watch {
            alt_watcher,
            debounce_ms,
        } => cmd_watch(&project_root, cli.offline, pool_size, alt_watcher, debounce_ms),
        Commands::Add { kind, name } => cmd_add(&project_root, kind, &name),
    }
}

fn pool_size(requested: Option<usize>) -> Result<usize> {
    match requested {
        Some(0) => Err(Error::user(
            "invalid io pool size, expected a positive non-zero number",
        )),
        Some(n) => Ok(n),
        None => Ok(DEFAULT_POOL_SIZE),
    }
}

/// Resolve, install, and load the project's plugins, then build a runtime.
fn setup_runtime(
    project_root: &Path,
    offline: bool,
    pool_size: usize,
    library_mode: bool,
) -> Result<Arc<BuildRuntime>> {
    let manifest = ProjectManifest::load_or_init(project_root)?;

    let resolver = Resolver::new(ResolverConfig::new().with_offline(offline));
    let resolved = resolver.install_manifest(&manifest, &mut |ident, path| {
        build_library(ident, path, offline, pool_size)
    })?;

    let registry = Arc::new(LanguageRegistry::new());
    let loader = Arc::new(PluginLoader::new(registry));
    loader.set_resolved(resolved);

    let mut config = ProjectConfig::load(project_root)?;
    for (ident, descriptor) in loader.descriptors() {
        config.merge_defaults(&ident, &descriptor.config);
    }

    loader.load_all()?;
    if library_mode {
        loader.load_transforms();
    }

    let store = Arc::new(CrossRunStore::load(project_root)?);
    let runtime = BuildRuntime::new(
        RuntimeConfig::new(project_root)
            .with_library_mode(library_mode)
            .with_pool_size(pool_size),
        &loader,
        store,
        config.value().clone(),
    );
    Ok(Arc::new(runtime))
}

/// Reentrant library build: the same pipeline over the plugin's own tree,
/// in library mode.
fn build_library(ident: &str, install_path: &Path, offline: bool, pool_size: usize) -> Result<()> {
    tracing::info!("building library {}!", ident);
    let runtime = setup_runtime(install_path, offline, pool_size, true)?;
    runtime.rebuild_all()?;
    runtime.write_build_manifest()?;
    runtime.shutdown()?;
    Ok(())
}

/// Flush persisted state on interrupt or panic, at most once overall.
fn install_exit_handlers(runtime: &Arc<BuildRuntime>, shutdown: &Arc<AtomicBool>) {
    let on_interrupt = runtime.clone();
    let flag = shutdown.clone();
    let result = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
        tracing::info!("shutdown signal received");
        tracing::info!("writing cross run data to disk");
        let _ = on_interrupt.shutdown();
        tracing::info!("exiting...");
        std::process::exit(0);
    });
    if let Err(e) = result {
        tracing::warn!("could not install interrupt handler: {}", e);
    }

    let on_panic = runtime.clone();
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        let _ = on_panic.shutdown();
    }));
}

fn cmd_build(project_root: &Path, offline: bool, pool_size: usize, lib: Option<String>) -> Result<()> {
    let library_mode = lib.is_some();
    let runtime = setup_runtime(project_root, offline, pool_size, library_mode)?;
    let shutdown = Arc::new(AtomicBool::new(false));
    install_exit_handlers(&runtime, &shutdown);

    tracing::info!("doing initial build.");
    runtime.rebuild_all()?;

    if let Some(name) = lib {
        tracing::info!("running transforms on lib {}", name);
        runtime.write_build_manifest()?;
    }

    runtime.shutdown()
}

#[cfg(feature = "watch")]
fn cmd_watch(
    project_root: &Path,
    offline: bool,
    pool_size: usize,
    alt_watcher: bool,
    debounce_ms: u64,
) -> Result<()> {
    let runtime = setup_runtime(project_root, offline, pool_size, false)?;
    let shutdown = Arc::new(AtomicBool::new(false));
    install_exit_handlers(&runtime, &shutdown);

    tracing::info!("doing initial build.");
    runtime.rebuild_all()?;
    tracing::info!("done initial build... waiting for file changes");

    let kind = if alt_watcher {
        WatcherKind::Polling
    } else {
        WatcherKind::Native
    };
    if alt_watcher {
        tracing::info!("set build debounce time to {}ms", debounce_ms);
    }
    let config = WatchConfig::new()
        .with_kind(kind)
        .with_debounce(std::time::Duration::from_millis(debounce_ms));

    WatchPipeline::new(config, runtime.clone()).run(shutdown)?;

    tracing::info!("writing cross run data to disk");
    runtime.shutdown()
}

fn cmd_add(project_root: &Path, kind: AddKind, name: &str) -> Result<()> {
    let kind = PluginKind::from(kind);
    let client = CatalogClient::default_endpoint();
    let reference = client.entry(kind, name)?;

    let mut manifest = ProjectManifest::load_or_init(project_root)?;
    match kind {
        PluginKind::Language => {
            tracing::info!("adding language...");
            manifest.add_language(reference)?;
        }
        PluginKind::Library => {
            tracing::info!("adding library...");
            manifest.add_library(reference)?;
        }
    }
    manifest.save(project_root)?;
    tracing::info!("finished adding {} '{}' to project!", kind, name);
    Ok(())
}

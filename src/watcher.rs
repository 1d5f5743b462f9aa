//! Watch pipeline: filesystem events become incremental compile tasks.
//!
//! Admission control is deliberately simple: at most one build in flight,
//! and events arriving while one is active are dropped with a warning, never
//! queued. The alternate (polling) watcher adds a debounce window that keeps
//! the gate closed for a while after each build. Bounded memory and latency
//! are traded for perfect event coverage; a dropped event needs another save
//! to converge.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::ProjectConfig;
use crate::error::{Error, Result};
use crate::runtime::{BuildRuntime, BuildTask, Trigger};

/// Default debounce window for the polling watcher.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Which watcher backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    /// Platform-native change notifications.
    Native,
    /// Polling backend with a debounce window.
    Polling,
}

/// Configuration for the watch pipeline.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Debounce window; only applied by the polling watcher.
    pub debounce: Duration,
    /// Watcher backend.
    pub kind: WatcherKind,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            kind: WatcherKind::Native,
        }
    }
}

impl WatchConfig {
    /// Create a default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Select the watcher backend.
    pub fn with_kind(mut self, kind: WatcherKind) -> Self {
        self.kind = kind;
        self
    }
}

/// At-most-one-build-in-flight admission control.
///
/// No fairness: a rejected event is simply gone.
pub struct AdmissionGate {
    in_flight: Arc<AtomicBool>,
}

impl AdmissionGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Try to claim the build slot.
    pub fn try_admit(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Reopen the gate after the debounce window elapses.
    pub fn release_after(&self, delay: Duration) {
        if delay.is_zero() {
            self.in_flight.store(false, Ordering::SeqCst);
            return;
        }
        let in_flight = self.in_flight.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            in_flight.store(false, Ordering::SeqCst);
        });
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for AdmissionGate {
    fn clone(&self) -> Self {
        Self {
            in_flight: self.in_flight.clone(),
        }
    }
}

/// Map a filesystem event to a compile trigger.
///
/// Creations compile like changes; everything else is ignored.
pub fn classify(kind: &EventKind) -> Option<Trigger> {
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) => Some(Trigger::Change),
        EventKind::Remove(_) => Some(Trigger::Remove),
        _ => None,
    }
}

enum AnyWatcher {
    Native(RecommendedWatcher),
    Polling(PollWatcher),
}

impl AnyWatcher {
    fn watch(&mut self, path: &Path, mode: RecursiveMode) -> Result<()> {
        let result = match self {
            Self::Native(w) => w.watch(path, mode),
            Self::Polling(w) => w.watch(path, mode),
        };
        result.map_err(|e| Error::critical(format!("watch error: {}", e)))
    }
}

/// Binds a filesystem watcher to a build runtime.
pub struct WatchPipeline {
    config: WatchConfig,
    runtime: Arc<BuildRuntime>,
}

impl WatchPipeline {
    /// Create a pipeline over a runtime.
    pub fn new(config: WatchConfig, runtime: Arc<BuildRuntime>) -> Self {
        Self { config, runtime }
    }

    /// The watch configuration.
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Watch the source tree and the config file until `shutdown` is set.
    ///
    /// Builds run on this thread; events arriving while one is active are
    /// dropped by the watcher callback with a warning.
    pub fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let src_dir = self.runtime.config().src_dir.clone();
        let project_root = self.runtime.config().project_root.clone();
        if !src_dir.is_dir() {
            return Err(Error::MissingSourceDir(src_dir));
        }

        let gate = AdmissionGate::new();
        let (tx, rx) = mpsc::channel::<(Trigger, PathBuf)>();

        let config_path = ProjectConfig::file_for(&project_root);
        let callback = {
            let gate = gate.clone();
            let src_dir = src_dir.clone();
            let config_path = config_path.clone();
            move |result: notify::Result<Event>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!("watch error: {}", e);
                        return;
                    }
                };
                let Some(path) = event.paths.first() else {
                    return;
                };
                if config_path.as_deref() == Some(path.as_path()) {
                    tracing::warn!(
                        "the project config has changed, restart to use the updated config"
                    );
                    return;
                }
                if !path.starts_with(&src_dir) {
                    return;
                }
                let Some(trigger) = classify(&event.kind) else {
                    return;
                };
                if trigger == Trigger::Change && !path.is_file() {
                    return;
                }
                if !gate.try_admit() {
                    tracing::warn!(
                        "building too fast! skipping build for file {}. rebuild if project not up to date.",
                        path.display()
                    );
                    return;
                }
                let _ = tx.send((trigger, path.clone()));
            }
        };

        let mut watcher = match self.config.kind {
            WatcherKind::Native => AnyWatcher::Native(
                RecommendedWatcher::new(callback, Config::default())
                    .map_err(|e| Error::critical(format!("watch error: {}", e)))?,
            ),
            WatcherKind::Polling => {
                tracing::warn!("using non-standard polling file watcher");
                AnyWatcher::Polling(
                    PollWatcher::new(
                        callback,
                        Config::default().with_poll_interval(Duration::from_millis(50)),
                    )
                    .map_err(|e| Error::critical(format!("watch error: {}", e)))?,
                )
            }
        };

        watcher.watch(&src_dir, RecursiveMode::Recursive)?;
        if let Some(ref path) = config_path {
            watcher.watch(path, RecursiveMode::NonRecursive)?;
        }

        tracing::info!("waiting for file changes");
        while !shutdown.load(Ordering::SeqCst) {
            let (trigger, path) = match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(item) => item,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };

            self.runtime.handle_task(&BuildTask::new(trigger, path));

            // The gate reopens only after the debounce timer elapses.
            let delay = match self.config.kind {
                WatcherKind::Polling => self.config.debounce,
                WatcherKind::Native => Duration::ZERO,
            };
            gate.release_after(delay);
        }

        Ok(())
    }
}

impl std::fmt::Debug for WatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchPipeline")
            .field("config", &self.config)
            .finish()
    }
}

//! User-supplied build hooks and named dispatchable events.

use std::path::PathBuf;
use std::time::Instant;

use serde_json::Value;

/// Payload handed to hooks and event callbacks.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// File the event concerns; `None` for whole-project passes.
    pub file: Option<PathBuf>,
    /// Whether the pass succeeded; only set for post-build hooks.
    pub success: Option<bool>,
    /// The merged project configuration.
    pub config: Value,
}

impl HookContext {
    /// Context for a whole-project pass.
    pub fn project(config: Value) -> Self {
        Self {
            file: None,
            success: None,
            config,
        }
    }

    /// Context for a single-file event.
    pub fn file(path: impl Into<PathBuf>, config: Value) -> Self {
        Self {
            file: Some(path.into()),
            success: None,
            config,
        }
    }
}

/// How a hook signalled completion.
pub enum HookCompletion {
    /// The hook finished before returning.
    Immediate,
    /// The hook's work continues on another thread; elapsed time is logged
    /// only once the handle joins.
    Deferred(std::thread::JoinHandle<()>),
}

type HookFn = Box<dyn Fn(&HookContext) -> HookCompletion + Send + Sync>;

/// The pre/post build hook set.
#[derive(Default)]
pub struct BuildHooks {
    pre_build: Option<HookFn>,
    post_build: Option<HookFn>,
    on_build_success: Option<HookFn>,
}

impl BuildHooks {
    /// Create an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pre-build hook.
    pub fn on_pre_build<F>(&mut self, hook: F)
    where
        F: Fn(&HookContext) -> HookCompletion + Send + Sync + 'static,
    {
        self.pre_build = Some(Box::new(hook));
    }

    /// Set the post-build hook.
    pub fn on_post_build<F>(&mut self, hook: F)
    where
        F: Fn(&HookContext) -> HookCompletion + Send + Sync + 'static,
    {
        self.post_build = Some(Box::new(hook));
    }

    /// Set the deprecated success-only hook.
    ///
    /// Kept as an alias for older configurations; prefer
    /// [`BuildHooks::on_post_build`] and checking `success`.
    pub fn on_build_success<F>(&mut self, hook: F)
    where
        F: Fn(&HookContext) -> HookCompletion + Send + Sync + 'static,
    {
        self.on_build_success = Some(Box::new(hook));
    }

    /// Run the pre-build hook for a whole-project pass.
    pub fn run_pre_build(&self, config: &Value) {
        run_timed("preBuild", &self.pre_build, HookContext::project(config.clone()));
    }

    /// Run the post-build hook (and the deprecated alias) after a pass.
    pub fn run_post_build(&self, success: bool, config: &Value) {
        if let Some(hook) = &self.on_build_success {
            tracing::error!(
                "onBuildSuccess is deprecated, use postBuild and check build.success instead"
            );
            if success {
                let mut ctx = HookContext::project(config.clone());
                ctx.success = Some(true);
                hook(&ctx);
            }
        }

        let mut ctx = HookContext::project(config.clone());
        ctx.success = Some(success);
        run_timed("postBuild", &self.post_build, ctx);
    }
}

impl std::fmt::Debug for BuildHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildHooks")
            .field("pre_build", &self.pre_build.is_some())
            .field("post_build", &self.post_build.is_some())
            .field("on_build_success", &self.on_build_success.is_some())
            .finish()
    }
}

fn run_timed(name: &'static str, hook: &Option<HookFn>, ctx: HookContext) {
    let Some(hook) = hook else {
        return;
    };
    tracing::info!("starting {}", name);
    let start = Instant::now();
    match hook(&ctx) {
        HookCompletion::Immediate => {
            tracing::info!(
                "finished {} after {:.3}ms",
                name,
                start.elapsed().as_secs_f64() * 1000.0
            );
        }
        HookCompletion::Deferred(handle) => {
            // Deferred hooks report once the work actually finishes.
            std::thread::spawn(move || {
                let _ = handle.join();
                tracing::info!(
                    "finished {} after {:.3}ms",
                    name,
                    start.elapsed().as_secs_f64() * 1000.0
                );
            });
        }
    }
}

/// A named callback list dispatched with elapsed-time logging.
pub struct DispatchableEvent {
    name: String,
    funcs: Vec<Box<dyn Fn(&HookContext) + Send + Sync>>,
}

impl DispatchableEvent {
    /// Create a named event.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            funcs: Vec::new(),
        }
    }

    /// Add a callback.
    pub fn add<F>(&mut self, func: F)
    where
        F: Fn(&HookContext) + Send + Sync + 'static,
    {
        self.funcs.push(Box::new(func));
    }

    /// Dispatch to every callback, in registration order.
    pub fn dispatch(&self, ctx: &HookContext) {
        if self.funcs.is_empty() {
            return;
        }
        tracing::info!("starting {}", self.name);
        let start = Instant::now();
        for func in &self.funcs {
            func(ctx);
        }
        tracing::info!(
            "done {} in {:.3}ms",
            self.name,
            start.elapsed().as_secs_f64() * 1000.0
        );
    }
}

impl std::fmt::Debug for DispatchableEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchableEvent")
            .field("name", &self.name)
            .field("callbacks", &self.funcs.len())
            .finish()
    }
}

/// The orchestrator's built-in event set.
#[derive(Debug)]
pub struct BuildEvents {
    /// Fired before every compile task.
    pub before_build_start: DispatchableEvent,
    /// Fired once a full rebuild finishes compiling.
    pub on_build_complete: DispatchableEvent,
}

impl BuildEvents {
    /// Create the event set.
    pub fn new() -> Self {
        Self {
            before_build_start: DispatchableEvent::new("beforeBuildStart"),
            on_build_complete: DispatchableEvent::new("onBuildComplete"),
        }
    }
}

impl Default for BuildEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_hooks_fire_with_project_context() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();

        let mut hooks = BuildHooks::new();
        hooks.on_pre_build(move |ctx| {
            assert!(ctx.file.is_none());
            seen.fetch_add(1, Ordering::SeqCst);
            HookCompletion::Immediate
        });

        hooks.run_pre_build(&serde_json::json!({}));
        hooks.run_pre_build(&serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_post_build_reports_success_flag() {
        let last = Arc::new(parking_lot::Mutex::new(None));
        let seen = last.clone();

        let mut hooks = BuildHooks::new();
        hooks.on_post_build(move |ctx| {
            *seen.lock() = ctx.success;
            HookCompletion::Immediate
        });

        hooks.run_post_build(false, &serde_json::json!({}));
        assert_eq!(*last.lock(), Some(false));

        hooks.run_post_build(true, &serde_json::json!({}));
        assert_eq!(*last.lock(), Some(true));
    }

    #[test]
    fn test_deprecated_alias_fires_only_on_success() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();

        let mut hooks = BuildHooks::new();
        hooks.on_build_success(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            HookCompletion::Immediate
        });

        hooks.run_post_build(false, &serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        hooks.run_post_build(true, &serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_hook_work_completes() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();

        let mut hooks = BuildHooks::new();
        hooks.on_pre_build(move |_| {
            let inner = seen.clone();
            HookCompletion::Deferred(std::thread::spawn(move || {
                inner.fetch_add(1, Ordering::SeqCst);
            }))
        });

        hooks.run_pre_build(&serde_json::json!({}));

        // The deferred thread finishes independently of the call.
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) == 1 {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("deferred hook never completed");
    }

    #[test]
    fn test_event_dispatch_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut event = DispatchableEvent::new("test");
        for i in 0..3 {
            let log = log.clone();
            event.add(move |_| log.lock().push(i));
        }

        event.dispatch(&HookContext::project(serde_json::json!({})));
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }
}

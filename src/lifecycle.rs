//! Process-wide lifecycle registry.
//!
//! Children that are not detached must die with the hosting process, however
//! it ends. Rust has no ambient "process exit" event, so the registry makes
//! those events explicit:
//!
//! - **Exit hooks** run once from [`Lifecycle::run_exit_hooks`], which the
//!   signal handlers and [`Lifecycle::exit`] call before the process exits.
//! - **Fatal hooks** run once from [`Lifecycle::dispatch_fatal`], which
//!   [`Lifecycle::catch_fatal`] calls when a panic unwinds out of the code it
//!   guards. Panics that are caught on the way, such as a failed tokio task
//!   observed through its `JoinHandle`, never get there. The panic keeps
//!   unwinding only when no fatal listener is registered.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Identifier returned by hook and listener registration.
pub type HookId = u64;

type Hook = Box<dyn FnOnce() + Send + 'static>;
type FatalListener = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// When a one-shot hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// The hosting process is about to exit.
    Exit,
    /// The hosting process hit an unhandled fatal error.
    Fatal,
}

/// What to do with a fatal error after the fatal hooks ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalDisposition {
    /// No listener handles it; report it as usual.
    Reraise,
    /// At least one listener took it.
    Handled,
}

#[derive(Default)]
struct Registry {
    next_id: HookId,
    exit_hooks: Vec<(HookId, Hook)>,
    fatal_hooks: Vec<(HookId, Hook)>,
    fatal_listeners: Vec<(HookId, FatalListener)>,
}

impl Registry {
    fn next_id(&mut self) -> HookId {
        self.next_id += 1;
        self.next_id
    }
}

/// Registry of shutdown hooks and process-wide handlers.
#[derive(Default)]
pub struct Lifecycle {
    registry: Mutex<Registry>,
    signal_listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("exit_hooks", &self.hook_count(HookKind::Exit))
            .field("fatal_hooks", &self.hook_count(HookKind::Fatal))
            .field("fatal_listeners", &self.fatal_listener_count())
            .field("signals_installed", &self.signal_handlers_installed())
            .finish()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    pub fn global() -> Arc<Lifecycle> {
        static GLOBAL: OnceLock<Arc<Lifecycle>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Lifecycle::new())).clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a hook that runs at most once.
    pub fn register_shutdown_hook<F>(&self, kind: HookKind, hook: F) -> HookId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut registry = self.lock();
        let id = registry.next_id();
        match kind {
            HookKind::Exit => registry.exit_hooks.push((id, Box::new(hook))),
            HookKind::Fatal => registry.fatal_hooks.push((id, Box::new(hook))),
        }
        id
    }

    /// Remove a hook that has not fired yet. Returns `false` if it was unknown.
    pub fn unregister_shutdown_hook(&self, id: HookId) -> bool {
        let mut registry = self.lock();
        let before = registry.exit_hooks.len() + registry.fatal_hooks.len();
        registry.exit_hooks.retain(|(hook_id, _)| *hook_id != id);
        registry.fatal_hooks.retain(|(hook_id, _)| *hook_id != id);
        before != registry.exit_hooks.len() + registry.fatal_hooks.len()
    }

    /// Number of pending hooks of the given kind.
    pub fn hook_count(&self, kind: HookKind) -> usize {
        let registry = self.lock();
        match kind {
            HookKind::Exit => registry.exit_hooks.len(),
            HookKind::Fatal => registry.fatal_hooks.len(),
        }
    }

    /// Register a persistent handler for fatal errors.
    pub fn register_fatal_listener<F>(&self, listener: F) -> HookId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.next_id();
        registry.fatal_listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn unregister_fatal_listener(&self, id: HookId) -> bool {
        let mut registry = self.lock();
        let before = registry.fatal_listeners.len();
        registry.fatal_listeners.retain(|(listener_id, _)| *listener_id != id);
        before != registry.fatal_listeners.len()
    }

    pub fn fatal_listener_count(&self) -> usize {
        self.lock().fatal_listeners.len()
    }

    /// Run and discard every pending exit hook.
    pub fn run_exit_hooks(&self) -> usize {
        let hooks = std::mem::take(&mut self.lock().exit_hooks);
        let count = hooks.len();
        for (_, hook) in hooks {
            hook();
        }
        if count > 0 {
            debug!(count, "Ran exit hooks");
        }
        count
    }

    /// Run pending fatal hooks, then hand the error to registered listeners.
    pub fn dispatch_fatal(&self, message: &str) -> FatalDisposition {
        let (hooks, listeners) = {
            let mut registry = self.lock();
            let hooks = std::mem::take(&mut registry.fatal_hooks);
            let listeners: Vec<FatalListener> = registry
                .fatal_listeners
                .iter()
                .map(|(_, l)| l.clone())
                .collect();
            (hooks, listeners)
        };

        for (_, hook) in hooks {
            hook();
        }

        if listeners.is_empty() {
            return FatalDisposition::Reraise;
        }
        for listener in listeners {
            listener(message);
        }
        FatalDisposition::Handled
    }

    /// Run `f`, treating a panic that escapes it as a fatal error.
    ///
    /// Fatal hooks run and listeners are notified. Without listeners the
    /// panic resumes unwinding; otherwise `None` is returned.
    pub fn catch_fatal<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Some(value),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                match self.dispatch_fatal(&message) {
                    FatalDisposition::Reraise => std::panic::resume_unwind(payload),
                    FatalDisposition::Handled => None,
                }
            }
        }
    }

    /// Whether the SIGTERM/SIGINT listener is installed and still running.
    pub fn signal_handlers_installed(&self) -> bool {
        self.signal_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|listener| !listener.is_finished())
    }

    /// Exit with status 0 on SIGTERM or SIGINT, after running exit hooks.
    ///
    /// The listener runs on its own thread and runtime, so it does not depend
    /// on the caller's runtime staying alive. Returns `true` only for the
    /// call that actually installed it.
    pub fn install_signal_handlers(self: &Arc<Self>) -> bool {
        let mut slot = self.signal_listener.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|listener| !listener.is_finished()) {
            return false;
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let lifecycle = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("sim-launcher-signals".to_string())
            .spawn(move || listen_for_shutdown(lifecycle, ready_tx));
        let listener = match spawned {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "Could not start signal listener");
                return false;
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *slot = Some(listener);
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Signal handlers not installed");
                false
            }
            Err(_) => {
                warn!("Signal listener stopped before installing handlers");
                false
            }
        }
    }

    /// Run exit hooks and terminate the process.
    pub fn exit(&self, code: i32) -> ! {
        self.run_exit_hooks();
        std::process::exit(code)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Body of the signal listener thread.
fn listen_for_shutdown(lifecycle: Arc<Lifecycle>, ready: mpsc::Sender<std::io::Result<()>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    runtime.block_on(async move {
        let signals = match ShutdownSignals::register() {
            Ok(signals) => signals,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        signals.recv().await;
        info!("Shutdown signal received");
        lifecycle.exit(0);
    });
}

#[cfg(unix)]
struct ShutdownSignals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => {},
            _ = self.sigint.recv() => {},
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(not(unix))]
impl ShutdownSignals {
    fn register() -> std::io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    async fn recv(mut self) {
        self.ctrl_c.recv().await;
    }
}

//! Spawning the simulator process.

use crate::error::LaunchError;
use crate::instances::Signaller;
use crate::lifecycle::{HookId, HookKind, Lifecycle};
use crate::request::{LaunchRequest, SimulatorConfig};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Where one of the child's standard streams goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    Null,
    Inherit,
    /// Opened in append mode, created if missing.
    File(PathBuf),
}

impl StreamTarget {
    fn open(&self) -> Result<Stdio, LaunchError> {
        match self {
            StreamTarget::Null => Ok(Stdio::null()),
            StreamTarget::Inherit => Ok(Stdio::inherit()),
            StreamTarget::File(path) => open_append(path).map(Stdio::from),
        }
    }
}

fn open_append(path: &Path) -> Result<std::fs::File, LaunchError> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|source| LaunchError::Redirect {
            path: path.to_path_buf(),
            source,
        })
}

/// Standard stream wiring for the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioPlan {
    pub stdin: StreamTarget,
    pub stdout: StreamTarget,
    pub stderr: StreamTarget,
}

impl StdioPlan {
    /// Null streams, inherited when verbose, with per-stream file overrides.
    pub fn for_request(request: &LaunchRequest) -> Self {
        let base = if request.verbose {
            StreamTarget::Inherit
        } else {
            StreamTarget::Null
        };
        let pick = |file: &Option<PathBuf>| match file {
            Some(path) => StreamTarget::File(path.clone()),
            None => base.clone(),
        };
        Self {
            stdin: pick(&request.stdin),
            stdout: pick(&request.stdout),
            stderr: pick(&request.stderr),
        }
    }
}

/// Lifecycle hooks that terminate a child when this process ends.
#[derive(Debug)]
pub struct ChildHooks {
    lifecycle: Arc<Lifecycle>,
    ids: [HookId; 2],
}

impl ChildHooks {
    /// Remove the hooks, e.g. once the child has been stopped explicitly.
    pub fn unregister(self) {
        for id in self.ids {
            self.lifecycle.unregister_shutdown_hook(id);
        }
    }
}

/// A freshly spawned simulator.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub child: Child,
    pub pid: u32,
    /// `None` when the child was detached.
    pub hooks: Option<ChildHooks>,
}

/// Spawns simulator processes and couples them to this process's lifetime.
#[derive(Clone)]
pub struct ProcessLauncher {
    lifecycle: Arc<Lifecycle>,
    signaller: Arc<dyn Signaller>,
}

impl ProcessLauncher {
    pub fn new(lifecycle: Arc<Lifecycle>, signaller: Arc<dyn Signaller>) -> Self {
        Self {
            lifecycle,
            signaller,
        }
    }

    /// Spawn the simulator described by `config`.
    pub fn launch(&self, config: &SimulatorConfig) -> Result<LaunchedProcess, LaunchError> {
        let plan = StdioPlan::for_request(&config.request);
        let detached = config.request.exit;

        let mut command = Command::new(&config.bin);
        command
            .args(config.args())
            .stdin(plan.stdin.open()?)
            .stdout(plan.stdout.open()?)
            .stderr(plan.stderr.open()?)
            .kill_on_drop(false);

        if detached {
            detach(&mut command);
        }

        let spawn_err = |source: std::io::Error| LaunchError::Spawn {
            bin: config.bin.clone(),
            source,
        };
        let child = command.spawn().map_err(spawn_err)?;
        let pid = child.id().ok_or_else(|| {
            spawn_err(std::io::Error::other("simulator exited before its pid was read"))
        })?;

        info!(
            bin = %config.bin.display(),
            port = config.port,
            pid,
            detached,
            "Spawned simulator"
        );

        let hooks = if detached {
            None
        } else {
            Some(self.couple_to_parent(pid))
        };

        Ok(LaunchedProcess { child, pid, hooks })
    }

    /// Register exit and fatal hooks that SIGTERM the child at most once.
    fn couple_to_parent(&self, pid: u32) -> ChildHooks {
        let signalled = Arc::new(AtomicBool::new(false));
        let make_hook = |reason: &'static str| {
            let signaller = self.signaller.clone();
            let signalled = signalled.clone();
            move || {
                if signalled.swap(true, Ordering::SeqCst) {
                    return;
                }
                debug!(pid, reason, "Terminating simulator with parent");
                if let Err(e) = signaller.terminate(pid) {
                    warn!(pid, error = %e, "Failed to terminate simulator");
                }
            }
        };

        let exit_id = self
            .lifecycle
            .register_shutdown_hook(HookKind::Exit, make_hook("exit"));
        let fatal_id = self
            .lifecycle
            .register_shutdown_hook(HookKind::Fatal, make_hook("fatal error"));
        ChildHooks {
            lifecycle: self.lifecycle.clone(),
            ids: [exit_id, fatal_id],
        }
    }
}

/// Keep the child out of this process's signal group so it survives it.
#[cfg(unix)]
fn detach(command: &mut Command) {
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    command.creation_flags(DETACHED_PROCESS);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::request::ResolvedTarget;
    use std::sync::Mutex;

    /// Records terminate calls instead of signalling.
    #[derive(Default)]
    pub(crate) struct RecordingSignaller {
        pub(crate) pids: Mutex<Vec<u32>>,
    }

    impl Signaller for RecordingSignaller {
        fn terminate(&self, pid: u32) -> std::io::Result<()> {
            self.pids.lock().unwrap().push(pid);
            Ok(())
        }
    }

    /// Write a fake simulator that records its arguments and then idles.
    #[cfg(unix)]
    pub(crate) fn fake_simulator(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let bin = dir.join("b2g-bin");
        std::fs::write(
            &bin,
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > \"$(dirname \"$0\")/args.txt\"\nexec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        bin
    }

    /// Spawn, retrying while another test thread still holds the script open.
    #[cfg(unix)]
    pub(crate) fn launch_retrying(
        launcher: &ProcessLauncher,
        config: &SimulatorConfig,
    ) -> LaunchedProcess {
        for _ in 0..20 {
            match launcher.launch(config) {
                Err(LaunchError::Spawn { source, .. })
                    if source.raw_os_error() == Some(libc::ETXTBSY) =>
                {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                other => return other.unwrap(),
            }
        }
        panic!("simulator script stayed busy");
    }

    fn config(bin: PathBuf, request: LaunchRequest) -> SimulatorConfig {
        SimulatorConfig::merge(
            &request,
            ResolvedTarget {
                bin,
                profile: PathBuf::from("/x/prof"),
                release: None,
            },
            6000,
        )
    }

    #[test]
    fn test_stdio_defaults_to_null() {
        let plan = StdioPlan::for_request(&LaunchRequest::default());
        assert_eq!(plan.stdin, StreamTarget::Null);
        assert_eq!(plan.stdout, StreamTarget::Null);
        assert_eq!(plan.stderr, StreamTarget::Null);
    }

    #[test]
    fn test_stdio_verbose_inherits() {
        let plan = StdioPlan::for_request(&LaunchRequest {
            verbose: true,
            ..Default::default()
        });
        assert_eq!(plan.stdin, StreamTarget::Inherit);
        assert_eq!(plan.stdout, StreamTarget::Inherit);
        assert_eq!(plan.stderr, StreamTarget::Inherit);
    }

    #[test]
    fn test_stdio_file_overrides_win() {
        let plan = StdioPlan::for_request(&LaunchRequest {
            verbose: true,
            stdout: Some(PathBuf::from("/tmp/sim.out")),
            ..Default::default()
        });
        assert_eq!(plan.stdin, StreamTarget::Inherit);
        assert_eq!(plan.stdout, StreamTarget::File(PathBuf::from("/tmp/sim.out")));
        assert_eq!(plan.stderr, StreamTarget::Inherit);

        let plan = StdioPlan::for_request(&LaunchRequest {
            stderr: Some(PathBuf::from("/tmp/sim.err")),
            ..Default::default()
        });
        assert_eq!(plan.stdout, StreamTarget::Null);
        assert_eq!(plan.stderr, StreamTarget::File(PathBuf::from("/tmp/sim.err")));
    }

    #[test]
    fn test_redirect_creates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.log");
        std::fs::write(&path, "before\n").unwrap();
        {
            use std::io::Write;
            let mut file = open_append(&path).unwrap();
            file.write_all(b"after\n").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "before\nafter\n");

        let err = open_append(&dir.path().join("missing/dir/sim.log")).unwrap_err();
        assert!(matches!(err, LaunchError::Redirect { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let lifecycle = Arc::new(Lifecycle::new());
        let launcher = ProcessLauncher::new(lifecycle.clone(), Arc::new(RecordingSignaller::default()));
        let err = launcher
            .launch(&config(
                PathBuf::from("/definitely/not/a/simulator"),
                LaunchRequest::default(),
            ))
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(lifecycle.hook_count(HookKind::Exit), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_hook_terminates_child_once() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = Arc::new(Lifecycle::new());
        let signaller = Arc::new(RecordingSignaller::default());
        let launcher = ProcessLauncher::new(lifecycle.clone(), signaller.clone());

        let mut launched = launch_retrying(
            &launcher,
            &config(fake_simulator(dir.path()), LaunchRequest::default()),
        );
        assert!(launched.hooks.is_some());
        assert_eq!(lifecycle.hook_count(HookKind::Exit), 1);
        assert_eq!(lifecycle.hook_count(HookKind::Fatal), 1);

        lifecycle.run_exit_hooks();
        lifecycle.run_exit_hooks();
        lifecycle.dispatch_fatal("late failure");
        assert_eq!(*signaller.pids.lock().unwrap(), vec![launched.pid]);

        launched.child.kill().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detached_child_has_no_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = Arc::new(Lifecycle::new());
        let signaller = Arc::new(RecordingSignaller::default());
        let launcher = ProcessLauncher::new(lifecycle.clone(), signaller.clone());

        let request = LaunchRequest {
            exit: true,
            ..Default::default()
        };
        let mut launched = launch_retrying(&launcher, &config(fake_simulator(dir.path()), request));
        assert!(launched.hooks.is_none());
        assert_eq!(lifecycle.hook_count(HookKind::Exit), 0);
        assert_eq!(lifecycle.hook_count(HookKind::Fatal), 0);

        lifecycle.run_exit_hooks();
        assert!(signaller.pids.lock().unwrap().is_empty());

        launched.child.kill().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unregistered_hooks_do_not_fire() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = Arc::new(Lifecycle::new());
        let signaller = Arc::new(RecordingSignaller::default());
        let launcher = ProcessLauncher::new(lifecycle.clone(), signaller.clone());

        let mut launched = launch_retrying(
            &launcher,
            &config(fake_simulator(dir.path()), LaunchRequest::default()),
        );
        launched.hooks.take().unwrap().unregister();
        assert_eq!(lifecycle.hook_count(HookKind::Exit), 0);

        lifecycle.run_exit_hooks();
        assert!(signaller.pids.lock().unwrap().is_empty());

        launched.child.kill().await.unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_handled_task_panic_keeps_child() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = Arc::new(Lifecycle::new());
        let signaller = Arc::new(RecordingSignaller::default());
        let launcher = ProcessLauncher::new(lifecycle.clone(), signaller.clone());
        let config = config(fake_simulator(dir.path()), LaunchRequest::default());

        let mut launched = lifecycle
            .catch_fatal(|| {
                runtime.block_on(async {
                    let launched = launch_retrying(&launcher, &config);
                    let task = tokio::spawn(async { panic!("worker failed") }).await;
                    assert!(task.is_err());
                    launched
                })
            })
            .expect("task panic stays contained");

        assert!(signaller.pids.lock().unwrap().is_empty());
        assert_eq!(lifecycle.hook_count(HookKind::Fatal), 1);
        runtime.block_on(async { launched.child.kill().await.unwrap() });
    }
}

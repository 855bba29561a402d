//! Firefox OS Simulator Launcher
//!
//! This library locates an installed Firefox OS simulator, starts it with
//! its remote debugger server listening on a local TCP port, and waits until
//! that port accepts connections.
//!
//! # Architecture
//!
//! - **Launcher**: Orchestrates a launch. Paths and port are resolved
//!   concurrently, then the simulator is spawned and its port polled.
//!
//! - **Collaborators**: Discovery, port finding, instance listing, signalling
//!   and the debugger handshake sit behind traits (`SimulatorDiscovery`,
//!   `PortFinder`, `InstanceLister`, `Signaller`, `DebugProtocol`) with
//!   default implementations for local use.
//!
//! - **Lifecycle**: Process-wide registry of one-shot hooks. Unless the
//!   launch is detached (`exit`), the simulator is sent SIGTERM when this
//!   process exits or receives SIGTERM/SIGINT, and when a panic escapes
//!   [`Lifecycle::catch_fatal`].
//!
//! # Usage
//!
//! ```no_run
//! use sim_launcher::{start_simulator, LaunchRequest};
//!
//! # async fn run() -> Result<(), sim_launcher::LaunchError> {
//! let request = LaunchRequest {
//!     release: vec!["2.2".to_string()],
//!     connect: true,
//!     ..Default::default()
//! };
//! let mut simulator = start_simulator(&request).await?;
//! println!("debugger on port {}", simulator.port());
//! simulator.terminate().await.ok();
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod discovery;
pub mod error;
pub mod instances;
pub mod launch;
pub mod lifecycle;
pub mod request;

pub use discovery::{ExtensionDirDiscovery, SimulatorDiscovery};
pub use error::LaunchError;
pub use instances::{InstanceLister, PosixSignaller, ProcInstanceLister, RunningInstance, Signaller};
pub use launch::{
    DebugProtocol, DebugSession, LaunchStage, Launcher, PortFinder, PortWaiter, RunningSimulator,
    SimulatorInfo,
};
pub use lifecycle::{FatalDisposition, HookKind, Lifecycle};
pub use request::{LaunchRequest, ResolvedTarget};

/// Launch a simulator with the default collaborators.
///
/// Installs the process-wide SIGTERM/SIGINT handlers on first use.
pub async fn start_simulator(request: &LaunchRequest) -> Result<RunningSimulator, LaunchError> {
    let launcher = Launcher::new();
    launcher.lifecycle().install_signal_handlers();
    launcher.launch(request).await
}

/// Callback form of [`start_simulator`]; must be called within a tokio runtime.
pub fn start_simulator_with_callback<F>(request: LaunchRequest, callback: F) -> JoinHandle<()>
where
    F: FnOnce(Result<RunningSimulator, LaunchError>) + Send + 'static,
{
    let launcher = Arc::new(Launcher::new());
    launcher.lifecycle().install_signal_handlers();
    launcher.launch_with_callback(request, callback)
}

/// Expand `~/` prefix to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    path.strip_prefix("~/")
        .and_then(|stripped| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(stripped)))
        .unwrap_or_else(|| PathBuf::from(path))
}

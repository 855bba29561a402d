//! Running simulator and launch stage types.

use super::client::DebugSession;
use super::process::{ChildHooks, LaunchedProcess};
use crate::instances::terminate_pid;
use crate::request::SimulatorConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Time allowed between SIGTERM and a forced kill in [`RunningSimulator::terminate`].
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Stage of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStage {
    /// Stale instances are being signalled.
    PendingForceKill,
    /// Paths and port are being settled.
    Resolving,
    /// The simulator process is being spawned.
    Launching,
    /// Waiting for the debugger port to accept connections.
    AwaitingPort,
    /// Performing the debugger handshake.
    Connecting,
    /// Simulator is up.
    Ready,
    /// Launch aborted.
    Failed,
}

impl std::fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchStage::PendingForceKill => write!(f, "pending_force_kill"),
            LaunchStage::Resolving => write!(f, "resolving"),
            LaunchStage::Launching => write!(f, "launching"),
            LaunchStage::AwaitingPort => write!(f, "awaiting_port"),
            LaunchStage::Connecting => write!(f, "connecting"),
            LaunchStage::Ready => write!(f, "ready"),
            LaunchStage::Failed => write!(f, "failed"),
        }
    }
}

/// Information about a launched simulator (serializable for output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorInfo {
    /// Simulator binary that was spawned.
    pub bin: PathBuf,
    /// Profile directory passed to the simulator.
    pub profile: PathBuf,
    /// Debugger server port.
    pub port: u16,
    /// Release tag, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    /// Process ID of the simulator.
    pub pid: u32,
    /// Whether the simulator outlives this process.
    pub detached: bool,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
}

/// A launched simulator with its child process.
///
/// The caller owns the process and is responsible for terminating it.
#[derive(Debug)]
pub struct RunningSimulator {
    /// Simulator metadata.
    pub info: SimulatorInfo,
    /// Child process handle.
    pub process: Child,
    /// Debugger session, when a handshake was requested.
    pub client: Option<DebugSession>,
    hooks: Option<ChildHooks>,
}

impl RunningSimulator {
    pub(crate) fn new(config: &SimulatorConfig, launched: LaunchedProcess) -> Self {
        let info = SimulatorInfo {
            bin: config.bin.clone(),
            profile: config.profile.clone(),
            port: config.port,
            release: config.release.clone(),
            pid: launched.pid,
            detached: config.request.exit,
            started_at: Utc::now(),
        };
        Self {
            info,
            process: launched.child,
            client: None,
            hooks: launched.hooks,
        }
    }

    pub fn bin(&self) -> &Path {
        &self.info.bin
    }

    pub fn profile(&self) -> &Path {
        &self.info.profile
    }

    pub fn port(&self) -> u16 {
        self.info.port
    }

    pub fn pid(&self) -> u32 {
        self.info.pid
    }

    pub fn release(&self) -> Option<&str> {
        self.info.release.as_deref()
    }

    /// Check if the child process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    /// Whether exit hooks still tie the child to this process.
    pub fn is_coupled(&self) -> bool {
        self.hooks.is_some()
    }

    /// Wait for the simulator to exit on its own.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.process.wait().await;
        self.release_hooks();
        status
    }

    /// Stop the simulator: SIGTERM, then a forced kill if it lingers.
    pub async fn terminate(&mut self) -> io::Result<ExitStatus> {
        self.release_hooks();
        if let Some(status) = self.process.try_wait()? {
            return Ok(status);
        }

        if let Err(e) = terminate_pid(self.info.pid) {
            warn!(pid = self.info.pid, error = %e, "SIGTERM failed, killing simulator");
        }
        match timeout(
            Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
            self.process.wait(),
        )
        .await
        {
            Ok(status) => status,
            Err(_) => {
                warn!(pid = self.info.pid, "Simulator ignored SIGTERM, killing");
                self.process.kill().await?;
                self.process.wait().await
            }
        }
    }

    /// Terminate after a failed launch, logging instead of failing.
    pub(crate) async fn discard(mut self) {
        match self.terminate().await {
            Ok(status) => debug!(pid = self.info.pid, %status, "Discarded simulator"),
            Err(e) => warn!(pid = self.info.pid, error = %e, "Failed to discard simulator"),
        }
    }

    fn release_hooks(&mut self) {
        if let Some(hooks) = self.hooks.take() {
            hooks.unregister();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display_matches_serde() {
        for stage in [
            LaunchStage::PendingForceKill,
            LaunchStage::Resolving,
            LaunchStage::Launching,
            LaunchStage::AwaitingPort,
            LaunchStage::Connecting,
            LaunchStage::Ready,
            LaunchStage::Failed,
        ] {
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json.as_str(), Some(stage.to_string().as_str()));
        }
    }

    #[test]
    fn test_info_omits_missing_release() {
        let info = SimulatorInfo {
            bin: PathBuf::from("/x/sim"),
            profile: PathBuf::from("/x/prof"),
            port: 6000,
            release: None,
            pid: 42,
            detached: false,
            started_at: Utc::now(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("release").is_none());
        assert_eq!(json["port"], 6000);
        assert_eq!(json["pid"], 42);
    }
}

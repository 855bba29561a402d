//! Launch request and resolved configuration types.

use crate::error::LaunchError;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Options recognized by a launch.
///
/// Every field is optional in the JSON form so a partial config file can be
/// layered under command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchRequest {
    /// Simulator binary. Discovery is skipped when both `bin` and `profile` are set.
    pub bin: Option<PathBuf>,
    /// Simulator profile directory.
    pub profile: Option<PathBuf>,
    /// Debugger port. `0` is treated as unset.
    pub port: Option<u16>,
    /// Terminate already running simulator instances first.
    pub force: bool,
    /// Inherit the parent's standard streams.
    pub verbose: bool,
    /// Append-mode file for the child's stdin.
    pub stdin: Option<PathBuf>,
    /// Append-mode file for the child's stdout.
    pub stdout: Option<PathBuf>,
    /// Append-mode file for the child's stderr.
    pub stderr: Option<PathBuf>,
    /// Detach the child so it outlives this process.
    pub exit: bool,
    /// Perform a debugger handshake once the port is ready.
    pub connect: bool,
    /// Acceptable release tags, e.g. `["2.2"]`.
    pub release: Vec<String>,
    /// Upper bound on the readiness wait. Unbounded when unset.
    pub ready_timeout_secs: Option<u64>,
}

impl LaunchRequest {
    /// Load a request from a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self, LaunchError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LaunchError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The requested port, if one was given and is non-zero.
    pub fn requested_port(&self) -> Option<u16> {
        self.port.filter(|p| *p != 0)
    }

    /// The caller's release, when exactly one was given.
    pub fn single_release(&self) -> Option<&str> {
        match self.release.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_secs.map(Duration::from_secs)
    }
}

/// A concrete binary/profile pair produced by path resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub bin: PathBuf,
    pub profile: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}

/// The request after paths and port have been settled.
///
/// Built once per launch from a clone of the caller's request.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub request: LaunchRequest,
    pub bin: PathBuf,
    pub profile: PathBuf,
    pub port: u16,
    pub release: Option<String>,
}

impl SimulatorConfig {
    /// Merge resolved paths and port into a copy of the request.
    pub fn merge(request: &LaunchRequest, target: ResolvedTarget, port: u16) -> Self {
        let release = target
            .release
            .or_else(|| request.single_release().map(str::to_string));
        Self {
            request: request.clone(),
            bin: target.bin,
            profile: target.profile,
            port,
            release,
        }
    }

    /// Arguments passed to the simulator binary.
    ///
    /// The profile path is passed through as is, whatever its encoding.
    pub fn args(&self) -> Vec<OsString> {
        vec![
            "-profile".into(),
            self.profile.clone().into_os_string(),
            "-start-debugger-server".into(),
            self.port.to_string().into(),
            "-no-remote".into(),
        ]
    }
}

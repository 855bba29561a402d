//! Error types for simulator launches.
//!
//! Every failure aborts the whole launch. The only condition that is retried
//! is a refused connection while waiting for the debugger port.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Launch errors, surfaced through whichever calling convention was used.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("No simulator found on your machine")]
    NotFound,

    /// A discovery source failed outright rather than finding nothing.
    #[error("Simulator discovery failed: {0}")]
    Discovery(String),

    #[error("No free port available: {0}")]
    Allocation(String),

    #[error("Failed to open {} for redirection: {source}", .path.display())]
    Redirect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn simulator {}: {source}", .bin.display())]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Probing debugger port {port} failed: {source}")]
    PortProbe {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Debugger port {port} not ready after {} seconds", .waited.as_secs())]
    ReadyTimeout { port: u16, waited: Duration },

    #[error("Debugger handshake on port {port} failed: {reason}")]
    Handshake { port: u16, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl LaunchError {
    /// Build a handshake error from anything displayable.
    pub fn handshake(port: u16, reason: impl std::fmt::Display) -> Self {
        LaunchError::Handshake {
            port,
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for LaunchError {
    fn from(e: serde_json::Error) -> Self {
        LaunchError::Config(e.to_string())
    }
}

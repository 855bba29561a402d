//! Running simulator instances and termination signals.

use serde::Serialize;
use std::io;

/// Process names a running simulator shows up as.
pub const SIMULATOR_PROCESS_NAMES: &[&str] = &["b2g", "b2g-bin"];

/// A simulator process found running on this machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningInstance {
    pub pid: u32,
    pub name: String,
}

/// Enumerates running simulator instances.
pub trait InstanceLister: Send + Sync {
    fn list_running(&self) -> io::Result<Vec<RunningInstance>>;
}

/// Sends termination signals to processes by pid.
pub trait Signaller: Send + Sync {
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Sends SIGTERM through `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixSignaller;

impl Signaller for PosixSignaller {
    fn terminate(&self, pid: u32) -> io::Result<()> {
        terminate_pid(pid)
    }
}

/// Send SIGTERM to `pid`.
#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "terminating arbitrary pids is only supported on unix",
    ))
}

/// Finds simulators by scanning `/proc/<pid>/comm`.
#[derive(Debug, Clone)]
pub struct ProcInstanceLister {
    proc_root: std::path::PathBuf,
}

impl Default for ProcInstanceLister {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcInstanceLister {
    pub fn new(proc_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl InstanceLister for ProcInstanceLister {
    fn list_running(&self) -> io::Result<Vec<RunningInstance>> {
        if !self.proc_root.is_dir() {
            return Ok(Vec::new());
        }

        let mut instances = Vec::new();
        for entry in std::fs::read_dir(&self.proc_root)? {
            let entry = entry?;
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes can exit between read_dir and read.
            let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
                continue;
            };
            let name = comm.trim();
            if SIMULATOR_PROCESS_NAMES.contains(&name) {
                instances.push(RunningInstance {
                    pid,
                    name: name.to_string(),
                });
            }
        }
        instances.sort_by_key(|i| i.pid);
        Ok(instances)
    }
}

//! Port allocation for the simulator's debugger server.

use crate::error::LaunchError;
use crate::request::LaunchRequest;
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Default starting port for debugger servers.
pub const DEFAULT_PORT_RANGE_START: u16 = 6000;
/// Default ending port for debugger servers.
pub const DEFAULT_PORT_RANGE_END: u16 = 6100;

/// Source of free TCP ports.
#[async_trait]
pub trait PortFinder: Send + Sync {
    async fn free_port(&self, options: &LaunchRequest) -> Result<u16, LaunchError>;

    /// Hand back a port that ended up unused.
    fn release(&self, _port: u16) {}
}

/// Finds free local ports within a configured range.
pub struct LocalPortFinder {
    /// Starting port (inclusive).
    base_port: u16,
    /// Maximum port (exclusive).
    max_port: u16,
    /// Ports already handed out, which a child may not have bound yet.
    handed_out: Mutex<HashSet<u16>>,
}

impl LocalPortFinder {
    /// Create a new port finder with the given range.
    pub fn new(base_port: u16, max_port: u16) -> Self {
        Self {
            base_port,
            max_port,
            handed_out: Mutex::new(HashSet::new()),
        }
    }

    /// Take the first port in range that binds and was not handed out before.
    ///
    /// Once every free port has been handed out, ports whose simulators have
    /// gone away (they bind again) are reclaimed and the scan repeats.
    pub fn allocate(&self) -> Option<u16> {
        let mut handed_out = self.handed_out.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(port) = self.first_free(&handed_out) {
            handed_out.insert(port);
            return Some(port);
        }

        let before = handed_out.len();
        handed_out.retain(|port| !port_binds(*port));
        if handed_out.len() < before {
            debug!(
                reclaimed = before - handed_out.len(),
                "Reclaimed ports no longer in use"
            );
        }
        let port = self.first_free(&handed_out)?;
        handed_out.insert(port);
        Some(port)
    }

    fn first_free(&self, handed_out: &HashSet<u16>) -> Option<u16> {
        (self.base_port..self.max_port).find(|port| !handed_out.contains(port) && port_binds(*port))
    }

    /// Make a previously allocated port available again.
    pub fn release(&self, port: u16) {
        let mut handed_out = self.handed_out.lock().unwrap_or_else(|e| e.into_inner());
        handed_out.remove(&port);
    }

    /// Get the number of ports handed out and not released.
    pub fn allocated_count(&self) -> usize {
        let handed_out = self.handed_out.lock().unwrap_or_else(|e| e.into_inner());
        handed_out.len()
    }
}

fn port_binds(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

impl Default for LocalPortFinder {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE_START, DEFAULT_PORT_RANGE_END)
    }
}

#[async_trait]
impl PortFinder for LocalPortFinder {
    async fn free_port(&self, _options: &LaunchRequest) -> Result<u16, LaunchError> {
        self.allocate().ok_or_else(|| {
            LaunchError::Allocation(format!(
                "no free port in {}..{}",
                self.base_port, self.max_port
            ))
        })
    }

    fn release(&self, port: u16) {
        LocalPortFinder::release(self, port);
    }
}

/// Settles the debugger port for a launch.
#[derive(Clone)]
pub struct PortAllocator {
    finder: Arc<dyn PortFinder>,
}

impl PortAllocator {
    pub fn new(finder: Arc<dyn PortFinder>) -> Self {
        Self { finder }
    }

    /// Use the requested port as is, or ask the finder for one.
    pub async fn allocate(&self, request: &LaunchRequest) -> Result<u16, LaunchError> {
        if let Some(port) = request.requested_port() {
            debug!(port, "Using requested port");
            return Ok(port);
        }
        let port = self.finder.free_port(request).await?;
        debug!(port, "Allocated free port");
        Ok(port)
    }
}

//! Resolution of the simulator binary and profile.

use crate::discovery::SimulatorDiscovery;
use crate::error::LaunchError;
use crate::request::{LaunchRequest, ResolvedTarget};
use std::sync::Arc;
use tracing::debug;

/// Turns a request into a concrete binary/profile pair.
#[derive(Clone)]
pub struct PathResolver {
    discovery: Arc<dyn SimulatorDiscovery>,
}

impl PathResolver {
    pub fn new(discovery: Arc<dyn SimulatorDiscovery>) -> Self {
        Self { discovery }
    }

    /// Use the caller's paths when both are given, otherwise the most
    /// preferred discovered simulator.
    pub async fn resolve(&self, request: &LaunchRequest) -> Result<ResolvedTarget, LaunchError> {
        if let (Some(bin), Some(profile)) = (&request.bin, &request.profile) {
            debug!(bin = %bin.display(), profile = %profile.display(), "Using supplied paths");
            return Ok(ResolvedTarget {
                bin: bin.clone(),
                profile: profile.clone(),
                release: request.single_release().map(str::to_string),
            });
        }

        let target = self
            .discovery
            .find(request)
            .await?
            .pop()
            .ok_or(LaunchError::NotFound)?;
        debug!(
            bin = %target.bin.display(),
            release = ?target.release,
            "Selected discovered simulator"
        );
        Ok(target)
    }
}

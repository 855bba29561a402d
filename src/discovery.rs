//! Discovery of installed simulators.
//!
//! Simulators ship as Firefox add-ons unpacked under a profile's
//! `extensions/` folder, one directory per release:
//!
//! ```text
//! <profiles root>/<profile>/extensions/fxos_2_2_simulator@mozilla.org/
//! ├── b2g/b2g-bin
//! └── profile/
//! ```

use crate::error::LaunchError;
use crate::request::{LaunchRequest, ResolvedTarget};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Source of installed simulator candidates.
#[async_trait]
pub trait SimulatorDiscovery: Send + Sync {
    /// Candidates matching `filter`, ranked ascending by preference.
    async fn find(&self, filter: &LaunchRequest) -> Result<Vec<ResolvedTarget>, LaunchError>;
}

/// Scans Firefox profile directories for simulator add-ons.
#[derive(Debug, Clone)]
pub struct ExtensionDirDiscovery {
    roots: Vec<PathBuf>,
}

impl Default for ExtensionDirDiscovery {
    fn default() -> Self {
        Self::new(default_profile_roots())
    }
}

fn addon_dir_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^fxos_(\d+)_(\d+)_simulator@mozilla\.org$").expect("valid addon dir regex")
    })
}

/// Binary location inside an add-on directory.
fn simulator_bin(addon_dir: &Path) -> PathBuf {
    let b2g = addon_dir.join("b2g");
    if cfg!(target_os = "macos") {
        b2g.join("B2G.app/Contents/MacOS/b2g-bin")
    } else if cfg!(windows) {
        b2g.join("b2g-bin.exe")
    } else {
        b2g.join("b2g-bin")
    }
}

/// Where Firefox keeps its profiles on this platform.
pub fn default_profile_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if cfg!(windows) {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            roots.push(PathBuf::from(appdata).join("Mozilla/Firefox/Profiles"));
        }
    } else if cfg!(target_os = "macos") {
        roots.push(crate::expand_path(
            "~/Library/Application Support/Firefox/Profiles",
        ));
    } else {
        roots.push(crate::expand_path("~/.mozilla/firefox"));
    }
    roots
}

impl ExtensionDirDiscovery {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Parse `fxos_2_2_simulator@mozilla.org` into `(2, 2)`.
    fn parse_addon_version(name: &str) -> Option<(u32, u32)> {
        let caps = addon_dir_pattern().captures(name)?;
        Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
    }

    /// Collect every simulator under the configured roots.
    ///
    /// A missing root is skipped; a root that exists but cannot be listed
    /// fails the scan.
    pub fn scan(&self) -> Result<Vec<((u32, u32), ResolvedTarget)>, LaunchError> {
        let mut found = Vec::new();
        for root in &self.roots {
            let profiles = match std::fs::read_dir(root) {
                Ok(profiles) => profiles,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(root = %root.display(), "No profiles root");
                    continue;
                }
                Err(e) => {
                    return Err(LaunchError::Discovery(format!(
                        "cannot read {}: {}",
                        root.display(),
                        e
                    )))
                }
            };
            for profile in profiles.flatten() {
                let extensions = profile.path().join("extensions");
                let Ok(addons) = std::fs::read_dir(&extensions) else {
                    continue;
                };
                for addon in addons.flatten() {
                    let name = addon.file_name();
                    let Some(version) = name.to_str().and_then(Self::parse_addon_version) else {
                        continue;
                    };
                    let addon_dir = addon.path();
                    let bin = simulator_bin(&addon_dir);
                    let sim_profile = addon_dir.join("profile");
                    if !bin.is_file() || !sim_profile.is_dir() {
                        debug!(addon = %addon_dir.display(), "Incomplete simulator add-on");
                        continue;
                    }
                    found.push((
                        version,
                        ResolvedTarget {
                            bin,
                            profile: sim_profile,
                            release: Some(format!("{}.{}", version.0, version.1)),
                        },
                    ));
                }
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

#[async_trait]
impl SimulatorDiscovery for ExtensionDirDiscovery {
    async fn find(&self, filter: &LaunchRequest) -> Result<Vec<ResolvedTarget>, LaunchError> {
        let targets = self
            .scan()?
            .into_iter()
            .map(|(_, target)| target)
            .filter(|target| {
                filter.release.is_empty()
                    || target
                        .release
                        .as_ref()
                        .is_some_and(|r| filter.release.contains(r))
            })
            .collect::<Vec<_>>();
        debug!(count = targets.len(), "Discovered simulators");
        Ok(targets)
    }
}

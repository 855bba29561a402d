//! Launch orchestration.
//!
//! ```text
//! pending_force_kill ─▶ resolving ─▶ launching ─▶ awaiting_port ─▶ [connecting] ─▶ ready
//!                       (paths ∥ port)
//!        any stage ─▶ failed
//! ```

use super::client::{ClientConnector, DebugProtocol, RemoteDebugClient};
use super::paths::PathResolver;
use super::port_allocator::{LocalPortFinder, PortAllocator, PortFinder};
use super::port_waiter::PortWaiter;
use super::process::ProcessLauncher;
use super::types::{LaunchStage, RunningSimulator};
use crate::discovery::{ExtensionDirDiscovery, SimulatorDiscovery};
use crate::error::LaunchError;
use crate::instances::{InstanceLister, PosixSignaller, ProcInstanceLister, Signaller};
use crate::lifecycle::Lifecycle;
use crate::request::{LaunchRequest, SimulatorConfig};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Launches simulators through pluggable collaborators.
#[derive(Clone)]
pub struct Launcher {
    discovery: Arc<dyn SimulatorDiscovery>,
    port_finder: Arc<dyn PortFinder>,
    instances: Arc<dyn InstanceLister>,
    protocol: Arc<dyn DebugProtocol>,
    signaller: Arc<dyn Signaller>,
    lifecycle: Arc<Lifecycle>,
    waiter: PortWaiter,
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Launcher {
    /// A launcher using the default collaborators and the global lifecycle.
    pub fn new() -> Self {
        Self {
            discovery: Arc::new(ExtensionDirDiscovery::default()),
            port_finder: Arc::new(LocalPortFinder::default()),
            instances: Arc::new(ProcInstanceLister::default()),
            protocol: Arc::new(RemoteDebugClient::default()),
            signaller: Arc::new(PosixSignaller),
            lifecycle: Lifecycle::global(),
            waiter: PortWaiter::default(),
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn SimulatorDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_port_finder(mut self, port_finder: Arc<dyn PortFinder>) -> Self {
        self.port_finder = port_finder;
        self
    }

    pub fn with_instance_lister(mut self, instances: Arc<dyn InstanceLister>) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_protocol(mut self, protocol: Arc<dyn DebugProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_signaller(mut self, signaller: Arc<dyn Signaller>) -> Self {
        self.signaller = signaller;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<Lifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_port_waiter(mut self, waiter: PortWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Launch a simulator and wait until its debugger port is ready.
    ///
    /// The request is cloned; the caller's copy is never modified.
    pub async fn launch(&self, request: &LaunchRequest) -> Result<RunningSimulator, LaunchError> {
        let mut stage = LaunchStage::PendingForceKill;
        let result = self.run_stages(request.clone(), &mut stage).await;
        match &result {
            Ok(simulator) => info!(
                port = simulator.port(),
                pid = simulator.pid(),
                release = simulator.release().unwrap_or("unknown"),
                "Simulator ready"
            ),
            Err(e) => {
                let reached = stage;
                self.enter(&mut stage, LaunchStage::Failed);
                error!(stage = %reached, error = %e, "Simulator launch failed");
            }
        }
        result
    }

    async fn run_stages(
        &self,
        request: LaunchRequest,
        stage: &mut LaunchStage,
    ) -> Result<RunningSimulator, LaunchError> {
        if request.force {
            self.kill_running_instances();
        }

        self.enter(stage, LaunchStage::Resolving);
        let paths = PathResolver::new(self.discovery.clone());
        let ports = PortAllocator::new(self.port_finder.clone());
        let (target, port) = tokio::try_join!(paths.resolve(&request), ports.allocate(&request))?;
        let config = SimulatorConfig::merge(&request, target, port);

        let result = self.start(&config, stage).await;
        if result.is_err() && request.requested_port().is_none() {
            self.port_finder.release(port);
        }
        result
    }

    async fn start(
        &self,
        config: &SimulatorConfig,
        stage: &mut LaunchStage,
    ) -> Result<RunningSimulator, LaunchError> {
        let request = &config.request;
        let port = config.port;

        self.enter(stage, LaunchStage::Launching);
        let launcher = ProcessLauncher::new(self.lifecycle.clone(), self.signaller.clone());
        let launched = launcher.launch(config)?;
        let mut simulator = RunningSimulator::new(config, launched);

        self.enter(stage, LaunchStage::AwaitingPort);
        let waiter = match request.ready_timeout() {
            Some(limit) => self.waiter.clone().with_timeout(Some(limit)),
            None => self.waiter.clone(),
        };
        if let Err(e) = waiter.wait_until_ready(port).await {
            simulator.discard().await;
            return Err(e);
        }

        if request.connect {
            self.enter(stage, LaunchStage::Connecting);
            let connector = ClientConnector::new(self.protocol.clone());
            if let Err(e) = connector.attach(&mut simulator).await {
                simulator.discard().await;
                return Err(e);
            }
        }

        self.enter(stage, LaunchStage::Ready);
        Ok(simulator)
    }

    fn enter(&self, stage: &mut LaunchStage, next: LaunchStage) {
        debug!(from = %stage, to = %next, "Launch stage");
        *stage = next;
    }

    /// Best-effort SIGTERM to every running simulator.
    ///
    /// Does not wait for the processes to exit, so a stale instance may still
    /// hold its port when the new one starts.
    fn kill_running_instances(&self) {
        let instances = match self.instances.list_running() {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "Could not enumerate running simulators");
                return;
            }
        };
        for instance in instances {
            match self.signaller.terminate(instance.pid) {
                Ok(()) => info!(pid = instance.pid, name = %instance.name, "Terminated running simulator"),
                Err(e) => warn!(pid = instance.pid, error = %e, "Failed to terminate running simulator"),
            }
        }
    }

    /// Callback adapter over [`Launcher::launch`].
    ///
    /// Spawns the launch on the current runtime and hands the result to
    /// `callback` when it finishes.
    pub fn launch_with_callback<F>(
        self: Arc<Self>,
        request: LaunchRequest,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<RunningSimulator, LaunchError>) + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.launch(&request).await;
            callback(result);
        })
    }
}

//! Simulator launch pipeline.
//!
//! A launch settles a binary/profile pair and a debugger port, spawns the
//! simulator bound to that port, and waits until the port accepts
//! connections, optionally finishing with a debugger handshake.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Launcher                          │
//! │                                                          │
//! │  force? ──▶ InstanceLister + Signaller (fire-and-forget) │
//! │                                                          │
//! │  PathResolver ──┐                                        │
//! │  (discovery)    ├─ try_join ─▶ SimulatorConfig           │
//! │  PortAllocator ─┘                                        │
//! │  (port finder)                                           │
//! │                                                          │
//! │  ProcessLauncher ─▶ PortWaiter ─▶ ClientConnector?       │
//! │  (lifecycle hooks)  (1s backoff)  (debug protocol)       │
//! └─────────────────────────────────────────────────────────┘
//!                               │ spawn
//!                               ▼
//!                     ┌──────────────────────┐
//!                     │ b2g-bin -profile ... │
//!                     │ -start-debugger-     │
//!                     │  server <port>       │
//!                     └──────────────────────┘
//! ```

/// Host the simulator's debugger server listens on.
///
/// Readiness polling and the handshake must reach the same address.
pub const DEBUGGER_HOST: &str = "127.0.0.1";

pub mod client;
mod orchestrator;
mod paths;
mod port_allocator;
mod port_waiter;
mod process;
mod types;

pub use client::{ClientConnector, DebugProtocol, DebugSession, RemoteDebugClient};
pub use orchestrator::Launcher;
pub use paths::PathResolver;
pub use port_allocator::{LocalPortFinder, PortAllocator, PortFinder};
pub use port_waiter::PortWaiter;
pub use process::{ChildHooks, LaunchedProcess, ProcessLauncher, StdioPlan, StreamTarget};
pub use types::{LaunchStage, RunningSimulator, SimulatorInfo};

//! Firefox OS Simulator Launcher
//!
//! Starts a simulator with its debugger server on a local port and prints
//! the launch details as JSON on stdout. Without `--exit` the launcher stays
//! in the foreground and takes the simulator down with it.

use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use sim_launcher::{
    expand_path, ExtensionDirDiscovery, InstanceLister, LaunchRequest, Launcher, Lifecycle,
    ProcInstanceLister, SimulatorDiscovery,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sim-launcher", version, about = "Firefox OS Simulator Launcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a simulator (default)
    Start(StartArgs),
    /// List installed simulators, least preferred first
    List(ListArgs),
    /// List running simulator processes
    Running,
}

#[derive(Args, Default)]
struct StartArgs {
    /// JSON file with launch options; flags given here take precedence
    #[arg(long)]
    config: Option<String>,
    /// Simulator binary (skips discovery together with --profile)
    #[arg(long)]
    bin: Option<String>,
    /// Simulator profile directory
    #[arg(long)]
    profile: Option<String>,
    /// Debugger server port (a free one is picked if omitted)
    #[arg(long)]
    port: Option<u16>,
    /// Terminate running simulators first
    #[arg(long)]
    force: bool,
    /// Show the simulator's output
    #[arg(long)]
    verbose: bool,
    /// Append-mode file for the simulator's stdin
    #[arg(long)]
    stdin: Option<String>,
    /// Append-mode file for the simulator's stdout
    #[arg(long)]
    stdout: Option<String>,
    /// Append-mode file for the simulator's stderr
    #[arg(long)]
    stderr: Option<String>,
    /// Leave the simulator running and return immediately
    #[arg(long)]
    exit: bool,
    /// Connect a debugger client once the port is ready
    #[arg(long)]
    connect: bool,
    /// Acceptable releases (comma-separated, e.g. 2.0,2.2)
    #[arg(long, value_delimiter = ',')]
    release: Vec<String>,
    /// Give up if the debugger port is not ready after this many seconds
    #[arg(long)]
    ready_timeout_secs: Option<u64>,
}

#[derive(Args)]
struct ListArgs {
    /// Only list these releases (comma-separated)
    #[arg(long, value_delimiter = ',')]
    release: Vec<String>,
}

impl StartArgs {
    /// Layer flags over the config file, if any.
    fn into_request(self) -> anyhow::Result<LaunchRequest> {
        let mut request = match self.config.as_deref() {
            Some(path) => LaunchRequest::from_json_file(&expand_path(path))?,
            None => LaunchRequest::default(),
        };
        let path = |p: Option<String>| p.map(|p| expand_path(&p));

        if let Some(bin) = path(self.bin) {
            request.bin = Some(bin);
        }
        if let Some(profile) = path(self.profile) {
            request.profile = Some(profile);
        }
        if self.port.is_some() {
            request.port = self.port;
        }
        if let Some(stdin) = path(self.stdin) {
            request.stdin = Some(stdin);
        }
        if let Some(stdout) = path(self.stdout) {
            request.stdout = Some(stdout);
        }
        if let Some(stderr) = path(self.stderr) {
            request.stderr = Some(stderr);
        }
        if !self.release.is_empty() {
            request.release = self.release;
        }
        if self.ready_timeout_secs.is_some() {
            request.ready_timeout_secs = self.ready_timeout_secs;
        }
        request.force |= self.force;
        request.verbose |= self.verbose;
        request.exit |= self.exit;
        request.connect |= self.connect;
        Ok(request)
    }
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON result.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sim_launcher=info")),
        )
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command.unwrap_or(Command::Start(StartArgs::default())) {
        Command::Start(args) => {
            // A panic escaping the launcher takes coupled simulators down too.
            let lifecycle = Lifecycle::global();
            lifecycle
                .catch_fatal(|| rt.block_on(run_start(args, lifecycle.clone())))
                .unwrap_or_else(|| Err(anyhow::anyhow!("launcher aborted by a fatal error")))
        }
        Command::List(args) => rt.block_on(run_list(args)),
        Command::Running => run_running(),
    }
}

async fn run_start(args: StartArgs, lifecycle: Arc<Lifecycle>) -> anyhow::Result<()> {
    let request = args.into_request()?;
    lifecycle.install_signal_handlers();

    let launcher = Launcher::new().with_lifecycle(lifecycle.clone());
    let mut simulator = launcher.launch(&request).await?;
    println!("{}", serde_json::to_string_pretty(&simulator.info)?);

    if request.exit {
        info!(pid = simulator.pid(), "Leaving simulator running");
        return Ok(());
    }

    // Signals end the process through the lifecycle's exit hooks.
    let status = simulator.wait().await?;
    info!(%status, "Simulator exited");
    lifecycle.run_exit_hooks();
    Ok(())
}

async fn run_list(args: ListArgs) -> anyhow::Result<()> {
    let filter = LaunchRequest {
        release: args.release,
        ..Default::default()
    };
    let targets = ExtensionDirDiscovery::default().find(&filter).await?;
    if targets.is_empty() {
        warn!("No simulator found on your machine");
    }
    println!("{}", serde_json::to_string_pretty(&targets)?);
    Ok(())
}

fn run_running() -> anyhow::Result<()> {
    let instances = ProcInstanceLister::default().list_running()?;
    println!("{}", serde_json::to_string_pretty(&instances)?);
    Ok(())
}

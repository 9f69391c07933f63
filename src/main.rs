// WireGuard Connection Lifecycle Daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use wg_lifecycle::{
    config::{load_config, ConfigStore},
    context::{HostLink, IpDownCallback, NetworkIdentity},
    control,
    engine::{Engine, Input},
    ifmonitor::InterfaceMonitor,
    launcher::{validate_interface_name, WgQuickLauncher},
    policy::{read_policy, PolicyMonitor},
};

/// Size of the channel buffer for engine inputs
const INPUT_CHANNEL_SIZE: usize = 32;

#[derive(Parser)]
#[command(name = "wg-lifecycle")]
#[command(about = "WireGuard connection lifecycle daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wg-lifecycle/config.toml")]
    config: PathBuf,
}

/// Host link of the standalone daemon: a fatal close is logged and
/// answered with the ip-down request the engine expects the host to issue.
struct DaemonHost {
    inputs: mpsc::Sender<Input>,
}

impl HostLink for DaemonHost {
    fn fatal_close(&self, identity: &NetworkIdentity, reason: &str) {
        log::error!("Connection '{}' closed: {}", identity.network_id, reason);

        let inputs = self.inputs.clone();
        let identity = identity.clone();
        // Sent from a task so the close can never wedge the engine loop
        // that is delivering it.
        tokio::spawn(async move {
            let network_id = identity.network_id.clone();
            let callback: IpDownCallback = Box::new(move || {
                log::info!("Connection '{}' released after close", network_id);
            });
            if inputs.send(Input::IpDown { identity, callback }).await.is_err() {
                log::debug!("Engine gone, dropping close follow-up");
            }
        });
    }
}

fn main() -> Result<()> {
    // Build custom Tokio runtime with limited thread pool
    // 2 threads is sufficient: 1 for the engine loop, 1 for D-Bus + process spawns
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wg-lifecycle")
        .thread_stack_size(2 * 1024 * 1024) // 2MB stack (vs 8MB default)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    log::info!("Starting wg-lifecycle daemon");
    log::info!("WireGuard interface: {}", config.general.wg_interface);
    log::info!("Config directory: {}", config.general.config_dir);
    match &config.general.active_config {
        Some(active) => log::info!("Active config: {}", active),
        None => log::info!("No active config selected"),
    }

    validate_interface_name(&config.general.wg_interface)
        .context("Configured wg_interface has invalid name")?;

    // Seed the policy flag from the store's current value
    let initial_policy = read_policy(Path::new(&config.general.policy_file));
    log::info!(
        "System-wide policy currently {}",
        if initial_policy { "enabled" } else { "disabled" }
    );

    // Single ingress channel: every event source serializes through it
    let (input_tx, input_rx) = mpsc::channel::<Input>(INPUT_CHANNEL_SIZE);

    let configs = ConfigStore::new(&config.general);
    let launcher = Arc::new(WgQuickLauncher::new(
        configs.config_dir().to_path_buf(),
        input_tx.clone(),
    ));
    let host = Arc::new(DaemonHost {
        inputs: input_tx.clone(),
    });

    // Control channel; also provides the status broadcast sink
    let (status, _connection) = control::serve(input_tx.clone())
        .await
        .context("Failed to start control interface")?;

    let engine = Engine::new(
        initial_policy,
        configs,
        launcher,
        host,
        Arc::new(status),
        input_rx,
    );
    let engine_task = tokio::spawn(engine.run());

    // Collaborator monitors
    let poll = Duration::from_secs(config.general.poll_interval);
    tokio::spawn(
        PolicyMonitor::new(
            PathBuf::from(&config.general.policy_file),
            poll,
            input_tx.clone(),
        )
        .run(initial_policy),
    );
    tokio::spawn(
        InterfaceMonitor::new(config.general.wg_interface.clone(), poll, input_tx.clone()).run(),
    );

    log::info!("Daemon started successfully");

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            log::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            log::info!("Received SIGINT");
        }
    }

    // Stop the engine; it tears down a still-running launcher itself
    if input_tx.send(Input::Shutdown).await.is_err() {
        log::warn!("Engine already stopped");
    }
    engine_task.await.context("Engine task panicked")?;

    log::info!("Shutdown complete");
    Ok(())
}

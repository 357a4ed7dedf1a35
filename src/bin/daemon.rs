// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! omen-fand: system service that owns the fan and runs the control loop
//! until SIGINT or SIGTERM.

use clap::Parser;
use omen_fan_control::calibration::CancelToken;
use omen_fan_control::config::{self, ConfigStore, Mode};
use omen_fan_control::control::ControlDaemon;
use omen_fan_control::hwmon::FanDevice;
use tokio::signal::unix::{SignalKind, signal};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "omen-fand", about = "HP Omen fan control daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Leave the fan as-is on exit instead of returning it to firmware control.
    #[arg(long)]
    no_restore: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let is_root = nix::unistd::geteuid().is_root();
    if !is_root {
        log::warn!("Running without root privileges, fan writes will likely fail");
    }

    let config_path = config::resolve_config_path(cli.config.as_deref(), is_root);
    let store = ConfigStore::new(config_path);

    // Discover hardware
    let device = FanDevice::discover();
    let paths = device.paths();
    log::info!(
        "Fan: {}, CPU temperature: {}",
        paths
            .pwm_enable
            .as_ref()
            .and_then(|p| p.parent())
            .map_or("not found".to_string(), |p| p.display().to_string()),
        paths
            .cpu_temp
            .as_ref()
            .map_or("not found".to_string(), |p| p.display().to_string()),
    );
    if !device.has_pwm_control() {
        log::warn!("pwm1 not present, manual and curve modes need the patched hp-wmi driver");
    }
    let device = device.into_shared();

    let shutdown = CancelToken::new();
    let shutdown_signal = shutdown.clone();

    // Signal handler
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                log::info!("Received shutdown signal");
                shutdown_signal.cancel();
            }
            Err(e) => log::error!("Failed to install signal handlers: {e}"),
        }
    });

    ControlDaemon::new(store.clone(), device.clone())
        .run(shutdown)
        .await;

    // A calibration in another process owns the fan; don't pull it out of max.
    if !cli.no_restore && store.load().mode != Mode::Calibration {
        let dev = device.lock().await;
        match dev.try_claim() {
            Ok(Some(_claim)) => match dev.restore_automatic() {
                Ok(()) => log::info!("Restored fan to automatic control"),
                Err(e) => log::warn!("Failed to restore automatic control: {e}"),
            },
            Ok(None) => log::info!("Fan is held by another process, leaving it as-is"),
            Err(e) => log::warn!("Failed to restore automatic control: {e}"),
        }
    }

    log::info!("Daemon shutting down");
    Ok(())
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = term.recv() => Ok(()),
    }
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! omen-fanctl: command-line client. Edits the shared config file that the
//! daemon polls, applies firmware modes directly, and runs calibration.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use omen_fan_control::board::{self, BoardSupport};
use omen_fan_control::calibration::{self, CalibrationOutcome, CancelToken};
use omen_fan_control::config::{self, Config, ConfigStore, Mode};
use omen_fan_control::curve::{self, Interpolation};
use omen_fan_control::hwmon::{ActuatorClaim, FanDevice, PwmEnable};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "omen-fanctl", about = "HP Omen fan control")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spin the fan at max and record its speed as the calibrated max RPM.
    Calibrate {
        /// Don't ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Set the fan mode. `last` re-applies the mode stored in the config.
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,

        /// Manual value: 0-255 (PWM) or 0-100% (e.g. "50%").
        #[arg(long)]
        value: Option<String>,

        /// CSV file with `temp,percent` lines for curve mode.
        #[arg(long)]
        curve_csv: Option<PathBuf>,
    },

    /// View or change options. Without flags, prints the current values.
    Options {
        /// Calibration wait time in seconds.
        #[arg(long)]
        wait_time: Option<u64>,

        /// Watchdog interval in seconds.
        #[arg(long)]
        watchdog: Option<u64>,

        /// Moving average window (samples).
        #[arg(long)]
        ma_window: Option<usize>,

        #[arg(long, value_enum)]
        curve_interpolation: Option<InterpolationArg>,
    },

    /// Show fan, temperature and config status.
    Status,

    /// Check whether this board is known to be supported.
    Board {
        /// DMI board name file.
        #[arg(long, default_value = board::BOARD_NAME_PATH)]
        dmi_path: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ModeArg {
    Auto,
    Max,
    Manual,
    Curve,
    Last,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum InterpolationArg {
    Smooth,
    Discrete,
}

impl From<InterpolationArg> for Interpolation {
    fn from(arg: InterpolationArg) -> Self {
        match arg {
            InterpolationArg::Smooth => Interpolation::Smooth,
            InterpolationArg::Discrete => Interpolation::Discrete,
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let is_root = nix::unistd::geteuid().is_root();
    let store = ConfigStore::new(config::resolve_config_path(cli.config.as_deref(), is_root));

    if !is_root && !store.load().bypass_root_warning {
        eprintln!("WARNING: Running without root privileges.");
        eprintln!("Most commands require root to function correctly.");
        eprintln!();
    }

    match cli.command {
        Command::Calibrate { yes } => calibrate(&store, yes).await,
        Command::Mode {
            mode,
            value,
            curve_csv,
        } => set_mode(&store, mode, value.as_deref(), curve_csv).await,
        Command::Options {
            wait_time,
            watchdog,
            ma_window,
            curve_interpolation,
        } => options(&store, wait_time, watchdog, ma_window, curve_interpolation),
        Command::Status => {
            status(&store);
            Ok(())
        }
        Command::Board { dmi_path } => {
            check_board(&store, &dmi_path);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn calibrate(store: &ConfigStore, yes: bool) -> anyhow::Result<()> {
    if !yes && !confirm("This will spin fans at max speed for calibration. Continue?")? {
        return Ok(());
    }

    let mut device = FanDevice::discover();
    let cancel = CancelToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_signal.cancel();
        }
    });

    let outcome =
        calibration::run_in_calibration_mode(&mut device, store, &cancel, |pct| {
            print!("\rCalibrating... {pct}%");
            let _ = io::stdout().flush();
        })
        .await
        .context("Calibration failed")?;
    println!();

    match outcome {
        CalibrationOutcome::Completed { max_rpm } => {
            println!("Calibration finished. Max RPM: {max_rpm}");
        }
        CalibrationOutcome::Cancelled => {
            println!("Calibration cancelled, previous fan state restored.");
        }
    }
    Ok(())
}

async fn set_mode(
    store: &ConfigStore,
    mode: ModeArg,
    value: Option<&str>,
    curve_csv: Option<PathBuf>,
) -> anyhow::Result<()> {
    let device = FanDevice::discover();

    let mode = match mode {
        ModeArg::Last => {
            let cfg = store.load();
            println!("Applying last saved mode: {}", cfg.mode.as_str().to_uppercase());
            let _claim = claim_fan(&device).await?;
            return apply_saved(&device, &cfg);
        }
        m => m,
    };

    if matches!(mode, ModeArg::Manual | ModeArg::Curve) && !device.has_pwm_control() {
        bail!("{mode:?} mode requires the patched hp-wmi driver (pwm1 not found)");
    }

    match mode {
        ModeArg::Auto | ModeArg::Max => {
            let (enable, mode) = if mode == ModeArg::Auto {
                (PwmEnable::Auto, Mode::Auto)
            } else {
                (PwmEnable::Max, Mode::Max)
            };
            let _claim = claim_fan(&device).await?;
            device.set_enable(enable)?;
            store.update(|c| c.mode = mode.clone())?;
            println!("Fan set to {}.", mode.as_str().to_uppercase());
        }
        ModeArg::Manual => {
            let Some(value) = value else {
                bail!("Please specify --value (0-255 or 0-100%) for manual mode");
            };
            let pwm = curve::parse_pwm_value(value)?;
            store.update(|c| {
                c.mode = Mode::Manual;
                c.manual_pwm = i64::from(pwm);
            })?;
            let _claim = claim_fan(&device).await?;
            device.set_pwm(pwm)?;
            println!("Setting PWM to {pwm}");
        }
        ModeArg::Curve => {
            let points = match curve_csv {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("Error reading {}", path.display()))?;
                    let points = curve::parse_csv(&text)?;
                    println!("Loaded {} points from CSV.", points.len());
                    Some(points)
                }
                None => None,
            };
            let saved = store.update(|c| {
                c.mode = Mode::Curve;
                if let Some(points) = points {
                    c.curve = points;
                } else if c.curve.is_empty() {
                    c.curve = curve::default_curve();
                }
            })?;
            println!(
                "Curve mode enabled with {} points. The daemon picks up the change on its next poll.",
                saved.curve.len()
            );
        }
        ModeArg::Last => unreachable!("handled above"),
    }
    Ok(())
}

fn apply_saved(device: &FanDevice, cfg: &Config) -> anyhow::Result<()> {
    match &cfg.mode {
        Mode::Auto => device.set_enable(PwmEnable::Auto)?,
        Mode::Max => device.set_enable(PwmEnable::Max)?,
        Mode::Manual if cfg.manual_pwm >= 0 => {
            device.set_pwm(cfg.manual_pwm.min(255) as u8)?;
        }
        Mode::Curve => println!("Curve mode is applied by the daemon."),
        other => println!("Nothing to apply for mode '{other}'."),
    }
    Ok(())
}

fn options(
    store: &ConfigStore,
    wait_time: Option<u64>,
    watchdog: Option<u64>,
    ma_window: Option<usize>,
    curve_interpolation: Option<InterpolationArg>,
) -> anyhow::Result<()> {
    if wait_time.is_none() && watchdog.is_none() && ma_window.is_none() && curve_interpolation.is_none() {
        let cfg = store.load();
        println!("Current Configuration ({}):", store.path().display());
        println!("  Calibration Wait Time: {}s \t--wait-time", cfg.calibration_wait);
        println!("  Watchdog Interval:     {}s \t--watchdog", cfg.watchdog_interval);
        println!("  MA Window (Smoothing): {}  \t--ma-window", cfg.ma_window);
        println!(
            "  Curve Interpolation:   {} \t--curve-interpolation",
            interpolation_name(cfg.curve_interpolation)
        );
        return Ok(());
    }

    for (name, v) in [("wait-time", wait_time), ("watchdog", watchdog)] {
        if v == Some(0) {
            bail!("--{name} must be positive");
        }
    }
    if ma_window == Some(0) {
        bail!("--ma-window must be positive");
    }

    let cfg = store.update(|c| {
        if let Some(v) = wait_time {
            c.calibration_wait = v;
        }
        if let Some(v) = watchdog {
            c.watchdog_interval = v;
        }
        if let Some(v) = ma_window {
            c.ma_window = v;
        }
        if let Some(v) = curve_interpolation {
            c.curve_interpolation = v.into();
        }
    })?;

    if wait_time.is_some() {
        println!("Calibration wait time set to {}s", cfg.calibration_wait);
    }
    if watchdog.is_some() {
        println!("Watchdog interval set to {}s", cfg.watchdog_interval);
    }
    if ma_window.is_some() {
        println!("MA Window set to {}", cfg.ma_window);
    }
    if curve_interpolation.is_some() {
        println!(
            "Curve Interpolation set to {}",
            interpolation_name(cfg.curve_interpolation)
        );
    }
    Ok(())
}

fn status(store: &ConfigStore) {
    let cfg = store.load();
    let device = FanDevice::discover();

    let driver_mode = match device.pwm_enable() {
        Some(PwmEnable::Manual) => match cfg.mode {
            Mode::Curve => "Curve (Service)".to_string(),
            Mode::Manual => format!("Manual Fixed ({})", cfg.manual_pwm),
            _ => PwmEnable::Manual.to_string(),
        },
        Some(mode) => mode.to_string(),
        None => match device.read_enable_raw() {
            Some(raw) => format!("Unknown ({raw})"),
            None => "N/A".to_string(),
        },
    };

    println!("Driver Mode:       {driver_mode}");
    println!("Configured Mode:   {}", cfg.mode);
    match cfg.fan_max {
        0 => println!("Max RPM:           not calibrated"),
        rpm => println!("Max RPM:           {rpm}"),
    }
    match device.fan_rpm() {
        Ok(Some(rpm)) => println!("Fan Speed:         {rpm} RPM"),
        Ok(None) => println!("Fan Speed:         N/A"),
        Err(e) => println!("Fan Speed:         error ({e})"),
    }
    match device.cpu_temp() {
        Ok(Some(t)) => println!("CPU Package Temp:  {t}°C"),
        Ok(None) => println!("CPU Package Temp:  N/A"),
        Err(e) => println!("CPU Package Temp:  error ({e})"),
    }

    let cores = device.core_temps();
    if !cores.is_empty() {
        println!("\nCore Temperatures:");
        for core in cores {
            println!("  {:<15} {}°C", core.label, core.temp_c);
        }
    }
}

fn check_board(store: &ConfigStore, dmi_path: &std::path::Path) {
    let mut cfg = store.load();
    let (support, board) = board::check_board_support(&mut cfg, store, dmi_path);
    println!("Board: {board} ({support})");

    match support {
        BoardSupport::Supported => {}
        BoardSupport::PossiblySupported if !cfg.enable_experimental => {
            println!("NOTE: Your board '{board}' is valid for experimental support.");
            println!("Community patches suggest it uses the Omen thermal path.");
            println!("Set \"enable_experimental\": true and \"thermal_profile\" in the config to try it.");
        }
        BoardSupport::PossiblySupported => {}
        BoardSupport::Unsupported if !cfg.bypass_warning => {
            println!("WARNING: Your board '{board}' is not in the known compatible list.");
            println!("Using this tool could potentially cause system instability.");
        }
        BoardSupport::Unsupported => {}
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Hold the fan's lock, so a running daemon tick or calibration finishes
/// before this process writes.
async fn claim_fan(device: &FanDevice) -> anyhow::Result<ActuatorClaim> {
    device.claim().await.context("Cannot lock the fan")
}

fn interpolation_name(i: Interpolation) -> &'static str {
    match i {
        Interpolation::Smooth => "smooth",
        Interpolation::Discrete => "discrete",
    }
}

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{prompt} [y/N]: ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Max RPM calibration.
//!
//! The fan is forced to firmware full speed, left to settle for
//! `calibration_wait` seconds (reported as ten progress steps), and the fan
//! speed is then sampled once. That reading becomes `fan_max` in the config.
//! The previous `pwm1_enable` (and `pwm1`, if it was manual) is restored
//! afterwards, also when the run is cancelled.

use crate::config::{ConfigStore, Mode};
use crate::error::{Error, Result};
use crate::hwmon::{FanDevice, PwmEnable, SharedDevice};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Number of progress steps the wait is split into.
pub const CALIBRATION_STEPS: u32 = 10;

/// How a calibration run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    /// The measured RPM was stored as `fan_max`.
    Completed { max_rpm: u32 },
    /// Stopped before measuring; `fan_max` was left alone.
    Cancelled,
}

/// Progress stream of a spawned run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationEvent {
    /// Percent complete, 10..=100
    Progress(u8),
    Finished { max_rpm: u32 },
    Cancelled,
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag that can also be awaited.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Routine
// ---------------------------------------------------------------------------

/// Hardware state captured before the fan is forced to max.
#[derive(Debug)]
struct Snapshot {
    enable: String,
    pwm: String,
}

impl Snapshot {
    fn take(device: &FanDevice) -> Self {
        Self {
            enable: device
                .read_enable_raw()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| PwmEnable::Auto.value().to_string()),
            pwm: device.read_pwm_raw().unwrap_or_else(|| "0".to_string()),
        }
    }

    fn restore(&self, device: &FanDevice) {
        if let Err(e) = device.write_enable_raw(&self.enable) {
            log::error!("Error restoring fan state: {e}");
            return;
        }
        if self.enable == "1" && !self.pwm.is_empty() {
            if let Err(e) = device.write_pwm_raw(&self.pwm) {
                log::error!("Error restoring fan duty: {e}");
            }
        }
    }
}

/// Percent reported after step `i` (0-based).
fn progress_percent(i: u32) -> u8 {
    (f64::from(i + 1) / f64::from(CALIBRATION_STEPS) * 100.0).round() as u8
}

/// Run a calibration on a device the caller holds exclusively.
///
/// The fan's cross-process lock is taken first (waiting for a daemon tick
/// to finish if needed) and held until the previous state is restored.
/// `on_progress` is called after each of the [`CALIBRATION_STEPS`] sleeps.
/// The result is persisted before hardware state is restored; restore
/// failures are logged and do not affect the outcome.
pub async fn run<F>(
    device: &mut FanDevice,
    store: &ConfigStore,
    wait: Duration,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<CalibrationOutcome>
where
    F: FnMut(u8),
{
    let _claim = device.claim().await?;
    log::info!("Starting calibration, waiting {}s at max", wait.as_secs_f64());

    let snapshot = Snapshot::take(device);
    device.set_enable(PwmEnable::Max)?;

    let step = wait / CALIBRATION_STEPS;
    let mut cancelled = false;
    for i in 0..CALIBRATION_STEPS {
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
        }
        on_progress(progress_percent(i));
    }

    let outcome = if cancelled {
        log::info!("Calibration cancelled");
        Ok(CalibrationOutcome::Cancelled)
    } else {
        measure_and_store(device, store)
    };

    snapshot.restore(device);
    outcome
}

fn measure_and_store(device: &FanDevice, store: &ConfigStore) -> Result<CalibrationOutcome> {
    let max_rpm = device.fan_rpm()?.unwrap_or_else(|| {
        log::warn!("Fan speed unavailable, storing max RPM 0");
        0
    });
    store.update(|c| c.fan_max = max_rpm)?;
    log::info!("Calibration finished, max RPM {max_rpm}");
    Ok(CalibrationOutcome::Completed { max_rpm })
}

/// Run a calibration with `mode = calibration` set in the config, so a
/// daemon polling the same file stays off the fan.
///
/// The previous mode is put back afterwards, whatever the outcome. A stale
/// `calibration` mode left by an interrupted run is restored as `auto`.
pub async fn run_in_calibration_mode<F>(
    device: &mut FanDevice,
    store: &ConfigStore,
    cancel: &CancelToken,
    on_progress: F,
) -> Result<CalibrationOutcome>
where
    F: FnMut(u8),
{
    let config = store.load();
    let previous = match config.mode {
        Mode::Calibration => Mode::Auto,
        mode => mode,
    };
    let wait = Duration::from_secs(config.calibration_wait);

    store.update(|c| c.mode = Mode::Calibration)?;
    let result = run(device, store, wait, cancel, on_progress).await;

    if let Err(e) = store.update(|c| c.mode = previous.clone()) {
        log::error!("Failed to restore mode '{previous}': {e}");
        if result.is_ok() {
            return Err(e);
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

/// A calibration running on its own task.
pub struct CalibrationTask {
    events: mpsc::UnboundedReceiver<CalibrationEvent>,
    cancel: CancelToken,
    handle: JoinHandle<Result<CalibrationOutcome>>,
}

impl CalibrationTask {
    /// Next progress event; `None` once the run has ended and all events
    /// were received.
    pub async fn next_event(&mut self) -> Option<CalibrationEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the run to end.
    pub async fn join(self) -> Result<CalibrationOutcome> {
        self.handle
            .await
            .map_err(|e| Error::Task(format!("calibration: {e}")))?
    }
}

/// Start a calibration on a background task.
///
/// The task holds the device lock for the whole run, so the control loop
/// cannot write to the fan until it ends.
pub fn spawn(device: SharedDevice, store: ConfigStore, wait: Duration) -> CalibrationTask {
    let cancel = CancelToken::new();
    let (tx, events) = mpsc::unbounded_channel();

    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        let mut guard = device.lock_owned().await;
        let progress_tx = tx.clone();
        let outcome = run(&mut guard, &store, wait, &token, |pct| {
            let _ = progress_tx.send(CalibrationEvent::Progress(pct));
        })
        .await;

        let last = match &outcome {
            Ok(CalibrationOutcome::Completed { max_rpm }) => {
                Some(CalibrationEvent::Finished { max_rpm: *max_rpm })
            }
            Ok(CalibrationOutcome::Cancelled) => Some(CalibrationEvent::Cancelled),
            Err(_) => None,
        };
        if let Some(event) = last {
            let _ = tx.send(event);
        }
        outcome
    });

    CalibrationTask {
        events,
        cancel,
        handle,
    }
}

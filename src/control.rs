// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The control loop.
//!
//! Every tick re-checks the config file, samples the CPU temperature into the
//! moving average and then acts according to the configured mode. Errors
//! inside a tick are logged and followed by a longer sleep; the loop only
//! ends when asked to shut down.
//!
//! Sysfs access runs on the blocking pool under [`DEVICE_IO_TIMEOUT`]. A
//! read or write that hangs keeps the device locked, so later ticks report
//! [`TickOutcome::DeviceBusy`] until it returns.

use crate::calibration::CancelToken;
use crate::config::{Config, ConfigStore, Mode};
use crate::curve;
use crate::error::{Error, Result};
use crate::governor::{Decision, Governor};
use crate::hwmon::{ActuatorClaim, FanDevice, PwmEnable, SharedDevice};
use crate::smoother::{SensorSample, Smoother};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::OwnedMutexGuard;

/// Normal tick period.
pub const TICK_PERIOD: Duration = Duration::from_secs(2);

/// Tick period while another party owns the fan.
pub const CALIBRATION_POLL: Duration = Duration::from_secs(1);

/// Sleep after a failed tick.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound on one batch of sysfs reads or writes.
pub const DEVICE_IO_TIMEOUT: Duration = Duration::from_secs(3);

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Config says a calibration is running; the fan was left alone.
    Calibrating,
    /// Another writer holds the fan: an in-process calibration, another
    /// process's lock, or a device call that has not returned yet.
    DeviceBusy,
    /// Curve mode wrote a new duty.
    Applied { pwm: u8 },
    /// Curve mode computed a duty but the governor held it back.
    Held { pwm: u8 },
    /// Curve mode with an empty curve.
    NoCurve,
    /// Curve mode without a temperature reading.
    NoTemperature,
    Manual { pwm: u8 },
    /// Manual mode with a negative `manual_pwm`.
    ManualDisabled,
    /// Firmware mode (`max` or `auto`) was (re)asserted.
    Firmware(PwmEnable),
    Unrecognized(String),
}

impl TickOutcome {
    /// How long to sleep before the next tick.
    pub fn next_delay(&self) -> Duration {
        match self {
            TickOutcome::Calibrating | TickOutcome::DeviceBusy => CALIBRATION_POLL,
            _ => TICK_PERIOD,
        }
    }
}

/// A hardware write decided by a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    SetPwm(u8),
    SetEnable(PwmEnable),
}

impl Action {
    fn apply(self, device: &FanDevice) -> Result<()> {
        match self {
            Action::SetPwm(pwm) => device.set_pwm(pwm),
            Action::SetEnable(mode) => device.set_enable(mode),
        }
    }
}

/// What the read phase of a tick saw.
struct Readings {
    claim: ActuatorClaim,
    temp_c: Option<i32>,
    rpm: u32,
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

/// Liveness timestamp. It only records when an interval elapsed; it does not
/// act on the hardware.
#[derive(Debug)]
pub struct Watchdog {
    last_reset: Instant,
}

impl Watchdog {
    pub fn new(now: Instant) -> Self {
        Self { last_reset: now }
    }

    /// Returns true (and re-arms) when more than `interval` passed since the
    /// last reset.
    pub fn check(&mut self, interval: Duration, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_reset) > interval {
            self.last_reset = now;
            true
        } else {
            false
        }
    }

    pub fn last_reset(&self) -> Instant {
        self.last_reset
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

pub struct ControlDaemon {
    store: ConfigStore,
    config: Arc<Config>,
    seen_mtime: Option<SystemTime>,
    device: SharedDevice,
    smoother: Smoother,
    governor: Governor,
    watchdog: Watchdog,
    active_mode: Option<Mode>,
}

impl ControlDaemon {
    pub fn new(store: ConfigStore, device: SharedDevice) -> Self {
        let seen_mtime = store.last_modified();
        let config = Arc::new(store.load());
        Self {
            store,
            config,
            seen_mtime,
            device,
            smoother: Smoother::new(),
            governor: Governor::new(),
            watchdog: Watchdog::new(now()),
            active_mode: None,
        }
    }

    /// The config snapshot the next tick will use.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Replace the config snapshot if the file's mtime advanced.
    pub fn reload_if_changed(&mut self) -> bool {
        let Some(mtime) = self.store.last_modified() else {
            return false;
        };
        if self.seen_mtime.is_some_and(|seen| mtime <= seen) {
            return false;
        }

        self.config = Arc::new(self.store.load());
        self.seen_mtime = Some(mtime);
        log::info!(
            "Reloaded config from {} (mode '{}')",
            self.store.path().display(),
            self.config.mode
        );
        true
    }

    /// One control cycle.
    pub async fn tick(&mut self, now: Instant) -> Result<TickOutcome> {
        self.reload_if_changed();
        let config = Arc::clone(&self.config);

        if self.active_mode.as_ref() != Some(&config.mode) {
            log::info!("Control mode is now '{}'", config.mode);
            self.governor.reset();
            self.active_mode = Some(config.mode.clone());
        }

        if config.mode == Mode::Calibration {
            return Ok(TickOutcome::Calibrating);
        }

        let watchdog_interval = Duration::from_secs(config.watchdog_interval);
        if self.watchdog.check(watchdog_interval, now) {
            log::debug!("Watchdog interval of {watchdog_interval:?} elapsed");
        }

        let Ok(device) = Arc::clone(&self.device).try_lock_owned() else {
            log::debug!("Fan device is busy, skipping tick");
            return Ok(TickOutcome::DeviceBusy);
        };

        let wants_rpm = config.mode == Mode::Curve;
        let (device, readings) = device_io(device, move |dev| {
            let Some(claim) = dev.try_claim()? else {
                return Ok(None);
            };
            let temp_c = dev.cpu_temp()?;
            let rpm = if wants_rpm {
                dev.fan_rpm()?.unwrap_or(0)
            } else {
                0
            };
            Ok(Some(Readings { claim, temp_c, rpm }))
        })
        .await?;
        let Some(Readings {
            claim: _claim,
            temp_c,
            rpm,
        }) = readings
        else {
            log::debug!("Fan is locked by another process, skipping tick");
            return Ok(TickOutcome::DeviceBusy);
        };

        let avg_temp = match temp_c {
            Some(temp_c) => {
                let sample = SensorSample {
                    temp_c,
                    taken_at: now,
                };
                Some(self.smoother.push(sample, config.ma_window))
            }
            None => {
                log::warn!("CPU temperature unavailable");
                None
            }
        };

        let (action, outcome) = match &config.mode {
            Mode::Curve => match avg_temp {
                Some(avg) => self.plan_curve(&config, avg, rpm, now),
                None => (None, TickOutcome::NoTemperature),
            },
            Mode::Manual if config.manual_pwm < 0 => (None, TickOutcome::ManualDisabled),
            Mode::Manual => {
                let pwm = config.manual_pwm.min(255) as u8;
                (Some(Action::SetPwm(pwm)), TickOutcome::Manual { pwm })
            }
            Mode::Max => (
                Some(Action::SetEnable(PwmEnable::Max)),
                TickOutcome::Firmware(PwmEnable::Max),
            ),
            Mode::Auto => (
                Some(Action::SetEnable(PwmEnable::Auto)),
                TickOutcome::Firmware(PwmEnable::Auto),
            ),
            Mode::Calibration => (None, TickOutcome::Calibrating),
            Mode::Unrecognized(mode) => {
                log::debug!("Unrecognized mode '{mode}', leaving the fan alone");
                (None, TickOutcome::Unrecognized(mode.clone()))
            }
        };

        if let Some(action) = action {
            device_io(device, move |dev| action.apply(dev)).await?;
        }
        Ok(outcome)
    }

    fn plan_curve(
        &mut self,
        config: &Config,
        avg_temp: f64,
        rpm: u32,
        now: Instant,
    ) -> (Option<Action>, TickOutcome) {
        let Some(percent) =
            curve::target_duty(avg_temp, &config.curve, config.curve_interpolation)
        else {
            return (None, TickOutcome::NoCurve);
        };
        let pwm = curve::percent_to_pwm(percent);

        match self.governor.evaluate(pwm, rpm, config.fan_max, now) {
            Decision::Apply => {
                log::debug!("{avg_temp:.1}C -> {percent:.1}% (pwm {pwm}), fan at {rpm} RPM");
                (Some(Action::SetPwm(pwm)), TickOutcome::Applied { pwm })
            }
            Decision::Hold => (None, TickOutcome::Held { pwm }),
        }
    }

    /// Tick until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancelToken) {
        log::info!(
            "Control loop started (config {}, mode '{}')",
            self.store.path().display(),
            self.config.mode
        );

        while !shutdown.is_cancelled() {
            let delay = match self.tick(now()).await {
                Ok(outcome) => {
                    log::trace!("Tick: {outcome:?}");
                    outcome.next_delay()
                }
                Err(e) => {
                    log::error!("Error in control loop: {e}");
                    ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        log::info!("Control loop stopped");
    }
}

/// Run `f` against the locked device on the blocking pool.
///
/// The guard travels with the call and comes back with its result. If the
/// call errors the guard is dropped; if it times out the guard stays with the
/// stuck call until it returns.
async fn device_io<T, F>(
    device: OwnedMutexGuard<FanDevice>,
    f: F,
) -> Result<(OwnedMutexGuard<FanDevice>, T)>
where
    F: FnOnce(&FanDevice) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let call = tokio::task::spawn_blocking(move || f(&*device).map(|value| (device, value)));
    match tokio::time::timeout(DEVICE_IO_TIMEOUT, call).await {
        Ok(joined) => joined.map_err(|e| Error::Task(format!("device I/O: {e}")))?,
        Err(_) => {
            log::warn!("Fan device did not respond within {DEVICE_IO_TIMEOUT:?}");
            Err(Error::Timeout(DEVICE_IO_TIMEOUT))
        }
    }
}

/// Current time from tokio's clock, so paused-time tests drive the loop.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{self, CalibrationOutcome};
    use crate::curve::{CurvePoint, Interpolation};
    use crate::hwmon::fake::FakeSysfs;
    use std::fs;
    use tempfile::TempDir;

    struct Harness {
        sys: FakeSysfs,
        _dir: TempDir,
        store: ConfigStore,
        device: SharedDevice,
        bumps: u64,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let sys = FakeSysfs::new();
            let dir = TempDir::new().unwrap();
            let store = ConfigStore::new(dir.path().join("config.json"));
            store.save(&config).unwrap();
            let device = sys.device().into_shared();
            Self {
                sys,
                _dir: dir,
                store,
                device,
                bumps: 0,
            }
        }

        fn daemon(&self) -> ControlDaemon {
            ControlDaemon::new(self.store.clone(), self.device.clone())
        }

        /// Save and move the mtime forward so the change is always seen.
        fn rewrite(&mut self, config: &Config) {
            self.store.save(config).unwrap();
            self.bumps += 1;
            let file = fs::File::options()
                .write(true)
                .open(self.store.path())
                .unwrap();
            file.set_modified(SystemTime::now() + Duration::from_secs(10 * self.bumps))
                .unwrap();
        }
    }

    fn curve_config(interpolation: Interpolation) -> Config {
        Config {
            mode: Mode::Curve,
            ma_window: 1,
            curve: vec![
                CurvePoint::new(30, 0),
                CurvePoint::new(60, 40),
                CurvePoint::new(90, 85),
            ],
            curve_interpolation: interpolation,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_curve_smooth_writes_pwm() {
        let h = Harness::new(curve_config(Interpolation::Smooth));
        h.sys.set_temp_millic(75_000);
        let mut d = h.daemon();

        let outcome = d.tick(Instant::now()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Applied { pwm: 159 });
        assert_eq!(h.sys.read("pwm1"), "159");
        assert_eq!(h.sys.read("pwm1_enable"), "1");
    }

    #[tokio::test]
    async fn test_curve_discrete_writes_pwm() {
        let h = Harness::new(curve_config(Interpolation::Discrete));
        h.sys.set_temp_millic(75_500);
        let mut d = h.daemon();

        let outcome = d.tick(Instant::now()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Applied { pwm: 102 });
        assert_eq!(h.sys.read("pwm1"), "102");
    }

    #[tokio::test]
    async fn test_curve_uses_moving_average() {
        let h = Harness::new(Config {
            ma_window: 3,
            ..curve_config(Interpolation::Smooth)
        });
        let mut d = h.daemon();
        let start = Instant::now();

        for (i, millic) in [30_000, 60_000, 90_000].into_iter().enumerate() {
            h.sys.set_temp_millic(millic);
            d.tick(start + TICK_PERIOD * i as u32).await.unwrap();
        }
        // mean 60C -> 40% -> 102
        assert_eq!(h.sys.read("pwm1"), "102");
    }

    #[tokio::test]
    async fn test_governor_holds_small_corrections() {
        let h = Harness::new(Config {
            fan_max: 6000,
            ..curve_config(Interpolation::Smooth)
        });
        h.sys.set_temp_millic(75_000);
        // pwm 159 expects ~3741 RPM
        h.sys.set_rpm(3700);
        let mut d = h.daemon();
        let start = Instant::now();

        assert_eq!(d.tick(start).await.unwrap(), TickOutcome::Held { pwm: 159 });
        assert_eq!(h.sys.read("pwm1"), "0");

        let later = start + Duration::from_secs(61);
        assert_eq!(d.tick(later).await.unwrap(), TickOutcome::Applied { pwm: 159 });
        assert_eq!(h.sys.read("pwm1"), "159");

        // Far off target: applied at once.
        h.sys.set_rpm(900);
        let next = later + TICK_PERIOD;
        assert_eq!(d.tick(next).await.unwrap(), TickOutcome::Applied { pwm: 159 });
    }

    #[tokio::test]
    async fn test_empty_curve_does_nothing() {
        let h = Harness::new(Config {
            curve: Vec::new(),
            ..curve_config(Interpolation::Smooth)
        });
        let mut d = h.daemon();
        assert_eq!(d.tick(Instant::now()).await.unwrap(), TickOutcome::NoCurve);
        assert_eq!(h.sys.read("pwm1_enable"), "2");
    }

    #[tokio::test]
    async fn test_manual_mode() {
        let mut h = Harness::new(Config {
            mode: Mode::Manual,
            manual_pwm: 300,
            ..Config::default()
        });
        let mut d = h.daemon();
        assert_eq!(
            d.tick(Instant::now()).await.unwrap(),
            TickOutcome::Manual { pwm: 255 }
        );
        assert_eq!(h.sys.read("pwm1"), "255");

        h.sys.write("pwm1", "9");
        h.rewrite(&Config {
            mode: Mode::Manual,
            manual_pwm: -1,
            ..Config::default()
        });
        assert_eq!(
            d.tick(Instant::now()).await.unwrap(),
            TickOutcome::ManualDisabled
        );
        assert_eq!(h.sys.read("pwm1"), "9");
    }

    #[tokio::test]
    async fn test_firmware_modes_and_reload() {
        let mut h = Harness::new(Config {
            mode: Mode::Max,
            ..Config::default()
        });
        let mut d = h.daemon();
        assert_eq!(
            d.tick(Instant::now()).await.unwrap(),
            TickOutcome::Firmware(PwmEnable::Max)
        );
        assert_eq!(h.sys.read("pwm1_enable"), "0");

        // Not reloaded without an mtime change.
        assert!(!d.reload_if_changed());

        h.rewrite(&Config::default());
        assert_eq!(
            d.tick(Instant::now()).await.unwrap(),
            TickOutcome::Firmware(PwmEnable::Auto)
        );
        assert_eq!(h.sys.read("pwm1_enable"), "2");
        assert_eq!(d.config().mode, Mode::Auto);
    }

    #[tokio::test]
    async fn test_calibration_mode_leaves_fan_alone() {
        let h = Harness::new(Config {
            mode: Mode::Calibration,
            ..Config::default()
        });
        h.sys.write("pwm1_enable", "0");
        let mut d = h.daemon();

        let outcome = d.tick(Instant::now()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Calibrating);
        assert_eq!(outcome.next_delay(), CALIBRATION_POLL);
        assert_eq!(h.sys.read("pwm1_enable"), "0");
        assert!(d.smoother.is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_mode_leaves_fan_alone() {
        let h = Harness::new(Config {
            mode: Mode::Unrecognized("turbo".to_string()),
            ..Config::default()
        });
        h.sys.write("pwm1_enable", "1");
        let mut d = h.daemon();

        assert_eq!(
            d.tick(Instant::now()).await.unwrap(),
            TickOutcome::Unrecognized("turbo".to_string())
        );
        assert_eq!(h.sys.read("pwm1_enable"), "1");
    }

    #[tokio::test]
    async fn test_busy_device_is_skipped() {
        let h = Harness::new(Config::default());
        let mut d = h.daemon();
        let _guard = h.device.lock().await;
        assert_eq!(d.tick(Instant::now()).await.unwrap(), TickOutcome::DeviceBusy);
    }

    #[tokio::test]
    async fn test_locked_fan_is_skipped() {
        let h = Harness::new(curve_config(Interpolation::Smooth));
        h.sys.set_temp_millic(75_000);
        let mut d = h.daemon();

        let held = h.sys.lock().try_claim().unwrap().unwrap();
        assert_eq!(d.tick(Instant::now()).await.unwrap(), TickOutcome::DeviceBusy);
        assert_eq!(h.sys.read("pwm1_enable"), "2");
        assert_eq!(h.sys.read("pwm1"), "0");
        assert!(d.smoother.is_empty());

        drop(held);
        assert_eq!(
            d.tick(Instant::now()).await.unwrap(),
            TickOutcome::Applied { pwm: 159 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_mode_cannot_interrupt_calibration_elsewhere() {
        // The daemon still believes the mode is auto while a calibration on
        // a separate handle (another process) drives the fan.
        let h = Harness::new(Config::default());
        let mut d = h.daemon();
        let mut other = h.sys.device();

        let cancel = CancelToken::new();
        let calibrating = calibration::run(
            &mut other,
            &h.store,
            Duration::from_secs(10),
            &cancel,
            |_| {},
        );
        let ticking = async {
            let mut outcomes = Vec::new();
            for _ in 0..4 {
                tokio::time::sleep(TICK_PERIOD).await;
                outcomes.push(d.tick(now()).await.unwrap());
                assert_eq!(h.sys.read("pwm1_enable"), "0");
            }
            outcomes
        };
        let (outcome, outcomes) = tokio::join!(calibrating, ticking);

        assert_eq!(outcomes, vec![TickOutcome::DeviceBusy; 4]);
        assert_eq!(
            outcome.unwrap(),
            CalibrationOutcome::Completed { max_rpm: 3000 }
        );
        assert_eq!(
            d.tick(now()).await.unwrap(),
            TickOutcome::Firmware(PwmEnable::Auto)
        );
    }

    #[tokio::test]
    async fn test_hung_device_call_times_out_and_keeps_device() {
        let h = Harness::new(Config::default());
        let guard = Arc::clone(&h.device).try_lock_owned().unwrap();

        let result = device_io(guard, |_| {
            std::thread::sleep(DEVICE_IO_TIMEOUT + Duration::from_millis(500));
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        let mut d = h.daemon();
        assert_eq!(d.tick(Instant::now()).await.unwrap(), TickOutcome::DeviceBusy);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.device.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_missing_temperature() {
        let mut h = Harness::new(curve_config(Interpolation::Smooth));
        fs::remove_file(h.sys.core_dir().join("temp1_input")).unwrap();
        let mut d = h.daemon();
        assert_eq!(
            d.tick(Instant::now()).await.unwrap(),
            TickOutcome::NoTemperature
        );

        // Firmware modes don't need a temperature.
        h.rewrite(&Config::default());
        assert_eq!(
            d.tick(Instant::now()).await.unwrap(),
            TickOutcome::Firmware(PwmEnable::Auto)
        );
    }

    #[tokio::test]
    async fn test_mode_change_resets_governor() {
        let mut h = Harness::new(Config {
            fan_max: 6000,
            ..curve_config(Interpolation::Smooth)
        });
        h.sys.set_temp_millic(75_000);
        h.sys.set_rpm(3700);
        let mut d = h.daemon();
        let start = Instant::now();

        d.tick(start).await.unwrap();
        assert!(d.governor.hold_since().is_some());

        h.rewrite(&Config {
            mode: Mode::Manual,
            manual_pwm: 40,
            ..Config::default()
        });
        d.tick(start + TICK_PERIOD).await.unwrap();
        assert!(d.governor.hold_since().is_none());
    }

    #[test]
    fn test_watchdog() {
        let start = Instant::now();
        let mut w = Watchdog::new(start);
        let interval = Duration::from_secs(90);
        assert!(!w.check(interval, start + Duration::from_secs(90)));
        assert!(w.check(interval, start + Duration::from_secs(91)));
        assert_eq!(w.last_reset(), start + Duration::from_secs(91));
        assert!(!w.check(interval, start + Duration::from_secs(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_from_errors_and_stops() {
        let h = Harness::new(Config {
            mode: Mode::Manual,
            manual_pwm: 120,
            ..Config::default()
        });
        fs::write(h.sys.core_dir().join("temp1_input"), "garbage").unwrap();

        let shutdown = CancelToken::new();
        let loop_task = tokio::spawn(h.daemon().run(shutdown.clone()));

        // First tick fails on the malformed sensor and backs off.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.sys.read("pwm1"), "0");

        h.sys.set_temp_millic(50_000);
        tokio::time::sleep(ERROR_BACKOFF).await;
        assert_eq!(h.sys.read("pwm1"), "120");

        shutdown.cancel();
        loop_task.await.unwrap();
    }
}

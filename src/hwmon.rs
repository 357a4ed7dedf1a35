// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! hwmon sysfs discovery and control.
//!
//! The fan is driven through the `hp-wmi` platform device's hwmon entry
//! (`fan1_input`, `pwm1`, `pwm1_enable`). CPU temperature comes from the
//! `coretemp`/`k10temp` hwmon device, or the first thermal zone if neither
//! exists.
//!
//! Every process that writes to the fan takes an advisory `flock` on a lock
//! file first ([`ActuatorLock`]), so the daemon and a calibration started
//! from another process never write at the same time.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const HP_WMI_HWMON_ROOT: &str = "/sys/devices/platform/hp-wmi/hwmon";
const HWMON_ROOT: &str = "/sys/class/hwmon";
const THERMAL_ZONE_TEMP: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Lock file shared by every writer of the fan.
pub const ACTUATOR_LOCK_PATH: &str = "/run/omen-fan-control.lock";

/// Poll interval while waiting for another process to release the fan.
const CLAIM_RETRY: Duration = Duration::from_millis(100);

/// hwmon driver names that expose the CPU package temperature as `temp1`.
const CPU_TEMP_DRIVERS: [&str; 2] = ["coretemp", "k10temp"];

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Files the control core reads and writes. Any of them may be missing,
/// e.g. `pwm1` only exists once the patched driver is loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HwmonPaths {
    /// `fan1_input`, RPM
    pub fan_speed: Option<PathBuf>,
    /// `pwm1_enable`: 0=max, 1=manual, 2=auto
    pub pwm_enable: Option<PathBuf>,
    /// `pwm1`, duty 0-255
    pub pwm: Option<PathBuf>,
    /// CPU temperature in millidegrees C
    pub cpu_temp: Option<PathBuf>,
}

/// Where discovery looks. Overridable so tests can use a fake sysfs tree.
#[derive(Debug, Clone)]
pub struct DiscoveryRoots {
    pub fan_hwmon_root: PathBuf,
    pub hwmon_root: PathBuf,
    pub thermal_zone_temp: PathBuf,
}

impl Default for DiscoveryRoots {
    fn default() -> Self {
        Self {
            fan_hwmon_root: PathBuf::from(HP_WMI_HWMON_ROOT),
            hwmon_root: PathBuf::from(HWMON_ROOT),
            thermal_zone_temp: PathBuf::from(THERMAL_ZONE_TEMP),
        }
    }
}

/// Values accepted by `pwm1_enable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmEnable {
    /// Firmware full speed
    Max,
    /// Software writes `pwm1`
    Manual,
    /// Firmware curve
    Auto,
}

impl PwmEnable {
    pub fn value(self) -> u8 {
        match self {
            PwmEnable::Max => 0,
            PwmEnable::Manual => 1,
            PwmEnable::Auto => 2,
        }
    }

    pub fn from_value(v: i64) -> Option<Self> {
        match v {
            0 => Some(PwmEnable::Max),
            1 => Some(PwmEnable::Manual),
            2 => Some(PwmEnable::Auto),
            _ => None,
        }
    }
}

impl fmt::Display for PwmEnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PwmEnable::Max => "Max",
            PwmEnable::Manual => "Manual",
            PwmEnable::Auto => "Auto",
        };
        write!(f, "{name} ({})", self.value())
    }
}

/// One labelled CPU temperature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreTemp {
    pub label: String,
    pub temp_c: i32,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Locate the fan and CPU temperature files on this machine.
pub fn discover_paths() -> HwmonPaths {
    discover_paths_in(&DiscoveryRoots::default())
}

pub fn discover_paths_in(roots: &DiscoveryRoots) -> HwmonPaths {
    let mut paths = HwmonPaths {
        cpu_temp: find_cpu_temp_path(roots),
        ..HwmonPaths::default()
    };

    match sorted_entries(&roots.fan_hwmon_root).into_iter().next() {
        Some(dir) => {
            paths.fan_speed = Some(dir.join("fan1_input"));
            paths.pwm_enable = Some(dir.join("pwm1_enable"));
            paths.pwm = Some(dir.join("pwm1"));
        }
        None => log::warn!(
            "No hwmon device under {}, is hp-wmi loaded?",
            roots.fan_hwmon_root.display()
        ),
    }

    paths
}

fn find_cpu_temp_path(roots: &DiscoveryRoots) -> Option<PathBuf> {
    for dir in sorted_entries(&roots.hwmon_root) {
        let Some(name) = read_trimmed(&dir.join("name")) else {
            continue;
        };
        if CPU_TEMP_DRIVERS.contains(&name.as_str()) {
            let input = dir.join("temp1_input");
            if input.exists() {
                return Some(input);
            }
        }
    }

    roots
        .thermal_zone_temp
        .exists()
        .then(|| roots.thermal_zone_temp.clone())
}

fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    dirs.sort();
    dirs
}

// ---------------------------------------------------------------------------
// Reading / writing
// ---------------------------------------------------------------------------

/// Read an integer attribute.
///
/// A missing, unreadable or empty file is `Ok(None)`; contents that are not
/// an integer are an error.
pub fn read_int(path: &Path) -> Result<Option<i64>> {
    let Some(raw) = read_trimmed(path) else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<i64>()
        .map(Some)
        .map_err(|_| Error::MalformedSensor {
            path: path.to_path_buf(),
            value: raw,
        })
}

/// Write a value to an attribute.
pub fn write_value(path: &Path, value: impl fmt::Display) -> Result<()> {
    fs::write(path, value.to_string()).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            log::warn!("Permission denied writing {}, are you root?", path.display());
        }
        Error::io(path, e)
    })
}

fn read_trimmed(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(s) => Some(s.trim().to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            log::warn!("Failed to read {}: {e}", path.display());
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Cross-process exclusion
// ---------------------------------------------------------------------------

/// Advisory lock file guarding the fan across processes.
#[derive(Debug, Clone)]
pub struct ActuatorLock {
    path: PathBuf,
}

/// Exclusive right to write to the fan. Released on drop.
#[derive(Debug)]
pub struct ActuatorClaim {
    _flock: Option<Flock<File>>,
}

impl ActuatorLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without waiting. `Ok(None)` means another holder has it.
    pub fn try_claim(&self) -> Result<Option<ActuatorClaim>> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(ActuatorClaim {
                _flock: Some(flock),
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(Error::Lock {
                path: self.path.clone(),
                source: errno,
            }),
        }
    }

    /// Wait until the lock is free and take it.
    pub async fn claim(&self) -> Result<ActuatorClaim> {
        let mut waiting = false;
        loop {
            if let Some(claim) = self.try_claim()? {
                return Ok(claim);
            }
            if !waiting {
                log::info!("Fan is in use by another process, waiting");
                waiting = true;
            }
            tokio::time::sleep(CLAIM_RETRY).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Device handle
// ---------------------------------------------------------------------------

/// The fan actuator and its sensors.
///
/// Whoever holds a `&mut FanDevice` (or the lock of a [`SharedDevice`]) is
/// the only writer to the fan.
#[derive(Debug)]
pub struct FanDevice {
    paths: HwmonPaths,
    lock: Option<ActuatorLock>,
}

/// The actuator handle shared between the control loop and calibration.
pub type SharedDevice = Arc<Mutex<FanDevice>>;

impl FanDevice {
    /// A device without a cross-process lock; only in-process exclusion
    /// through [`SharedDevice`] applies.
    pub fn new(paths: HwmonPaths) -> Self {
        Self { paths, lock: None }
    }

    pub fn with_lock(mut self, lock: ActuatorLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Discover the system's paths and guard them with the system lock file.
    pub fn discover() -> Self {
        Self::new(discover_paths()).with_lock(ActuatorLock::new(ACTUATOR_LOCK_PATH))
    }

    pub fn into_shared(self) -> SharedDevice {
        Arc::new(Mutex::new(self))
    }

    pub fn paths(&self) -> &HwmonPaths {
        &self.paths
    }

    pub fn lock(&self) -> Option<&ActuatorLock> {
        self.lock.as_ref()
    }

    /// Take the fan's lock without waiting; `Ok(None)` if another process
    /// holds it. Always succeeds on a device without a lock.
    pub fn try_claim(&self) -> Result<Option<ActuatorClaim>> {
        match &self.lock {
            Some(lock) => lock.try_claim(),
            None => Ok(Some(ActuatorClaim { _flock: None })),
        }
    }

    /// Wait for the fan's lock.
    pub async fn claim(&self) -> Result<ActuatorClaim> {
        match &self.lock {
            Some(lock) => lock.claim().await,
            None => Ok(ActuatorClaim { _flock: None }),
        }
    }

    /// Whether `pwm1` exists, i.e. the driver supports manual duty writes.
    pub fn has_pwm_control(&self) -> bool {
        self.paths.pwm.as_deref().is_some_and(Path::exists)
    }

    /// Current fan speed in RPM.
    pub fn fan_rpm(&self) -> Result<Option<u32>> {
        let Some(path) = &self.paths.fan_speed else {
            return Ok(None);
        };
        Ok(read_int(path)?.map(|v| v.clamp(0, i64::from(u32::MAX)) as u32))
    }

    /// CPU temperature in whole degrees C (millidegrees floored).
    pub fn cpu_temp(&self) -> Result<Option<i32>> {
        let Some(path) = &self.paths.cpu_temp else {
            return Ok(None);
        };
        Ok(read_int(path)?.map(millic_to_c))
    }

    /// Package and per-core temperatures from the CPU hwmon device.
    ///
    /// Package entries come first, then cores ordered by index.
    pub fn core_temps(&self) -> Vec<CoreTemp> {
        let Some(dir) = self.paths.cpu_temp.as_deref().and_then(Path::parent) else {
            return Vec::new();
        };

        let mut packages = Vec::new();
        let mut cores = Vec::new();
        for path in sorted_entries(dir) {
            let Some(file) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !(file.starts_with("temp") && file.ends_with("_input")) {
                continue;
            }
            let Ok(Some(millic)) = read_int(&path) else {
                continue;
            };
            let label = read_trimmed(&path.with_file_name(file.replace("input", "label")))
                .unwrap_or_else(|| file.to_string());
            let temp = CoreTemp {
                temp_c: millic_to_c(millic),
                label,
            };

            if temp.label.contains("Core") {
                let idx = temp
                    .label
                    .split_whitespace()
                    .last()
                    .and_then(|n| n.parse::<u32>().ok())
                    .unwrap_or(999);
                cores.push((idx, temp));
            } else if temp.label.contains("Package") {
                packages.push(temp);
            }
        }

        cores.sort_by_key(|(idx, _)| *idx);
        packages.extend(cores.into_iter().map(|(_, t)| t));
        packages
    }

    /// Raw `pwm1_enable` contents.
    pub fn read_enable_raw(&self) -> Option<String> {
        self.paths.pwm_enable.as_deref().and_then(read_trimmed)
    }

    /// Raw `pwm1` contents.
    pub fn read_pwm_raw(&self) -> Option<String> {
        self.paths.pwm.as_deref().and_then(read_trimmed)
    }

    pub fn pwm_enable(&self) -> Option<PwmEnable> {
        self.read_enable_raw()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(PwmEnable::from_value)
    }

    /// Write `pwm1_enable` verbatim, used to restore a snapshot.
    pub fn write_enable_raw(&self, raw: &str) -> Result<()> {
        write_value(self.enable_path()?, raw)
    }

    /// Write `pwm1` verbatim, used to restore a snapshot.
    pub fn write_pwm_raw(&self, raw: &str) -> Result<()> {
        write_value(self.pwm_path()?, raw)
    }

    pub fn set_enable(&self, mode: PwmEnable) -> Result<()> {
        write_value(self.enable_path()?, mode.value())
    }

    /// Write a duty value (0-255), switching to manual mode first if the
    /// fan is not already in it.
    pub fn set_pwm(&self, value: u8) -> Result<()> {
        if self.read_enable_raw().as_deref() != Some("1") {
            self.set_enable(PwmEnable::Manual)?;
        }
        write_value(self.pwm_path()?, value)
    }

    /// Hand the fan back to the firmware curve.
    pub fn restore_automatic(&self) -> Result<()> {
        self.set_enable(PwmEnable::Auto)
    }

    fn enable_path(&self) -> Result<&Path> {
        self.paths
            .pwm_enable
            .as_deref()
            .ok_or(Error::MissingPath("pwm1_enable"))
    }

    fn pwm_path(&self) -> Result<&Path> {
        self.paths.pwm.as_deref().ok_or(Error::MissingPath("pwm1"))
    }
}

fn millic_to_c(millic: i64) -> i32 {
    millic.div_euclid(1000).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::fake::FakeSysfs;
    use super::*;

    #[test]
    fn test_discovery_prefers_coretemp() {
        let sys = FakeSysfs::new();
        let paths = discover_paths_in(&sys.roots);
        assert_eq!(paths.fan_speed, Some(sys.fan_dir().join("fan1_input")));
        assert_eq!(paths.pwm, Some(sys.fan_dir().join("pwm1")));
        assert_eq!(paths.pwm_enable, Some(sys.fan_dir().join("pwm1_enable")));
        assert_eq!(paths.cpu_temp, Some(sys.core_dir().join("temp1_input")));
    }

    #[test]
    fn test_discovery_falls_back_to_thermal_zone() {
        let sys = FakeSysfs::new();
        fs::remove_dir_all(sys.core_dir()).unwrap();
        let paths = discover_paths_in(&sys.roots);
        assert_eq!(paths.cpu_temp, Some(sys.roots.thermal_zone_temp.clone()));
    }

    #[test]
    fn test_discovery_without_fan_device() {
        let sys = FakeSysfs::new();
        fs::remove_dir_all(sys.fan_dir()).unwrap();
        let paths = discover_paths_in(&sys.roots);
        assert_eq!(paths.pwm, None);
        assert!(paths.cpu_temp.is_some());
    }

    #[test]
    fn test_read_int() {
        let sys = FakeSysfs::new();
        let dir = sys.fan_dir();
        assert_eq!(read_int(&dir.join("fan1_input")).unwrap(), Some(3000));
        assert_eq!(read_int(&dir.join("nope")).unwrap(), None);

        fs::write(dir.join("empty"), "\n").unwrap();
        assert_eq!(read_int(&dir.join("empty")).unwrap(), None);

        fs::write(dir.join("junk"), "hot\n").unwrap();
        assert!(matches!(
            read_int(&dir.join("junk")),
            Err(Error::MalformedSensor { .. })
        ));
    }

    #[test]
    fn test_cpu_temp_floors_millidegrees() {
        let sys = FakeSysfs::new();
        let dev = sys.device();
        assert_eq!(dev.cpu_temp().unwrap(), Some(45));
        sys.set_temp_millic(67999);
        assert_eq!(dev.cpu_temp().unwrap(), Some(67));
    }

    #[test]
    fn test_set_pwm_switches_to_manual() {
        let sys = FakeSysfs::new();
        let dev = sys.device();
        dev.set_pwm(159).unwrap();
        assert_eq!(sys.read("pwm1_enable"), "1");
        assert_eq!(sys.read("pwm1"), "159");
        assert_eq!(dev.pwm_enable(), Some(PwmEnable::Manual));
    }

    #[test]
    fn test_firmware_modes() {
        let sys = FakeSysfs::new();
        let dev = sys.device();
        dev.set_enable(PwmEnable::Max).unwrap();
        assert_eq!(sys.read("pwm1_enable"), "0");
        dev.restore_automatic().unwrap();
        assert_eq!(sys.read("pwm1_enable"), "2");
    }

    #[test]
    fn test_missing_pwm_path_is_an_error() {
        let dev = FanDevice::new(HwmonPaths::default());
        assert!(!dev.has_pwm_control());
        assert!(matches!(dev.set_pwm(10), Err(Error::MissingPath(_))));
        assert_eq!(dev.fan_rpm().unwrap(), None);
        assert_eq!(dev.cpu_temp().unwrap(), None);
    }

    #[test]
    fn test_claim_excludes_other_handles() {
        let sys = FakeSysfs::new();
        let first = sys.device();
        let second = sys.device();

        let claim = first.try_claim().unwrap();
        assert!(claim.is_some());
        assert!(second.try_claim().unwrap().is_none());
        assert!(sys.lock().try_claim().unwrap().is_none());

        drop(claim);
        assert!(second.try_claim().unwrap().is_some());
    }

    #[test]
    fn test_unlocked_device_always_claims() {
        let dev = FanDevice::new(HwmonPaths::default());
        assert!(dev.lock().is_none());
        let _a = dev.try_claim().unwrap().unwrap();
        assert!(dev.try_claim().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_waits_for_release() {
        let sys = FakeSysfs::new();
        let held = sys.lock().try_claim().unwrap().unwrap();
        let dev = sys.device();

        let release = async {
            tokio::time::sleep(Duration::from_millis(350)).await;
            drop(held);
        };
        let (claim, ()) = tokio::join!(dev.claim(), release);
        assert!(claim.is_ok());
        assert!(sys.lock().try_claim().unwrap().is_none());
    }

    #[test]
    fn test_core_temps_order() {
        let sys = FakeSysfs::new();
        let core = sys.core_dir();
        fs::write(core.join("temp1_label"), "Package id 0\n").unwrap();
        for (n, label, millic) in [(2, "Core 4", "51000"), (3, "Core 0", "48000")] {
            fs::write(core.join(format!("temp{n}_input")), millic).unwrap();
            fs::write(core.join(format!("temp{n}_label")), label).unwrap();
        }

        let temps = sys.device().core_temps();
        let labels: Vec<&str> = temps.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, ["Package id 0", "Core 0", "Core 4"]);
        assert_eq!(temps[1].temp_c, 48);
    }
}

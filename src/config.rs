// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration file handling.
//!
//! The config is a JSON document shared between the daemon and any front-end
//! that edits it. There is no locking: writers replace the whole file and the
//! daemon notices by polling its modification time.
//!
//! Default path: `/etc/omen-fan-control/config.json` for root, the user's
//! config directory otherwise.

use crate::curve::{CurvePoint, Interpolation};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;

/// Config file location when running as root.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/omen-fan-control/config.json";

/// Directory name under the user's config dir.
pub const CONFIG_DIR_NAME: &str = "omen-fan-control";

/// Schema version stamped on every save.
pub const CONFIG_VERSION: u32 = 1;

/// Front-ends running as a normal user read the system config.
const CONFIG_FILE_MODE: u32 = 0o644;

pub const DEFAULT_CALIBRATION_WAIT_SECS: u64 = 30;
pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 90;
pub const DEFAULT_MA_WINDOW: usize = 5;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Which control path the daemon runs.
///
/// Any string other than the known modes is kept verbatim so it survives a
/// save, and the daemon leaves the fan alone while it is active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Mode {
    /// Firmware (BIOS) control, `pwm1_enable = 2`.
    #[default]
    Auto,
    /// Firmware full speed, `pwm1_enable = 0`.
    Max,
    /// Fixed PWM from `manual_pwm`.
    Manual,
    /// PWM from the temperature curve.
    Curve,
    /// A calibration run owns the fan; the daemon idles.
    Calibration,
    Unrecognized(String),
}

impl Mode {
    pub fn as_str(&self) -> &str {
        match self {
            Mode::Auto => "auto",
            Mode::Max => "max",
            Mode::Manual => "manual",
            Mode::Curve => "curve",
            Mode::Calibration => "calibration",
            Mode::Unrecognized(s) => s,
        }
    }
}

impl From<String> for Mode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "auto" => Mode::Auto,
            "max" => Mode::Max,
            "manual" => Mode::Manual,
            "curve" => Mode::Curve,
            "calibration" => Mode::Calibration,
            _ => Mode::Unrecognized(s),
        }
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted config document.
///
/// Missing keys take their defaults. Keys this crate does not know about are
/// collected in `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,

    /// Max fan RPM measured by the last calibration; 0 = never calibrated.
    pub fan_max: u32,

    /// Total calibration duration in seconds.
    pub calibration_wait: u64,

    /// Watchdog interval in seconds.
    pub watchdog_interval: u64,

    /// Moving average window length, in samples.
    pub ma_window: usize,

    /// Temperature curve for `curve` mode.
    pub curve: Vec<CurvePoint>,

    pub mode: Mode,

    /// PWM (0-255) for `manual` mode. Negative disables manual writes.
    pub manual_pwm: i64,

    pub curve_interpolation: Interpolation,

    pub bypass_warning: bool,
    pub bypass_patch_warning: bool,
    pub bypass_root_warning: bool,
    pub enable_experimental: bool,

    /// Thermal profile used by the driver patch step: omen, victus, victus_s.
    pub thermal_profile: String,

    /// Board name read from DMI, cached because the read needs root.
    pub cached_board_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_type: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            fan_max: 0,
            calibration_wait: DEFAULT_CALIBRATION_WAIT_SECS,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL_SECS,
            ma_window: DEFAULT_MA_WINDOW,
            curve: Vec::new(),
            mode: Mode::Auto,
            manual_pwm: 0,
            curve_interpolation: Interpolation::Smooth,
            bypass_warning: false,
            bypass_patch_warning: false,
            bypass_root_warning: false,
            enable_experimental: false,
            thermal_profile: "omen".to_string(),
            cached_board_name: None,
            install_type: None,
            extra: serde_json::Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The config file on disk.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config, returning the default if the file doesn't exist.
    pub fn try_load(&self) -> Result<Config> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!("No config file at {}, using defaults", self.path.display());
                return Ok(Config::default());
            }
            Err(e) => return Err(Error::io(&self.path, e)),
        };

        let config = serde_json::from_str(&contents)?;
        log::debug!("Loaded config from {}", self.path.display());
        Ok(config)
    }

    /// Load the config, falling back to defaults if it is unreadable or
    /// corrupt.
    pub fn load(&self) -> Config {
        self.try_load().unwrap_or_else(|e| {
            log::warn!(
                "Could not load config from {}: {e}, using defaults",
                self.path.display()
            );
            Config::default()
        })
    }

    /// Save the config, creating parent directories if needed.
    ///
    /// The document is written to a uniquely named sibling temp file and
    /// renamed over the target, so a concurrent reader sees either the old
    /// or the new file and concurrent writers never share a temp file.
    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
        }

        let mut doc = config.clone();
        doc.version = CONFIG_VERSION;
        let contents = to_pretty_json(&doc)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
        tmp.write_all(&contents)
            .and_then(|()| {
                tmp.as_file()
                    .set_permissions(fs::Permissions::from_mode(CONFIG_FILE_MODE))
            })
            .map_err(|e| Error::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::io(&self.path, e.error))?;

        log::debug!("Saved config to {}", self.path.display());
        Ok(())
    }

    /// Re-read the file, apply `f`, and save. Returns the saved document.
    ///
    /// Fails without writing if the existing file cannot be read or parsed,
    /// so a document this crate does not understand is never replaced by
    /// defaults.
    pub fn update<F>(&self, f: F) -> Result<Config>
    where
        F: FnOnce(&mut Config),
    {
        let mut config = self.try_load()?;
        f(&mut config);
        self.save(&config)?;
        Ok(config)
    }

    /// Modification time of the file, or `None` if it cannot be stat'ed.
    pub fn last_modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

// ---------------------------------------------------------------------------
// Path selection
// ---------------------------------------------------------------------------

/// Default config path for a process with or without root privileges.
pub fn default_config_path(is_root: bool) -> PathBuf {
    if is_root {
        return PathBuf::from(SYSTEM_CONFIG_PATH);
    }
    match dirs::config_dir() {
        Some(dir) => dir.join(CONFIG_DIR_NAME).join("config.json"),
        None => PathBuf::from(SYSTEM_CONFIG_PATH),
    }
}

/// Resolve the config file path from CLI arg or default.
pub fn resolve_config_path(cli_path: Option<&str>, is_root: bool) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| default_config_path(is_root))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_pretty_json(config: &Config) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    config.serialize(&mut ser)?;
    Ok(buf)
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan control for HP Omen laptops.
//!
//! The `omen-fand` daemon runs [`control::ControlDaemon`], which polls the
//! JSON config and the CPU temperature and drives the fan through the
//! `hp-wmi` hwmon interface. `omen-fanctl` edits the config and runs
//! [`calibration`] to measure the fan's max RPM.

pub mod board;
pub mod calibration;
pub mod config;
pub mod control;
pub mod curve;
pub mod error;
pub mod governor;
pub mod hwmon;
pub mod smoother;

pub use error::{Error, Result};

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Hysteresis for curve-driven PWM writes.
//!
//! Small corrections are held back so the fan does not audibly hunt around a
//! set point; large ones go through immediately. A hold that lasts longer
//! than [`HOLD_TIMEOUT`] is released so the fan cannot stay stale forever.

use std::time::{Duration, Instant};

/// Expected-vs-measured RPM difference treated as noise.
pub const HOLD_BAND_RPM: f64 = 200.0;

/// Maximum time a write is held back.
pub const HOLD_TIMEOUT: Duration = Duration::from_secs(60);

/// What the control loop should do with the target this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Apply,
    Hold,
}

#[derive(Debug, Default)]
pub struct Governor {
    last_applied: Option<u8>,
    hold_since: Option<Instant>,
}

impl Governor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `target_pwm` should be written now.
    ///
    /// `max_rpm == 0` means the fan was never calibrated; every target is
    /// applied. Otherwise the target is converted to an expected RPM and
    /// compared against `current_rpm`. The hold timer starts on the first
    /// close-enough tick and is only cleared by a large difference or by an
    /// apply; a changing target inside the band does not restart it.
    pub fn evaluate(
        &mut self,
        target_pwm: u8,
        current_rpm: u32,
        max_rpm: u32,
        now: Instant,
    ) -> Decision {
        let decision = if max_rpm == 0 {
            Decision::Apply
        } else {
            let target_rpm = f64::from(target_pwm) / 255.0 * f64::from(max_rpm);
            let diff = (target_rpm - f64::from(current_rpm)).abs();

            if diff > HOLD_BAND_RPM {
                self.hold_since = None;
                Decision::Apply
            } else {
                let since = *self.hold_since.get_or_insert(now);
                if now.saturating_duration_since(since) > HOLD_TIMEOUT {
                    Decision::Apply
                } else {
                    log::debug!(
                        "Holding pwm {target_pwm}: expected {target_rpm:.0} RPM vs {current_rpm} RPM"
                    );
                    Decision::Hold
                }
            }
        };

        if decision == Decision::Apply {
            self.hold_since = None;
            self.last_applied = Some(target_pwm);
        }
        decision
    }

    /// The last PWM value this governor let through.
    pub fn last_applied(&self) -> Option<u8> {
        self.last_applied
    }

    /// When the current hold started, if one is in progress.
    pub fn hold_since(&self) -> Option<Instant> {
        self.hold_since
    }

    /// Forget all state, e.g. after a mode change.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

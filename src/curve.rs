// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan curve definitions and interpolation.
//!
//! A curve maps CPU temperature (degrees C) to a fan duty percentage (0-100).
//! The daemon converts the percentage to a PWM duty value (0-255) before
//! writing it to the hardware.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A single point on a fan curve.
///
/// Stored in the config document as a `[temp, percent]` pair. Any JSON
/// number is accepted on read (graphical editors save floats); values are
/// rounded to whole degrees and percent, with the duty clamped to 0-100.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "(f64, f64)", into = "(i32, u8)")]
pub struct CurvePoint {
    /// Temperature in degrees Celsius
    pub temp_c: i32,
    /// Fan duty in percent (0-100)
    pub duty: u8,
}

impl CurvePoint {
    pub const fn new(temp_c: i32, duty: u8) -> Self {
        Self { temp_c, duty }
    }
}

impl From<(f64, f64)> for CurvePoint {
    fn from((temp_c, duty): (f64, f64)) -> Self {
        Self {
            temp_c: temp_c.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32,
            duty: duty.round().clamp(0.0, 100.0) as u8,
        }
    }
}

impl From<CurvePoint> for (i32, u8) {
    fn from(p: CurvePoint) -> Self {
        (p.temp_c, p.duty)
    }
}

/// How the duty is derived between two curve points.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Step function: the lower point's duty holds until the next point.
    Discrete,
    /// Linear interpolation between neighbouring points. Unknown values in
    /// the config document fall back to this.
    #[default]
    #[serde(other)]
    Smooth,
}

/// Compute the target duty percentage for `temp_c`.
///
/// Returns `None` for an empty curve. The points are sorted by temperature
/// before use (stable sort, so points sharing a temperature keep their
/// order), and the first bracketing segment wins.
///
/// - At or below the first point: the first point's duty
/// - At or above the last point: the last point's duty
/// - In between: see [`Interpolation`]
pub fn target_duty(temp_c: f64, curve: &[CurvePoint], mode: Interpolation) -> Option<f64> {
    let mut points = curve.to_vec();
    points.sort_by_key(|p| p.temp_c);

    let first = points.first()?;
    let last = points.last()?;

    if temp_c <= f64::from(first.temp_c) {
        return Some(f64::from(first.duty));
    }
    if temp_c >= f64::from(last.temp_c) {
        return Some(f64::from(last.duty));
    }

    for window in points.windows(2) {
        let lo = &window[0];
        let hi = &window[1];
        let (lo_t, hi_t) = (f64::from(lo.temp_c), f64::from(hi.temp_c));

        if lo_t <= temp_c && temp_c <= hi_t {
            let duty = match mode {
                Interpolation::Discrete => f64::from(lo.duty),
                Interpolation::Smooth if hi.temp_c == lo.temp_c => f64::from(hi.duty),
                Interpolation::Smooth => {
                    let frac = (temp_c - lo_t) / (hi_t - lo_t);
                    f64::from(lo.duty) + frac * (f64::from(hi.duty) - f64::from(lo.duty))
                }
            };
            return Some(duty);
        }
    }

    // Unreachable for a sorted curve once both clamps have been checked.
    Some(f64::from(last.duty))
}

/// Convert a duty percentage (0-100) to a PWM value (0-255).
///
/// Halves round to even, so 62.5% maps to 159 and 30% to 76.
pub fn percent_to_pwm(percent: f64) -> u8 {
    (percent / 100.0 * 255.0).round_ties_even().clamp(0.0, 255.0) as u8
}

/// Parse a manual fan value: a PWM value `0-255`, or a percentage such as
/// `50%` which is converted with [`percent_to_pwm`].
pub fn parse_pwm_value(value: &str) -> Result<u8> {
    let value = value.trim();
    if let Some(percent) = value.strip_suffix('%') {
        let percent: u8 = percent
            .trim()
            .parse()
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| Error::InvalidValue(format!("{value:?}: percentage must be 0-100")))?;
        return Ok(percent_to_pwm(f64::from(percent)));
    }
    value
        .parse::<u8>()
        .map_err(|_| Error::InvalidValue(format!("{value:?}: use 0-255 or a percentage like 50%")))
}

/// Validate user supplied curve points.
pub fn validate(points: &[CurvePoint]) -> Result<()> {
    if points.is_empty() {
        return Err(Error::InvalidCurve("curve has no points".to_string()));
    }
    if let Some(p) = points.iter().find(|p| p.duty > 100) {
        return Err(Error::InvalidCurve(format!(
            "duty {}% at {}C must be 0-100",
            p.duty, p.temp_c
        )));
    }
    Ok(())
}

/// Parse a curve from CSV text with one `temp,percent` pair per line.
///
/// Blank lines, `#` comments and lines without a comma are skipped. The
/// result is sorted by temperature and validated.
pub fn parse_csv(text: &str) -> Result<Vec<CurvePoint>> {
    let mut points = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || !line.contains(',') {
            continue;
        }

        let mut parts = line.split(',').map(str::trim);
        let (Some(temp), Some(duty)) = (parts.next(), parts.next()) else {
            continue;
        };
        let bad_line = || Error::InvalidCurve(format!("line {}: {line:?}", lineno + 1));
        let temp_c: i32 = temp.parse().map_err(|_| bad_line())?;
        let duty: i64 = duty.parse().map_err(|_| bad_line())?;
        if !(0..=100).contains(&duty) {
            return Err(Error::InvalidCurve(format!(
                "line {}: speed {duty} must be 0-100%",
                lineno + 1
            )));
        }

        points.push(CurvePoint::new(temp_c, duty as u8));
    }

    points.sort_by_key(|p| p.temp_c);
    validate(&points)?;
    Ok(points)
}

/// A quiet starting curve for users who switch to curve mode without one.
pub fn default_curve() -> Vec<CurvePoint> {
    vec![
        CurvePoint::new(40, 0),
        CurvePoint::new(55, 30),
        CurvePoint::new(70, 55),
        CurvePoint::new(85, 85),
        CurvePoint::new(95, 100),
    ]
}

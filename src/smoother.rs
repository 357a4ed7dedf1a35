// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Moving average over recent temperature samples.

use std::collections::VecDeque;
use std::time::Instant;

/// One temperature reading as seen by the control loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    /// Temperature in whole degrees Celsius
    pub temp_c: i32,
    pub taken_at: Instant,
}

/// Sliding window of the most recent samples.
///
/// The window length is passed on every push so a config reload that
/// shrinks it takes effect on the next sample.
#[derive(Debug, Default)]
pub struct Smoother {
    samples: VecDeque<SensorSample>,
}

impl Smoother {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample, evict down to `window` entries (oldest first) and
    /// return the mean of what remains. A window of 0 is treated as 1.
    pub fn push(&mut self, sample: SensorSample, window: usize) -> f64 {
        let window = window.max(1);
        self.samples.push_back(sample);
        while self.samples.len() > window {
            self.samples.pop_front();
        }
        self.average()
    }

    /// Mean of the current window, or 0.0 before the first sample.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: i64 = self.samples.iter().map(|s| i64::from(s.temp_c)).sum();
        sum as f64 / self.samples.len() as f64
    }

    pub fn latest(&self) -> Option<&SensorSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(temp_c: i32) -> SensorSample {
        SensorSample {
            temp_c,
            taken_at: Instant::now(),
        }
    }

    #[test]
    fn test_window_of_one_passes_through() {
        let mut s = Smoother::new();
        for t in [40, 85, 52, 61] {
            assert_eq!(s.push(sample(t), 1), f64::from(t));
        }
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_only_latest_samples_count() {
        let mut s = Smoother::new();
        for t in [100, 100, 100, 40, 50, 60] {
            s.push(sample(t), 3);
        }
        assert_eq!(s.average(), 50.0);
        assert_eq!(s.latest().map(|x| x.temp_c), Some(60));
    }

    #[test]
    fn test_shrinking_window_evicts_immediately() {
        let mut s = Smoother::new();
        for t in [10, 20, 30, 40, 50] {
            s.push(sample(t), 5);
        }
        assert_eq!(s.len(), 5);
        assert_eq!(s.push(sample(60), 2), 55.0);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_zero_window_behaves_like_one() {
        let mut s = Smoother::new();
        s.push(sample(30), 0);
        assert_eq!(s.push(sample(70), 0), 70.0);
    }

    #[test]
    fn test_empty_average() {
        let s = Smoother::new();
        assert!(s.is_empty());
        assert_eq!(s.average(), 0.0);
    }
}

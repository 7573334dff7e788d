//! Delay-o-meter: how much does this host overshoot a sleep?
//!
//! Each sample requests a fixed pause and records `elapsed - requested` in
//! milliseconds. Samples may be negative when the host wakes early; a well
//! behaved host clusters them around zero. A large mean is not an error,
//! it is surfaced to the caller, which decides whether to warn.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Calibration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Number of samples to take (0 skips calibration).
    pub samples: u32,
    /// Requested pause per sample, in milliseconds.
    pub sleep_ms: u64,
    /// Mean overshoot above which the host is considered jittery.
    pub warn_threshold_ms: f64,
    /// Pause after a jitter warning so the user can read it.
    pub warn_pause_secs: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            samples: 20,
            sleep_ms: 200,
            warn_threshold_ms: 2.0,
            warn_pause_secs: 5,
        }
    }
}

/// Summary of a calibration run. Only mean and peak are kept.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JitterStats {
    pub samples: u32,
    pub mean_ms: f64,
    pub peak_ms: f64,
}

impl JitterStats {
    /// Summarize raw samples. An empty slice yields zeros.
    #[must_use]
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self {
                samples: 0,
                mean_ms: 0.0,
                peak_ms: 0.0,
            };
        }
        let sum: f64 = samples.iter().sum();
        let peak = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            samples: samples.len() as u32,
            mean_ms: sum / samples.len() as f64,
            peak_ms: peak,
        }
    }

    /// True when the mean overshoot is above `threshold_ms`.
    #[must_use]
    pub fn exceeds(&self, threshold_ms: f64) -> bool {
        self.mean_ms > threshold_ms
    }
}

/// Measures sleep overshoot with a fixed requested pause.
#[derive(Debug, Clone, Copy)]
pub struct DelayCalibrator {
    requested: Duration,
}

impl DelayCalibrator {
    #[must_use]
    pub const fn new(requested: Duration) -> Self {
        Self { requested }
    }

    #[must_use]
    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self::new(Duration::from_millis(config.sleep_ms))
    }

    #[must_use]
    pub const fn requested(&self) -> Duration {
        self.requested
    }

    /// Take one sample. Blocks for roughly the requested duration.
    #[must_use]
    pub fn sample(&self) -> f64 {
        let start = Instant::now();
        std::thread::sleep(self.requested);
        let elapsed = start.elapsed();
        (elapsed.as_secs_f64() - self.requested.as_secs_f64()) * 1000.0
    }

    /// Take `count` samples and return their mean and peak.
    ///
    /// Blocks for about `count * requested`.
    #[must_use]
    pub fn measure_jitter(&self, count: u32) -> JitterStats {
        self.measure_jitter_with(count, |_| {})
    }

    /// Like [`measure_jitter`](Self::measure_jitter), reporting each sample.
    pub fn measure_jitter_with(&self, count: u32, mut on_sample: impl FnMut(f64)) -> JitterStats {
        let mut samples = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let sample = self.sample();
            on_sample(sample);
            samples.push(sample);
        }
        JitterStats::from_samples(&samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_mean_and_peak() {
        let stats = JitterStats::from_samples(&[0.5, -0.25, 1.75]);
        assert_eq!(stats.samples, 3);
        assert!((stats.mean_ms - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.peak_ms - 1.75).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_allow_negative_samples() {
        let stats = JitterStats::from_samples(&[-0.5, -0.1]);
        assert!(stats.mean_ms < 0.0);
        assert!((stats.peak_ms - -0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_stats_are_zero() {
        let stats = JitterStats::from_samples(&[]);
        assert_eq!(stats.samples, 0);
        assert!(stats.mean_ms.abs() < f64::EPSILON);
        assert!(!stats.exceeds(2.0));
    }

    #[test]
    fn exceeds_is_strict() {
        let stats = JitterStats::from_samples(&[2.0]);
        assert!(!stats.exceeds(2.0));
        assert!(stats.exceeds(1.999));
    }

    #[test]
    fn measure_takes_requested_count() {
        let calibrator = DelayCalibrator::new(Duration::from_millis(5));
        let mut seen = 0;
        let stats = calibrator.measure_jitter_with(3, |_| seen += 1);
        assert_eq!(seen, 3);
        assert_eq!(stats.samples, 3);
        // thread::sleep never returns early on supported platforms
        assert!(stats.peak_ms >= stats.mean_ms);
        assert!(stats.mean_ms > -1.0);
    }

    #[test]
    fn zero_count_does_not_sleep() {
        let calibrator = DelayCalibrator::new(Duration::from_secs(10));
        let start = Instant::now();
        let stats = calibrator.measure_jitter(0);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(stats.samples, 0);
    }

    #[test]
    fn default_config_values() {
        let cfg = CalibrationConfig::default();
        assert_eq!(cfg.samples, 20);
        assert_eq!(cfg.sleep_ms, 200);
        assert!((cfg.warn_threshold_ms - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.warn_pause_secs, 5);
    }
}

//! Monotonic clock access, EWMA estimators, and the dynamic jitter buffer
//! multiplier. Same exponential-average idea as a fixed-alpha RTT tracker,
//! but continuously time-weighted by an explicit time constant instead of
//! a fixed per-sample alpha, so irregular sample spacing doesn't skew it.

use std::time::Instant;

/// Wall-independent "now" in seconds, backed by [`Instant`]. Never derived
/// from [`std::time::SystemTime`] — offsets and jitter must be immune to
/// clock adjustments.
pub fn now_seconds(epoch: Instant) -> f64 {
    epoch.elapsed().as_secs_f64()
}

/// Exponentially-weighted mean and variance, continuously re-weighted by
/// elapsed time rather than a fixed sample count, so a burst of samples
/// doesn't over-correct the estimate.
#[derive(Debug, Clone)]
pub struct EwmaMeanStd {
    tau: f64,
    mean: Option<f64>,
    mean_sq: f64,
    last_sample_at: Option<f64>,
}

impl EwmaMeanStd {
    pub fn new(tau_seconds: f64) -> Self {
        Self { tau: tau_seconds, mean: None, mean_sq: 0.0, last_sample_at: None }
    }

    pub fn observe(&mut self, now: f64, sample: f64) {
        match self.mean {
            None => {
                self.mean = Some(sample);
                self.mean_sq = sample * sample;
            }
            Some(mean) => {
                let dt = self.last_sample_at.map(|t| (now - t).max(0.0)).unwrap_or(0.0);
                let alpha = if self.tau > 0.0 { 1.0 - (-dt / self.tau).exp() } else { 1.0 };
                let new_mean = mean + alpha * (sample - mean);
                self.mean_sq += alpha * (sample * sample - self.mean_sq);
                self.mean = Some(new_mean);
            }
        }
        self.last_sample_at = Some(now);
    }

    pub fn mean(&self) -> f64 {
        self.mean.unwrap_or(0.0)
    }

    pub fn stddev(&self) -> f64 {
        let mean = self.mean();
        (self.mean_sq - mean * mean).max(0.0).sqrt()
    }

    pub fn has_samples(&self) -> bool {
        self.mean.is_some()
    }
}

/// Tracks `offset = local_receive_time - server_broadcast_time` and exposes
/// an estimate of current server time plus its jitter.
#[derive(Debug, Clone)]
pub struct TimeEstimator {
    offset: EwmaMeanStd,
}

impl Default for TimeEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeEstimator {
    pub fn new() -> Self {
        Self { offset: EwmaMeanStd::new(1.0) }
    }

    pub fn observe(&mut self, local_receive_time: f64, server_broadcast_time: f64) {
        self.offset.observe(local_receive_time, local_receive_time - server_broadcast_time);
    }

    pub fn is_ready(&self) -> bool {
        self.offset.has_samples()
    }

    pub fn estimate_server_now(&self, local_now: f64) -> f64 {
        if self.is_ready() {
            local_now - self.offset.mean()
        } else {
            local_now
        }
    }

    pub fn jitter_std(&self) -> f64 {
        self.offset.stddev()
    }
}

/// Smoothed estimate of the interval between consecutive send timestamps;
/// used to fall back to a nominal rate before enough samples arrive.
#[derive(Debug, Clone)]
pub struct SendIntervalEstimator {
    nominal: f64,
    estimate: EwmaMeanStd,
    last_pose_time: Option<f64>,
}

impl SendIntervalEstimator {
    pub fn new(nominal_interval_secs: f64) -> Self {
        Self { nominal: nominal_interval_secs, estimate: EwmaMeanStd::new(2.0), last_pose_time: None }
    }

    pub fn observe(&mut self, pose_time: f64) {
        if let Some(last) = self.last_pose_time {
            let delta = pose_time - last;
            if delta > 0.0 && delta <= 1.0 {
                self.estimate.observe(pose_time, delta);
            }
        }
        self.last_pose_time = Some(pose_time);
    }

    pub fn interval(&self) -> f64 {
        if self.estimate.has_samples() {
            self.estimate.mean()
        } else {
            self.nominal
        }
    }
}

/// Bounds and tuning for [`dynamic_buffer_multiplier`].
#[derive(Debug, Clone, Copy)]
pub struct BufferMultiplierSettings {
    pub enabled: bool,
    pub base_multiplier: f64,
    pub tolerance: f64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
}

impl Default for BufferMultiplierSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_multiplier: 2.0,
            tolerance: 0.5,
            min_multiplier: 1.0,
            max_multiplier: 6.0,
        }
    }
}

pub fn dynamic_buffer_multiplier(
    settings: &BufferMultiplierSettings,
    send_interval: f64,
    jitter_std: f64,
    estimator_ready: bool,
) -> f64 {
    let clamp = |v: f64| v.clamp(settings.min_multiplier, settings.max_multiplier);

    if !settings.enabled || !estimator_ready || send_interval <= 0.0 {
        return clamp(settings.base_multiplier);
    }

    let adaptive = (send_interval + jitter_std) / send_interval + settings.tolerance;
    clamp(settings.base_multiplier.max(adaptive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_estimate_converges_to_mean() {
        let mut est = TimeEstimator::new();
        let samples = [0.10, 0.11, 0.09, 0.10];
        for (i, &s) in samples.iter().enumerate() {
            est.observe(i as f64 * 0.1, i as f64 * 0.1 - s);
        }
        let server_now = est.estimate_server_now(1.0);
        assert!((1.0 - server_now - 0.10).abs() < 0.02);
        assert!(est.jitter_std() >= 0.0);
    }

    #[test]
    fn jitter_increases_with_noise() {
        let mut stable = TimeEstimator::new();
        let mut noisy = TimeEstimator::new();
        for i in 0..20 {
            let t = i as f64 * 0.1;
            stable.observe(t, t - 0.1);
            let noise = if i % 2 == 0 { 0.05 } else { -0.05 };
            noisy.observe(t, t - 0.1 - noise);
        }
        assert!(noisy.jitter_std() > stable.jitter_std());
    }

    #[test]
    fn not_ready_returns_local_now() {
        let est = TimeEstimator::new();
        assert_eq!(est.estimate_server_now(5.0), 5.0);
        assert!(!est.is_ready());
    }

    #[test]
    fn buffer_multiplier_clamped_when_not_ready() {
        let settings = BufferMultiplierSettings::default();
        let m = dynamic_buffer_multiplier(&settings, 0.1, 0.0, false);
        assert_eq!(m, settings.base_multiplier);
    }

    #[test]
    fn buffer_multiplier_grows_with_jitter() {
        let settings = BufferMultiplierSettings::default();
        let low = dynamic_buffer_multiplier(&settings, 0.1, 0.0, true);
        let high = dynamic_buffer_multiplier(&settings, 0.1, 0.2, true);
        assert!(high >= low);
    }

    #[test]
    fn send_interval_falls_back_to_nominal() {
        let est = SendIntervalEstimator::new(0.1);
        assert_eq!(est.interval(), 0.1);
    }

    #[test]
    fn send_interval_tracks_samples() {
        let mut est = SendIntervalEstimator::new(0.1);
        for t in [0.0, 0.1, 0.2, 0.3] {
            est.observe(t);
        }
        assert!((est.interval() - 0.1).abs() < 0.01);
    }
}

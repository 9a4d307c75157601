// Sliding-window linear regression of remote time against local time
// Feeds the virtual clock and decides how often the client should probe.

use std::time::Duration;
use tracing::debug;

use crate::clock::Calibration;
use crate::constants::{DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_THRESHOLD, POLL_BASE_SECS, R_SQUARED_CLAMP};
use crate::error::SyncError;

/// Result of one least-squares fit over the sample window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Regression {
    /// Slope `m`
    pub rate: f64,
    /// Intercept `b`
    pub offset: f64,
    /// Goodness of fit in `[0, 1]`
    pub r_squared: f64,
    /// Anchored form of the same line, used to build the virtual clock
    pub calibration: Calibration,
}

/// Circular window of `(local, remote)` samples and the fit over it.
///
/// While `filling`, only the first `time_index` entries are valid; once the
/// window has wrapped, all `window_size` entries are used and each new sample
/// overwrites the oldest.
#[derive(Debug, Clone)]
pub struct RegressionEstimator {
    window_size: usize,
    window_threshold: usize,
    local_times: Vec<u64>,
    remote_times: Vec<u64>,
    time_index: usize,
    filling: bool,
    last: Option<Regression>,
}

impl RegressionEstimator {
    pub fn new(window_size: usize) -> Self {
        Self::with_threshold(window_size, DEFAULT_WINDOW_THRESHOLD)
    }

    /// `window_threshold` is the number of samples needed before the first
    /// fit is attempted; it is clamped to `[2, window_size]`.
    pub fn with_threshold(window_size: usize, window_threshold: usize) -> Self {
        let window_size = window_size.max(2);
        RegressionEstimator {
            window_size,
            window_threshold: window_threshold.clamp(2, window_size),
            local_times: vec![0; window_size],
            remote_times: vec![0; window_size],
            time_index: 0,
            filling: true,
            last: None,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn is_filling(&self) -> bool {
        self.filling
    }

    /// Number of valid samples in the window.
    pub fn len(&self) -> usize {
        if self.filling {
            self.time_index
        } else {
            self.window_size
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest successful fit, if any.
    pub fn regression(&self) -> Option<Regression> {
        self.last
    }

    pub fn rate(&self) -> f64 {
        self.last.map_or(1.0, |r| r.rate)
    }

    pub fn offset(&self) -> f64 {
        self.last.map_or(0.0, |r| r.offset)
    }

    pub fn r_squared(&self) -> f64 {
        self.last.map_or(0.0, |r| r.r_squared)
    }

    /// Forget every sample and the current fit.
    pub fn reset(&mut self) {
        self.local_times.iter_mut().for_each(|t| *t = 0);
        self.remote_times.iter_mut().for_each(|t| *t = 0);
        self.time_index = 0;
        self.filling = true;
        self.last = None;
    }

    /// Store one sample, overwriting the oldest once the window is full.
    pub fn add_sample(&mut self, local_avg: u64, remote: u64) {
        self.local_times[self.time_index] = local_avg;
        self.remote_times[self.time_index] = remote;
        self.time_index += 1;
        if self.time_index == self.window_size {
            self.filling = false;
            self.time_index = 0;
        }
    }

    /// Refit the line over the valid part of the window.
    ///
    /// Returns `None` while too few samples have been collected or when all
    /// local timestamps coincide; the previous fit is kept in that case.
    pub fn recompute(&mut self) -> Option<Regression> {
        let n = self.len();
        if self.filling && n < self.window_threshold {
            debug!("Window filling: {}/{} samples", n, self.window_threshold);
            return None;
        }
        match fit(&self.local_times[..n], &self.remote_times[..n]) {
            Some(regression) => {
                self.last = Some(regression);
                Some(regression)
            }
            None => {
                debug!("Regression skipped: no spread in local timestamps");
                None
            }
        }
    }

    /// Turn one probe round trip into a sample.
    ///
    /// `local_send` is the time stamped into the probe, `local_receive` the
    /// time the reply arrived. The midpoint approximates when the remote
    /// clock was read. A reply that arrives before it was sent is rejected
    /// without touching the window.
    pub fn observe(
        &mut self,
        local_send: u64,
        remote: u64,
        local_receive: u64,
    ) -> Result<Option<Regression>, SyncError> {
        if local_receive < local_send {
            return Err(SyncError::BogusObservation {
                sent: local_send,
                received: local_receive,
            });
        }
        // Average without overflowing near u64::MAX
        let local_avg = local_send + (local_receive - local_send) / 2;
        self.add_sample(local_avg, remote);
        Ok(self.recompute())
    }

    /// How long the client may wait before the next probe.
    ///
    /// Zero while filling. Afterwards `1ms / (1 - r²)` with r² clamped to
    /// 0.99999, capped at `max`.
    pub fn poll_interval(&self, max: Duration) -> Duration {
        if self.filling {
            return Duration::ZERO;
        }
        let r_squared = self.r_squared().clamp(0.0, R_SQUARED_CLAMP);
        let secs = POLL_BASE_SECS / (1.0 - r_squared);
        Duration::from_secs_f64(secs).min(max)
    }
}

impl Default for RegressionEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

/// Least squares over `(xs, ys)`.
///
/// Samples are shifted by their minimum first so the sums stay small enough
/// for f64 even with nanosecond timestamps.
fn fit(xs: &[u64], ys: &[u64]) -> Option<Regression> {
    let n = xs.len();
    let x0 = *xs.iter().min()?;
    let y0 = *ys.iter().min()?;

    let (mut sum_x, mut sum_y) = (0.0, 0.0);
    for (&x, &y) in xs.iter().zip(ys) {
        sum_x += (x - x0) as f64;
        sum_y += (y - y0) as f64;
    }
    let xbar = sum_x / n as f64;
    let ybar = sum_y / n as f64;

    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for (&x, &y) in xs.iter().zip(ys) {
        let dx = (x - x0) as f64 - xbar;
        let dy = (y - y0) as f64 - ybar;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    if sxx == 0.0 {
        return None;
    }

    let rate = sxy / sxx;
    let r_squared = if syy > 0.0 {
        (sxy * sxy / (sxx * syy)).clamp(0.0, 1.0)
    } else {
        0.0
    };

    // Anchor the line at the (integer-rounded) mean of the window
    let xbar_round = xbar.round();
    let local_ref = x0 + xbar_round as u64;
    let remote_rel = ybar + rate * (xbar_round - xbar);
    let remote_ref = (y0 as i128 + remote_rel.round() as i128).clamp(0, u64::MAX as i128) as u64;
    let calibration = Calibration {
        local_ref,
        remote_ref,
        rate,
    };

    Some(Regression {
        rate,
        offset: calibration.offset(),
        r_squared,
        calibration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_perfect_fit_window_of_four() {
        let mut est = RegressionEstimator::new(4);
        est.add_sample(10, 100);
        est.add_sample(20, 110);
        est.add_sample(30, 120);
        assert!(est.is_filling());
        est.add_sample(40, 130);
        assert!(!est.is_filling());

        let reg = est.recompute().unwrap();
        assert!((reg.rate - 1.0).abs() < 1e-9);
        assert!((reg.offset - 90.0).abs() < 1e-9);
        assert!((reg.r_squared - 1.0).abs() < 1e-9);
        assert_eq!(reg.calibration.apply(50), 140);
    }

    #[test]
    fn test_needs_threshold_samples_while_filling() {
        let mut est = RegressionEstimator::new(32);
        for i in 0..3u64 {
            est.add_sample(i * 10, i * 20);
            assert!(est.recompute().is_none());
        }
        est.add_sample(30, 60);
        let reg = est.recompute().unwrap();
        assert!((reg.rate - 2.0).abs() < 1e-9);
        assert!(est.is_filling());
        assert_eq!(est.len(), 4);
    }

    #[test]
    fn test_window_wraps_and_slides() {
        let mut est = RegressionEstimator::new(4);
        // First window: slope 1
        for i in 0..4u64 {
            est.add_sample(i * 10, 1000 + i * 10);
        }
        assert_eq!(est.len(), 4);
        // Overwrite everything with slope 2
        for i in 10..14u64 {
            est.add_sample(i * 10, i * 20);
        }
        assert_eq!(est.len(), 4);
        let reg = est.recompute().unwrap();
        assert!((reg.rate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_bogus_observation_leaves_window_untouched() {
        let mut est = RegressionEstimator::new(8);
        est.observe(100, 1000, 120).unwrap();
        assert_eq!(est.len(), 1);

        let err = est.observe(200, 2000, 150).unwrap_err();
        assert!(matches!(err, SyncError::BogusObservation { sent: 200, received: 150 }));
        assert_eq!(est.len(), 1);
    }

    #[test]
    fn test_observe_uses_midpoint() {
        let mut est = RegressionEstimator::with_threshold(4, 2);
        est.observe(0, 1000, 20).unwrap();
        let reg = est.observe(100, 1100, 120).unwrap().unwrap();
        // Midpoints 10 and 110
        assert!((reg.rate - 1.0).abs() < 1e-9);
        assert!((reg.offset - 990.0).abs() < 1e-9);
    }

    #[test]
    fn test_constant_local_times_give_no_fit() {
        let mut est = RegressionEstimator::new(4);
        for i in 0..4u64 {
            est.add_sample(500, i);
        }
        assert!(est.recompute().is_none());
        assert!(est.regression().is_none());
        assert_eq!(est.rate(), 1.0);
    }

    #[test]
    fn test_constant_remote_times_give_zero_r_squared() {
        let mut est = RegressionEstimator::new(4);
        for i in 0..4u64 {
            est.add_sample(i * 10, 777);
        }
        let reg = est.recompute().unwrap();
        assert_eq!(reg.rate, 0.0);
        assert_eq!(reg.r_squared, 0.0);
    }

    #[test]
    fn test_poll_interval_policy() {
        let max = Duration::from_secs(1);
        let mut est = RegressionEstimator::new(4);
        assert_eq!(est.poll_interval(max), Duration::ZERO);

        for i in 0..4u64 {
            est.add_sample(i * 10, i * 10);
        }
        est.recompute();
        // r² == 1 is clamped: 1ms / 1e-5 = 100s, capped at max
        assert_eq!(est.poll_interval(max), max);
        assert_eq!(
            est.poll_interval(Duration::from_secs(1000)),
            Duration::from_secs_f64(POLL_BASE_SECS / (1.0 - R_SQUARED_CLAMP))
        );
    }

    #[test]
    fn test_poll_interval_shrinks_with_jitter() {
        let max = Duration::from_secs(1);
        let mut est = RegressionEstimator::new(4);
        est.add_sample(0, 0);
        est.add_sample(10, 30);
        est.add_sample(20, 0);
        est.add_sample(30, 30);
        let reg = est.recompute().unwrap();
        assert!(reg.r_squared < 0.5);
        let interval = est.poll_interval(max);
        assert!(interval >= Duration::from_millis(1));
        assert!(interval < Duration::from_millis(3));
    }

    #[test]
    fn test_noisy_samples_converge() {
        let mut rng = rand::thread_rng();
        let mut est = RegressionEstimator::new(32);
        let true_rate = 1.0001;
        let true_offset = 5_000_000_000.0;

        for i in 0..32u64 {
            let local = 1_000_000_000 + i * 10_000_000;
            let noise: f64 = rng.gen_range(-50_000.0..50_000.0);
            let remote = (true_rate * local as f64 + true_offset + noise) as u64;
            est.add_sample(local, remote);
            est.recompute();
        }

        let reg = est.regression().unwrap();
        assert!(!est.is_filling());
        assert!((reg.rate - true_rate).abs() < 1e-3);
        assert!(reg.r_squared > 0.999);
        let local = 1_200_000_000u64;
        let expected = true_rate * local as f64 + true_offset;
        assert!((reg.calibration.apply(local) as f64 - expected).abs() < 200_000.0);
    }

    #[test]
    fn test_reset() {
        let mut est = RegressionEstimator::new(4);
        for i in 0..4u64 {
            est.add_sample(i, i);
        }
        est.recompute();
        est.reset();
        assert!(est.is_filling());
        assert!(est.is_empty());
        assert!(est.regression().is_none());
    }

    #[test]
    fn test_threshold_is_clamped_to_window() {
        let mut est = RegressionEstimator::with_threshold(2, 10);
        est.add_sample(0, 0);
        est.add_sample(10, 20);
        assert!(!est.is_filling());
        assert!((est.recompute().unwrap().rate - 2.0).abs() < 1e-9);
    }
}

// Local monotonic time and the derived virtual clock
// The virtual clock maps local time onto the remote reference using the latest calibration.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Anything that can be asked for a timestamp in nanoseconds.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> u64;
}

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed since a process-wide epoch.
///
/// Every instance shares the same epoch, so readings from different
/// instances are directly comparable.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            epoch: *PROCESS_EPOCH.get_or_init(Instant::now),
        }
    }

    pub fn now(&self) -> u64 {
        // u64 nanoseconds cover ~584 years of uptime
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> u64 {
        MonotonicClock::now(self)
    }
}

/// Linear mapping from local to remote time.
///
/// Stored as an anchor pair plus slope instead of `(rate, offset)`:
/// nanosecond timestamps are too large to multiply in f64 without losing
/// precision, differences from the anchor are not.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub local_ref: u64,
    pub remote_ref: u64,
    pub rate: f64,
}

impl Calibration {
    /// rate = 1, offset = 0
    pub const IDENTITY: Calibration = Calibration {
        local_ref: 0,
        remote_ref: 0,
        rate: 1.0,
    };

    /// `rate * local + offset`, evaluated around the anchor.
    pub fn apply(&self, local: u64) -> u64 {
        let delta = local as i128 - self.local_ref as i128;
        let scaled = (delta as f64 * self.rate).round() as i128;
        (self.remote_ref as i128 + scaled).clamp(0, u64::MAX as i128) as u64
    }

    /// Intercept `b` of `remote = rate * local + b`.
    pub fn offset(&self) -> f64 {
        self.remote_ref as f64 - self.rate * self.local_ref as f64
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration::IDENTITY
    }
}

/// Single-writer sequence lock over a calibration.
///
/// Readers never block; they retry if a publish overlapped their read.
#[derive(Debug)]
struct CalibrationCell {
    seq: AtomicU64,
    local_ref: AtomicU64,
    remote_ref: AtomicU64,
    rate_bits: AtomicU64,
}

impl CalibrationCell {
    fn new(cal: Calibration) -> Self {
        CalibrationCell {
            seq: AtomicU64::new(0),
            local_ref: AtomicU64::new(cal.local_ref),
            remote_ref: AtomicU64::new(cal.remote_ref),
            rate_bits: AtomicU64::new(cal.rate.to_bits()),
        }
    }

    /// Only the synchronization loop publishes, so writers never race each other.
    fn store(&self, cal: Calibration) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.local_ref.store(cal.local_ref, Ordering::Relaxed);
        self.remote_ref.store(cal.remote_ref, Ordering::Relaxed);
        self.rate_bits.store(cal.rate.to_bits(), Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn load(&self) -> Calibration {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let cal = Calibration {
                local_ref: self.local_ref.load(Ordering::Relaxed),
                remote_ref: self.remote_ref.load(Ordering::Relaxed),
                rate: f64::from_bits(self.rate_bits.load(Ordering::Relaxed)),
            };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return cal;
            }
        }
    }
}

/// Read-only view of a synchronized clock.
///
/// Cheap to clone; every clone observes the same calibration. Always usable,
/// starting out as the identity transform before the first estimate.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    local: MonotonicClock,
    calibration: Arc<CalibrationCell>,
}

impl VirtualClock {
    pub fn new(local: MonotonicClock) -> Self {
        VirtualClock {
            local,
            calibration: Arc::new(CalibrationCell::new(Calibration::IDENTITY)),
        }
    }

    /// Current local monotonic time.
    pub fn local_now(&self) -> u64 {
        self.local.now()
    }

    /// Estimated remote time for a given local reading.
    pub fn virtual_time(&self, local: u64) -> u64 {
        self.calibration.load().apply(local)
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration.load()
    }

    pub fn rate(&self) -> f64 {
        self.calibration.load().rate
    }

    pub fn offset(&self) -> f64 {
        self.calibration.load().offset()
    }

    pub(crate) fn publish(&self, cal: Calibration) {
        self.calibration.store(cal);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> u64 {
        self.virtual_time(self.local.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_shares_epoch() {
        let a = MonotonicClock::new();
        let b = MonotonicClock::new();
        let t0 = a.now();
        let t1 = b.now();
        assert!(t1 >= t0);
    }

    #[test]
    fn test_identity_before_first_estimate() {
        let clock = VirtualClock::new(MonotonicClock::new());
        assert_eq!(clock.virtual_time(12345), 12345);
        assert_eq!(clock.rate(), 1.0);
        assert_eq!(clock.offset(), 0.0);
    }

    #[test]
    fn test_calibration_apply() {
        let cal = Calibration {
            local_ref: 25,
            remote_ref: 115,
            rate: 1.0,
        };
        assert_eq!(cal.apply(10), 100);
        assert_eq!(cal.apply(40), 130);
        assert!((cal.offset() - 90.0).abs() < 1e-9);

        let half = Calibration {
            local_ref: 1_000,
            remote_ref: 5_000,
            rate: 0.5,
        };
        assert_eq!(half.apply(3_000), 6_000);
        assert_eq!(half.apply(0), 4_500);
    }

    #[test]
    fn test_apply_clamps_below_zero() {
        let cal = Calibration {
            local_ref: 1_000,
            remote_ref: 10,
            rate: 1.0,
        };
        assert_eq!(cal.apply(0), 0);
    }

    #[test]
    fn test_large_timestamps_keep_precision() {
        // Wall-clock nanoseconds, beyond f64's exact integer range
        let remote = 1_700_000_000_123_456_789u64;
        let cal = Calibration {
            local_ref: 5_000_000_000,
            remote_ref: remote,
            rate: 1.0,
        };
        assert_eq!(cal.apply(5_000_000_001), remote + 1);
    }

    #[test]
    fn test_publish_is_visible_to_clones() {
        let clock = VirtualClock::new(MonotonicClock::new());
        let reader = clock.clone();
        let cal = Calibration {
            local_ref: 100,
            remote_ref: 1_100,
            rate: 2.0,
        };
        clock.publish(cal);
        assert_eq!(reader.calibration(), cal);
        assert_eq!(reader.virtual_time(150), 1_200);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_snapshot() {
        let clock = VirtualClock::new(MonotonicClock::new());
        let reader = clock.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..10_000 {
                let cal = reader.calibration();
                // Every published snapshot keeps remote_ref == 2 * local_ref
                assert_eq!(cal.remote_ref, cal.local_ref * 2);
            }
        });
        for i in 0..10_000u64 {
            clock.publish(Calibration {
                local_ref: i,
                remote_ref: i * 2,
                rate: 1.0,
            });
        }
        handle.join().unwrap();
    }
}

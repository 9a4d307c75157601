// Shared defaults and limits for clock synchronization and the thread pool

use std::time::Duration;

/// Size of the sample window used for regression.
pub const DEFAULT_WINDOW_SIZE: usize = 32;

/// Smallest and largest accepted sample window.
pub const MIN_WINDOW_SIZE: usize = 2;
pub const MAX_WINDOW_SIZE: usize = 1024;

/// Samples required before a regression is attempted while the window fills.
pub const DEFAULT_WINDOW_THRESHOLD: usize = 4;

/// Maximum polling interval once the estimate is trusted.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Remote port range accepted by the client.
pub const MIN_PORT: u16 = 1;
pub const MAX_PORT: u16 = 32767;

/// r² is clamped to this before computing the adaptive poll interval,
/// keeping `1 - r²` away from zero.
pub const R_SQUARED_CLAMP: f64 = 0.99999;

/// Base poll interval (seconds) scaled by `1 / (1 - r²)`.
pub const POLL_BASE_SECS: f64 = 1e-3;

/// Default number of pooled connection contexts.
pub const DEFAULT_MAX_THREADS: i32 = 1;

/// `max_threads` value meaning "no limit".
pub const UNLIMITED_THREADS: i32 = -1;

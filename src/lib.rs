pub mod constants;
pub mod error;
pub mod config;
pub mod clock;
pub mod estimator;
pub mod net;
pub mod client;
pub mod pool;

pub use client::{ClientState, ClockSyncClient, SyncStats};
pub use clock::{Calibration, MonotonicClock, TimeSource, VirtualClock};
pub use config::ClientSettings;
pub use error::SyncError;
pub use estimator::{Regression, RegressionEstimator};
pub use net::{TimePacket, TimeProvider};
pub use pool::{ExecutionContext, RequestContext, ThreadHooks, ThreadKind, ThreadPool};

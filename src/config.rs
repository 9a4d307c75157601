// Configuration for the clock client, the thread pool and the binary

use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAX_THREADS, DEFAULT_TIMEOUT, DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_THRESHOLD,
    MAX_PORT, MAX_WINDOW_SIZE, MIN_PORT, MIN_WINDOW_SIZE, UNLIMITED_THREADS,
};
use crate::error::SyncError;

/// Settings for a [`ClockSyncClient`](crate::client::ClockSyncClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Host name or IP address of the time provider
    pub address: String,
    pub port: u16,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_window_threshold")]
    pub window_threshold: usize,
    /// Longest interval between probes
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    /// Replies slower than this are discarded. `None` accepts everything.
    #[serde(default)]
    pub round_trip_limit: Option<Duration>,
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_window_threshold() -> usize {
    DEFAULT_WINDOW_THRESHOLD
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl ClientSettings {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        ClientSettings {
            address: address.into(),
            port,
            window_size: DEFAULT_WINDOW_SIZE,
            window_threshold: DEFAULT_WINDOW_THRESHOLD,
            timeout: DEFAULT_TIMEOUT,
            round_trip_limit: None,
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_window_threshold(mut self, window_threshold: usize) -> Self {
        self.window_threshold = window_threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_round_trip_limit(mut self, limit: Duration) -> Self {
        self.round_trip_limit = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.address.trim().is_empty() {
            return Err(SyncError::InvalidConfig("remote address is required".to_string()));
        }
        validate_port(self.port)?;
        validate_window_size(self.window_size)?;
        validate_window_threshold(self.window_threshold, self.window_size)?;
        validate_timeout(self.timeout)?;
        if let Some(limit) = self.round_trip_limit {
            if limit.is_zero() {
                return Err(SyncError::InvalidConfig("round trip limit must be positive".to_string()));
            }
        }
        Ok(())
    }
}

pub fn validate_port(port: u16) -> Result<(), SyncError> {
    if !(MIN_PORT..=MAX_PORT).contains(&port) {
        return Err(SyncError::InvalidConfig(format!(
            "port {} outside {}..={}",
            port, MIN_PORT, MAX_PORT
        )));
    }
    Ok(())
}

pub fn validate_window_size(window_size: usize) -> Result<(), SyncError> {
    if !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&window_size) {
        return Err(SyncError::InvalidConfig(format!(
            "window size {} outside {}..={}",
            window_size, MIN_WINDOW_SIZE, MAX_WINDOW_SIZE
        )));
    }
    Ok(())
}

pub fn validate_window_threshold(threshold: usize, window_size: usize) -> Result<(), SyncError> {
    if threshold < MIN_WINDOW_SIZE || threshold > window_size {
        return Err(SyncError::InvalidConfig(format!(
            "window threshold {} outside {}..={}",
            threshold, MIN_WINDOW_SIZE, window_size
        )));
    }
    Ok(())
}

pub fn validate_timeout(timeout: Duration) -> Result<(), SyncError> {
    if timeout.is_zero() {
        return Err(SyncError::InvalidConfig("timeout must be positive".to_string()));
    }
    Ok(())
}

pub fn validate_max_threads(max_threads: i32) -> Result<(), SyncError> {
    if max_threads < UNLIMITED_THREADS {
        return Err(SyncError::InvalidConfig(format!(
            "max threads {} below {}",
            max_threads, UNLIMITED_THREADS
        )));
    }
    Ok(())
}

/// Stream synchronization daemon configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Serve time packets on [host:]port.
    #[arg(long, value_name = "ADDR")]
    pub provide: Option<String>,

    /// Synchronize against the time provider at this host.
    #[arg(long, value_name = "HOST")]
    pub remote: Option<String>,

    /// Remote time provider port.
    #[arg(long, default_value_t = 5637)]
    pub port: u16,

    /// Number of samples in the regression window.
    #[arg(long, default_value_t = DEFAULT_WINDOW_SIZE)]
    pub window_size: usize,

    /// Samples needed before the first estimate.
    #[arg(long, default_value_t = DEFAULT_WINDOW_THRESHOLD)]
    pub window_threshold: usize,

    /// Maximum polling interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub timeout_ms: u64,

    /// Discard replies whose round trip exceeds this many milliseconds.
    #[arg(long)]
    pub round_trip_limit_ms: Option<u64>,

    /// Pooled connection contexts, 0 for none, -1 for unlimited.
    #[arg(long, default_value_t = DEFAULT_MAX_THREADS, allow_negative_numbers = true)]
    pub max_threads: i32,

    /// Statistics logging interval in seconds, 0 to disable
    #[arg(long, default_value_t = 10)]
    pub status_interval: u64,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    /// Client settings, or `None` when no remote was given.
    pub fn client_settings(&self) -> Result<Option<ClientSettings>, SyncError> {
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let mut settings = ClientSettings::new(remote.clone(), self.port)
            .with_window_size(self.window_size)
            .with_window_threshold(self.window_threshold)
            .with_timeout(Duration::from_millis(self.timeout_ms));
        if let Some(ms) = self.round_trip_limit_ms {
            settings = settings.with_round_trip_limit(Duration::from_millis(ms));
        }
        settings.validate()?;
        Ok(Some(settings))
    }

    /// Parse `--provide` as `[host:]port`; a bare port binds all interfaces.
    pub fn provider_addr(&self) -> Result<Option<std::net::SocketAddr>, SyncError> {
        let Some(provide) = &self.provide else {
            return Ok(None);
        };
        let full = if provide.chars().all(|c| c.is_ascii_digit()) {
            format!("0.0.0.0:{}", provide)
        } else {
            provide.clone()
        };
        full.parse()
            .map(Some)
            .map_err(|e| SyncError::InvalidConfig(format!("invalid provider address '{}': {}", provide, e)))
    }
}

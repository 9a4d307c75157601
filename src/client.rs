// Network clock synchronization client
// Probes a remote time provider and keeps the virtual clock calibrated against it.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::{MonotonicClock, VirtualClock};
use crate::config::ClientSettings;
use crate::error::SyncError;
use crate::estimator::RegressionEstimator;
use crate::net::packet::TimePacket;

/// Lifecycle of a [`ClockSyncClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Messages understood by the background loop.
#[derive(Debug)]
enum Control {
    Stop,
}

/// Snapshot of the client's counters and current estimate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub probes_sent: u64,
    pub replies: u64,
    pub samples: u64,
    pub bogus: u64,
    pub malformed: u64,
    pub rtt_rejected: u64,
    pub foreign: u64,
    pub last_rtt_ns: u64,
    pub poll_interval_us: u64,
    pub rate: f64,
    pub offset: f64,
    pub r_squared: f64,
    pub synced: bool,
}

/// State shared between the caller-facing client and its background loop.
#[derive(Debug, Default)]
struct Shared {
    probes_sent: AtomicU64,
    replies: AtomicU64,
    samples: AtomicU64,
    bogus: AtomicU64,
    malformed: AtomicU64,
    rtt_rejected: AtomicU64,
    foreign: AtomicU64,
    last_rtt_ns: AtomicU64,
    poll_interval_us: AtomicU64,
    r_squared_bits: AtomicU64,
    synced: Mutex<bool>,
    synced_cv: Condvar,
    has_synced: AtomicBool,
}

impl Shared {
    fn mark_synced(&self) {
        if self.has_synced.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut synced = self.synced.lock().unwrap_or_else(|e| e.into_inner());
        *synced = true;
        self.synced_cv.notify_all();
    }
}

/// Client side of the time-packet exchange.
///
/// `start` spawns one dedicated thread that owns the UDP socket and the
/// regression window; callers only ever read the derived [`VirtualClock`].
pub struct ClockSyncClient {
    settings: ClientSettings,
    clock: VirtualClock,
    shared: Arc<Shared>,
    state: ClientState,
    estimator: Option<RegressionEstimator>,
    control_tx: Option<mpsc::Sender<Control>>,
    worker: Option<JoinHandle<RegressionEstimator>>,
    local_addr: Option<SocketAddr>,
}

impl ClockSyncClient {
    pub fn new(settings: ClientSettings) -> Result<Self, SyncError> {
        settings.validate()?;
        let estimator = RegressionEstimator::with_threshold(settings.window_size, settings.window_threshold);
        Ok(ClockSyncClient {
            settings,
            clock: VirtualClock::new(MonotonicClock::new()),
            shared: Arc::new(Shared::default()),
            state: ClientState::Idle,
            estimator: Some(estimator),
            control_tx: None,
            worker: None,
            local_addr: None,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Handle to the synchronized clock, usable at any time.
    pub fn clock(&self) -> VirtualClock {
        self.clock.clone()
    }

    /// Estimated remote time right now.
    pub fn now(&self) -> u64 {
        self.clock.virtual_time(self.clock.local_now())
    }

    /// Local address of the probe socket while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// True once the sample window has filled for the first time.
    pub fn is_synced(&self) -> bool {
        self.shared.has_synced.load(Ordering::Acquire)
    }

    /// Block until synced or `timeout` elapses. Returns the synced state.
    pub fn wait_synced(&self, timeout: Duration) -> bool {
        let guard = self.shared.synced.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .shared
            .synced_cv
            .wait_timeout_while(guard, timeout, |synced| !*synced)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }

    pub fn stats(&self) -> SyncStats {
        let s = &self.shared;
        let cal = self.clock.calibration();
        SyncStats {
            probes_sent: s.probes_sent.load(Ordering::Relaxed),
            replies: s.replies.load(Ordering::Relaxed),
            samples: s.samples.load(Ordering::Relaxed),
            bogus: s.bogus.load(Ordering::Relaxed),
            malformed: s.malformed.load(Ordering::Relaxed),
            rtt_rejected: s.rtt_rejected.load(Ordering::Relaxed),
            foreign: s.foreign.load(Ordering::Relaxed),
            last_rtt_ns: s.last_rtt_ns.load(Ordering::Relaxed),
            poll_interval_us: s.poll_interval_us.load(Ordering::Relaxed),
            rate: cal.rate,
            offset: cal.offset(),
            r_squared: f64::from_bits(s.r_squared_bits.load(Ordering::Relaxed)),
            synced: self.is_synced(),
        }
    }

    /// Open the probe socket and spawn the synchronization loop.
    ///
    /// Blocks until the loop is running or setup failed. Allowed from
    /// `Idle` and `Stopped`; the sample window carries over a restart.
    pub fn start(&mut self) -> Result<(), SyncError> {
        if !matches!(self.state, ClientState::Idle | ClientState::Stopped) {
            return Err(SyncError::InvalidState(self.state));
        }

        let remote = resolve(&self.settings.address, self.settings.port)?;
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = std::net::UdpSocket::bind(bind_addr).map_err(SyncError::Socket)?;
        let local_addr = socket.local_addr().map_err(SyncError::Socket)?;
        socket.set_nonblocking(true).map_err(SyncError::Socket)?;

        let estimator = match self.estimator.take() {
            Some(estimator) => estimator,
            None => RegressionEstimator::with_threshold(self.settings.window_size, self.settings.window_threshold),
        };
        let (control_tx, control_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let worker = SyncWorker {
            remote,
            max_timeout: self.settings.timeout,
            round_trip_limit: self.settings.round_trip_limit,
            clock: self.clock.clone(),
            shared: Arc::clone(&self.shared),
            estimator,
        };

        // On spawn failure the closure, and the socket with it, is dropped
        let handle = thread::Builder::new()
            .name(format!("clocksync-{}", remote))
            .spawn(move || worker.run(socket, control_rx, ready_tx))
            .map_err(SyncError::Thread)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.estimator = handle.join().ok();
                return Err(e);
            }
            Err(_) => {
                self.estimator = handle.join().ok();
                return Err(SyncError::Thread(io::Error::new(
                    io::ErrorKind::Other,
                    "synchronization loop exited during startup",
                )));
            }
        }

        info!("Clock sync to {} started on {}", remote, local_addr);
        self.control_tx = Some(control_tx);
        self.worker = Some(handle);
        self.local_addr = Some(local_addr);
        self.state = ClientState::Running;
        Ok(())
    }

    /// Signal the loop to exit and wait for it, releasing the socket.
    ///
    /// A no-op unless running.
    pub fn stop(&mut self) {
        if self.state != ClientState::Running {
            return;
        }
        self.state = ClientState::Stopping;
        if let Some(tx) = self.control_tx.take() {
            // A full or closed channel means the loop is already leaving
            let _ = tx.try_send(Control::Stop);
        }
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(estimator) => self.estimator = Some(estimator),
                Err(_) => warn!("Clock sync loop panicked"),
            }
        }
        self.local_addr = None;
        self.state = ClientState::Stopped;
        info!("Clock sync to {}:{} stopped", self.settings.address, self.settings.port);
    }
}

impl Drop for ClockSyncClient {
    fn drop(&mut self) {
        // Don't join here; just make sure the loop winds down
        if let Some(tx) = self.control_tx.take() {
            let _ = tx.try_send(Control::Stop);
        }
    }
}

fn resolve(address: &str, port: u16) -> Result<SocketAddr, SyncError> {
    let addr_err = |source: io::Error| SyncError::Address {
        address: address.to_string(),
        port,
        source,
    };
    (address, port)
        .to_socket_addrs()
        .map_err(addr_err)?
        .next()
        .ok_or_else(|| addr_err(io::Error::new(io::ErrorKind::NotFound, "no addresses found")))
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

fn deadline_after(interval: Duration) -> Instant {
    let now = Instant::now();
    // Far enough out to never fire while still representable
    now.checked_add(interval)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}

/// Everything owned by the background thread.
struct SyncWorker {
    remote: SocketAddr,
    max_timeout: Duration,
    round_trip_limit: Option<Duration>,
    clock: VirtualClock,
    shared: Arc<Shared>,
    estimator: RegressionEstimator,
}

impl SyncWorker {
    fn run(
        mut self,
        socket: std::net::UdpSocket,
        control_rx: mpsc::Receiver<Control>,
        ready_tx: std_mpsc::Sender<Result<(), SyncError>>,
    ) -> RegressionEstimator {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                let _ = ready_tx.send(Err(SyncError::Thread(e)));
                return self.estimator;
            }
        };
        runtime.block_on(async {
            let socket = match UdpSocket::from_std(socket) {
                Ok(socket) => socket,
                Err(e) => {
                    let _ = ready_tx.send(Err(SyncError::Socket(e)));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            self.run_loop(&socket, control_rx).await;
        });
        self.estimator
    }

    async fn run_loop(&mut self, socket: &UdpSocket, mut control_rx: mpsc::Receiver<Control>) {
        let mut buf = [0u8; 1500];
        // Probe right away. Only sent probes and accepted replies move the deadline.
        let mut deadline = Instant::now();
        loop {
            tokio::select! {
                biased;
                cmd = control_rx.recv() => {
                    debug!("Clock sync loop for {} leaving on {:?}", self.remote, cmd);
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.send_probe(socket).await;
                    deadline = deadline_after(self.max_timeout);
                }
                res = socket.recv_from(&mut buf) => {
                    match res {
                        Ok((size, peer)) => {
                            if let Some(next) = self.handle_reply(&buf[..size], peer) {
                                deadline = deadline_after(next);
                            }
                        }
                        Err(e) => warn!("Clock sync receive error: {}", e),
                    }
                }
            }
        }
    }

    async fn send_probe(&self, socket: &UdpSocket) {
        let packet = TimePacket::new(self.clock.local_now());
        match socket.send_to(&packet.encode(), self.remote).await {
            Ok(_) => {
                self.shared.probes_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("Failed to send probe to {}: {}", self.remote, e),
        }
    }

    /// Feed one reply into the estimator. Returns the next poll interval if
    /// the sample was accepted.
    fn handle_reply(&mut self, data: &[u8], peer: SocketAddr) -> Option<Duration> {
        let received = self.clock.local_now();
        if peer != self.remote {
            self.shared.foreign.fetch_add(1, Ordering::Relaxed);
            debug!("Ignoring datagram from {}, expected {}", peer, self.remote);
            return None;
        }
        self.shared.replies.fetch_add(1, Ordering::Relaxed);

        let packet = match TimePacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.shared.malformed.fetch_add(1, Ordering::Relaxed);
                debug!("Ignoring datagram from {}: {} ({})", peer, e, hex::encode(data));
                return None;
            }
        };

        let rtt = received.saturating_sub(packet.local_time);
        if let Some(limit) = self.round_trip_limit {
            if rtt > saturating_nanos(limit) {
                self.shared.rtt_rejected.fetch_add(1, Ordering::Relaxed);
                debug!("Discarding reply from {}: round trip {}ns over limit", peer, rtt);
                return None;
            }
        }

        match self.estimator.observe(packet.local_time, packet.remote_time, received) {
            Ok(regression) => {
                self.shared.samples.fetch_add(1, Ordering::Relaxed);
                self.shared.last_rtt_ns.store(rtt, Ordering::Relaxed);
                if let Some(regression) = regression {
                    self.clock.publish(regression.calibration);
                    self.shared
                        .r_squared_bits
                        .store(regression.r_squared.to_bits(), Ordering::Relaxed);
                    debug!(
                        "rate={:.9} offset={:.0} r²={:.6}",
                        regression.rate, regression.offset, regression.r_squared
                    );
                }
                if !self.estimator.is_filling() {
                    self.shared.mark_synced();
                }
                let next = self.estimator.poll_interval(self.max_timeout);
                self.shared
                    .poll_interval_us
                    .store(u64::try_from(next.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);
                Some(next)
            }
            Err(e) => {
                self.shared.bogus.fetch_add(1, Ordering::Relaxed);
                warn!("Discarding reply from {}: {}", peer, e);
                None
            }
        }
    }
}

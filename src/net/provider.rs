// UDP time provider
// Answers time packets by stamping the remote time and echoing them back to the sender.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::packet::TimePacket;
use crate::clock::TimeSource;
use crate::pool::ExecutionContext;

/// Serves a clock to [`ClockSyncClient`](crate::client::ClockSyncClient)s.
pub struct TimeProvider {
    addr: SocketAddr,
    answered: Arc<AtomicU64>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl TimeProvider {
    /// Bind to `addr` and start answering probes from the current tokio runtime.
    pub async fn start(addr: SocketAddr, source: Arc<dyn TimeSource>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let answered = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&answered);
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                tokio::select! {
                    res = socket.recv_from(&mut buf) => {
                        match res {
                            Ok((size, peer)) => {
                                Self::answer(&socket, &buf[..size], peer, source.as_ref(), &counter).await;
                            }
                            Err(e) => {
                                error!("Time provider receive error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Time provider on {} shutting down", local_addr);
                        break;
                    }
                }
            }
        });

        info!("Time provider listening on {}", local_addr);
        Ok(TimeProvider {
            addr: local_addr,
            answered,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Start a provider on `ctx`'s event loop and wait until it is bound.
    ///
    /// Bind errors are returned here rather than lost inside the context.
    /// The provider serves until the returned task is aborted or the
    /// context's loop stops.
    pub async fn spawn_on(
        ctx: &ExecutionContext,
        addr: SocketAddr,
        source: Arc<dyn TimeSource>,
    ) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = ctx.spawn(async move {
            let provider = match TimeProvider::start(addr, source).await {
                Ok(provider) => provider,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if ready_tx.send(Ok(provider.addr())).is_err() {
                return;
            }
            std::future::pending::<()>().await;
            drop(provider);
        });

        match ready_rx.await {
            Ok(Ok(bound)) => Ok((bound, task)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::Other,
                "time provider task ended before binding",
            )),
        }
    }

    /// Address the provider is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of probes answered so far.
    pub fn answered(&self) -> u64 {
        self.answered.load(Ordering::Relaxed)
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    async fn answer(
        socket: &UdpSocket,
        data: &[u8],
        peer: SocketAddr,
        source: &dyn TimeSource,
        answered: &AtomicU64,
    ) {
        let mut packet = match TimePacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping datagram from {}: {} ({})", peer, e, hex::encode(data));
                return;
            }
        };
        packet.remote_time = source.now();
        answered.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = socket.send_to(&packet.encode(), peer).await {
            debug!("Failed to answer {}: {}", peer, e);
        }
    }
}

impl Drop for TimeProvider {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

// Error taxonomy shared by the clock client, time provider and thread pool

use std::io;
use thiserror::Error;

use crate::client::ClientState;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Socket creation, bind or local-address lookup failed.
    #[error("socket error: {0}")]
    Socket(#[source] io::Error),

    /// A background loop or worker thread could not be spawned.
    #[error("failed to spawn background loop: {0}")]
    Thread(#[source] io::Error),

    #[error("cannot resolve {address}:{port}: {source}")]
    Address {
        address: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Fewer bytes than a full time packet were available.
    #[error("malformed time packet: {len} bytes, expected {expected}")]
    MalformedPacket { len: usize, expected: usize },

    /// The reply arrived "before" its probe was sent.
    #[error("bogus observation: receive time {received} < send time {sent}")]
    BogusObservation { sent: u64, received: u64 },

    #[error("execution context {id} is shutting down")]
    ReuseRejected { id: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation not allowed while client is {0:?}")]
    InvalidState(ClientState),
}

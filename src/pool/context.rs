// Execution contexts: an event loop plus a reuse count
// The loop is stopped from inside itself once the last handle is released.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SyncError;

/// What an execution context is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ThreadKind {
    /// Client connection handling; pooled and shared
    Connection,
    /// Media session handling; always dedicated
    Media,
}

impl fmt::Display for ThreadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadKind::Connection => write!(f, "connection"),
            ThreadKind::Media => write!(f, "media"),
        }
    }
}

/// State shared by every handle to one context, and by the pool's queue.
pub(crate) struct ContextShared {
    id: u64,
    kind: ThreadKind,
    reuse_count: AtomicUsize,
    handle: Handle,
    /// Taken exactly once, by whichever release drops the count to zero
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ContextShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Take another counted handle, unless the context is already shutting down.
    pub(crate) fn try_reuse(self: &Arc<Self>) -> Result<ExecutionContext, SyncError> {
        self.reuse_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count > 0 {
                    Some(count + 1)
                } else {
                    None
                }
            })
            .map(|_| ExecutionContext {
                shared: Arc::clone(self),
            })
            .map_err(|_| SyncError::ReuseRejected { id: self.id })
    }

    fn release(&self) {
        let previous = self.reuse_count.fetch_sub(1, Ordering::AcqRel);
        if previous != 1 {
            return;
        }
        let stop_tx = self
            .stop_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = stop_tx {
            debug!("Stopping {} context {}", self.kind, self.id);
            // Run the stop on the context's own loop, after any work queued before it
            self.handle.spawn(async move {
                let _ = tx.send(());
            });
        }
    }
}

impl fmt::Debug for ContextShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextShared")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("reuse_count", &self.reuse_count.load(Ordering::Relaxed))
            .finish()
    }
}

/// A counted handle to an event loop.
///
/// Every handle, whether freshly created, cloned or obtained through reuse,
/// holds one count. Dropping (or [`release`](Self::release)-ing) the last one
/// stops the loop.
#[derive(Debug)]
pub struct ExecutionContext {
    shared: Arc<ContextShared>,
}

/// Owns the event loop until some thread runs it.
pub struct LoopRunner {
    runtime: Runtime,
    stop_rx: oneshot::Receiver<()>,
    id: u64,
    kind: ThreadKind,
}

impl ExecutionContext {
    /// Allocate a fresh event loop with a reuse count of one.
    ///
    /// The loop does not turn until the returned [`LoopRunner`] is run.
    pub fn new(id: u64, kind: ThreadKind) -> Result<(ExecutionContext, LoopRunner), SyncError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SyncError::Thread)?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let shared = Arc::new(ContextShared {
            id,
            kind,
            reuse_count: AtomicUsize::new(1),
            handle: runtime.handle().clone(),
            stop_tx: Mutex::new(Some(stop_tx)),
        });
        let runner = LoopRunner {
            runtime,
            stop_rx,
            id,
            kind,
        };
        Ok((ExecutionContext { shared }, runner))
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> ThreadKind {
        self.shared.kind
    }

    pub fn reuse_count(&self) -> usize {
        self.shared.reuse_count.load(Ordering::Acquire)
    }

    /// Handle to the context's runtime, for spawning or entering it.
    pub fn handle(&self) -> &Handle {
        &self.shared.handle
    }

    /// Run `future` on this context's event loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.shared.handle.spawn(future)
    }

    /// Take a second handle to the same loop.
    ///
    /// Always succeeds while `self` is alive, since `self` keeps the count above zero.
    pub fn reuse(&self) -> Result<ExecutionContext, SyncError> {
        self.shared.try_reuse()
    }

    /// Give this handle back. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }

    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    pub fn same_loop(&self, other: &ExecutionContext) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Clone for ExecutionContext {
    fn clone(&self) -> Self {
        self.shared.reuse_count.fetch_add(1, Ordering::AcqRel);
        ExecutionContext {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl LoopRunner {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    /// Drive the event loop on the calling thread until the context is
    /// fully released. Tasks still pending at that point are dropped.
    pub fn run(self) {
        let LoopRunner { runtime, stop_rx, id, kind } = self;
        debug!("Entering {} context {}", kind, id);
        runtime.block_on(async {
            let _ = stop_rx.await;
        });
        debug!("Leaving {} context {}", kind, id);
    }
}

impl fmt::Debug for LoopRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopRunner")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

// Thread pool handing out execution contexts
// Connection contexts are shared round-robin up to max_threads; media contexts are never shared.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use super::context::{ContextShared, ExecutionContext, LoopRunner, ThreadKind};
use crate::config::validate_max_threads;
use crate::constants::{DEFAULT_MAX_THREADS, UNLIMITED_THREADS};
use crate::error::SyncError;

/// Who is asking for a context. Only used for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub peer: Option<SocketAddr>,
    pub session: Option<String>,
}

/// Callbacks run on a worker thread around each context's event loop.
pub trait ThreadHooks: Send + Sync {
    /// Called on the worker thread before the loop starts turning.
    fn enter(&self, _id: u64, _kind: ThreadKind) {}
    /// Called on the worker thread after the loop has stopped.
    fn leave(&self, _id: u64, _kind: ThreadKind) {}
}

#[derive(Default)]
struct ActiveQueue {
    contexts: VecDeque<Arc<ContextShared>>,
    /// Slots claimed by creations still in progress outside the lock
    pending: usize,
}

struct PoolInner {
    max_threads: AtomicI32,
    next_id: AtomicU64,
    queue: Mutex<ActiveQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    hooks: RwLock<Option<Arc<dyn ThreadHooks>>>,
}

impl PoolInner {
    fn hooks(&self) -> Option<Arc<dyn ThreadHooks>> {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Supplies execution contexts to connection and media handling code.
///
/// Cheap to clone; clones share the same queue and workers. Construct once at
/// startup and call [`cleanup`](Self::cleanup) at shutdown.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub fn new() -> Self {
        ThreadPool {
            inner: Arc::new(PoolInner {
                max_threads: AtomicI32::new(DEFAULT_MAX_THREADS),
                next_id: AtomicU64::new(1),
                queue: Mutex::new(ActiveQueue::default()),
                workers: Mutex::new(Vec::new()),
                hooks: RwLock::new(None),
            }),
        }
    }

    pub fn with_max_threads(max_threads: i32) -> Result<Self, SyncError> {
        let pool = Self::new();
        pool.set_max_threads(max_threads)?;
        Ok(pool)
    }

    /// Change the cap for future requests. An oversized queue is not shrunk.
    pub fn set_max_threads(&self, max_threads: i32) -> Result<(), SyncError> {
        validate_max_threads(max_threads)?;
        self.inner.max_threads.store(max_threads, Ordering::Release);
        Ok(())
    }

    pub fn max_threads(&self) -> i32 {
        self.inner.max_threads.load(Ordering::Acquire)
    }

    pub fn set_hooks(&self, hooks: Arc<dyn ThreadHooks>) {
        *self.inner.hooks.write().unwrap_or_else(|e| e.into_inner()) = Some(hooks);
    }

    /// Number of connection contexts currently issued.
    pub fn queue_len(&self) -> usize {
        self.lock_queue().contexts.len()
    }

    /// Get a context for `kind`.
    ///
    /// `Ok(None)` means no dedicated connection context is granted
    /// (`max_threads == 0`) and the caller must schedule the work itself.
    /// Every returned handle must be released exactly once.
    pub fn get_thread(&self, kind: ThreadKind, ctx: &RequestContext) -> Result<Option<ExecutionContext>, SyncError> {
        match kind {
            ThreadKind::Media => self.create(kind, ctx, false).map(Some),
            ThreadKind::Connection => self.get_connection_thread(ctx),
        }
    }

    fn get_connection_thread(&self, ctx: &RequestContext) -> Result<Option<ExecutionContext>, SyncError> {
        let max_threads = self.max_threads();
        if max_threads == 0 {
            return Ok(None);
        }

        let limit = if max_threads == UNLIMITED_THREADS {
            usize::MAX
        } else {
            max_threads as usize
        };
        let queued = {
            let mut queue = self.lock_queue();
            loop {
                if queue.contexts.len() + queue.pending < limit {
                    queue.pending += 1;
                    break true;
                }
                // At capacity: round-robin over the issued contexts
                let Some(shared) = queue.contexts.pop_front() else {
                    break false;
                };
                match shared.try_reuse() {
                    Ok(handle) => {
                        queue.contexts.push_back(shared);
                        debug!(
                            "Reusing connection context {} (count {}) for {:?}",
                            handle.id(),
                            handle.reuse_count(),
                            ctx
                        );
                        return Ok(Some(handle));
                    }
                    Err(e) => debug!("{}, dropping it from the queue", e),
                }
            }
        };

        let created = self.create(ThreadKind::Connection, ctx, queued);
        if queued {
            let mut queue = self.lock_queue();
            queue.pending -= 1;
            if let Ok(handle) = &created {
                queue.contexts.push_back(Arc::clone(handle.shared()));
            }
        }
        created.map(Some)
    }

    /// Build a fresh context and hand its loop to a new worker thread.
    fn create(&self, kind: ThreadKind, ctx: &RequestContext, queued: bool) -> Result<ExecutionContext, SyncError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (handle, runner) = ExecutionContext::new(id, kind)?;
        self.submit(runner, queued)?;
        debug!("Created {} context {} for {:?}", kind, id, ctx);
        Ok(handle)
    }

    fn submit(&self, runner: LoopRunner, queued: bool) -> Result<(), SyncError> {
        let pool = Arc::downgrade(&self.inner);
        let name = format!("pool-{}-{}", runner.kind(), runner.id());
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || run_worker(pool, runner, queued))
            .map_err(SyncError::Thread)?;
        let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
        // Finished workers need no joining
        workers.retain(|w| !w.is_finished());
        workers.push(worker);
        Ok(())
    }

    /// Wait until every context handed out so far has torn down.
    ///
    /// Only returns once all handles have been released. Must not be called
    /// from inside one of the pool's own contexts.
    pub fn cleanup(&self) {
        loop {
            let workers: Vec<JoinHandle<()>> = {
                let mut guard = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
                guard.drain(..).collect()
            };
            if workers.is_empty() {
                break;
            }
            for worker in workers {
                if worker.join().is_err() {
                    warn!("Pool worker panicked");
                }
            }
        }
        info!("Thread pool cleaned up");
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, ActiveQueue> {
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

fn run_worker(pool: Weak<PoolInner>, runner: LoopRunner, queued: bool) {
    let (id, kind) = (runner.id(), runner.kind());
    let hooks = pool.upgrade().and_then(|p| p.hooks());

    if let Some(hooks) = &hooks {
        hooks.enter(id, kind);
    }
    runner.run();
    if let Some(hooks) = &hooks {
        hooks.leave(id, kind);
    }

    if queued {
        if let Some(pool) = pool.upgrade() {
            let mut queue = pool.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.contexts.retain(|shared| shared.id() != id);
        }
    }
}

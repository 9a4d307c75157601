// Execution context pool
// Hands out event loops for connection and media handling.

pub mod context;
pub mod threadpool;

pub use context::{ExecutionContext, LoopRunner, ThreadKind};
pub use threadpool::{RequestContext, ThreadHooks, ThreadPool};

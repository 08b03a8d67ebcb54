//! Worker pools for inbound calls.
//!
//! Inbound CALLs never run on the task that reads the transport. The
//! embedder supplies the pool they run on.

use std::sync::Arc;

use tokio::runtime::Handle;

use super::error::RpcError;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait WorkerPool: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs jobs on the tokio blocking thread pool, so handlers may block
/// (including on nested `invoke_blocking` calls).
#[derive(Clone)]
pub struct BlockingPool {
    runtime: Handle,
}

impl BlockingPool {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// A pool on the current tokio runtime.
    pub fn current() -> Result<Self, RpcError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| RpcError::NoRuntime)
    }
}

impl WorkerPool for BlockingPool {
    fn execute(&self, job: Job) {
        self.runtime.spawn_blocking(job);
    }
}

impl<P: WorkerPool + ?Sized> WorkerPool for Arc<P> {
    fn execute(&self, job: Job) {
        (**self).execute(job);
    }
}

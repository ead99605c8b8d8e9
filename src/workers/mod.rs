//! Bounded worker pool for CPU-bound body transforms.
//!
//! # Responsibilities
//! - Run blocking work off the async executor
//! - Refuse work beyond a fixed capacity instead of queueing it
//!
//! # Design Decisions
//! - Admission is decided synchronously at `submit`; a full pool fails fast
//!   with `EngineError::Overloaded`
//! - Each job holds its semaphore permit until it finishes, so capacity
//!   counts running jobs, not submitted ones

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;

use crate::error::{EngineError, Result};
use crate::observability::metrics;

/// A unit of blocking work producing a transformed body.
pub type Job = Box<dyn FnOnce() -> Result<Bytes> + Send + 'static>;

/// Interface the pipeline uses to offload work.
pub trait WorkerPool: Send + Sync + std::fmt::Debug {
    /// Submit a job. Fails immediately with `Overloaded` when at capacity.
    fn submit(&self, job: Job) -> BoxFuture<'static, Result<Bytes>>;

    /// Maximum number of concurrently running jobs.
    fn capacity(&self) -> usize;
}

/// `Semaphore`-bounded pool running jobs on tokio's blocking threads.
#[derive(Debug, Clone)]
pub struct BoundedPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BoundedPool {
    /// Create a new pool admitting at most `capacity` jobs at once.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Jobs currently running.
    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}

impl WorkerPool for BoundedPool {
    fn submit(&self, job: Job) -> BoxFuture<'static, Result<Bytes>> {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                metrics::record_overload();
                tracing::debug!(capacity = self.capacity, "Worker pool at capacity");
                let capacity = self.capacity;
                return Box::pin(async move { Err(EngineError::Overloaded { capacity }) });
            }
        };

        Box::pin(async move {
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job()
            });
            handle.await.map_err(EngineError::handler)?
        })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

//! Bounded worker pools
//!
//! Each pool is a named semaphore in front of `tokio::spawn`. Separate pools
//! keep slow network work (provider streams, vector search) from starving
//! classification and context building.

use crate::config::ExecutorConfig;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

/// Returned by [`WorkerPool::try_spawn`] when every permit is taken
#[derive(Debug, Error)]
#[error("worker pool {pool} is saturated ({size} workers busy)")]
pub struct PoolSaturated {
    pub pool: String,
    pub size: usize,
}

/// A named, bounded task pool
#[derive(Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool allowing `size` tasks to run at once
    pub fn new(name: &str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name: Arc::from(name),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawn a task that waits for a free worker before running
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // The semaphore is never closed, so acquisition only waits
            let _permit = permits.acquire_owned().await.ok();
            fut.await
        })
    }

    /// Spawn only if a worker is free right now
    pub fn try_spawn<F>(&self, fut: F) -> Result<JoinHandle<F::Output>, PoolSaturated>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| PoolSaturated {
                pool: self.name.to_string(),
                size: self.size,
            })?;

        Ok(tokio::spawn(async move {
            let _permit = permit;
            fut.await
        }))
    }

    /// Fan out every future onto the pool and wait for all of them.
    ///
    /// Results come back in submission order.
    pub async fn join_all<I, F>(&self, futures: I) -> Vec<Result<F::Output, JoinError>>
    where
        I: IntoIterator<Item = F>,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handles: Vec<_> = futures.into_iter().map(|fut| self.spawn(fut)).collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await);
        }
        results
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

/// The four pools used by the answering pipeline
#[derive(Clone, Debug)]
pub struct Executors {
    /// Per-sub-question intent classification
    pub classify: WorkerPool,
    /// Per-sub-question context building (KB + MCP orchestration)
    pub context: WorkerPool,
    /// Per-intent KB search + rerank
    pub kb: WorkerPool,
    /// Provider streaming I/O
    pub stream: WorkerPool,
}

impl Executors {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            classify: WorkerPool::new("intent-classify", config.classify_workers),
            context: WorkerPool::new("context-build", config.context_workers),
            kb: WorkerPool::new("kb-retrieve", config.kb_workers),
            stream: WorkerPool::new("model-stream", config.stream_workers),
        }
    }
}

impl Default for Executors {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

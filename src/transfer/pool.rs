//! Bounded worker pools
//!
//! Bucket units run on a [`TransferPool`] sized by the caller; each unit
//! runs its shards on its own pool of `threads` workers, so at most
//! `threads × bucket_concurrency` shards are in flight. Every task runs to
//! completion; failures are collected, never short-circuited.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{BackupError, BackupResult};

/// Build a pool of `threads` workers
pub(crate) fn build_pool(threads: usize, prefix: &'static str) -> BackupResult<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(move |i| format!("{}-{}", prefix, i))
        .build()
        .map_err(|e| BackupError::Config(format!("Failed to start worker pool: {}", e)))
}

/// Run `task` over `items` on `pool`, returning one result per item in order
pub(crate) fn run_all<T, R, F>(pool: &ThreadPool, items: &[T], task: F) -> Vec<BackupResult<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> BackupResult<R> + Sync + Send,
{
    pool.install(|| items.par_iter().map(|item| task(item)).collect())
}

/// Pool that runs bucket-level transfer units
pub struct TransferPool {
    pool: ThreadPool,
    size: usize,
}

impl TransferPool {
    /// Pool running at most `bucket_concurrency` units at once
    pub fn new(bucket_concurrency: usize) -> BackupResult<Self> {
        Ok(Self {
            pool: build_pool(bucket_concurrency, "docvault-bucket")?,
            size: bucket_concurrency.max(1),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Execute every item, collecting all results
    pub fn run<T, R, F>(&self, items: &[T], task: F) -> Vec<BackupResult<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> BackupResult<R> + Sync + Send,
    {
        run_all(&self.pool, items, task)
    }
}

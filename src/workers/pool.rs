use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_WORKERS: usize = 4;

/// Fixed-size rayon pool for one pipeline stage.
pub struct WorkerPool {
    pool: ThreadPool,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, ThreadPoolBuildError> {
        let size = size.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|index| format!("lookalike-worker-{}", index))
            .build()?;
        Ok(Self { pool, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on every item, at most `size` at a time. Items not yet
    /// started when `token` fires are skipped.
    ///
    /// Returns how many items ran.
    pub fn run<T, F>(&self, items: Vec<T>, token: &CancellationToken, job: F) -> usize
    where
        T: Send,
        F: Fn(T) + Send + Sync,
    {
        self.pool.install(|| {
            items
                .into_par_iter()
                .map(|item| {
                    if token.is_cancelled() {
                        return 0;
                    }
                    job(item);
                    1
                })
                .sum()
        })
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("size", &self.size).finish()
    }
}

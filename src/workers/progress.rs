use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Point-in-time view of a running job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: usize,
    pub processed: usize,
    pub current_item: String,
}

impl JobProgress {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.processed as f64 / self.total as f64 * 100.0
    }
}

/// Shared, clonable handle that a job writes and pollers read.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<Mutex<JobProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new phase of `total` items.
    pub fn reset(&self, total: usize, label: &str) {
        let mut progress = self.lock();
        progress.total = total;
        progress.processed = 0;
        progress.current_item = label.to_string();
    }

    pub fn advance(&self, item: &str) {
        let mut progress = self.lock();
        progress.processed += 1;
        progress.current_item = item.to_string();
    }

    pub fn snapshot(&self) -> JobProgress {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobProgress> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub mod comparison;
pub mod export;
pub mod indexer;
pub mod runner;
pub mod scanner;

use crate::database::DatabaseError;
use scanner::ScanError;
use thiserror::Error;

pub use comparison::{CompareSummary, ComparisonService};
pub use export::{ExportOptions, ExportService, ExportSummary};
pub use indexer::{IndexSummary, Indexer, IndexingService};
pub use runner::{GroupMatches, ProjectRunner, ProjectStats, SourceMatches};
pub use scanner::Scanner;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("No source images indexed for project {project_id}")]
    NoSourceRecords { project_id: String },

    #[error("No target images indexed for project {project_id}")]
    NoTargetRecords { project_id: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Failed to start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

/// Results waiting to be written, flushed whenever their weight reaches
/// the batch size. A failed write is logged and the batch dropped.
pub(crate) struct Batch<T> {
    items: Vec<T>,
    weight: usize,
    capacity: usize,
    pub written: usize,
    pub lost: usize,
}

impl<T> Batch<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            weight: 0,
            capacity: capacity.max(1),
            written: 0,
            lost: 0,
        }
    }

    pub fn push<F>(&mut self, item: T, weight: usize, write: F)
    where
        F: FnOnce(&[T]) -> Result<usize, DatabaseError>,
    {
        self.items.push(item);
        self.weight += weight.max(1);
        if self.weight >= self.capacity {
            self.flush(write);
        }
    }

    pub fn flush<F>(&mut self, write: F)
    where
        F: FnOnce(&[T]) -> Result<usize, DatabaseError>,
    {
        if self.items.is_empty() {
            return;
        }

        match write(&self.items) {
            Ok(written) => {
                log::debug!("Flushed batch of {} items", self.items.len());
                self.written += written;
            }
            Err(e) => {
                log::error!("Failed to write batch of {} items: {}", self.items.len(), e);
                self.lost += self.items.len();
            }
        }
        self.items.clear();
        self.weight = 0;
    }
}

use super::scanner::{DiscoveredFile, ScanError, Scanner};
use super::{Batch, PipelineError};
use crate::config::MatchConfig;
use crate::core::fingerprint::{DecodeError, FeatureExtractor};
use crate::database::models::{NewImageRecord, ProjectStatus};
use crate::database::{DatabaseError, Store};
use crate::workers::{ProgressTracker, WorkerPool};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Turns files under a root into fingerprinted records.
#[derive(Debug, Clone)]
pub struct Indexer {
    scanner: Scanner,
    extractor: FeatureExtractor,
}

impl Indexer {
    pub fn new(scanner: Scanner, extractor: FeatureExtractor) -> Self {
        Self { scanner, extractor }
    }

    pub fn from_config(config: &MatchConfig) -> Self {
        Self::new(
            Scanner::new(&config.supported_formats),
            FeatureExtractor::new().with_histogram(config.compute_histogram),
        )
    }

    /// Files under `root` whose relative path is not in `known`.
    pub fn pending(
        &self,
        root: &Path,
        known: &HashSet<String>,
    ) -> Result<Vec<DiscoveredFile>, ScanError> {
        Ok(self
            .scanner
            .discover(root)?
            .into_iter()
            .filter(|file| !known.contains(&file.relative_path))
            .collect())
    }

    pub fn index_file(&self, file: &DiscoveredFile) -> Result<NewImageRecord, DecodeError> {
        let fingerprint = self.extractor.extract(&file.absolute_path)?;
        Ok(NewImageRecord {
            relative_path: file.relative_path.clone(),
            absolute_path: file.absolute_path.to_string_lossy().to_string(),
            width: fingerprint.width,
            height: fingerprint.height,
            size_bytes: file.size_bytes,
            fingerprint,
        })
    }

    /// Lazy run over the new files under `root`. Fingerprints are computed as
    /// the run is consumed; files that fail to decode are logged and skipped.
    /// Planning again with the grown `known` set resumes where a run stopped.
    pub fn plan(&self, root: &Path, known: &HashSet<String>) -> Result<IndexRun, ScanError> {
        let files = self.pending(root, known)?;
        Ok(IndexRun {
            indexer: self.clone(),
            total: files.len(),
            files: files.into_iter(),
        })
    }
}

pub struct IndexRun {
    indexer: Indexer,
    total: usize,
    files: std::vec::IntoIter<DiscoveredFile>,
}

impl IndexRun {
    /// Files the run started with, including ones that may fail to decode.
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for IndexRun {
    type Item = NewImageRecord;

    fn next(&mut self) -> Option<Self::Item> {
        for file in self.files.by_ref() {
            match self.indexer.index_file(&file) {
                Ok(record) => return Some(record),
                Err(e) => log::warn!("Skipping {}: {}", file.relative_path, e),
            }
        }
        None
    }
}

/// Counts for one indexed root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RootSummary {
    pub name: String,
    pub discovered: usize,
    pub new_records: usize,
    pub total_records: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub source: RootSummary,
    pub targets: Vec<RootSummary>,
}

impl IndexSummary {
    pub fn new_records(&self) -> usize {
        self.source.new_records + self.targets.iter().map(|t| t.new_records).sum::<usize>()
    }

    pub fn target_records(&self) -> usize {
        self.targets.iter().map(|t| t.total_records).sum()
    }
}

/// Indexes a project's source root and every target root into the store.
pub struct IndexingService {
    store: Arc<dyn Store>,
    config: MatchConfig,
    indexer: Indexer,
}

impl IndexingService {
    pub fn new(store: Arc<dyn Store>, config: MatchConfig) -> Self {
        let indexer = Indexer::from_config(&config);
        Self {
            store,
            config,
            indexer,
        }
    }

    pub fn index_project(
        &self,
        project_id: &str,
        token: &CancellationToken,
        progress: &ProgressTracker,
    ) -> Result<IndexSummary, PipelineError> {
        let project = self.store.get_project(project_id)?;
        let groups = self.store.target_groups(project_id)?;

        // every root must exist before anything is written
        Scanner::validate_root(Path::new(&project.source_path))?;
        for group in &groups {
            Scanner::validate_root(Path::new(&group.path))?;
        }

        log::info!("Indexing project {} ({})", project.name, project.id);
        self.store
            .update_project_status(project_id, ProjectStatus::Indexing, None)?;

        let pool = WorkerPool::new(self.config.workers)?;
        let mut summary = IndexSummary::default();

        let known = self.store.known_source_paths(project_id)?;
        let files = self.indexer.pending(Path::new(&project.source_path), &known)?;
        summary.source = self.index_root(
            &pool,
            "source",
            known.len(),
            files,
            token,
            progress,
            |records| self.store.insert_source_records(project_id, records),
        );
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        for group in &groups {
            let known = self.store.known_target_paths(&group.id)?;
            let files = self.indexer.pending(Path::new(&group.path), &known)?;
            let root = self.index_root(
                &pool,
                &group.name,
                known.len(),
                files,
                token,
                progress,
                |records| self.store.insert_target_records(&group.id, records),
            );
            summary.targets.push(root);
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
        }

        self.store
            .update_project_status(project_id, ProjectStatus::Indexed, None)?;
        log::info!(
            "Indexed project {}: {} new records, {} source, {} target",
            project.name,
            summary.new_records(),
            summary.source.total_records,
            summary.target_records()
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn index_root<W>(
        &self,
        pool: &WorkerPool,
        name: &str,
        already_known: usize,
        files: Vec<DiscoveredFile>,
        token: &CancellationToken,
        progress: &ProgressTracker,
        write: W,
    ) -> RootSummary
    where
        W: Fn(&[NewImageRecord]) -> Result<usize, DatabaseError> + Sync,
    {
        let discovered = files.len();
        log::info!("Indexing {}: {} new files", name, discovered);
        progress.reset(discovered, &format!("Indexing {}", name));

        let batch = Mutex::new(Batch::new(self.config.batch_size));
        pool.run(files, token, |file| {
            let record = self.indexer.index_file(&file);
            progress.advance(&file.relative_path);

            match record {
                Ok(record) => batch
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(record, 1, &write),
                Err(e) => log::warn!("Skipping {}: {}", file.relative_path, e),
            }
        });

        let mut batch = batch.into_inner().unwrap_or_else(PoisonError::into_inner);
        batch.flush(&write);
        if batch.lost > 0 {
            log::warn!("{}: {} records were not saved", name, batch.lost);
        }

        RootSummary {
            name: name.to_string(),
            discovered,
            new_records: batch.written,
            total_records: already_known + batch.written,
        }
    }
}

use super::comparison::ComparisonService;
use super::export::{ExportOptions, ExportService};
use super::indexer::IndexingService;
use super::PipelineError;
use crate::config::MatchConfig;
use crate::database::models::{
    CandidateMatch, ImageRecord, NewTargetGroup, Project, ProjectStatus, RecordStatus, Selection,
    SelectionChoice, SelectionOrigin, TargetGroup,
};
use crate::database::Store;
use crate::workers::{JobProgress, ProgressTracker, TaskKind, TaskManager};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct GroupMatches {
    pub group: TargetGroup,
    pub candidates: Vec<CandidateMatch>,
    pub selection: Option<Selection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceMatches {
    pub source: ImageRecord,
    pub confirmed: bool,
    pub groups: Vec<GroupMatches>,
}

/// How far comparison has got through a project's sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProjectStats {
    pub total_files: usize,
    /// Sources that have been compared at least once.
    pub processed: usize,
    pub progress: f64,
}

/// Progress handle and start generation of the latest job per key.
#[derive(Default)]
struct JobSlot {
    generation: u64,
    progress: ProgressTracker,
}

type Slots = Arc<Mutex<HashMap<(String, TaskKind), JobSlot>>>;

/// Starts, cancels and observes a project's background jobs and applies
/// their outcome to the project status.
///
/// The `start_*` methods spawn onto the current Tokio runtime.
pub struct ProjectRunner {
    store: Arc<dyn Store>,
    config: MatchConfig,
    tasks: TaskManager,
    slots: Slots,
}

impl ProjectRunner {
    pub fn new(store: Arc<dyn Store>, config: MatchConfig) -> Self {
        Self {
            store,
            config,
            tasks: TaskManager::new(),
            slots: Arc::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn create_project(
        &self,
        name: &str,
        source_path: &str,
        groups: &[NewTargetGroup],
    ) -> Result<Project, PipelineError> {
        Ok(self.store.create_project(name, source_path, groups)?)
    }

    /// Stop the project's jobs, wait for them to exit, then remove the
    /// project and everything recorded for it.
    pub async fn delete_project(&self, project_id: &str) -> Result<(), PipelineError> {
        let project = self.store.get_project(project_id)?;

        let stopped = self.tasks.stop_project(project_id).await;
        if stopped > 0 {
            log::info!("Stopped {} job(s) of project {}", stopped, project.name);
        }

        self.store.delete_project(project_id)?;
        lock(&self.slots).retain(|(project, _), _| project != project_id);
        log::info!("Deleted project {} ({})", project.name, project.id);
        Ok(())
    }

    pub fn stats(&self, project_id: &str) -> Result<ProjectStats, PipelineError> {
        self.store.get_project(project_id)?;
        let total_files = self.store.source_records(project_id, None)?.len();
        let processed = self
            .store
            .source_records(project_id, Some(RecordStatus::Analyzed))?
            .len();

        let progress = if total_files == 0 {
            0.0
        } else {
            processed as f64 / total_files as f64 * 100.0
        };
        Ok(ProjectStats {
            total_files,
            processed,
            progress,
        })
    }

    /// Index new files under the source and target roots.
    pub fn start_indexing(&self, project_id: &str) -> Result<JoinHandle<()>, PipelineError> {
        let previous = self.store.get_project(project_id)?.status;
        let indexing = IndexingService::new(Arc::clone(&self.store), self.config.clone());

        Ok(self.launch(project_id, TaskKind::Indexing, move |token, progress, outcome| {
            let result = indexing.index_project(outcome.project_id(), &token, &progress);
            outcome.finish(result.map(|_| ()), previous);
        }))
    }

    /// Index, then compare every source against every target group.
    pub fn start_comparison(&self, project_id: &str) -> Result<JoinHandle<()>, PipelineError> {
        let previous = self.store.get_project(project_id)?.status;
        let indexing = IndexingService::new(Arc::clone(&self.store), self.config.clone());
        let comparison = ComparisonService::new(Arc::clone(&self.store), self.config.clone());

        Ok(self.launch(project_id, TaskKind::Comparison, move |token, progress, outcome| {
            let mut last_good = previous;
            let result = indexing
                .index_project(outcome.project_id(), &token, &progress)
                .and_then(|_| {
                    last_good = ProjectStatus::Indexed;
                    comparison.compare_project(outcome.project_id(), &token, &progress)
                });
            outcome.finish(result.map(|_| ()), last_good);
        }))
    }

    pub fn start_export(
        &self,
        project_id: &str,
        options: ExportOptions,
    ) -> Result<JoinHandle<()>, PipelineError> {
        self.store.get_project(project_id)?;
        let export = ExportService::new(Arc::clone(&self.store));

        Ok(self.launch(project_id, TaskKind::Export, move |token, progress, outcome| {
            let result = export.export_project(outcome.project_id(), &options, &token, &progress);
            match result {
                Ok(summary) => log::info!(
                    "Exported {} files to {}",
                    summary.copied + summary.placeholders,
                    summary.output_dir.display()
                ),
                Err(PipelineError::Cancelled) => log::info!("Export cancelled"),
                // export failures never change the matching status
                Err(e) => log::error!("Export of {} failed: {}", outcome.project_id(), e),
            }
        }))
    }

    /// Signal every job of the project. Returns how many were running.
    pub fn cancel_project(&self, project_id: &str) -> usize {
        let signalled = self.tasks.cancel_all(project_id);
        if signalled > 0 {
            log::info!("Cancelling {} job(s) for project {}", signalled, project_id);
        }
        signalled
    }

    pub fn cancel(&self, project_id: &str, kind: TaskKind) -> bool {
        self.tasks.cancel(project_id, kind)
    }

    pub fn is_running(&self, project_id: &str, kind: TaskKind) -> bool {
        self.tasks.is_running(project_id, kind)
    }

    /// Progress of the latest job of `kind`, if one was ever started.
    pub fn progress(&self, project_id: &str, kind: TaskKind) -> Option<JobProgress> {
        lock(&self.slots)
            .get(&(project_id.to_string(), kind))
            .map(|slot| slot.progress.snapshot())
    }

    /// Every source with its ranked candidates and selection per target group.
    pub fn matches(&self, project_id: &str) -> Result<Vec<SourceMatches>, PipelineError> {
        let groups = self.store.target_groups(project_id)?;
        let sources = self.store.source_records(project_id, None)?;

        let mut matches = Vec::with_capacity(sources.len());
        for source in sources {
            let mut per_group = Vec::with_capacity(groups.len());
            for group in &groups {
                per_group.push(GroupMatches {
                    candidates: self.store.candidates_for(&source.id, &group.id)?,
                    selection: self.store.selection(&source.id, &group.id)?,
                    group: group.clone(),
                });
            }
            matches.push(SourceMatches {
                confirmed: self.store.is_confirmed(&source.id)?,
                source,
                groups: per_group,
            });
        }
        Ok(matches)
    }

    pub fn select_candidate(
        &self,
        source_id: &str,
        group_id: &str,
        candidate_id: &str,
    ) -> Result<Selection, PipelineError> {
        let candidate = self.store.candidate(candidate_id)?;
        if candidate.source_id != source_id || candidate.group_id != group_id {
            return Err(PipelineError::InvalidSelection(format!(
                "candidate {} does not belong to source {} in group {}",
                candidate_id, source_id, group_id
            )));
        }

        Ok(self.store.upsert_selection(
            source_id,
            group_id,
            SelectionChoice::Candidate(candidate.id),
            SelectionOrigin::User,
        )?)
    }

    pub fn mark_no_match(&self, source_id: &str, group_id: &str) -> Result<Selection, PipelineError> {
        self.store.source_record(source_id)?;
        Ok(self.store.upsert_selection(
            source_id,
            group_id,
            SelectionChoice::NoMatch,
            SelectionOrigin::User,
        )?)
    }

    pub fn confirm(&self, source_id: &str, confirmed: bool) -> Result<(), PipelineError> {
        self.store.source_record(source_id)?;
        Ok(self.store.set_confirmed(source_id, confirmed)?)
    }

    fn launch<F>(&self, project_id: &str, kind: TaskKind, job: F) -> JoinHandle<()>
    where
        F: FnOnce(CancellationToken, ProgressTracker, Outcome) + Send + 'static,
    {
        let key = (project_id.to_string(), kind);
        let (generation, progress) = {
            let mut slots = lock(&self.slots);
            let slot = slots.entry(key.clone()).or_default();
            slot.generation += 1;
            slot.progress = ProgressTracker::new();
            (slot.generation, slot.progress.clone())
        };

        let outcome = Outcome {
            store: Arc::clone(&self.store),
            slots: Arc::clone(&self.slots),
            key,
            generation,
        };

        log::info!("Starting {} for project {}", kind, project_id);
        self.tasks
            .start(project_id, kind, move |token| job(token, progress, outcome))
    }
}

/// Applies a finished job's result to the project, unless a newer job of
/// the same kind has taken over.
struct Outcome {
    store: Arc<dyn Store>,
    slots: Slots,
    key: (String, TaskKind),
    generation: u64,
}

impl Outcome {
    fn project_id(&self) -> &str {
        &self.key.0
    }

    fn is_current(&self) -> bool {
        lock(&self.slots)
            .get(&self.key)
            .is_some_and(|slot| slot.generation == self.generation)
    }

    fn finish(&self, result: Result<(), PipelineError>, last_good: ProjectStatus) {
        let (project_id, kind) = (&self.key.0, self.key.1);
        let update = match result {
            Ok(()) => {
                log::info!("{} finished for project {}", kind, project_id);
                return;
            }
            Err(PipelineError::Cancelled) => {
                log::info!("{} cancelled for project {}", kind, project_id);
                if !self.is_current() {
                    return;
                }
                self.store.update_project_status(project_id, last_good, None)
            }
            Err(e) => {
                log::error!("{} failed for project {}: {}", kind, project_id, e);
                if !self.is_current() {
                    return;
                }
                let message = e.to_string();
                self.store
                    .update_project_status(project_id, ProjectStatus::Error, Some(&message))
            }
        };

        if let Err(e) = update {
            log::error!("Failed to record status of project {}: {}", project_id, e);
        }
    }
}

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<(String, TaskKind), JobSlot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

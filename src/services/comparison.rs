use super::{Batch, PipelineError};
use crate::config::MatchConfig;
use crate::core::filter::{AllTargets, CandidateFilter, DimensionFilter};
use crate::core::ranking::select_candidates;
use crate::core::similarity::SimilarityScorer;
use crate::database::models::{
    ImageRecord, NewCandidate, ProjectStatus, RecordStatus, SelectionChoice, SelectionOrigin,
    TargetGroup,
};
use crate::database::{DatabaseError, Store};
use crate::workers::{ProgressTracker, WorkerPool};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Candidates produced for one source across every group.
struct ScoredSource {
    source_id: String,
    candidates: Vec<NewCandidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompareSummary {
    pub sources: usize,
    pub groups: usize,
    pub candidates: usize,
    pub auto_selections: usize,
}

/// Scores every indexed source against every non-empty target group.
pub struct ComparisonService {
    store: Arc<dyn Store>,
    config: MatchConfig,
    scorer: SimilarityScorer,
    filter: Box<dyn CandidateFilter>,
}

impl ComparisonService {
    pub fn new(store: Arc<dyn Store>, config: MatchConfig) -> Self {
        let filter: Box<dyn CandidateFilter> = if config.dimension_prefilter {
            Box::new(DimensionFilter::new())
        } else {
            Box::new(AllTargets)
        };

        Self {
            store,
            scorer: SimilarityScorer::new(config.weights),
            config,
            filter,
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn CandidateFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn compare_project(
        &self,
        project_id: &str,
        token: &CancellationToken,
        progress: &ProgressTracker,
    ) -> Result<CompareSummary, PipelineError> {
        let project = self.store.get_project(project_id)?;

        let sources: Vec<ImageRecord> = self
            .store
            .source_records(project_id, None)?
            .into_iter()
            .filter(|record| record.status != RecordStatus::Pending)
            .collect();
        if sources.is_empty() {
            return Err(PipelineError::NoSourceRecords {
                project_id: project_id.to_string(),
            });
        }

        let mut groups = Vec::new();
        for group in self.store.target_groups(project_id)? {
            let targets = self.store.target_records(&group.id)?;
            if targets.is_empty() {
                log::warn!("Target group {} has no indexed images, skipping", group.name);
                continue;
            }
            groups.push((group, targets));
        }
        if groups.is_empty() {
            return Err(PipelineError::NoTargetRecords {
                project_id: project_id.to_string(),
            });
        }

        log::info!(
            "Comparing {} sources against {} target groups ({} filter)",
            sources.len(),
            groups.len(),
            self.filter.name()
        );
        self.store
            .update_project_status(project_id, ProjectStatus::Comparing, None)?;

        let pool = WorkerPool::new(self.config.workers)?;
        let write = |scored: &[ScoredSource]| self.write_scored(scored);
        let batch = Mutex::new(Batch::new(self.config.batch_size));
        progress.reset(sources.len(), "Comparing");

        let processed = pool.run(sources, token, |source| {
            if let Err(e) = self.store.clear_candidates(&source.id) {
                log::error!("Failed to clear candidates of {}: {}", source.relative_path, e);
            }

            let candidates = self.rank_source(&source, &groups);
            progress.advance(&source.relative_path);

            let weight = candidates.len();
            let scored = ScoredSource {
                source_id: source.id,
                candidates,
            };
            batch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(scored, weight, &write);
        });

        // whatever finished is kept, even on cancellation
        let mut batch = batch.into_inner().unwrap_or_else(PoisonError::into_inner);
        batch.flush(&write);

        if token.is_cancelled() {
            log::info!(
                "Comparison of {} cancelled after {} sources",
                project.name,
                processed
            );
            return Err(PipelineError::Cancelled);
        }

        let auto_selections = match self.auto_select(project_id) {
            Ok(count) => count,
            Err(e) => {
                log::warn!("Failed to create auto-selections: {}", e);
                0
            }
        };

        self.store
            .update_project_status(project_id, ProjectStatus::Completed, None)?;

        let summary = CompareSummary {
            sources: processed,
            groups: groups.len(),
            candidates: batch.written,
            auto_selections,
        };
        log::info!(
            "Comparison of {} completed: {} candidates, {} auto-selections",
            project.name,
            summary.candidates,
            summary.auto_selections
        );
        Ok(summary)
    }

    /// Ranked candidates of `source` for each group, ready to persist.
    pub fn rank_source(
        &self,
        source: &ImageRecord,
        groups: &[(TargetGroup, Vec<ImageRecord>)],
    ) -> Vec<NewCandidate> {
        let mut candidates = Vec::new();

        for (group, targets) in groups {
            let scored: Vec<_> = self
                .filter
                .filter(source, targets)
                .into_iter()
                .map(|target| {
                    let score = self.scorer.score(&source.fingerprint, &target.fingerprint);
                    (target, score)
                })
                .collect();

            let shortlist = select_candidates(scored, self.config.max_candidates);
            if shortlist.is_forced() {
                log::debug!(
                    "{} in {}: nothing above any tier, kept the best at {:.2}%",
                    source.relative_path,
                    group.name,
                    shortlist.ranked[0].score
                );
            }

            candidates.extend(shortlist.ranked.into_iter().map(|ranked| NewCandidate {
                source_id: source.id.clone(),
                group_id: group.id.clone(),
                file_path: ranked.item.absolute_path.clone(),
                similarity_score: ranked.score,
                rank: ranked.rank as u32,
                width: ranked.item.width,
                height: ranked.item.height,
            }));
        }

        candidates
    }

    fn write_scored(&self, scored: &[ScoredSource]) -> Result<usize, DatabaseError> {
        let candidates: Vec<NewCandidate> = scored
            .iter()
            .flat_map(|s| s.candidates.iter().cloned())
            .collect();
        let written = self.store.insert_candidates(&candidates)?;

        // the candidates are stored, so a failed status update does not lose them
        let source_ids: Vec<String> = scored.iter().map(|s| s.source_id.clone()).collect();
        if let Err(e) = self.store.mark_sources_analyzed(&source_ids) {
            log::error!("Failed to mark {} sources analyzed: {}", source_ids.len(), e);
        }
        Ok(written)
    }

    /// Rank-1 candidates become auto selections where none exists yet.
    fn auto_select(&self, project_id: &str) -> Result<usize, DatabaseError> {
        let mut created = 0;
        for candidate in self.store.rank_one_candidates(project_id)? {
            let inserted = self.store.insert_selection_if_absent(
                &candidate.source_id,
                &candidate.group_id,
                SelectionChoice::Candidate(candidate.id.clone()),
                SelectionOrigin::Auto,
            )?;
            if inserted {
                created += 1;
            }
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fingerprint::Fingerprint;
    use crate::core::ranking::DEFAULT_MAX_CANDIDATES;
    use crate::database::models::{NewImageRecord, NewTargetGroup};
    use crate::database::{MemoryStore, SqliteStore};

    fn record(name: &str, hash: u64, width: u32) -> NewImageRecord {
        NewImageRecord {
            relative_path: name.to_string(),
            absolute_path: format!("/data/{}", name),
            width,
            height: 100,
            size_bytes: u64::from(width) * 100,
            fingerprint: Fingerprint {
                perceptual_hash: hash,
                width,
                height: 100,
                color_histogram: None,
            },
        }
    }

    fn setup(groups: &[&str]) -> (Arc<MemoryStore>, String, Vec<TargetGroup>) {
        let store = Arc::new(MemoryStore::new());
        let new_groups: Vec<_> = groups
            .iter()
            .map(|name| NewTargetGroup {
                name: name.to_string(),
                path: format!("/data/{}", name),
            })
            .collect();
        let project = store.create_project("cmp", "/data/source", &new_groups).unwrap();
        let groups = store.target_groups(&project.id).unwrap();
        (store, project.id, groups)
    }

    #[test]
    fn test_compare_ranks_and_auto_selects() {
        let (store, project_id, groups) = setup(&["edited"]);
        store
            .insert_source_records(&project_id, &[record("s.png", 0, 100)])
            .unwrap();
        store
            .insert_target_records(
                &groups[0].id,
                &[
                    record("far.png", u64::MAX, 100),
                    record("exact.png", 0, 100),
                    record("near.png", 0b1111, 100),
                ],
            )
            .unwrap();

        let service = ComparisonService::new(store.clone(), MatchConfig::default());
        let summary = service
            .compare_project(&project_id, &CancellationToken::new(), &ProgressTracker::new())
            .unwrap();
        assert_eq!(summary.sources, 1);
        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.auto_selections, 1);

        let source = store.source_records(&project_id, None).unwrap().remove(0);
        assert_eq!(source.status, RecordStatus::Analyzed);

        let candidates = store.candidates_for(&source.id, &groups[0].id).unwrap();
        let paths: Vec<_> = candidates.iter().map(|c| c.file_path.as_str()).collect();
        assert_eq!(paths, vec!["/data/exact.png", "/data/near.png"]);
        assert_eq!(candidates[0].similarity_score, 100.0);

        let selection = store.selection(&source.id, &groups[0].id).unwrap().unwrap();
        assert_eq!(selection.choice, SelectionChoice::Candidate(candidates[0].id.clone()));
        assert_eq!(selection.origin, SelectionOrigin::Auto);
        assert_eq!(
            store.get_project(&project_id).unwrap().status,
            ProjectStatus::Completed
        );
    }

    #[test]
    fn test_failed_status_update_keeps_written_candidates() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let project = store
            .create_project(
                "cmp",
                "/data/source",
                &[NewTargetGroup {
                    name: "edited".to_string(),
                    path: "/data/edited".to_string(),
                }],
            )
            .unwrap();
        let group = store.target_groups(&project.id).unwrap().remove(0);
        store
            .insert_source_records(&project.id, &[record("s.png", 0, 100)])
            .unwrap();
        store
            .insert_target_records(&group.id, &[record("exact.png", 0, 100)])
            .unwrap();
        store.execute_raw(
            "CREATE TRIGGER no_status_update BEFORE UPDATE ON source_records
             BEGIN SELECT RAISE(ABORT, 'read only'); END;",
        );

        let service = ComparisonService::new(store.clone(), MatchConfig::default());
        let summary = service
            .compare_project(&project.id, &CancellationToken::new(), &ProgressTracker::new())
            .unwrap();
        assert_eq!(summary.candidates, 1);

        let source = store.source_records(&project.id, None).unwrap().remove(0);
        assert_ne!(source.status, RecordStatus::Analyzed);
        assert_eq!(store.candidates_for(&source.id, &group.id).unwrap().len(), 1);
    }

    #[test]
    fn test_rerun_replaces_candidates_and_keeps_no_match() {
        let (store, project_id, groups) = setup(&["edited"]);
        store
            .insert_source_records(&project_id, &[record("s.png", 0, 100)])
            .unwrap();
        store
            .insert_target_records(&groups[0].id, &[record("t.png", 0, 100)])
            .unwrap();

        let service = ComparisonService::new(store.clone(), MatchConfig::default());
        let run = || {
            service
                .compare_project(&project_id, &CancellationToken::new(), &ProgressTracker::new())
                .unwrap()
        };
        run();

        let source = store.source_records(&project_id, None).unwrap().remove(0);
        store
            .upsert_selection(
                &source.id,
                &groups[0].id,
                SelectionChoice::NoMatch,
                SelectionOrigin::User,
            )
            .unwrap();

        let second = run();
        assert_eq!(second.auto_selections, 0);
        assert_eq!(store.candidates_for(&source.id, &groups[0].id).unwrap().len(), 1);
        assert_eq!(
            store.selection(&source.id, &groups[0].id).unwrap().unwrap().choice,
            SelectionChoice::NoMatch
        );
    }

    #[test]
    fn test_empty_group_is_skipped_but_all_empty_fails() {
        let (store, project_id, groups) = setup(&["empty", "full"]);
        store
            .insert_source_records(&project_id, &[record("s.png", 0, 100)])
            .unwrap();
        let service = ComparisonService::new(store.clone(), MatchConfig::default());

        let result =
            service.compare_project(&project_id, &CancellationToken::new(), &ProgressTracker::new());
        assert!(matches!(result, Err(PipelineError::NoTargetRecords { .. })));

        store
            .insert_target_records(&groups[1].id, &[record("t.png", 1, 100)])
            .unwrap();
        let summary = service
            .compare_project(&project_id, &CancellationToken::new(), &ProgressTracker::new())
            .unwrap();
        assert_eq!(summary.groups, 1);
    }

    #[test]
    fn test_no_sources_fails() {
        let (store, project_id, groups) = setup(&["edited"]);
        store
            .insert_target_records(&groups[0].id, &[record("t.png", 0, 100)])
            .unwrap();

        let service = ComparisonService::new(store, MatchConfig::default());
        let result =
            service.compare_project(&project_id, &CancellationToken::new(), &ProgressTracker::new());
        assert!(matches!(result, Err(PipelineError::NoSourceRecords { .. })));
    }

    #[test]
    fn test_group_never_ends_empty_and_caps() {
        let (store, project_id, groups) = setup(&["many"]);
        store
            .insert_source_records(&project_id, &[record("s.png", 0, 100)])
            .unwrap();
        let targets: Vec<_> = (0..80).map(|i| record(&format!("t{:03}.png", i), 0, 100)).collect();
        store.insert_target_records(&groups[0].id, &targets).unwrap();

        let service = ComparisonService::new(store.clone(), MatchConfig::default());
        let source = store.source_records(&project_id, None).unwrap().remove(0);
        let group_data = vec![(groups[0].clone(), store.target_records(&groups[0].id).unwrap())];

        let ranked = service.rank_source(&source, &group_data);
        assert_eq!(ranked.len(), DEFAULT_MAX_CANDIDATES);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[0].file_path, "/data/t000.png");
        assert_eq!(ranked.last().unwrap().rank as usize, DEFAULT_MAX_CANDIDATES);

        let opposite = vec![(
            groups[0].clone(),
            vec![store.target_records(&groups[0].id).unwrap()[0].clone()],
        )];
        let mut inverted = source.clone();
        inverted.fingerprint.perceptual_hash = u64::MAX;
        let forced = service.rank_source(&inverted, &opposite);
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].similarity_score, 0.0);
    }

    /// Passes every target through, cancelling the run on first use.
    struct CancelOnFirstUse(CancellationToken);

    impl CandidateFilter for CancelOnFirstUse {
        fn name(&self) -> &'static str {
            "cancel-on-first-use"
        }

        fn filter<'a>(&self, _: &ImageRecord, targets: &'a [ImageRecord]) -> Vec<&'a ImageRecord> {
            self.0.cancel();
            targets.iter().collect()
        }
    }

    #[test]
    fn test_cancel_keeps_finished_sources() {
        let (store, project_id, groups) = setup(&["edited"]);
        let sources: Vec<_> = (0..20).map(|i| record(&format!("s{:02}.png", i), 0, 100)).collect();
        store.insert_source_records(&project_id, &sources).unwrap();
        store
            .insert_target_records(&groups[0].id, &[record("t.png", 0, 100)])
            .unwrap();

        let token = CancellationToken::new();
        let config = MatchConfig {
            workers: 1,
            batch_size: 1,
            ..MatchConfig::default()
        };
        let service = ComparisonService::new(store.clone(), config)
            .with_filter(Box::new(CancelOnFirstUse(token.clone())));

        let result = service.compare_project(&project_id, &token, &ProgressTracker::new());
        assert!(matches!(result, Err(PipelineError::Cancelled)));

        let analyzed = store
            .source_records(&project_id, Some(RecordStatus::Analyzed))
            .unwrap();
        assert!(!analyzed.is_empty());
        assert!(analyzed.len() < 20);
        for source in &analyzed {
            assert_eq!(store.candidates_for(&source.id, &groups[0].id).unwrap().len(), 1);
        }
        assert_eq!(
            store.get_project(&project_id).unwrap().status,
            ProjectStatus::Comparing
        );
    }

    #[test]
    fn test_dimension_prefilter_narrows_targets() {
        let (store, project_id, groups) = setup(&["sizes"]);
        store
            .insert_source_records(&project_id, &[record("s.png", 0, 100)])
            .unwrap();
        store
            .insert_target_records(
                &groups[0].id,
                &[record("same_size.png", 0xFF, 100), record("huge.png", 0, 1000)],
            )
            .unwrap();

        let config = MatchConfig {
            dimension_prefilter: true,
            ..MatchConfig::default()
        };
        let service = ComparisonService::new(store.clone(), config);
        let source = store.source_records(&project_id, None).unwrap().remove(0);
        let group_data = vec![(groups[0].clone(), store.target_records(&groups[0].id).unwrap())];

        let ranked = service.rank_source(&source, &group_data);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].file_path, "/data/same_size.png");

        let unfiltered = service.with_filter(Box::new(AllTargets));
        let ranked = unfiltered.rank_source(&source, &group_data);
        assert_eq!(ranked[0].file_path, "/data/huge.png");
    }
}

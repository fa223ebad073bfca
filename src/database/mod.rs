pub mod memory;
pub mod models;
pub mod sqlite;

use models::{
    CandidateMatch, ImageRecord, NewCandidate, NewImageRecord, NewTargetGroup, Project,
    ProjectStatus, RecordStatus, Selection, SelectionChoice, SelectionOrigin, TargetGroup,
};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database query error: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid stored data: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatabaseError {
    pub fn not_found(entity: &'static str, id: &str) -> Self {
        DatabaseError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Persistence collaborator for projects, records, candidates and selections.
///
/// Implementations must give read-after-write consistency within a process
/// and be shareable across worker threads.
pub trait Store: Send + Sync {
    // Projects and target groups
    fn create_project(
        &self,
        name: &str,
        source_path: &str,
        groups: &[NewTargetGroup],
    ) -> Result<Project, DatabaseError>;
    fn get_project(&self, id: &str) -> Result<Project, DatabaseError>;
    /// Newest first.
    fn list_projects(&self) -> Result<Vec<Project>, DatabaseError>;
    fn update_project_status(
        &self,
        id: &str,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> Result<(), DatabaseError>;
    /// Removes the project with its groups, records, candidates,
    /// selections and confirmations.
    fn delete_project(&self, id: &str) -> Result<(), DatabaseError>;
    /// In creation order.
    fn target_groups(&self, project_id: &str) -> Result<Vec<TargetGroup>, DatabaseError>;

    // Image records
    fn known_source_paths(&self, project_id: &str) -> Result<HashSet<String>, DatabaseError>;
    fn known_target_paths(&self, group_id: &str) -> Result<HashSet<String>, DatabaseError>;
    /// Records whose relative path is already stored are skipped. Returns the number inserted.
    fn insert_source_records(
        &self,
        project_id: &str,
        records: &[NewImageRecord],
    ) -> Result<usize, DatabaseError>;
    fn insert_target_records(
        &self,
        group_id: &str,
        records: &[NewImageRecord],
    ) -> Result<usize, DatabaseError>;
    /// Ordered by relative path.
    fn source_records(
        &self,
        project_id: &str,
        status: Option<RecordStatus>,
    ) -> Result<Vec<ImageRecord>, DatabaseError>;
    fn source_record(&self, id: &str) -> Result<ImageRecord, DatabaseError>;
    /// Ordered by relative path.
    fn target_records(&self, group_id: &str) -> Result<Vec<ImageRecord>, DatabaseError>;
    fn mark_sources_analyzed(&self, ids: &[String]) -> Result<(), DatabaseError>;

    // Candidates
    /// Drops the source's candidates together with every selection that
    /// pointed at one of them or was made automatically. Explicit user
    /// "no match" selections survive.
    fn clear_candidates(&self, source_id: &str) -> Result<(), DatabaseError>;
    fn insert_candidates(&self, candidates: &[NewCandidate]) -> Result<usize, DatabaseError>;
    /// Ordered by rank.
    fn candidates_for(
        &self,
        source_id: &str,
        group_id: &str,
    ) -> Result<Vec<CandidateMatch>, DatabaseError>;
    fn candidate(&self, id: &str) -> Result<CandidateMatch, DatabaseError>;
    fn rank_one_candidates(&self, project_id: &str) -> Result<Vec<CandidateMatch>, DatabaseError>;

    // Selections and confirmations
    fn selection(&self, source_id: &str, group_id: &str)
        -> Result<Option<Selection>, DatabaseError>;
    fn upsert_selection(
        &self,
        source_id: &str,
        group_id: &str,
        choice: SelectionChoice,
        origin: SelectionOrigin,
    ) -> Result<Selection, DatabaseError>;
    /// Returns false when a selection already existed and was left alone.
    fn insert_selection_if_absent(
        &self,
        source_id: &str,
        group_id: &str,
        choice: SelectionChoice,
        origin: SelectionOrigin,
    ) -> Result<bool, DatabaseError>;
    fn set_confirmed(&self, source_id: &str, confirmed: bool) -> Result<(), DatabaseError>;
    fn is_confirmed(&self, source_id: &str) -> Result<bool, DatabaseError>;
}

/// Default database location under the user data directory.
pub fn default_database_path() -> Result<PathBuf, DatabaseError> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| DatabaseError::Invalid("Could not find data directory".to_string()))?;

    let app_dir = data_dir.join("lookalike");
    std::fs::create_dir_all(&app_dir)?;
    Ok(app_dir.join("lookalike.db"))
}

/// Behaviour every `Store` must share, run against each implementation.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::core::fingerprint::Fingerprint;

    pub fn record(relative_path: &str, hash: u64) -> NewImageRecord {
        NewImageRecord {
            relative_path: relative_path.to_string(),
            absolute_path: format!("/data/{}", relative_path),
            width: 64,
            height: 48,
            size_bytes: 2048,
            fingerprint: Fingerprint {
                perceptual_hash: hash,
                width: 64,
                height: 48,
                color_histogram: Some(vec![1.0 / 48.0; 48]),
            },
        }
    }

    fn candidate(source_id: &str, group_id: &str, name: &str, score: f64, rank: u32) -> NewCandidate {
        NewCandidate {
            source_id: source_id.to_string(),
            group_id: group_id.to_string(),
            file_path: format!("/targets/{}", name),
            similarity_score: score,
            rank,
            width: 64,
            height: 48,
        }
    }

    fn project_with_group(store: &dyn Store) -> (Project, TargetGroup) {
        let project = store
            .create_project(
                "shoot",
                "/data/source",
                &[NewTargetGroup {
                    name: "edited".to_string(),
                    path: "/data/edited".to_string(),
                }],
            )
            .unwrap();
        let group = store.target_groups(&project.id).unwrap().remove(0);
        (project, group)
    }

    pub fn projects_and_groups(store: &dyn Store) {
        let project = store
            .create_project(
                "shoot",
                "/data/source",
                &[
                    NewTargetGroup {
                        name: "edited".to_string(),
                        path: "/data/edited".to_string(),
                    },
                    NewTargetGroup {
                        name: "web".to_string(),
                        path: "/data/web".to_string(),
                    },
                ],
            )
            .unwrap();

        assert!(project.id.starts_with("prj_"));
        assert_eq!(project.status, ProjectStatus::Pending);
        assert_eq!(store.get_project(&project.id).unwrap(), project);

        let names: Vec<_> = store
            .target_groups(&project.id)
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["edited", "web"]);

        store
            .update_project_status(&project.id, ProjectStatus::Error, Some("no targets"))
            .unwrap();
        let failed = store.get_project(&project.id).unwrap();
        assert_eq!(failed.status, ProjectStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("no targets"));

        store
            .update_project_status(&project.id, ProjectStatus::Indexed, None)
            .unwrap();
        assert_eq!(store.get_project(&project.id).unwrap().error_message, None);

        assert_eq!(store.list_projects().unwrap().len(), 1);
        assert!(matches!(
            store.get_project("prj_missing"),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    pub fn records_are_keyed_by_relative_path(store: &dyn Store) {
        let (project, group) = project_with_group(store);

        let inserted = store
            .insert_source_records(&project.id, &[record("b.png", 2), record("a/c.png", 1)])
            .unwrap();
        assert_eq!(inserted, 2);

        let again = store
            .insert_source_records(&project.id, &[record("b.png", 9), record("d.png", 3)])
            .unwrap();
        assert_eq!(again, 1);

        let sources = store.source_records(&project.id, None).unwrap();
        let paths: Vec<_> = sources.iter().map(|r| r.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a/c.png", "b.png", "d.png"]);
        assert_eq!(sources[1].fingerprint.perceptual_hash, 2);
        assert_eq!(sources[0].status, RecordStatus::Indexed);
        assert_eq!(sources[0].fingerprint.color_histogram.as_ref().map(Vec::len), Some(48));

        let known = store.known_source_paths(&project.id).unwrap();
        assert!(known.contains("a/c.png") && known.contains("d.png"));

        store.insert_target_records(&group.id, &[record("t.png", u64::MAX)]).unwrap();
        let targets = store.target_records(&group.id).unwrap();
        assert_eq!(targets[0].fingerprint.perceptual_hash, u64::MAX);
        assert_eq!(targets[0].owner_id, group.id);
        assert!(store.known_target_paths(&group.id).unwrap().contains("t.png"));

        store.mark_sources_analyzed(&[sources[0].id.clone()]).unwrap();
        let analyzed = store
            .source_records(&project.id, Some(RecordStatus::Analyzed))
            .unwrap();
        assert_eq!(analyzed.len(), 1);
        assert_eq!(store.source_record(&sources[0].id).unwrap().status, RecordStatus::Analyzed);
    }

    pub fn delete_cascades_to_project_data(store: &dyn Store) {
        let (project, group) = project_with_group(store);
        let (other, other_group) = project_with_group(store);

        for (owner, target_group) in [(&project, &group), (&other, &other_group)] {
            store.insert_source_records(&owner.id, &[record("s.png", 0)]).unwrap();
            store
                .insert_target_records(&target_group.id, &[record("t.png", 0)])
                .unwrap();
        }
        let source = store.source_records(&project.id, None).unwrap().remove(0);
        store
            .insert_candidates(&[candidate(&source.id, &group.id, "t.png", 100.0, 1)])
            .unwrap();
        store
            .upsert_selection(&source.id, &group.id, SelectionChoice::NoMatch, SelectionOrigin::User)
            .unwrap();
        store.set_confirmed(&source.id, true).unwrap();

        store.delete_project(&project.id).unwrap();

        assert!(matches!(
            store.get_project(&project.id),
            Err(DatabaseError::NotFound { .. })
        ));
        assert!(store.target_groups(&project.id).unwrap().is_empty());
        assert!(store.source_records(&project.id, None).unwrap().is_empty());
        assert!(store.target_records(&group.id).unwrap().is_empty());
        assert!(store.candidates_for(&source.id, &group.id).unwrap().is_empty());
        assert!(store.rank_one_candidates(&project.id).unwrap().is_empty());
        assert!(store.selection(&source.id, &group.id).unwrap().is_none());
        assert!(!store.is_confirmed(&source.id).unwrap());

        // the other project is untouched
        assert_eq!(store.list_projects().unwrap().len(), 1);
        assert_eq!(store.source_records(&other.id, None).unwrap().len(), 1);
        assert_eq!(store.target_records(&other_group.id).unwrap().len(), 1);

        assert!(matches!(
            store.delete_project(&project.id),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    pub fn candidates_and_selections(store: &dyn Store) {
        let (project, group) = project_with_group(store);
        store.insert_source_records(&project.id, &[record("s.png", 0)]).unwrap();
        let source = store.source_records(&project.id, None).unwrap().remove(0);

        store
            .insert_candidates(&[
                candidate(&source.id, &group.id, "second.png", 60.0, 2),
                candidate(&source.id, &group.id, "first.png", 90.0, 1),
            ])
            .unwrap();

        let candidates = store.candidates_for(&source.id, &group.id).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].rank, 1);
        assert_eq!(candidates[0].file_path, "/targets/first.png");

        let best = store.rank_one_candidates(&project.id).unwrap();
        assert_eq!(best.len(), 1);
        assert_eq!(store.candidate(&best[0].id).unwrap(), best[0]);

        let auto = SelectionChoice::Candidate(best[0].id.clone());
        assert!(store
            .insert_selection_if_absent(&source.id, &group.id, auto.clone(), SelectionOrigin::Auto)
            .unwrap());
        assert!(!store
            .insert_selection_if_absent(&source.id, &group.id, auto, SelectionOrigin::Auto)
            .unwrap());

        let user = store
            .upsert_selection(
                &source.id,
                &group.id,
                SelectionChoice::Candidate(candidates[1].id.clone()),
                SelectionOrigin::User,
            )
            .unwrap();
        let stored = store.selection(&source.id, &group.id).unwrap().unwrap();
        assert_eq!(stored.origin, SelectionOrigin::User);
        assert_eq!(stored.choice, user.choice);

        // clearing drops candidate-backed selections
        store.clear_candidates(&source.id).unwrap();
        assert!(store.candidates_for(&source.id, &group.id).unwrap().is_empty());
        assert!(store.selection(&source.id, &group.id).unwrap().is_none());

        // but keeps an explicit "no match"
        store
            .upsert_selection(&source.id, &group.id, SelectionChoice::NoMatch, SelectionOrigin::User)
            .unwrap();
        store.clear_candidates(&source.id).unwrap();
        assert_eq!(
            store.selection(&source.id, &group.id).unwrap().unwrap().choice,
            SelectionChoice::NoMatch
        );

        assert!(!store.is_confirmed(&source.id).unwrap());
        store.set_confirmed(&source.id, true).unwrap();
        assert!(store.is_confirmed(&source.id).unwrap());
        store.set_confirmed(&source.id, false).unwrap();
        assert!(!store.is_confirmed(&source.id).unwrap());
    }
}

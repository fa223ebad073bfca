use super::models::{
    new_id, now, CandidateMatch, ImageRecord, NewCandidate, NewImageRecord, NewTargetGroup,
    Project, ProjectStatus, RecordStatus, Selection, SelectionChoice, SelectionOrigin,
    TargetGroup,
};
use super::{DatabaseError, Store};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct State {
    projects: Vec<Project>,
    groups: Vec<TargetGroup>,
    sources: Vec<ImageRecord>,
    targets: Vec<ImageRecord>,
    candidates: Vec<CandidateMatch>,
    selections: HashMap<(String, String), Selection>,
    confirmed: HashSet<String>,
}

impl State {
    fn project_mut(&mut self, id: &str) -> Result<&mut Project, DatabaseError> {
        self.projects
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| DatabaseError::not_found("Project", id))
    }
}

/// In-process store. Everything lives behind one mutex.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn insert_records(
    existing: &mut Vec<ImageRecord>,
    owner_id: &str,
    prefix: &str,
    records: &[NewImageRecord],
) -> usize {
    let mut known: HashSet<String> = existing
        .iter()
        .filter(|r| r.owner_id == owner_id)
        .map(|r| r.relative_path.clone())
        .collect();

    let mut inserted = 0;
    for record in records {
        if known.insert(record.relative_path.clone()) {
            existing.push(record.clone().into_record(owner_id, prefix));
            inserted += 1;
        }
    }
    inserted
}

fn sorted_by_path(mut records: Vec<ImageRecord>) -> Vec<ImageRecord> {
    records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    records
}

impl Store for MemoryStore {
    fn create_project(
        &self,
        name: &str,
        source_path: &str,
        groups: &[NewTargetGroup],
    ) -> Result<Project, DatabaseError> {
        let mut state = self.lock();
        let timestamp = now();
        let project = Project {
            id: new_id("prj"),
            name: name.to_string(),
            source_path: source_path.to_string(),
            status: ProjectStatus::Pending,
            error_message: None,
            created_at: timestamp.clone(),
            updated_at: timestamp,
        };

        for group in groups {
            state.groups.push(TargetGroup {
                id: new_id("grp"),
                project_id: project.id.clone(),
                name: group.name.clone(),
                path: group.path.clone(),
            });
        }
        state.projects.push(project.clone());
        Ok(project)
    }

    fn get_project(&self, id: &str) -> Result<Project, DatabaseError> {
        self.lock().project_mut(id).map(|p| p.clone())
    }

    fn list_projects(&self) -> Result<Vec<Project>, DatabaseError> {
        Ok(self.lock().projects.iter().rev().cloned().collect())
    }

    fn update_project_status(
        &self,
        id: &str,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        let project = state.project_mut(id)?;
        project.status = status;
        project.error_message = error_message.map(str::to_string);
        project.updated_at = now();
        Ok(())
    }

    fn delete_project(&self, id: &str) -> Result<(), DatabaseError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let before = state.projects.len();
        state.projects.retain(|p| p.id != id);
        if state.projects.len() == before {
            return Err(DatabaseError::not_found("Project", id));
        }

        let groups: HashSet<String> = state
            .groups
            .iter()
            .filter(|g| g.project_id == id)
            .map(|g| g.id.clone())
            .collect();
        let sources: HashSet<String> = state
            .sources
            .iter()
            .filter(|r| r.owner_id == id)
            .map(|r| r.id.clone())
            .collect();

        state.groups.retain(|g| g.project_id != id);
        state.sources.retain(|r| r.owner_id != id);
        state.targets.retain(|r| !groups.contains(&r.owner_id));
        state.candidates.retain(|c| !sources.contains(&c.source_id));
        state.selections.retain(|(source, _), _| !sources.contains(source));
        state.confirmed.retain(|source| !sources.contains(source));
        Ok(())
    }

    fn target_groups(&self, project_id: &str) -> Result<Vec<TargetGroup>, DatabaseError> {
        Ok(self
            .lock()
            .groups
            .iter()
            .filter(|g| g.project_id == project_id)
            .cloned()
            .collect())
    }

    fn known_source_paths(&self, project_id: &str) -> Result<HashSet<String>, DatabaseError> {
        Ok(self
            .lock()
            .sources
            .iter()
            .filter(|r| r.owner_id == project_id)
            .map(|r| r.relative_path.clone())
            .collect())
    }

    fn known_target_paths(&self, group_id: &str) -> Result<HashSet<String>, DatabaseError> {
        Ok(self
            .lock()
            .targets
            .iter()
            .filter(|r| r.owner_id == group_id)
            .map(|r| r.relative_path.clone())
            .collect())
    }

    fn insert_source_records(
        &self,
        project_id: &str,
        records: &[NewImageRecord],
    ) -> Result<usize, DatabaseError> {
        let mut state = self.lock();
        Ok(insert_records(&mut state.sources, project_id, "src", records))
    }

    fn insert_target_records(
        &self,
        group_id: &str,
        records: &[NewImageRecord],
    ) -> Result<usize, DatabaseError> {
        let mut state = self.lock();
        Ok(insert_records(&mut state.targets, group_id, "tgt", records))
    }

    fn source_records(
        &self,
        project_id: &str,
        status: Option<RecordStatus>,
    ) -> Result<Vec<ImageRecord>, DatabaseError> {
        let records = self
            .lock()
            .sources
            .iter()
            .filter(|r| r.owner_id == project_id)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        Ok(sorted_by_path(records))
    }

    fn source_record(&self, id: &str) -> Result<ImageRecord, DatabaseError> {
        self.lock()
            .sources
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| DatabaseError::not_found("Source record", id))
    }

    fn target_records(&self, group_id: &str) -> Result<Vec<ImageRecord>, DatabaseError> {
        let records = self
            .lock()
            .targets
            .iter()
            .filter(|r| r.owner_id == group_id)
            .cloned()
            .collect();
        Ok(sorted_by_path(records))
    }

    fn mark_sources_analyzed(&self, ids: &[String]) -> Result<(), DatabaseError> {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        for record in self.lock().sources.iter_mut() {
            if ids.contains(record.id.as_str()) {
                record.status = RecordStatus::Analyzed;
            }
        }
        Ok(())
    }

    fn clear_candidates(&self, source_id: &str) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        state.candidates.retain(|c| c.source_id != source_id);
        state.selections.retain(|(source, _), selection| {
            source != source_id
                || (selection.origin == SelectionOrigin::User
                    && selection.choice == SelectionChoice::NoMatch)
        });
        Ok(())
    }

    fn insert_candidates(&self, candidates: &[NewCandidate]) -> Result<usize, DatabaseError> {
        let mut state = self.lock();
        state
            .candidates
            .extend(candidates.iter().cloned().map(NewCandidate::into_candidate));
        Ok(candidates.len())
    }

    fn candidates_for(
        &self,
        source_id: &str,
        group_id: &str,
    ) -> Result<Vec<CandidateMatch>, DatabaseError> {
        let mut candidates: Vec<_> = self
            .lock()
            .candidates
            .iter()
            .filter(|c| c.source_id == source_id && c.group_id == group_id)
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.rank);
        Ok(candidates)
    }

    fn candidate(&self, id: &str) -> Result<CandidateMatch, DatabaseError> {
        self.lock()
            .candidates
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| DatabaseError::not_found("Candidate", id))
    }

    fn rank_one_candidates(&self, project_id: &str) -> Result<Vec<CandidateMatch>, DatabaseError> {
        let state = self.lock();
        let sources: HashSet<&str> = state
            .sources
            .iter()
            .filter(|r| r.owner_id == project_id)
            .map(|r| r.id.as_str())
            .collect();

        Ok(state
            .candidates
            .iter()
            .filter(|c| c.rank == 1 && sources.contains(c.source_id.as_str()))
            .cloned()
            .collect())
    }

    fn selection(
        &self,
        source_id: &str,
        group_id: &str,
    ) -> Result<Option<Selection>, DatabaseError> {
        Ok(self
            .lock()
            .selections
            .get(&(source_id.to_string(), group_id.to_string()))
            .cloned())
    }

    fn upsert_selection(
        &self,
        source_id: &str,
        group_id: &str,
        choice: SelectionChoice,
        origin: SelectionOrigin,
    ) -> Result<Selection, DatabaseError> {
        let mut state = self.lock();
        let key = (source_id.to_string(), group_id.to_string());
        let id = state
            .selections
            .get(&key)
            .map(|s| s.id.clone())
            .unwrap_or_else(|| new_id("sel"));

        let selection = Selection {
            id,
            source_id: source_id.to_string(),
            group_id: group_id.to_string(),
            choice,
            origin,
            updated_at: now(),
        };
        state.selections.insert(key, selection.clone());
        Ok(selection)
    }

    fn insert_selection_if_absent(
        &self,
        source_id: &str,
        group_id: &str,
        choice: SelectionChoice,
        origin: SelectionOrigin,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock();
        let key = (source_id.to_string(), group_id.to_string());
        if state.selections.contains_key(&key) {
            return Ok(false);
        }

        state.selections.insert(
            key,
            Selection {
                id: new_id("sel"),
                source_id: source_id.to_string(),
                group_id: group_id.to_string(),
                choice,
                origin,
                updated_at: now(),
            },
        );
        Ok(true)
    }

    fn set_confirmed(&self, source_id: &str, confirmed: bool) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        if confirmed {
            state.confirmed.insert(source_id.to_string());
        } else {
            state.confirmed.remove(source_id);
        }
        Ok(())
    }

    fn is_confirmed(&self, source_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.lock().confirmed.contains(source_id))
    }
}

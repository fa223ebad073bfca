use super::models::{
    new_id, now, CandidateMatch, ImageRecord, NewCandidate, NewImageRecord, NewTargetGroup,
    Project, ProjectStatus, RecordStatus, Selection, SelectionChoice, SelectionOrigin,
    TargetGroup,
};
use super::{DatabaseError, Store};
use crate::core::fingerprint::Fingerprint;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        source_path TEXT NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS target_groups (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        path TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS source_records (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        relative_path TEXT NOT NULL,
        absolute_path TEXT NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        size_bytes INTEGER NOT NULL,
        perceptual_hash TEXT NOT NULL,
        color_histogram TEXT,
        status TEXT NOT NULL,
        UNIQUE (owner_id, relative_path)
    );

    CREATE TABLE IF NOT EXISTS target_records (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        relative_path TEXT NOT NULL,
        absolute_path TEXT NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        size_bytes INTEGER NOT NULL,
        perceptual_hash TEXT NOT NULL,
        color_histogram TEXT,
        status TEXT NOT NULL,
        UNIQUE (owner_id, relative_path)
    );

    CREATE TABLE IF NOT EXISTS candidates (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        group_id TEXT NOT NULL,
        file_path TEXT NOT NULL,
        similarity_score REAL NOT NULL,
        rank INTEGER NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_candidates_source ON candidates(source_id, group_id);
    CREATE INDEX IF NOT EXISTS idx_candidates_rank ON candidates(rank);

    CREATE TABLE IF NOT EXISTS selections (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        group_id TEXT NOT NULL,
        candidate_id TEXT,
        origin TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (source_id, group_id)
    );

    CREATE TABLE IF NOT EXISTS confirmations (
        source_id TEXT PRIMARY KEY,
        confirmed INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    );
";

const RECORD_COLUMNS: &str = "id, owner_id, relative_path, absolute_path, width, height, \
                              size_bytes, perceptual_hash, color_histogram, status";
const CANDIDATE_COLUMNS: &str =
    "id, source_id, group_id, file_path, similarity_score, rank, width, height";
const SELECTION_COLUMNS: &str = "id, source_id, group_id, candidate_id, origin, updated_at";

/// Which record table a query targets.
#[derive(Clone, Copy)]
enum RecordTable {
    Sources,
    Targets,
}

impl RecordTable {
    fn name(self) -> &'static str {
        match self {
            RecordTable::Sources => "source_records",
            RecordTable::Targets => "target_records",
        }
    }

    fn id_prefix(self) -> &'static str {
        match self {
            RecordTable::Sources => "src",
            RecordTable::Targets => "tgt",
        }
    }
}

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::initialize(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) {
        self.conn().execute_batch(sql).unwrap();
    }

    fn known_paths(&self, table: RecordTable, owner_id: &str) -> Result<HashSet<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT relative_path FROM {} WHERE owner_id = ?1",
            table.name()
        ))?;
        let paths = stmt
            .query_map(params![owner_id], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(paths)
    }

    fn insert_records(
        &self,
        table: RecordTable,
        owner_id: &str,
        records: &[NewImageRecord],
    ) -> Result<usize, DatabaseError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                table.name(),
                RECORD_COLUMNS
            ))?;

            for record in records {
                let histogram = record
                    .fingerprint
                    .color_histogram
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;

                inserted += stmt.execute(params![
                    new_id(table.id_prefix()),
                    owner_id,
                    record.relative_path,
                    record.absolute_path,
                    i64::from(record.width),
                    i64::from(record.height),
                    record.size_bytes as i64,
                    record.fingerprint.perceptual_hash.to_string(),
                    histogram,
                    String::from(RecordStatus::Indexed),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn query_records(
        &self,
        table: RecordTable,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ImageRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE {} ORDER BY relative_path",
            RECORD_COLUMNS,
            table.name(),
            filter
        ))?;
        let rows = stmt
            .query_map(args, RecordRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    fn query_candidates(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<CandidateMatch>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM candidates WHERE {} ORDER BY rank, rowid",
            CANDIDATE_COLUMNS, filter
        ))?;
        let candidates = stmt
            .query_map(args, candidate_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(candidates)
    }
}

/// Raw record columns; decoding the hash and histogram can fail outside rusqlite.
struct RecordRow {
    id: String,
    owner_id: String,
    relative_path: String,
    absolute_path: String,
    width: i64,
    height: i64,
    size_bytes: i64,
    perceptual_hash: String,
    color_histogram: Option<String>,
    status: String,
}

impl RecordRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            relative_path: row.get(2)?,
            absolute_path: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
            size_bytes: row.get(6)?,
            perceptual_hash: row.get(7)?,
            color_histogram: row.get(8)?,
            status: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<ImageRecord, DatabaseError> {
        let perceptual_hash = self.perceptual_hash.parse::<u64>().map_err(|e| {
            DatabaseError::Invalid(format!("hash of {}: {}", self.relative_path, e))
        })?;
        let color_histogram: Option<Vec<f64>> = self
            .color_histogram
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        let width = self.width as u32;
        let height = self.height as u32;
        Ok(ImageRecord {
            id: self.id,
            owner_id: self.owner_id,
            relative_path: self.relative_path,
            absolute_path: self.absolute_path,
            width,
            height,
            size_bytes: self.size_bytes as u64,
            fingerprint: Fingerprint {
                perceptual_hash,
                width,
                height,
                color_histogram,
            },
            status: RecordStatus::from(self.status),
        })
    }
}

fn project_from_row(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        source_path: row.get(2)?,
        status: ProjectStatus::from(row.get::<_, String>(3)?),
        error_message: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn candidate_from_row(row: &Row) -> rusqlite::Result<CandidateMatch> {
    Ok(CandidateMatch {
        id: row.get(0)?,
        source_id: row.get(1)?,
        group_id: row.get(2)?,
        file_path: row.get(3)?,
        similarity_score: row.get(4)?,
        rank: row.get::<_, i64>(5)? as u32,
        width: row.get::<_, i64>(6)? as u32,
        height: row.get::<_, i64>(7)? as u32,
    })
}

fn selection_from_row(row: &Row) -> rusqlite::Result<Selection> {
    let choice = match row.get::<_, Option<String>>(3)? {
        Some(candidate_id) => SelectionChoice::Candidate(candidate_id),
        None => SelectionChoice::NoMatch,
    };
    Ok(Selection {
        id: row.get(0)?,
        source_id: row.get(1)?,
        group_id: row.get(2)?,
        choice,
        origin: SelectionOrigin::from(row.get::<_, String>(4)?),
        updated_at: row.get(5)?,
    })
}

impl Store for SqliteStore {
    fn create_project(
        &self,
        name: &str,
        source_path: &str,
        groups: &[NewTargetGroup],
    ) -> Result<Project, DatabaseError> {
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

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO projects (id, name, source_path, status, error_message, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)",
            params![
                project.id,
                project.name,
                project.source_path,
                String::from(project.status),
                project.created_at,
                project.updated_at,
            ],
        )?;
        for group in groups {
            tx.execute(
                "INSERT INTO target_groups (id, project_id, name, path) VALUES (?1, ?2, ?3, ?4)",
                params![new_id("grp"), project.id, group.name, group.path],
            )?;
        }
        tx.commit()?;

        Ok(project)
    }

    fn get_project(&self, id: &str) -> Result<Project, DatabaseError> {
        self.conn()
            .query_row(
                "SELECT id, name, source_path, status, error_message, created_at, updated_at
                 FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()?
            .ok_or_else(|| DatabaseError::not_found("Project", id))
    }

    fn list_projects(&self) -> Result<Vec<Project>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, source_path, status, error_message, created_at, updated_at
             FROM projects ORDER BY created_at DESC, rowid DESC",
        )?;
        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    fn update_project_status(
        &self,
        id: &str,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let updated = self.conn().execute(
            "UPDATE projects SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
            params![String::from(status), error_message, now(), id],
        )?;
        if updated == 0 {
            return Err(DatabaseError::not_found("Project", id));
        }
        Ok(())
    }

    fn delete_project(&self, id: &str) -> Result<(), DatabaseError> {
        const SOURCES: &str = "SELECT id FROM source_records WHERE owner_id = ?1";
        const GROUPS: &str = "SELECT id FROM target_groups WHERE project_id = ?1";

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for statement in [
            format!("DELETE FROM selections WHERE source_id IN ({})", SOURCES),
            format!("DELETE FROM confirmations WHERE source_id IN ({})", SOURCES),
            format!("DELETE FROM candidates WHERE source_id IN ({})", SOURCES),
            "DELETE FROM source_records WHERE owner_id = ?1".to_string(),
            format!("DELETE FROM target_records WHERE owner_id IN ({})", GROUPS),
            "DELETE FROM target_groups WHERE project_id = ?1".to_string(),
        ] {
            tx.execute(&statement, params![id])?;
        }

        let deleted = tx.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DatabaseError::not_found("Project", id));
        }
        tx.commit()?;
        Ok(())
    }

    fn target_groups(&self, project_id: &str) -> Result<Vec<TargetGroup>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, name, path FROM target_groups
             WHERE project_id = ?1 ORDER BY rowid",
        )?;
        let groups = stmt
            .query_map(params![project_id], |row| {
                Ok(TargetGroup {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    name: row.get(2)?,
                    path: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    fn known_source_paths(&self, project_id: &str) -> Result<HashSet<String>, DatabaseError> {
        self.known_paths(RecordTable::Sources, project_id)
    }

    fn known_target_paths(&self, group_id: &str) -> Result<HashSet<String>, DatabaseError> {
        self.known_paths(RecordTable::Targets, group_id)
    }

    fn insert_source_records(
        &self,
        project_id: &str,
        records: &[NewImageRecord],
    ) -> Result<usize, DatabaseError> {
        self.insert_records(RecordTable::Sources, project_id, records)
    }

    fn insert_target_records(
        &self,
        group_id: &str,
        records: &[NewImageRecord],
    ) -> Result<usize, DatabaseError> {
        self.insert_records(RecordTable::Targets, group_id, records)
    }

    fn source_records(
        &self,
        project_id: &str,
        status: Option<RecordStatus>,
    ) -> Result<Vec<ImageRecord>, DatabaseError> {
        match status {
            Some(status) => self.query_records(
                RecordTable::Sources,
                "owner_id = ?1 AND status = ?2",
                params![project_id, String::from(status)],
            ),
            None => self.query_records(RecordTable::Sources, "owner_id = ?1", params![project_id]),
        }
    }

    fn source_record(&self, id: &str) -> Result<ImageRecord, DatabaseError> {
        self.query_records(RecordTable::Sources, "id = ?1", params![id])?
            .pop()
            .ok_or_else(|| DatabaseError::not_found("Source record", id))
    }

    fn target_records(&self, group_id: &str) -> Result<Vec<ImageRecord>, DatabaseError> {
        self.query_records(RecordTable::Targets, "owner_id = ?1", params![group_id])
    }

    fn mark_sources_analyzed(&self, ids: &[String]) -> Result<(), DatabaseError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE source_records SET status = ?1 WHERE id = ?2")?;
            for id in ids {
                stmt.execute(params![String::from(RecordStatus::Analyzed), id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn clear_candidates(&self, source_id: &str) -> Result<(), DatabaseError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM selections
             WHERE source_id = ?1 AND (origin = ?2 OR candidate_id IS NOT NULL)",
            params![source_id, String::from(SelectionOrigin::Auto)],
        )?;
        tx.execute("DELETE FROM candidates WHERE source_id = ?1", params![source_id])?;
        tx.commit()?;
        Ok(())
    }

    fn insert_candidates(&self, candidates: &[NewCandidate]) -> Result<usize, DatabaseError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO candidates ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                CANDIDATE_COLUMNS
            ))?;
            for candidate in candidates {
                stmt.execute(params![
                    new_id("cand"),
                    candidate.source_id,
                    candidate.group_id,
                    candidate.file_path,
                    candidate.similarity_score,
                    i64::from(candidate.rank),
                    i64::from(candidate.width),
                    i64::from(candidate.height),
                ])?;
            }
        }
        tx.commit()?;
        Ok(candidates.len())
    }

    fn candidates_for(
        &self,
        source_id: &str,
        group_id: &str,
    ) -> Result<Vec<CandidateMatch>, DatabaseError> {
        self.query_candidates(
            "source_id = ?1 AND group_id = ?2",
            params![source_id, group_id],
        )
    }

    fn candidate(&self, id: &str) -> Result<CandidateMatch, DatabaseError> {
        self.query_candidates("id = ?1", params![id])?
            .pop()
            .ok_or_else(|| DatabaseError::not_found("Candidate", id))
    }

    fn rank_one_candidates(&self, project_id: &str) -> Result<Vec<CandidateMatch>, DatabaseError> {
        self.query_candidates(
            "rank = 1 AND source_id IN (SELECT id FROM source_records WHERE owner_id = ?1)",
            params![project_id],
        )
    }

    fn selection(
        &self,
        source_id: &str,
        group_id: &str,
    ) -> Result<Option<Selection>, DatabaseError> {
        let selection = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM selections WHERE source_id = ?1 AND group_id = ?2",
                    SELECTION_COLUMNS
                ),
                params![source_id, group_id],
                selection_from_row,
            )
            .optional()?;
        Ok(selection)
    }

    fn upsert_selection(
        &self,
        source_id: &str,
        group_id: &str,
        choice: SelectionChoice,
        origin: SelectionOrigin,
    ) -> Result<Selection, DatabaseError> {
        self.conn().execute(
            &format!(
                "INSERT INTO selections ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (source_id, group_id) DO UPDATE SET
                     candidate_id = excluded.candidate_id,
                     origin = excluded.origin,
                     updated_at = excluded.updated_at",
                SELECTION_COLUMNS
            ),
            params![
                new_id("sel"),
                source_id,
                group_id,
                choice.candidate_id(),
                String::from(origin),
                now(),
            ],
        )?;

        self.selection(source_id, group_id)?
            .ok_or_else(|| DatabaseError::not_found("Selection", source_id))
    }

    fn insert_selection_if_absent(
        &self,
        source_id: &str,
        group_id: &str,
        choice: SelectionChoice,
        origin: SelectionOrigin,
    ) -> Result<bool, DatabaseError> {
        let inserted = self.conn().execute(
            &format!(
                "INSERT OR IGNORE INTO selections ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                SELECTION_COLUMNS
            ),
            params![
                new_id("sel"),
                source_id,
                group_id,
                choice.candidate_id(),
                String::from(origin),
                now(),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn set_confirmed(&self, source_id: &str, confirmed: bool) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO confirmations (source_id, confirmed, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (source_id) DO UPDATE SET
                 confirmed = excluded.confirmed,
                 updated_at = excluded.updated_at",
            params![source_id, confirmed, now()],
        )?;
        Ok(())
    }

    fn is_confirmed(&self, source_id: &str) -> Result<bool, DatabaseError> {
        let confirmed = self
            .conn()
            .query_row(
                "SELECT confirmed FROM confirmations WHERE source_id = ?1",
                params![source_id],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(confirmed.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::contract;
    use tempfile::TempDir;

    #[test]
    fn test_projects_and_groups() {
        contract::projects_and_groups(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_records_are_keyed_by_relative_path() {
        contract::records_are_keyed_by_relative_path(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_candidates_and_selections() {
        contract::candidates_and_selections(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_delete_cascades_to_project_data() {
        contract::delete_cascades_to_project_data(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_data_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("lookalike.db");

        let project_id = {
            let store = SqliteStore::open(&db_path).unwrap();
            let project = store.create_project("shoot", "/data/source", &[]).unwrap();
            store
                .insert_source_records(&project.id, &[contract::record("a.png", u64::MAX - 7)])
                .unwrap();
            project.id
        };

        let store = SqliteStore::open(&db_path).unwrap();
        assert_eq!(store.get_project(&project_id).unwrap().name, "shoot");
        let records = store.source_records(&project_id, None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fingerprint.perceptual_hash, u64::MAX - 7);
    }

    #[test]
    fn test_corrupt_hash_is_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        let project = store.create_project("shoot", "/data/source", &[]).unwrap();
        store
            .insert_source_records(&project.id, &[contract::record("a.png", 1)])
            .unwrap();
        store
            .conn()
            .execute("UPDATE source_records SET perceptual_hash = 'zz'", [])
            .unwrap();

        assert!(matches!(
            store.source_records(&project.id, None),
            Err(DatabaseError::Invalid(_))
        ));
    }
}

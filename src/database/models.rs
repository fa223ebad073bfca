use crate::core::fingerprint::Fingerprint;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub fn now() -> String {
    Utc::now().to_rfc3339()
}

// Project models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub source_path: String,
    pub status: ProjectStatus,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTargetGroup {
    pub name: String,
    pub path: String,
}

// Image records, shared by sources (owner = project) and targets (owner = group)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub owner_id: String,
    pub relative_path: String,
    pub absolute_path: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub fingerprint: Fingerprint,
    pub status: RecordStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewImageRecord {
    pub relative_path: String,
    pub absolute_path: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub fingerprint: Fingerprint,
}

impl NewImageRecord {
    pub fn into_record(self, owner_id: &str, prefix: &str) -> ImageRecord {
        ImageRecord {
            id: new_id(prefix),
            owner_id: owner_id.to_string(),
            relative_path: self.relative_path,
            absolute_path: self.absolute_path,
            width: self.width,
            height: self.height,
            size_bytes: self.size_bytes,
            fingerprint: self.fingerprint,
            status: RecordStatus::Indexed,
        }
    }
}

// Candidate models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    pub id: String,
    pub source_id: String,
    pub group_id: String,
    pub file_path: String,
    pub similarity_score: f64,
    pub rank: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCandidate {
    pub source_id: String,
    pub group_id: String,
    pub file_path: String,
    pub similarity_score: f64,
    pub rank: u32,
    pub width: u32,
    pub height: u32,
}

impl NewCandidate {
    pub fn into_candidate(self) -> CandidateMatch {
        CandidateMatch {
            id: new_id("cand"),
            source_id: self.source_id,
            group_id: self.group_id,
            file_path: self.file_path,
            similarity_score: self.similarity_score,
            rank: self.rank,
            width: self.width,
            height: self.height,
        }
    }
}

// Selection models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub id: String,
    pub source_id: String,
    pub group_id: String,
    pub choice: SelectionChoice,
    pub origin: SelectionOrigin,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionChoice {
    Candidate(String),
    NoMatch,
}

impl SelectionChoice {
    pub fn candidate_id(&self) -> Option<&str> {
        match self {
            SelectionChoice::Candidate(id) => Some(id),
            SelectionChoice::NoMatch => None,
        }
    }
}

// Enums for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectStatus {
    Pending,
    Indexing,
    Indexed,
    Comparing,
    Completed,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Indexing => "indexing",
            ProjectStatus::Indexed => "indexed",
            ProjectStatus::Comparing => "comparing",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Error => "error",
        }
    }
}

impl From<String> for ProjectStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "indexing" => ProjectStatus::Indexing,
            "indexed" => ProjectStatus::Indexed,
            "comparing" => ProjectStatus::Comparing,
            "completed" => ProjectStatus::Completed,
            "error" => ProjectStatus::Error,
            _ => ProjectStatus::Pending,
        }
    }
}

impl From<ProjectStatus> for String {
    fn from(status: ProjectStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Pending,
    Indexed,
    Analyzed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Indexed => "indexed",
            RecordStatus::Analyzed => "analyzed",
        }
    }
}

impl From<String> for RecordStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "indexed" => RecordStatus::Indexed,
            "analyzed" => RecordStatus::Analyzed,
            _ => RecordStatus::Pending,
        }
    }
}

impl From<RecordStatus> for String {
    fn from(status: RecordStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionOrigin {
    Auto,
    User,
}

impl From<String> for SelectionOrigin {
    fn from(s: String) -> Self {
        match s.as_str() {
            "auto" => SelectionOrigin::Auto,
            _ => SelectionOrigin::User,
        }
    }
}

impl From<SelectionOrigin> for String {
    fn from(origin: SelectionOrigin) -> Self {
        match origin {
            SelectionOrigin::Auto => "auto".to_string(),
            SelectionOrigin::User => "user".to_string(),
        }
    }
}

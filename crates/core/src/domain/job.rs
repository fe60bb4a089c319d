// Job Domain Model

use crate::domain::error::{DomainError, Result};
use crate::domain::processor::ProcessorId;
use std::path::Path;

/// Row id in the `jobs` table
pub type JobId = i64;

/// Priority (higher number = higher priority)
pub type Priority = i32;

/// Terminal state of a job, as recorded by the owning processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

impl JobOutcome {
    /// `None` while the job is still unfinished (`success IS NULL`)
    pub fn from_success(success: Option<bool>) -> Option<Self> {
        success.map(|ok| if ok { JobOutcome::Succeeded } else { JobOutcome::Failed })
    }

    /// Suffix used when archiving the artifacts of a finished job
    pub fn archive_tag(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "processed",
            JobOutcome::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Succeeded => write!(f, "SUCCEEDED"),
            JobOutcome::Failed => write!(f, "FAILED"),
        }
    }
}

/// Job Entity (one row of `jobs`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub pathname: String,
    pub uuid: String,
    pub owner: ProcessorId,
    pub priority: Priority,
    pub queued_at: i64,          // epoch ms
    pub started_at: Option<i64>, // set by the owning processor
    pub success: Option<bool>,
}

impl Job {
    pub fn outcome(&self) -> Option<JobOutcome> {
        JobOutcome::from_success(self.success)
    }
}

/// Insert payload for admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub pathname: String,
    pub uuid: String,
    pub owner: ProcessorId,
    pub priority: Priority,
    pub queued_at: i64,
}

/// Projection used by the job cleanup loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalJob {
    pub id: JobId,
    pub pathname: String,
    pub uuid: String,
}

/// Derive the job uuid from the artifact's json file name
///
/// `/root/ab/abc123.json` with suffix `.json` yields `abc123`.
pub fn derive_uuid(artifact: &Path, json_suffix: &str) -> Result<String> {
    let file_name = artifact
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DomainError::MissingFileName(artifact.display().to_string()))?;

    match file_name.strip_suffix(json_suffix) {
        Some(uuid) if !uuid.is_empty() => Ok(uuid.to_string()),
        _ => Err(DomainError::InvalidArtifactName {
            path: artifact.display().to_string(),
            suffix: json_suffix.to_string(),
        }),
    }
}

//! Job records and their status state machine.
//!
//! A Job represents a single deployment attempt. Status moves forward only:
//! pending -> running -> {succeeded | failed}.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::ProjectType;

/// A deployment job record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Durable internal identifier (UUID)
    pub id: String,

    /// Human-friendly identifier, e.g. `dep-1a2b3c4d`
    pub external_id: String,

    /// Current status
    pub status: JobStatus,

    /// When the job was submitted
    pub created_at: DateTime<Utc>,

    /// Last status/result change
    pub updated_at: DateTime<Utc>,

    /// Pipeline parameters as resolved at submission
    pub params: JobParams,

    /// Artifact reference, set on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,

    /// Human-readable failure summary, set on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Number of persisted log events (event history is stored separately)
    #[serde(default)]
    pub event_count: u64,
}

impl Job {
    /// Create a pending job with freshly allocated ids
    pub fn new(params: JobParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            external_id: generate_external_id(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            params,
            result: None,
            failure_reason: None,
            event_count: 0,
        }
    }

    /// Whether `key` names this job by either identifier
    pub fn matches_id(&self, key: &str) -> bool {
        self.id == key || self.external_id == key
    }

    /// Apply an update, enforcing monotonic status transitions
    pub fn apply(&mut self, update: JobUpdate) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(update.status) {
            return Err(InvalidTransition {
                from: self.status,
                to: update.status,
            });
        }

        self.status = update.status;
        if update.result.is_some() {
            self.result = update.result;
        }
        if update.failure_reason.is_some() {
            self.failure_reason = update.failure_reason;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Pipeline parameters captured on the job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParams {
    pub source_ref: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_directory: Option<String>,
    /// Requested or detected project type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_type: Option<ProjectType>,
}

/// Result of a successful deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// Content id of the uploaded artifact
    pub content_id: String,
    /// Public URL where the artifact is served
    pub url: String,
}

/// A status change plus the fields that accompany it
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub failure_reason: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            result: None,
            failure_reason: None,
        }
    }

    pub fn succeeded(result: JobResult) -> Self {
        Self {
            status: JobStatus::Succeeded,
            result: Some(result),
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result: None,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    /// Succeeded and failed are terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Forward-only transitions; a job may fail straight from pending
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Succeeded) | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Generate a short human-friendly id (`dep-` + 8 hex chars)
pub fn generate_external_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("dep-{}", &raw[..8])
}

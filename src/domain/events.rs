//! Log events emitted while a deployment runs.
//!
//! Events are immutable once recorded. Each carries a per-job sequence number
//! assigned by the event logger, so replays and reconnects can be de-duplicated
//! by consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single progress/result message tied to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Owning job (internal id)
    pub job_id: String,

    /// Per-job insertion order, starting at 0
    pub seq: u64,

    /// Severity/category of the message
    #[serde(rename = "type")]
    pub kind: LogKind,

    /// Human-readable message (NO secrets)
    pub message: String,

    /// When the event was recorded; non-decreasing within a job
    pub timestamp: DateTime<Utc>,

    /// Explicit completion marker, set only on the job's final event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<Outcome>,
}

impl LogEvent {
    /// Create a new event stamped with the current time
    pub fn new(job_id: impl Into<String>, seq: u64, kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            seq,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            terminal: None,
        }
    }

    /// Mark this event as the job's terminal event
    pub fn with_terminal(mut self, outcome: Outcome) -> Self {
        self.terminal = Some(outcome);
        self
    }

    /// Resolve whether this event ends the job's stream.
    ///
    /// The explicit marker always wins. With `legacy_matching` enabled, message
    /// text is also inspected the way older producers signalled completion.
    /// Substring matching is deprecated and off by default.
    pub fn completion_outcome(&self, legacy_matching: bool) -> Option<Outcome> {
        if self.terminal.is_some() {
            return self.terminal;
        }
        if !legacy_matching {
            return None;
        }

        let message = self.message.to_lowercase();
        match self.kind {
            LogKind::Success if message.contains("completed successfully") => {
                Some(Outcome::Succeeded)
            }
            LogKind::Error if message.contains("failed") => Some(Outcome::Failed),
            _ => None,
        }
    }
}

/// Category of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Error,
    Success,
}

/// How a job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    /// The event kind used for the completion frame
    pub fn kind(self) -> LogKind {
        match self {
            Outcome::Succeeded => LogKind::Success,
            Outcome::Failed => LogKind::Error,
        }
    }
}

/// Synthetic event delivered to subscribers when a job finishes.
///
/// Serialized as `{type, message, timestamp}` in the `completion` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl CompletionEvent {
    /// Build the completion event for a job that ended with `outcome`, echoing
    /// the terminal event's message
    pub fn for_outcome(outcome: Outcome, detail: &str) -> Self {
        let message = match (outcome, detail.trim()) {
            (Outcome::Succeeded, "") => "Deployment completed".to_string(),
            (Outcome::Failed, "") => "Deployment failed".to_string(),
            (_, detail) => detail.to_string(),
        };
        Self {
            kind: outcome.kind(),
            message,
            timestamp: Utc::now(),
        }
    }
}

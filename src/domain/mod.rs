//! Domain types for the deployment service.
//!
//! This module contains the core data structures:
//! - Job: A deployment attempt and its status state machine
//! - LogEvent: Timestamped progress messages tied to a job
//! - DeployRequest: Submission input and validation

pub mod events;
pub mod job;
pub mod request;

// Re-export commonly used types
pub use events::{CompletionEvent, LogEvent, LogKind, Outcome};
pub use job::{InvalidTransition, Job, JobParams, JobResult, JobStatus, JobUpdate};
pub use request::{DeployRequest, ProjectType, SourceRef};

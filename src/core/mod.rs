//! Core orchestration logic.
//!
//! This module contains:
//! - JobStore: durable job records and event history
//! - EventLogger: broadcast-then-batch event recording
//! - BroadcastHub: per-job fan-out with replay
//! - ReconciliationSweeper: persists events that beat their job record
//! - Orchestrator: the deployment pipeline

pub mod background;
pub mod hub;
pub mod job_store;
pub mod logger;
pub mod orchestrator;
pub mod pipeline;
pub mod sweeper;

// Re-export commonly used types
pub use background::BackgroundTask;
pub use hub::{BroadcastHub, HubMessage, Subscription};
pub use job_store::{EventPage, FileJobStore, JobStore, MemoryJobStore};
pub use logger::EventLogger;
pub use orchestrator::{Collaborators, Orchestrator, Submission};
pub use pipeline::{BuildPlan, Stage};
pub use sweeper::{ReconciliationSweeper, SweepReport};

//! launchpad - Deployment pipeline runner with live build log streaming
//!
//! Accepts a deployment request (a source reference plus build settings),
//! runs the build-and-publish pipeline in the background and streams progress
//! to any number of observers, whether they attach before, during or after
//! the run.
//!
//! # Architecture
//!
//! - Every progress message is recorded through the `EventLogger`, which
//!   broadcasts it immediately and persists it in batches
//! - The `BroadcastHub` keeps a bounded replay buffer per job, so late
//!   subscribers catch up before switching to live delivery
//! - Events that arrive before their job record exists are held and written
//!   later by the `ReconciliationSweeper`
//!
//! # Modules
//!
//! - `adapters`: External collaborators (git, shell builds, artifact publishing, secrets)
//! - `core`: Orchestration logic (JobStore, EventLogger, BroadcastHub, Sweeper, Orchestrator)
//! - `domain`: Data structures (Job, LogEvent, DeployRequest)
//! - `server`: HTTP API and event stream
//! - `client`: API client with a reconnecting log follower
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start the server
//! launchpad serve
//!
//! # Deploy a repository and watch the build
//! launchpad submit acme/site --branch main --follow
//!
//! # Check a deployment
//! launchpad status dep-1a2b3c4d
//! ```

pub mod adapters;
pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod server;

// Re-export main types at crate root for convenience
pub use core::{BroadcastHub, EventLogger, Orchestrator, ReconciliationSweeper};
pub use domain::{DeployRequest, Job, JobStatus, LogEvent, LogKind};
pub use error::{DeployError, StoreError};

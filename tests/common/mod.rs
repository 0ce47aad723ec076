//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use launchpad::adapters::{
    ArtifactPublisher, BuildOutput, BuildRunner, GitFetcher, LocalPublisher, NoSecrets,
    PublishedArtifact,
};
use launchpad::config::{HubSettings, LoggerSettings, PipelineSettings};
use launchpad::core::{
    BroadcastHub, Collaborators, EventLogger, HubMessage, JobStore, MemoryJobStore, Orchestrator,
};
use launchpad::domain::{CompletionEvent, Job, JobUpdate, LogEvent};
use launchpad::error::StoreError;
use tempfile::TempDir;

pub fn hub_settings() -> HubSettings {
    HubSettings {
        completion_grace_ms: 100,
        ..Default::default()
    }
}

pub fn logger_settings() -> LoggerSettings {
    LoggerSettings {
        batch_size: 5,
        flush_interval_ms: 20,
        ..Default::default()
    }
}

/// A static site on disk
pub fn static_site() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>hello</h1>").unwrap();
    std::fs::write(dir.path().join("style.css"), "h1 { color: red; }").unwrap();
    dir
}

/// Runner that answers every command with the same exit code, optionally slowly
pub struct ScriptedRunner {
    pub exit_code: i32,
    pub delay: Duration,
    pub commands: Mutex<Vec<String>>,
    pub envs: Mutex<Vec<HashMap<String, String>>>,
}

impl ScriptedRunner {
    pub fn succeeding() -> Self {
        Self::with(0, Duration::ZERO)
    }

    pub fn with(exit_code: i32, delay: Duration) -> Self {
        Self {
            exit_code,
            delay,
            commands: Mutex::new(Vec::new()),
            envs: Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildRunner for ScriptedRunner {
    async fn run(&self, command: &str, cwd: &Path, env: &HashMap<String, String>) -> Result<BuildOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        self.envs.lock().unwrap().push(env.clone());
        tokio::time::sleep(self.delay).await;

        if self.exit_code == 0 {
            std::fs::create_dir_all(cwd.join("dist"))?;
            std::fs::write(cwd.join("dist/index.html"), "built")?;
        }
        Ok(BuildOutput {
            exit_code: self.exit_code,
            stdout: format!("running {}\n", command),
            stderr: if self.exit_code == 0 {
                String::new()
            } else {
                "error: module not found\n".to_string()
            },
        })
    }
}

/// Runner that panics mid-build
pub struct PanickingRunner;

#[async_trait]
impl BuildRunner for PanickingRunner {
    async fn run(&self, _command: &str, _cwd: &Path, _env: &HashMap<String, String>) -> Result<BuildOutput> {
        panic!("runner exploded");
    }
}

/// Publisher that always fails
pub struct BrokenPublisher;

#[async_trait]
impl ArtifactPublisher for BrokenPublisher {
    async fn publish(&self, _dir: &Path) -> Result<PublishedArtifact> {
        bail!("storage unavailable")
    }
}

/// Store whose `create` lands late, so early events have no record to go to
pub struct SlowCreateStore {
    pub inner: MemoryJobStore,
    pub delay: Duration,
}

#[async_trait]
impl JobStore for SlowCreateStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.create(job).await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        self.inner.get(id).await
    }

    async fn update_status(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError> {
        self.inner.update_status(id, update).await
    }

    async fn append_events(&self, id: &str, events: &[LogEvent]) -> Result<(), StoreError> {
        self.inner.append_events(id, events).await
    }

    async fn list_events(
        &self,
        id: &str,
        page: usize,
        limit: usize,
    ) -> Result<launchpad::core::EventPage, StoreError> {
        self.inner.list_events(id, page, limit).await
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.inner.list_jobs(limit).await
    }
}

/// Orchestrator wired to in-memory storage and a local artifact directory
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn JobStore>,
    pub workspaces: TempDir,
    pub artifacts: TempDir,
}

impl Harness {
    pub fn new(runner: Arc<dyn BuildRunner>, settings: PipelineSettings) -> Self {
        Self::build(Arc::new(MemoryJobStore::new()), runner, None, settings)
    }

    pub fn build(
        store: Arc<dyn JobStore>,
        runner: Arc<dyn BuildRunner>,
        publisher: Option<Arc<dyn ArtifactPublisher>>,
        settings: PipelineSettings,
    ) -> Self {
        let workspaces = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();

        let hub = BroadcastHub::new(hub_settings());
        let logger = EventLogger::new(store.clone(), hub, logger_settings());
        let publisher = publisher.unwrap_or_else(|| {
            Arc::new(LocalPublisher::new(
                artifacts.path(),
                "http://localhost:8080/artifacts",
            ))
        });

        let collaborators = Collaborators {
            fetcher: Arc::new(GitFetcher::default()),
            runner,
            publisher,
            secrets: Arc::new(NoSecrets),
        };
        let orchestrator = Orchestrator::new(
            store.clone(),
            logger,
            collaborators,
            settings,
            workspaces.path(),
        );

        Self {
            orchestrator,
            store,
            workspaces,
            artifacts,
        }
    }

    /// Follow a job's stream until its completion arrives
    pub async fn wait_for_completion(&self, job_id: &str) -> (Vec<LogEvent>, CompletionEvent) {
        let (mut subscription, mut events) = self.orchestrator.hub().subscribe(job_id);

        let completion = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                match subscription.recv().await {
                    Some(HubMessage::Event(event)) => events.push(event),
                    Some(HubMessage::Completion(completion)) => return completion,
                    Some(HubMessage::Heartbeat) => {}
                    None => panic!("stream closed before completion"),
                }
            }
        })
        .await
        .expect("deployment did not complete in time");

        // The orchestrator drains after the terminal event; make it durable here too
        self.orchestrator.logger().wait_for_flush(job_id).await.unwrap();
        (events, completion)
    }

    pub fn workspace_entries(&self) -> usize {
        std::fs::read_dir(self.workspaces.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

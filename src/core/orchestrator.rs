//! Deployment orchestrator.
//!
//! `submit` validates a request, probes the source, allocates ids and returns
//! straight away. The deployment itself runs on a detached task: it creates the
//! job record, then drives the stages in order. Every stage reports progress
//! through the event logger; the first failure aborts the rest.
//!
//! The build workspace is a temporary directory owned by the running stage
//! future. It is removed when that future finishes, fails, times out or
//! panics, and any child process still running is killed with it.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{
    ArtifactPublisher, BuildOutput, BuildRunner, FileSecretProvider, GitFetcher, HttpSecretProvider,
    LocalPublisher, SecretProvider, ShellRunner, SourceFetcher,
};
use crate::adapters::secrets::render_env_file;
use crate::config::{PipelineSettings, ResolvedConfig};
use crate::domain::{DeployRequest, Job, JobResult, JobStatus, JobUpdate, Outcome, SourceRef};
use crate::error::DeployError;

use super::hub::BroadcastHub;
use super::job_store::JobStore;
use super::logger::EventLogger;
use super::pipeline::{BuildPlan, Stage};

/// External systems a deployment talks to
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub runner: Arc<dyn BuildRunner>,
    pub publisher: Arc<dyn ArtifactPublisher>,
    pub secrets: Arc<dyn SecretProvider>,
}

impl Collaborators {
    /// Production adapters: git, `sh`, local artifact directory, file or HTTP secrets
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let secrets: Arc<dyn SecretProvider> = match &config.secrets_url {
            Some(url) => Arc::new(HttpSecretProvider::new(url.clone(), config.secrets_token.clone())),
            None => Arc::new(FileSecretProvider::new(config.secrets_dir.clone())),
        };

        Self {
            fetcher: Arc::new(GitFetcher::new(
                config.git_token.clone(),
                config.pipeline.probe_timeout(),
            )),
            runner: Arc::new(ShellRunner::new()),
            publisher: Arc::new(LocalPublisher::new(
                config.artifacts_dir(),
                config.artifacts_base_url(),
            )),
            secrets,
        }
    }
}

/// Ids handed back to the submitter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub job_id: String,
    pub external_id: String,
}

struct OrchestratorInner {
    store: Arc<dyn JobStore>,
    logger: EventLogger,
    collaborators: Collaborators,
    settings: PipelineSettings,
    workspaces: PathBuf,
}

/// Runs deployments as detached background tasks
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        logger: EventLogger,
        collaborators: Collaborators,
        settings: PipelineSettings,
        workspaces: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                logger,
                collaborators,
                settings,
                workspaces: workspaces.into(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn logger(&self) -> &EventLogger {
        &self.inner.logger
    }

    pub fn hub(&self) -> &BroadcastHub {
        self.inner.logger.hub()
    }

    /// Validate and start a deployment.
    ///
    /// Returns once ids are allocated; the pipeline continues in the
    /// background. Validation and probe failures are returned before any id
    /// exists.
    #[instrument(skip(self, request), fields(source = %request.source_ref))]
    pub async fn submit(&self, request: DeployRequest) -> Result<Submission, DeployError> {
        let params = request.validate()?;
        let source = SourceRef::parse(&params.source_ref)?;

        let limit = self.inner.settings.probe_timeout();
        match timeout(limit, self.inner.collaborators.fetcher.probe(&source, &params.branch)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(DeployError::Validation(format!("{:#}", e))),
            Err(_) => {
                return Err(DeployError::Validation(format!(
                    "Source probe timed out after {}s",
                    limit.as_secs()
                )))
            }
        }

        let job = Job::new(params);
        let submission = Submission {
            job_id: job.id.clone(),
            external_id: job.external_id.clone(),
        };
        info!(job_id = %job.id, external_id = %job.external_id, "Deployment accepted");

        // May land before the record is committed; the pending set covers that
        self.inner.logger.info(&job.id, "Deployment queued");

        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.run(job).await });

        Ok(submission)
    }

    /// Create the record and run the pipeline, containing any panic
    async fn run(self, job: Job) {
        let job_id = job.id.clone();

        if let Err(e) = self.inner.store.create(&job).await {
            error!(%job_id, error = %e, "Failed to create job record");
            self.inner.logger.record_terminal(
                &job_id,
                Outcome::Failed,
                "Deployment failed: job record could not be created",
            );
            return;
        }

        let worker = self.clone();
        let task = tokio::spawn(async move { worker.execute(job).await });

        if let Err(e) = task.await {
            error!(%job_id, error = %e, "Deployment task aborted");
            let already_finished = matches!(
                self.inner.store.get(&job_id).await,
                Ok(Some(job)) if job.status.is_terminal()
            );
            if !already_finished {
                self.finish_failed(&job_id, "Internal error: deployment aborted unexpectedly")
                    .await;
            }
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn execute(&self, job: Job) {
        let job_id = job.id.as_str();

        if let Err(e) = self
            .inner
            .store
            .update_status(job_id, JobUpdate::status(JobStatus::Running))
            .await
        {
            warn!(error = %e, "Failed to mark job running");
        }
        self.inner.logger.info(job_id, "Deployment started");

        let limit = self.inner.settings.timeout();
        let outcome = match timeout(limit, self.run_stages(&job)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DeployError::Timeout {
                limit_secs: limit.as_secs(),
            }),
        };

        match outcome {
            Ok(result) => self.finish_succeeded(job_id, result).await,
            Err(e) => {
                if matches!(e, DeployError::Timeout { .. }) {
                    self.inner.logger.error(job_id, e.to_string());
                }
                self.finish_failed(job_id, &e.to_string()).await;
            }
        }
    }

    /// Run one stage, reporting entry and exit
    async fn stage<T, F>(&self, job_id: &str, stage: Stage, work: F) -> Result<T, DeployError>
    where
        F: Future<Output = Result<T, DeployError>>,
    {
        let logger = &self.inner.logger;
        logger.info(job_id, format!("{} started", stage));
        let started = Instant::now();

        match work.await {
            Ok(value) => {
                logger.success(
                    job_id,
                    format!("{} done ({:.1}s)", stage, started.elapsed().as_secs_f64()),
                );
                Ok(value)
            }
            Err(e) => {
                logger.error(job_id, e.to_string());
                Err(e)
            }
        }
    }

    async fn run_stages(&self, job: &Job) -> Result<JobResult, DeployError> {
        let job_id = job.id.as_str();
        let params = &job.params;
        let logger = &self.inner.logger;
        let collaborators = &self.inner.collaborators;
        let source = SourceRef::parse(&params.source_ref)?;

        let workspace: TempDir = self
            .stage(job_id, Stage::AcquireWorkspace, async {
                tokio::fs::create_dir_all(&self.inner.workspaces)
                    .await
                    .map_err(|e| DeployError::stage(Stage::AcquireWorkspace, e.to_string()))?;
                tempfile::Builder::new()
                    .prefix("launchpad-")
                    .tempdir_in(&self.inner.workspaces)
                    .map_err(|e| DeployError::stage(Stage::AcquireWorkspace, e.to_string()))
            })
            .await?;
        let src_dir = workspace.path().join("src");
        debug!(workspace = %workspace.path().display(), "Workspace acquired");

        self.stage(job_id, Stage::FetchSource, async {
            logger.info(job_id, format!("Fetching {} ({})", source.location(), params.branch));
            collaborators
                .fetcher
                .fetch(&source, &params.branch, &src_dir)
                .await
                .map_err(|e| DeployError::stage(Stage::FetchSource, format!("{:#}", e)))
        })
        .await?;

        let plan = self
            .stage(job_id, Stage::DetectProject, async {
                let plan = BuildPlan::detect(&src_dir, params).await?;
                logger.info(job_id, format!("Detected {} project", plan.project_type));
                Ok::<_, DeployError>(plan)
            })
            .await?;

        self.stage(job_id, Stage::InstallDependencies, async {
            match &plan.install_command {
                Some(command) => {
                    self.run_command(job_id, Stage::InstallDependencies, command, &src_dir, &HashMap::new())
                        .await
                }
                None => {
                    logger.info(job_id, "No dependencies to install");
                    Ok(())
                }
            }
        })
        .await?;

        let env = self
            .stage(job_id, Stage::InjectSecrets, async {
                let (owner, repo) = source.owner_and_repo();
                let vars = collaborators
                    .secrets
                    .fetch(&owner, &repo)
                    .await
                    .map_err(|e| DeployError::stage(Stage::InjectSecrets, format!("{:#}", e)))?;

                if !vars.is_empty() {
                    tokio::fs::write(src_dir.join(".env"), render_env_file(&vars))
                        .await
                        .map_err(|e| DeployError::stage(Stage::InjectSecrets, e.to_string()))?;
                }
                logger.info(job_id, format!("Injected {} environment variable(s)", vars.len()));
                Ok::<_, DeployError>(vars)
            })
            .await?;

        self.stage(job_id, Stage::Build, async {
            match &plan.build_command {
                Some(command) => self.run_command(job_id, Stage::Build, command, &src_dir, &env).await,
                None => {
                    logger.info(job_id, "No build command, publishing sources as-is");
                    Ok(())
                }
            }
        })
        .await?;

        let output_dir = self
            .stage(job_id, Stage::PrepareOutput, async {
                let dir = plan.resolve_output(&src_dir).await?;
                // Never publish the injected secrets file
                let env_file = dir.join(".env");
                if !env.is_empty() && tokio::fs::try_exists(&env_file).await.unwrap_or(false) {
                    tokio::fs::remove_file(&env_file)
                        .await
                        .map_err(|e| DeployError::stage(Stage::PrepareOutput, e.to_string()))?;
                }
                logger.info(job_id, format!("Using output directory {}", display_relative(&dir, &src_dir)));
                Ok::<_, DeployError>(dir)
            })
            .await?;

        let artifact = self
            .stage(job_id, Stage::UploadArtifact, async {
                collaborators
                    .publisher
                    .publish(&output_dir)
                    .await
                    .map_err(|e| DeployError::stage(Stage::UploadArtifact, format!("{:#}", e)))
            })
            .await?;
        logger.info(job_id, format!("Artifact {}", artifact.content_id));

        drop(workspace);

        Ok(JobResult {
            content_id: artifact.content_id,
            url: artifact.url,
        })
    }

    /// Run an install/build command and echo the tail of its output
    async fn run_command(
        &self,
        job_id: &str,
        stage: Stage,
        command: &str,
        cwd: &std::path::Path,
        env: &HashMap<String, String>,
    ) -> Result<(), DeployError> {
        let logger = &self.inner.logger;
        logger.info(job_id, format!("$ {}", command));

        let output: BuildOutput = self
            .inner
            .collaborators
            .runner
            .run(command, cwd, env)
            .await
            .map_err(|e| DeployError::stage(stage, format!("{:#}", e)))?;

        for line in output.tail(self.inner.settings.output_tail_lines) {
            logger.info(job_id, line);
        }

        if !output.success() {
            let detail = output.last_error_line().unwrap_or("no output");
            return Err(DeployError::stage(
                stage,
                format!("'{}' exited with code {}: {}", command, output.exit_code, detail),
            ));
        }
        Ok(())
    }

    async fn finish_succeeded(&self, job_id: &str, result: JobResult) {
        let logger = &self.inner.logger;
        logger.info(job_id, format!("{} started", Stage::Finalize));

        match self
            .inner
            .store
            .update_status(job_id, JobUpdate::succeeded(result.clone()))
            .await
        {
            Ok(_) => {
                info!(%job_id, url = %result.url, "Deployment succeeded");
                logger.success(job_id, format!("Published at {}", result.url));
                logger.record_terminal(job_id, Outcome::Succeeded, "Deployment completed successfully");
                self.drain(job_id).await;
            }
            Err(e) => {
                error!(%job_id, error = %e, "Failed to record deployment result");
                logger.error(job_id, format!("{} failed: could not record result", Stage::Finalize));
                self.finish_failed(job_id, "Deployment result could not be recorded")
                    .await;
            }
        }
    }

    async fn finish_failed(&self, job_id: &str, reason: &str) {
        warn!(%job_id, %reason, "Deployment failed");
        if let Err(e) = self
            .inner
            .store
            .update_status(job_id, JobUpdate::failed(reason))
            .await
        {
            error!(%job_id, error = %e, "Failed to record job failure");
        }

        self.inner.logger.record_terminal(
            job_id,
            Outcome::Failed,
            format!("Deployment failed: {}", reason),
        );
        self.drain(job_id).await;
    }

    /// Wait until the terminal event is durable
    async fn drain(&self, job_id: &str) {
        match self.inner.logger.wait_for_flush(job_id).await {
            Ok(()) => {
                self.inner.logger.release(job_id);
            }
            Err(e) => {
                warn!(%job_id, error = %e, "Final events held for reconciliation");
            }
        }
    }
}

fn display_relative(dir: &std::path::Path, root: &std::path::Path) -> String {
    match dir.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => dir.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_relative() {
        let root = std::path::Path::new("/ws/src");
        assert_eq!(display_relative(&root.join("dist"), root), "dist");
        assert_eq!(display_relative(root, root), ".");
        assert_eq!(display_relative(std::path::Path::new("/elsewhere"), root), "/elsewhere");
    }
}

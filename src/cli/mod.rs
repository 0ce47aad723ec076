//! Command-line interface for launchpad.
//!
//! `serve` runs the deployment server in-process. Every other command talks to
//! a running server over HTTP.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use crate::client::{DeployClient, ReconnectPolicy, StreamUpdate};
use crate::config;
use crate::domain::{DeployRequest, Job, LogEvent, LogKind, ProjectType};

/// launchpad - Deployment pipeline runner with live build logs
#[derive(Parser, Debug)]
#[command(name = "launchpad")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Server base URL for client commands
    #[arg(long, global = true, env = "LAUNCHPAD_SERVER", default_value = "http://127.0.0.1:8080")]
    pub server: String,

    /// API token for client commands
    #[arg(long, global = true, env = "LAUNCHPAD_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the deployment server
    Serve {
        /// Address to bind to (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Submit a deployment
    Submit {
        /// Git URL, owner/repo shorthand, or local directory
        source_ref: String,

        /// Branch to deploy
        #[arg(short, long, default_value = "main")]
        branch: String,

        /// Build command (detected if not specified)
        #[arg(long)]
        build_command: Option<String>,

        /// Output directory relative to the project root
        #[arg(long)]
        output_dir: Option<String>,

        /// Project type (detected if not specified)
        #[arg(long, value_enum)]
        project_type: Option<ProjectTypeArg>,

        /// Stream the build log until the deployment finishes
        #[arg(short, long)]
        follow: bool,
    },

    /// Show a deployment
    Status {
        /// Deployment id (internal or dep-xxxxxxxx)
        id: String,
    },

    /// List recent deployments
    Jobs {
        /// Maximum number of deployments to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print persisted log events
    Logs {
        /// Deployment id
        id: String,

        #[arg(short, long, default_value = "1")]
        page: usize,

        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Stream a deployment's log until it finishes
    Follow {
        /// Deployment id
        id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Project type for CLI (maps to ProjectType)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ProjectTypeArg {
    Node,
    Static,
    Other,
}

impl From<ProjectTypeArg> for ProjectType {
    fn from(t: ProjectTypeArg) -> Self {
        match t {
            ProjectTypeArg::Node => ProjectType::Node,
            ProjectTypeArg::Static => ProjectType::Static,
            ProjectTypeArg::Other => ProjectType::Other,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let client = DeployClient::new(&self.server, self.token.clone());

        match self.command {
            Commands::Serve { bind } => {
                let cfg = config::config()?;
                crate::server::serve(cfg, bind).await
            }
            Commands::Submit {
                source_ref,
                branch,
                build_command,
                output_dir,
                project_type,
                follow,
            } => {
                let request = DeployRequest {
                    source_ref,
                    branch,
                    build_command,
                    output_directory: output_dir,
                    project_type: project_type.map(Into::into),
                };
                submit(&client, request, follow).await
            }
            Commands::Status { id } => show_status(&client, &id).await,
            Commands::Jobs { limit } => list_jobs(&client, limit).await,
            Commands::Logs { id, page, limit } => show_logs(&client, &id, page, limit).await,
            Commands::Follow { id } => follow(&client, &id).await,
            Commands::Config => show_config(),
        }
    }
}

async fn submit(client: &DeployClient, request: DeployRequest, follow_log: bool) -> Result<()> {
    let submission = client.submit(&request).await?;

    println!("Deployment queued");
    println!("  Job ID:      {}", submission.job_id);
    println!("  External ID: {}", submission.external_id);

    if follow_log {
        println!();
        follow(client, &submission.job_id).await?;
    }
    Ok(())
}

fn print_event(event: &LogEvent) {
    let marker = match event.kind {
        LogKind::Info => " ",
        LogKind::Success => "+",
        LogKind::Error => "!",
    };
    println!("{} {} {}", event.timestamp.format("%H:%M:%S"), marker, event.message);
}

async fn follow(client: &DeployClient, id: &str) -> Result<()> {
    let completion = client
        .follow(id, &ReconnectPolicy::default(), |update| {
            if let StreamUpdate::Event(event) = update {
                print_event(event);
            }
        })
        .await?;

    println!();
    println!("{}", completion.message);

    let job = client.get_job(id).await?;
    if let Some(result) = &job.result {
        println!("URL: {}", result.url);
    }
    if job.status == crate::domain::JobStatus::Failed {
        anyhow::bail!("Deployment {} failed", job.external_id);
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!("Job ID:      {}", job.id);
    println!("External ID: {}", job.external_id);
    println!("Status:      {}", job.status);
    println!("Source:      {} ({})", job.params.source_ref, job.params.branch);
    if let Some(project_type) = job.params.project_type {
        println!("Project:     {}", project_type);
    }
    println!("Created:     {}", job.created_at);
    println!("Updated:     {}", job.updated_at);
    if let Some(result) = &job.result {
        println!("Content ID:  {}", result.content_id);
        println!("URL:         {}", result.url);
    }
    if let Some(reason) = &job.failure_reason {
        println!("Failure:     {}", reason);
    }
    println!("Events:      {}", job.event_count);
}

async fn show_status(client: &DeployClient, id: &str) -> Result<()> {
    let job = client.get_job(id).await?;
    print_job(&job);
    Ok(())
}

async fn list_jobs(client: &DeployClient, limit: usize) -> Result<()> {
    let jobs = client.list_jobs(limit).await?;

    if jobs.is_empty() {
        println!("No deployments found");
        return Ok(());
    }

    println!("{:<14} {:<11} {:<21} {}", "ID", "STATUS", "CREATED", "SOURCE");
    println!("{}", "-".repeat(80));

    for job in jobs {
        println!(
            "{:<14} {:<11} {:<21} {}",
            job.external_id,
            job.status,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.params.source_ref
        );
    }

    Ok(())
}

async fn show_logs(client: &DeployClient, id: &str, page: usize, limit: usize) -> Result<()> {
    let page = client.logs(id, page, limit).await?;

    for event in &page.events {
        print_event(event);
    }

    let pages = page.total.div_ceil(page.limit.max(1)).max(1);
    println!();
    println!("Page {}/{} ({} events)", page.page, pages, page.total);
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Launchpad Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Jobs:       {}", cfg.jobs_dir().display());
    println!("  Artifacts:  {}", cfg.artifacts_dir().display());
    println!("  Workspaces: {}", cfg.workspaces.display());
    println!("  Secrets:    {}", cfg.secrets_url.as_deref().map(str::to_string).unwrap_or_else(|| cfg.secrets_dir.display().to_string()));
    println!();
    println!("Server:");
    println!("  Bind:       {}", cfg.bind);
    println!("  Public URL: {}", cfg.public_url);
    println!("  Auth:       {}", if cfg.api_tokens.is_empty() { "disabled" } else { "enabled" });
    println!();
    println!("Event logger:");
    println!("  Batch size:     {}", cfg.logger.batch_size);
    println!("  Flush interval: {}ms", cfg.logger.flush_interval_ms);
    println!("  Pending TTL:    {}s", cfg.logger.pending_ttl_secs);
    println!();
    println!("Broadcast hub:");
    println!("  Replay buffer:  {} events", cfg.hub.replay_capacity);
    println!("  Heartbeat:      {}s", cfg.hub.heartbeat_interval_secs);
    println!("  Close grace:    {}ms", cfg.hub.completion_grace_ms);
    println!("  Legacy matching: {}", cfg.hub.legacy_completion_matching);
    println!();
    println!("Sweeper interval: {}ms", cfg.sweeper.interval_ms);
    println!("Pipeline timeout: {}s", cfg.pipeline.timeout_secs);

    Ok(())
}

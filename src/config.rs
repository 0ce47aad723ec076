//! Configuration for the deployment service.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LAUNCHPAD_HOME, LAUNCHPAD_BIND, LAUNCHPAD_API_TOKENS,
//!    LAUNCHPAD_GIT_TOKEN, LAUNCHPAD_PUBLIC_URL)
//! 2. Config file (.launchpad/config.yaml)
//! 3. Defaults (~/.launchpad)
//!
//! Config file discovery:
//! - Searches current directory and parents for .launchpad/config.yaml
//! - Relative paths in the config file resolve against the .launchpad/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub logger: Option<LoggerSettings>,
    #[serde(default)]
    pub hub: Option<HubSettings>,
    #[serde(default)]
    pub sweeper: Option<SweeperSettings>,
    #[serde(default)]
    pub pipeline: Option<PipelineSettings>,
    #[serde(default)]
    pub secrets: Option<SecretsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (job records, artifacts)
    pub home: Option<String>,
    /// Where build workspaces are created (defaults to the system temp dir)
    pub workspaces: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
    /// Base URL under which published artifacts are reachable
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    /// Directory holding `<owner>/<repo>.env` files
    pub dir: Option<String>,
    /// Remote secret provider base URL (takes precedence over `dir`)
    pub url: Option<String>,
    pub token: Option<String>,
}

/// Event logger batching
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerSettings {
    /// Flush when this many events are waiting
    pub batch_size: usize,
    /// Flush at most this long after the first unflushed event
    pub flush_interval_ms: u64,
    /// Drop pending events whose job never appears after this long
    pub pending_ttl_secs: u64,
    /// Per-job cap on events waiting for their job record
    pub max_pending_per_job: usize,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            flush_interval_ms: 1000,
            pending_ttl_secs: 600,
            max_pending_per_job: 10_000,
        }
    }
}

impl LoggerSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

/// Broadcast hub buffering and liveness
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Events kept per job for late subscribers (oldest dropped)
    pub replay_capacity: usize,
    /// Outbound queue size per subscriber
    pub queue_capacity: usize,
    /// Consecutive full-queue deliveries before a subscriber is dropped
    pub max_full_strikes: u32,
    pub heartbeat_interval_secs: u64,
    /// Delay between completion and force-closing subscriptions
    pub completion_grace_ms: u64,
    /// How long a completed job's replay buffer is kept
    pub retention_secs: u64,
    /// Deprecated: also detect completion from message text
    pub legacy_completion_matching: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            replay_capacity: 100,
            queue_capacity: 256,
            max_full_strikes: 3,
            heartbeat_interval_secs: 15,
            completion_grace_ms: 2000,
            retention_secs: 300,
            legacy_completion_matching: false,
        }
    }
}

impl HubSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        // tokio intervals reject a zero period
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweeperSettings {
    pub interval_ms: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self { interval_ms: 5000 }
    }
}

impl SweeperSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Pipeline execution limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Wall-clock budget for the whole pipeline
    pub timeout_secs: u64,
    /// Lines of captured install/build output echoed as events
    pub output_tail_lines: usize,
    /// Bound on the synchronous source probe at submission
    pub probe_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 900,
            output_tail_lines: 20,
            probe_timeout_secs: 20,
        }
    }
}

impl PipelineSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// Parent directory for build workspaces
    pub workspaces: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub bind: String,
    pub public_url: String,
    /// Accepted API tokens; empty disables auth
    pub api_tokens: Vec<String>,
    pub git_token: Option<String>,
    pub secrets_dir: PathBuf,
    pub secrets_url: Option<String>,
    pub secrets_token: Option<String>,
    pub logger: LoggerSettings,
    pub hub: HubSettings,
    pub sweeper: SweeperSettings,
    pub pipeline: PipelineSettings,
}

impl ResolvedConfig {
    /// Job records directory
    pub fn jobs_dir(&self) -> PathBuf {
        self.home.join("jobs")
    }

    /// Published artifacts directory
    pub fn artifacts_dir(&self) -> PathBuf {
        self.home.join("artifacts")
    }

    /// Base URL for artifact links
    pub fn artifacts_base_url(&self) -> String {
        format!("{}/artifacts", self.public_url.trim_end_matches('/'))
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".launchpad").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Split a comma-separated token list, ignoring blanks
fn parse_token_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Merge a parsed config file with environment overrides
fn resolve(config: ConfigFile, config_file: Option<PathBuf>, default_home: PathBuf) -> ResolvedConfig {
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let home = if let Ok(env_home) = std::env::var("LAUNCHPAD_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = config.paths.home {
        resolve_path(&config_dir, home_path)
    } else {
        default_home
    };

    let workspaces = config
        .paths
        .workspaces
        .as_deref()
        .map(|p| resolve_path(&config_dir, p))
        .unwrap_or_else(std::env::temp_dir);

    let server = config.server.unwrap_or(ServerConfig {
        bind: None,
        public_url: None,
    });
    let bind = std::env::var("LAUNCHPAD_BIND")
        .ok()
        .or(server.bind)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let public_url = std::env::var("LAUNCHPAD_PUBLIC_URL")
        .ok()
        .or(server.public_url)
        .unwrap_or_else(|| format!("http://{}", bind));

    let api_tokens = match std::env::var("LAUNCHPAD_API_TOKENS") {
        Ok(raw) => parse_token_list(&raw),
        Err(_) => config.auth.map(|a| a.tokens).unwrap_or_default(),
    };

    let secrets = config.secrets.unwrap_or(SecretsConfig {
        dir: None,
        url: None,
        token: None,
    });
    let secrets_dir = secrets
        .dir
        .as_deref()
        .map(|p| resolve_path(&config_dir, p))
        .unwrap_or_else(|| home.join("secrets"));

    ResolvedConfig {
        workspaces,
        config_file,
        bind,
        public_url,
        api_tokens,
        git_token: std::env::var("LAUNCHPAD_GIT_TOKEN").ok(),
        secrets_dir,
        secrets_url: secrets.url,
        secrets_token: secrets.token,
        logger: config.logger.unwrap_or_default(),
        hub: config.hub.unwrap_or_default(),
        sweeper: config.sweeper.unwrap_or_default(),
        pipeline: config.pipeline.unwrap_or_default(),
        home,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".launchpad");

    let config_file = find_config_file();
    let config = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(config, config_file, default_home))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(".launchpad");
        std::fs::create_dir_all(&config_dir).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  home: ./state
server:
  bind: 0.0.0.0:9000
auth:
  tokens: [alpha, beta]
logger:
  batch_size: 5
hub:
  replay_capacity: 10
  legacy_completion_matching: true
sweeper:
  interval_ms: 250
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.paths.home.as_deref(), Some("./state"));
        assert_eq!(config.auth.as_ref().unwrap().tokens, vec!["alpha", "beta"]);

        let logger = config.logger.clone().unwrap();
        assert_eq!(logger.batch_size, 5);
        // Unspecified fields keep their defaults
        assert_eq!(logger.flush_interval_ms, 1000);

        let hub = config.hub.clone().unwrap();
        assert_eq!(hub.replay_capacity, 10);
        assert!(hub.legacy_completion_matching);
        assert_eq!(hub.completion_grace_ms, 2000);

        assert_eq!(config.sweeper.as_ref().unwrap().interval_ms, 250);
    }

    #[test]
    fn test_defaults() {
        let hub = HubSettings::default();
        assert_eq!(hub.replay_capacity, 100);
        assert_eq!(hub.completion_grace(), Duration::from_secs(2));
        assert!(!hub.legacy_completion_matching);

        let pipeline = PipelineSettings::default();
        assert_eq!(pipeline.timeout(), Duration::from_secs(900));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let sweeper: SweeperSettings = serde_yaml::from_str("interval_ms: 0").unwrap();
        assert_eq!(sweeper.interval(), Duration::from_millis(1));

        let hub: HubSettings = serde_yaml::from_str("heartbeat_interval_secs: 0").unwrap();
        assert_eq!(hub.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_token_list_parsing() {
        assert_eq!(parse_token_list("a, b,,c "), vec!["a", "b", "c"]);
        assert!(parse_token_list(" , ").is_empty());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.launchpad");

        assert_eq!(
            resolve_path(&base, "./state"),
            PathBuf::from("/home/user/project/.launchpad/state")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }

    #[test]
    fn test_derived_paths() {
        let resolved = resolve(
            ConfigFile {
                server: Some(ServerConfig {
                    bind: Some("127.0.0.1:9999".to_string()),
                    public_url: Some("https://deploy.example.com/".to_string()),
                }),
                ..Default::default()
            },
            None,
            PathBuf::from("/srv/launchpad"),
        );

        if std::env::var("LAUNCHPAD_HOME").is_err() {
            assert_eq!(resolved.jobs_dir(), PathBuf::from("/srv/launchpad/jobs"));
            assert_eq!(resolved.secrets_dir, PathBuf::from("/srv/launchpad/secrets"));
        }
        if std::env::var("LAUNCHPAD_PUBLIC_URL").is_err() {
            assert_eq!(
                resolved.artifacts_base_url(),
                "https://deploy.example.com/artifacts"
            );
        }
    }
}

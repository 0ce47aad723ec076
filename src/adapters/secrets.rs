//! Secret providers.
//!
//! Secrets are keyed by repository owner and name. Values are handed to build
//! subprocesses only; callers must never log them.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::SecretProvider;

/// Provider used when no secret store is configured
pub struct NoSecrets;

#[async_trait]
impl SecretProvider for NoSecrets {
    async fn fetch(&self, _owner: &str, _repo: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// Reads `<dir>/<owner>/<repo>.env` files
pub struct FileSecretProvider {
    dir: PathBuf,
}

impl FileSecretProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty() && segment != "." && segment != ".." && !segment.contains(['/', '\\'])
}

/// Parse dotenv-style `KEY=value` lines
pub fn parse_env_file(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }

            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Render variables as a `.env` file, keys sorted
pub fn render_env_file(vars: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = vars.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|k| format!("{}={}\n", k, quote_env_value(&vars[k])))
        .collect()
}

fn quote_env_value(value: &str) -> String {
    if value.chars().any(|c| c.is_whitespace() || c == '#' || c == '"') {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    async fn fetch(&self, owner: &str, repo: &str) -> Result<HashMap<String, String>> {
        if !is_safe_segment(owner) || !is_safe_segment(repo) {
            anyhow::bail!("Invalid repository name: {}/{}", owner, repo);
        }

        let path = self.dir.join(owner).join(format!("{}.env", repo));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(parse_env_file(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read secrets file {}", path.display())),
        }
    }
}

/// Fetches secrets from an HTTP service: `GET <url>/<owner>/<repo>` returning a JSON object
pub struct HttpSecretProvider {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpSecretProvider {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SecretProvider for HttpSecretProvider {
    async fn fetch(&self, owner: &str, repo: &str) -> Result<HashMap<String, String>> {
        let mut request = self
            .client
            .get(format!("{}/{}/{}", self.endpoint, owner, repo))
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.context("Failed to reach secret store")?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(HashMap::new());
        }
        if !status.is_success() {
            // Body is not echoed; it may contain secret material
            anyhow::bail!("Secret store error ({})", status);
        }

        let body: HashMap<String, serde_json::Value> = response
            .json()
            .await
            .context("Secret store returned an invalid response")?;

        Ok(body
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect())
    }
}

//! Adapter interfaces for external systems.
//!
//! The orchestrator talks to source hosting, the build toolchain, artifact
//! storage and the secret store only through these traits, so each can be
//! replaced (or faked in tests) independently.

pub mod git;
pub mod publish;
pub mod secrets;
pub mod shell;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::SourceRef;

pub use git::GitFetcher;
pub use publish::LocalPublisher;
pub use secrets::{FileSecretProvider, HttpSecretProvider, NoSecrets};
pub use shell::ShellRunner;

/// Retrieves source trees
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Cheap reachability check used at submission time
    async fn probe(&self, source: &SourceRef, branch: &str) -> Result<()>;

    /// Materialize the source at `branch` into the empty directory `dest`
    async fn fetch(&self, source: &SourceRef, branch: &str, dest: &Path) -> Result<()>;
}

/// Captured result of a build or install command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl BuildOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `n` non-empty lines across stdout then stderr
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines: Vec<&str> = self
            .stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .collect();
        let skip = lines.len().saturating_sub(n);
        lines[skip..].iter().map(|l| l.to_string()).collect()
    }

    /// Last non-empty stderr line, falling back to stdout
    pub fn last_error_line(&self) -> Option<&str> {
        fn last_line(s: &str) -> Option<&str> {
            s.lines().rev().map(str::trim).find(|l| !l.is_empty())
        }
        last_line(&self.stderr).or_else(|| last_line(&self.stdout))
    }
}

/// Runs shell commands inside a workspace
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(&self, command: &str, cwd: &Path, env: &HashMap<String, String>) -> Result<BuildOutput>;
}

/// A published, content-addressed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedArtifact {
    pub content_id: String,
    pub url: String,
}

/// Uploads build output
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(&self, dir: &Path) -> Result<PublishedArtifact>;
}

/// Supplies deployment-time environment variables for a repository
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn fetch(&self, owner: &str, repo: &str) -> Result<HashMap<String, String>>;
}

/// Recursively copy `src` into `dst`, skipping the named top-level entries.
///
/// Blocking; call from `spawn_blocking`.
pub(crate) fn copy_tree(src: &Path, dst: &Path, skip: &[&str]) -> std::io::Result<u64> {
    std::fs::create_dir_all(dst)?;
    let mut copied = 0;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if skip.iter().any(|s| name.as_os_str() == *s) {
            continue;
        }

        let file_type = entry.file_type()?;
        let target = dst.join(&name);
        if file_type.is_dir() {
            copied += copy_tree(&entry.path(), &target, &[])?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
        // Symlinks are not followed
    }

    Ok(copied)
}

//! Shell command runner for install and build steps.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use super::{BuildOutput, BuildRunner};

/// Runs commands through `sh -c`
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

#[async_trait]
impl BuildRunner for ShellRunner {
    async fn run(&self, command: &str, cwd: &Path, env: &HashMap<String, String>) -> Result<BuildOutput> {
        // The child is killed if the deployment is cancelled or times out
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .envs(env)
            .env("CI", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn '{}'", command))?;

        Ok(BuildOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

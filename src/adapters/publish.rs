//! Content-addressed artifact publishing to a local directory.
//!
//! The content id is a SHA-256 over every file's relative path and bytes, in
//! sorted path order, so identical output always maps to the same location.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{copy_tree, ArtifactPublisher, PublishedArtifact};

/// Publishes artifacts under `<root>/<content-id>/`, served at `<base_url>/<content-id>/`
pub struct LocalPublisher {
    root: PathBuf,
    base_url: String,
}

impl LocalPublisher {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Relative paths of all regular files under `dir`, sorted
fn collect_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    fn walk(base: &Path, current: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                walk(base, &path, out)?;
            } else if file_type.is_file() {
                if let Ok(relative) = path.strip_prefix(base) {
                    out.push(relative.to_path_buf());
                }
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(dir, dir, &mut files)?;
    files.sort();
    Ok(files)
}

/// Compute the `sha256-<hex>` content id of a directory tree
pub fn content_id(dir: &Path) -> Result<String> {
    let files = collect_files(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    if files.is_empty() {
        anyhow::bail!("Output directory is empty: {}", dir.display());
    }

    let mut hasher = Sha256::new();
    for relative in &files {
        let bytes = std::fs::read(dir.join(relative))
            .with_context(|| format!("Failed to read {}", relative.display()))?;
        hasher.update(relative.to_string_lossy().replace('\\', "/").as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }

    Ok(format!("sha256-{}", hex::encode(hasher.finalize())))
}

fn publish_blocking(root: &Path, dir: &Path) -> Result<String> {
    let cid = content_id(dir)?;
    let target = root.join(&cid);
    if target.is_dir() {
        tracing::debug!(content_id = %cid, "Artifact already published");
        return Ok(cid);
    }

    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create artifact root {}", root.display()))?;

    // Stage next to the target, then rename into place
    let staging = root.join(format!(".staging-{}", uuid::Uuid::new_v4()));
    copy_tree(dir, &staging, &[]).context("Failed to copy artifact")?;
    if let Err(e) = std::fs::rename(&staging, &target) {
        let _ = std::fs::remove_dir_all(&staging);
        if !target.is_dir() {
            return Err(e).context("Failed to move artifact into place");
        }
    }

    Ok(cid)
}

#[async_trait]
impl ArtifactPublisher for LocalPublisher {
    async fn publish(&self, dir: &Path) -> Result<PublishedArtifact> {
        let root = self.root.clone();
        let dir = dir.to_path_buf();
        let content_id = tokio::task::spawn_blocking(move || publish_blocking(&root, &dir))
            .await
            .context("Publish task failed")??;

        Ok(PublishedArtifact {
            url: format!("{}/{}/", self.base_url, content_id),
            content_id,
        })
    }
}

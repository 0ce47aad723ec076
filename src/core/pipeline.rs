//! Deployment stages and build planning.
//!
//! A deployment runs a fixed sequence of stages. The build plan decides, from
//! the fetched source tree and the request parameters, which install and build
//! commands run and where the deployable output is expected.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{JobParams, ProjectType};
use crate::error::DeployError;

/// Output directories tried, in order, for node projects
pub const NODE_OUTPUT_CANDIDATES: &[&str] = &["dist", "build", "out", "public"];

const NODE_LOCK_FILES: &[&str] = &["package-lock.json", "npm-shrinkwrap.json"];

/// Stages of a deployment, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AcquireWorkspace,
    FetchSource,
    DetectProject,
    InstallDependencies,
    InjectSecrets,
    Build,
    PrepareOutput,
    UploadArtifact,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::AcquireWorkspace,
        Stage::FetchSource,
        Stage::DetectProject,
        Stage::InstallDependencies,
        Stage::InjectSecrets,
        Stage::Build,
        Stage::PrepareOutput,
        Stage::UploadArtifact,
        Stage::Finalize,
    ];

    /// Human-readable stage name used in events and errors
    pub fn label(self) -> &'static str {
        match self {
            Stage::AcquireWorkspace => "Workspace setup",
            Stage::FetchSource => "Source fetch",
            Stage::DetectProject => "Project detection",
            Stage::InstallDependencies => "Dependency install",
            Stage::InjectSecrets => "Secret injection",
            Stage::Build => "Build",
            Stage::PrepareOutput => "Output preparation",
            Stage::UploadArtifact => "Artifact upload",
            Stage::Finalize => "Finalization",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// What to run and where to look for output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub project_type: ProjectType,

    pub install_command: Option<String>,

    pub build_command: Option<String>,

    /// Explicit output directory; `None` means search the defaults after building
    pub output_directory: Option<String>,
}

impl BuildPlan {
    /// Inspect the source tree and combine it with the request parameters.
    ///
    /// An explicit project type, build command or output directory always wins
    /// over what the tree suggests.
    pub async fn detect(root: &Path, params: &JobParams) -> Result<Self, DeployError> {
        let project_type = match params.project_type {
            Some(explicit) => explicit,
            None => detect_project_type(root).await,
        };

        let plan = match project_type {
            ProjectType::Node => {
                let manifest = read_manifest(root).await?;
                let has_lock = futures::future::join_all(
                    NODE_LOCK_FILES.iter().map(|f| tokio::fs::try_exists(root.join(f))),
                )
                .await
                .into_iter()
                .any(|exists| exists.unwrap_or(false));

                let default_build = manifest
                    .as_ref()
                    .and_then(|m| m.get("scripts"))
                    .and_then(|s| s.get("build"))
                    .map(|_| "npm run build".to_string());

                BuildPlan {
                    project_type,
                    install_command: Some(if has_lock { "npm ci" } else { "npm install" }.to_string()),
                    build_command: params.build_command.clone().or(default_build),
                    output_directory: params.output_directory.clone(),
                }
            }
            ProjectType::Static => BuildPlan {
                project_type,
                install_command: None,
                build_command: params.build_command.clone(),
                output_directory: Some(params.output_directory.clone().unwrap_or_else(|| ".".to_string())),
            },
            ProjectType::Other => {
                let (Some(build), Some(output)) = (&params.build_command, &params.output_directory) else {
                    return Err(DeployError::stage(
                        Stage::DetectProject,
                        "Unrecognized project: a build command and output directory are required",
                    ));
                };
                BuildPlan {
                    project_type,
                    install_command: None,
                    build_command: Some(build.clone()),
                    output_directory: Some(output.clone()),
                }
            }
        };

        Ok(plan)
    }

    /// Locate the directory to publish once the build has run
    pub async fn resolve_output(&self, root: &Path) -> Result<PathBuf, DeployError> {
        let candidates: Vec<&str> = match &self.output_directory {
            Some(dir) => vec![dir.as_str()],
            None => NODE_OUTPUT_CANDIDATES.to_vec(),
        };

        for candidate in &candidates {
            let relative = Path::new(candidate);
            if relative.is_absolute()
                || relative.components().any(|c| matches!(c, Component::ParentDir))
            {
                return Err(DeployError::stage(
                    Stage::PrepareOutput,
                    format!("Output directory must stay inside the project: {}", candidate),
                ));
            }

            let path = root.join(relative);
            if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
                return Ok(path);
            }
        }

        Err(DeployError::stage(
            Stage::PrepareOutput,
            format!("Output directory not found (looked for: {})", candidates.join(", ")),
        ))
    }
}

/// Guess the project type from marker files
pub async fn detect_project_type(root: &Path) -> ProjectType {
    if tokio::fs::try_exists(root.join("package.json")).await.unwrap_or(false) {
        ProjectType::Node
    } else if tokio::fs::try_exists(root.join("index.html")).await.unwrap_or(false) {
        ProjectType::Static
    } else {
        ProjectType::Other
    }
}

async fn read_manifest(root: &Path) -> Result<Option<serde_json::Value>, DeployError> {
    let path = root.join("package.json");
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(DeployError::stage(
                Stage::DetectProject,
                format!("Failed to read package.json: {}", e),
            ))
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| DeployError::stage(Stage::DetectProject, format!("Invalid package.json: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params() -> JobParams {
        JobParams {
            source_ref: "https://example.com/acme/site.git".to_string(),
            branch: "main".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_node_with_lock_and_build_script() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"site","scripts":{"build":"vite build"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();

        let plan = BuildPlan::detect(dir.path(), &params()).await.unwrap();
        assert_eq!(plan.project_type, ProjectType::Node);
        assert_eq!(plan.install_command.as_deref(), Some("npm ci"));
        assert_eq!(plan.build_command.as_deref(), Some("npm run build"));
        assert_eq!(plan.output_directory, None);
    }

    #[tokio::test]
    async fn test_node_without_build_script() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name":"site"}"#).unwrap();

        let plan = BuildPlan::detect(dir.path(), &params()).await.unwrap();
        assert_eq!(plan.install_command.as_deref(), Some("npm install"));
        assert_eq!(plan.build_command, None);
    }

    #[tokio::test]
    async fn test_static_site_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();

        let plan = BuildPlan::detect(dir.path(), &params()).await.unwrap();
        assert_eq!(plan.project_type, ProjectType::Static);
        assert_eq!(plan.install_command, None);
        assert_eq!(plan.output_directory.as_deref(), Some("."));
        assert_eq!(plan.resolve_output(dir.path()).await.unwrap(), dir.path().join("."));
    }

    #[tokio::test]
    async fn test_unknown_project_needs_explicit_settings() {
        let dir = TempDir::new().unwrap();
        let err = BuildPlan::detect(dir.path(), &params()).await.unwrap_err();
        assert!(matches!(err, DeployError::Stage { stage: Stage::DetectProject, .. }));

        let explicit = JobParams {
            build_command: Some("make site".to_string()),
            output_directory: Some("_site".to_string()),
            ..params()
        };
        let plan = BuildPlan::detect(dir.path(), &explicit).await.unwrap();
        assert_eq!(plan.project_type, ProjectType::Other);
        assert_eq!(plan.build_command.as_deref(), Some("make site"));
    }

    #[tokio::test]
    async fn test_resolve_output_searches_node_candidates() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("build")).unwrap();
        std::fs::create_dir(dir.path().join("public")).unwrap();

        let plan = BuildPlan {
            project_type: ProjectType::Node,
            install_command: None,
            build_command: None,
            output_directory: None,
        };
        assert_eq!(plan.resolve_output(dir.path()).await.unwrap(), dir.path().join("build"));

        let missing = BuildPlan {
            output_directory: Some("dist".to_string()),
            ..plan
        };
        let err = missing.resolve_output(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("dist"));
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(Stage::ALL.len(), 9);
        assert_eq!(Stage::FetchSource.to_string(), "Source fetch");
        let err = DeployError::stage(Stage::Build, "exit code 2");
        assert_eq!(err.to_string(), "Build failed: exit code 2");
    }
}

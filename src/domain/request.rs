//! Deployment submission requests and their validation.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use super::job::JobParams;
use crate::error::DeployError;

/// Body of a deployment submission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    #[serde(default)]
    pub source_ref: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub output_directory: Option<String>,
    #[serde(default)]
    pub project_type: Option<ProjectType>,
}

impl DeployRequest {
    /// Validate fields and convert into job parameters.
    ///
    /// Blank optional fields are treated as absent.
    pub fn validate(self) -> Result<JobParams, DeployError> {
        let source_ref = self.source_ref.trim().to_string();
        let branch = self.branch.trim().to_string();

        if source_ref.is_empty() {
            return Err(DeployError::Validation("sourceRef is required".to_string()));
        }
        if branch.is_empty() {
            return Err(DeployError::Validation("branch is required".to_string()));
        }
        if branch.starts_with('-') || branch.chars().any(char::is_whitespace) {
            return Err(DeployError::Validation(format!(
                "branch '{}' is not a valid branch name",
                branch
            )));
        }

        SourceRef::parse(&source_ref)?;

        let build_command = non_blank(self.build_command);
        let output_directory = non_blank(self.output_directory);

        if let Some(ref dir) = output_directory {
            validate_output_directory(dir)?;
        }

        Ok(JobParams {
            source_ref,
            branch,
            build_command,
            output_directory,
            project_type: self.project_type,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_output_directory(dir: &str) -> Result<(), DeployError> {
    let path = Path::new(dir);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));

    if escapes {
        return Err(DeployError::Validation(format!(
            "outputDirectory '{}' must be a relative path inside the project",
            dir
        )));
    }
    Ok(())
}

/// Kind of project being deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    /// package.json based project
    Node,

    /// Plain files with an index.html at the root
    Static,

    /// Anything else; needs an explicit build command and output directory
    Other,
}

impl std::fmt::Display for ProjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProjectType::Node => "node",
            ProjectType::Static => "static",
            ProjectType::Other => "other",
        };
        f.write_str(name)
    }
}

/// A parsed source reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    /// Remote git URL (https or ssh)
    Remote(String),

    /// Directory on the local filesystem
    Local(String),
}

impl SourceRef {
    /// Parse a user-supplied reference.
    ///
    /// Accepts `https://`/`http://`/`ssh://` URLs, scp-style `git@host:owner/repo`,
    /// an existing local directory, or `owner/repo` shorthand for GitHub.
    pub fn parse(raw: &str) -> Result<Self, DeployError> {
        let raw = raw.trim();

        if raw.starts_with("https://") || raw.starts_with("http://") || raw.starts_with("ssh://") {
            return Ok(SourceRef::Remote(raw.to_string()));
        }
        if raw.starts_with("git@") && raw.contains(':') {
            return Ok(SourceRef::Remote(raw.to_string()));
        }
        if Path::new(raw).is_dir() {
            return Ok(SourceRef::Local(raw.to_string()));
        }

        let parts: Vec<&str> = raw.split('/').collect();
        let valid_segment = |s: &str| {
            !s.is_empty()
                && s != "."
                && s != ".."
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if parts.len() == 2 && parts.iter().all(|s| valid_segment(s)) {
            return Ok(SourceRef::Remote(format!(
                "https://github.com/{}/{}.git",
                parts[0],
                parts[1].trim_end_matches(".git")
            )));
        }

        Err(DeployError::Validation(format!(
            "sourceRef '{}' is not a git URL, owner/repo, or local directory",
            raw
        )))
    }

    /// URL or path as passed to the fetcher
    pub fn location(&self) -> &str {
        match self {
            SourceRef::Remote(url) => url,
            SourceRef::Local(path) => path,
        }
    }

    /// Owner and repository name, taken from the last two path segments
    pub fn owner_and_repo(&self) -> (String, String) {
        let trimmed = self
            .location()
            .trim_end_matches('/')
            .trim_end_matches(".git");
        let mut segments = trimmed.rsplit(|c| c == '/' || c == ':');
        let repo = segments.next().unwrap_or_default().to_string();
        let owner = segments.next().unwrap_or_default().to_string();
        (owner, repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source_ref: &str, branch: &str) -> DeployRequest {
        DeployRequest {
            source_ref: source_ref.to_string(),
            branch: branch.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert!(matches!(
            request("", "main").validate(),
            Err(DeployError::Validation(_))
        ));
        assert!(matches!(
            request("acme/site", "  ").validate(),
            Err(DeployError::Validation(_))
        ));
    }

    #[test]
    fn test_bad_branch_rejected() {
        assert!(request("acme/site", "--upload-pack=x").validate().is_err());
        assert!(request("acme/site", "feature one").validate().is_err());
    }

    #[test]
    fn test_output_directory_must_stay_inside() {
        let mut req = request("acme/site", "main");
        req.output_directory = Some("../etc".to_string());
        assert!(req.validate().is_err());

        let mut req = request("acme/site", "main");
        req.output_directory = Some("/tmp/out".to_string());
        assert!(req.validate().is_err());

        let mut req = request("acme/site", "main");
        req.output_directory = Some("dist/site".to_string());
        assert_eq!(req.validate().unwrap().output_directory.as_deref(), Some("dist/site"));
    }

    #[test]
    fn test_blank_optionals_are_dropped() {
        let mut req = request("acme/site", "main");
        req.build_command = Some("   ".to_string());
        let params = req.validate().unwrap();
        assert!(params.build_command.is_none());
    }

    #[test]
    fn test_source_ref_forms() {
        assert_eq!(
            SourceRef::parse("acme/site").unwrap(),
            SourceRef::Remote("https://github.com/acme/site.git".to_string())
        );
        assert!(matches!(
            SourceRef::parse("git@github.com:acme/site.git").unwrap(),
            SourceRef::Remote(_)
        ));
        assert!(SourceRef::parse("not a ref at all").is_err());
        assert!(SourceRef::parse("a/b/c").is_err());
    }

    #[test]
    fn test_owner_and_repo() {
        let https = SourceRef::parse("https://github.com/acme/site.git").unwrap();
        assert_eq!(https.owner_and_repo(), ("acme".to_string(), "site".to_string()));

        let scp = SourceRef::parse("git@github.com:acme/site.git").unwrap();
        assert_eq!(scp.owner_and_repo(), ("acme".to_string(), "site".to_string()));
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use time::UtcDateTime;

/// A repository identified by `owner/name`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self { owner: owner.into(), name: name.into() }
    }

    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }

    pub fn full_name(&self) -> String { format!("{}/{}", self.owner, self.name) }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Something a trusted identity is allowed to do.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// May trigger the post-processor on pull requests opened from forks.
    RunOnForks,
    /// Automation account whose label events are subject to loop suppression.
    Automation,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PullRequestAction {
    Opened,
    Synchronize,
    Labeled,
    Closed,
    Edited,
    Other(String),
}

impl PullRequestAction {
    pub fn parse(s: &str) -> Self {
        match s {
            "opened" => Self::Opened,
            "synchronize" => Self::Synchronize,
            "labeled" => Self::Labeled,
            "closed" => Self::Closed,
            "edited" => Self::Edited,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Opened => "opened",
            Self::Synchronize => "synchronize",
            Self::Labeled => "labeled",
            Self::Closed => "closed",
            Self::Edited => "edited",
            Self::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct HeadRef {
    /// Full name of the repository the branch lives in.
    pub repo: String,
    pub ref_name: String,
    pub sha: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct BaseRef {
    pub repo: String,
    pub ref_name: String,
}

/// Pull request as it appeared in a webhook payload.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct PullRequestSnapshot {
    pub number: u64,
    pub head: HeadRef,
    pub base: BaseRef,
    pub labels: Vec<String>,
    pub merged: bool,
    pub body: Option<String>,
}

impl PullRequestSnapshot {
    /// Repository names are case-insensitive.
    pub fn is_fork(&self) -> bool { !self.head.repo.eq_ignore_ascii_case(&self.base.repo) }

    pub fn has_label(&self, label: &str) -> bool { self.labels.iter().any(|l| l == label) }
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct RepositoryInfo {
    pub full_name: String,
    pub name: String,
    pub default_branch: Option<String>,
}

/// Immutable snapshot of a single `pull_request` webhook delivery.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PullRequestEvent {
    pub action: PullRequestAction,
    /// Absent on some `closed` notifications.
    pub pull_request: Option<PullRequestSnapshot>,
    pub repository: Option<RepositoryInfo>,
    pub organization: Option<String>,
    pub installation_id: Option<u64>,
    pub sender: Option<String>,
    /// The label that was just added, for `labeled` events.
    pub label: Option<String>,
    pub merged: bool,
    /// Body before the edit, for `edited` events.
    pub previous_body: Option<String>,
}

/// A merge queue asking for checks on a temporary merge commit.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MergeGroupEvent {
    pub head_sha: String,
    pub repository: String,
    pub installation_id: Option<u64>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WebhookEvent {
    PullRequest(Box<PullRequestEvent>),
    MergeGroup(MergeGroupEvent),
    Other(String),
}

impl WebhookEvent {
    pub fn installation_id(&self) -> Option<u64> {
        match self {
            Self::PullRequest(event) => event.installation_id,
            Self::MergeGroup(event) => event.installation_id,
            Self::Other(_) => None,
        }
    }
}

/// Pull request freshly fetched from the API.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct PullRequestDetail {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub draft: bool,
    pub head: HeadRef,
    pub base: BaseRef,
    pub labels: Vec<String>,
    /// Default branch of the base repository.
    pub default_branch: String,
}

impl PullRequestDetail {
    pub fn has_label(&self, label: &str) -> bool { self.labels.iter().any(|l| l == label) }
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct LockConfig {
    pub docker: DockerConfig,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct DockerConfig {
    pub image: String,
    pub digest: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LockConfigError {
    #[error("lock file did not contain \"docker\" key")]
    MissingDocker,
    #[error("lock file is invalid: {0}")]
    Invalid(#[from] serde_yaml::Error),
    #[error(transparent)]
    Fetch(anyhow::Error),
}

impl LockConfig {
    pub fn parse(text: &str) -> Result<Self, LockConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)?;
        let Some(docker) = value.get("docker") else {
            return Err(LockConfigError::MissingDocker);
        };
        let docker = serde_yaml::from_value(docker.clone())?;
        Ok(Self { docker })
    }

    /// Container reference pinned by digest.
    pub fn container(&self) -> String { format!("{}@{}", self.docker.image, self.docker.digest) }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Skipped,
}

impl CheckConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for CheckConclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Contents of a published check run.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CheckPayload {
    pub title: String,
    pub summary: String,
    pub text: String,
    pub conclusion: CheckConclusion,
    pub details_url: Option<String>,
}

impl CheckPayload {
    pub fn new(
        conclusion: CheckConclusion,
        summary: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let summary = summary.into();
        Self { title: summary.clone(), summary, text: text.into(), conclusion, details_url: None }
    }

    pub fn with_details_url(mut self, url: Option<String>) -> Self {
        self.details_url = url;
        self
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CheckRun {
    pub id: u64,
    pub name: String,
    pub head_sha: String,
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommitRecord {
    pub timestamp: UtcDateTime,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool { matches!(self, Self::Succeeded | Self::Failed) }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BuildStep {
    pub name: String,
    pub status: BuildStatus,
}

/// Latest known state of a build.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub steps: Vec<BuildStep>,
    pub log_url: Option<String>,
}

/// Stored configuration snapshot for a repository.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Configs {
    pub installation_id: u64,
    /// The branch the configuration files were read from.
    pub branch_name: String,
    pub commit_hash: String,
}

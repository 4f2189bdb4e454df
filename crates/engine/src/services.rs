use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use postproc_core::models::{
    BuildResult, CheckPayload, CheckRun, CommitRecord, Configs, LockConfig, LockConfigError,
    PullRequestDetail, RepoRef,
};

use crate::lock::{Lock, LockError};

#[async_trait]
pub trait PullRequestApi: Send + Sync {
    async fn get_pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequestDetail>;

    /// Paths of the files changed by the pull request.
    async fn list_files(&self, repo: &RepoRef, number: u64) -> Result<Vec<String>>;

    /// Commits on the pull request, oldest first.
    async fn list_commits(&self, repo: &RepoRef, number: u64) -> Result<Vec<CommitRecord>>;

    async fn close_pull_request(&self, repo: &RepoRef, number: u64) -> Result<()>;

    async fn delete_branch(&self, repo: &RepoRef, branch: &str) -> Result<()>;

    /// Returns `false` when the label was not present.
    async fn remove_label(&self, repo: &RepoRef, number: u64, label: &str) -> Result<bool>;
}

#[async_trait]
pub trait CheckApi: Send + Sync {
    async fn find_latest_check(
        &self,
        repo: &RepoRef,
        head_sha: &str,
        name: &str,
    ) -> Result<Option<CheckRun>>;

    async fn create_check(
        &self,
        repo: &RepoRef,
        head_sha: &str,
        name: &str,
        payload: &CheckPayload,
    ) -> Result<CheckRun>;

    async fn update_check(
        &self,
        repo: &RepoRef,
        check_id: u64,
        payload: &CheckPayload,
    ) -> Result<CheckRun>;
}

#[async_trait]
pub trait LockConfigSource: Send + Sync {
    /// `Ok(None)` when the repository has no lock file at `git_ref`.
    async fn get_lock_config(
        &self,
        repo: &RepoRef,
        git_ref: &str,
    ) -> Result<Option<LockConfig>, LockConfigError>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BuildKind {
    PostProcess,
    Regenerate,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BuildRequest {
    pub kind: BuildKind,
    pub substitutions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BuildHandle {
    pub id: String,
    pub log_url: Option<String>,
}

#[async_trait]
pub trait BuildService: Send + Sync {
    async fn run_build(&self, request: &BuildRequest) -> Result<BuildHandle>;

    async fn get_build(&self, handle: &BuildHandle) -> Result<BuildResult>;
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Never waits: a held lock fails with [`LockError::Contended`].
    async fn acquire(&self, key: &str) -> Result<Lock, LockError>;

    async fn release(&self, lock: Lock) -> Result<()>;
}

#[async_trait]
pub trait ConfigsStore: Send + Sync {
    /// `repo` is the full `owner/name`.
    async fn get_configs(&self, repo: &str) -> Result<Option<Configs>>;

    async fn store_configs(&self, repo: &str, configs: &Configs) -> Result<()>;
}

#[async_trait]
pub trait ConfigRefresher: Send + Sync {
    async fn refresh_configs(
        &self,
        store: &dyn ConfigsStore,
        current: Option<&Configs>,
        repo: &RepoRef,
        default_branch: &str,
        installation_id: u64,
    ) -> Result<()>;
}

#[async_trait]
pub trait PostBuildUpdater: Send + Sync {
    /// Runs after a label-triggered post-processor build has been published.
    async fn update_after_post_processor(&self, repo: &RepoRef, number: u64) -> Result<()>;
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use octocrab::params::{pulls::State, repos::Reference};
use postproc_core::models::{
    BaseRef, CommitRecord, HeadRef, LockConfig, LockConfigError, PullRequestDetail, RepoRef,
};
use postproc_engine::{
    loop_breaker::latest_commit_by_others,
    policy::REGENERATE_CHECKBOX_CHECKED,
    services::{LockConfigSource, PostBuildUpdater, PullRequestApi},
};
use serde::{Deserialize, Serialize};
use time::UtcDateTime;

use crate::{GitHubApi, is_not_found};

const REGENERATE_CHECKBOX_UNCHECKED: &str = "- [ ] Regenerate this pull request now.";

#[derive(Serialize)]
struct ContentParams<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
}

#[derive(Deserialize)]
struct ContentFile {
    content: Option<String>,
    encoding: Option<String>,
}

impl GitHubApi {
    async fn fetch_file(
        &self,
        repo: &RepoRef,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<String>> {
        let route = format!("/repos/{}/{}/contents/{}", repo.owner, repo.name, path);
        let result = self.client.get(&route, Some(&ContentParams { git_ref })).await;
        let file: ContentFile = match result {
            Ok(file) => file,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to fetch {path} from {repo}@{git_ref}"));
            }
        };
        let content = file.content.unwrap_or_default();
        if file.encoding.as_deref().is_some_and(|e| e != "base64") {
            return Ok(Some(content));
        }
        let cleaned = content.split_whitespace().collect::<String>();
        let bytes =
            STANDARD.decode(cleaned).with_context(|| format!("Invalid base64 in {path}"))?;
        String::from_utf8(bytes).map(Some).with_context(|| format!("{path} is not valid UTF-8"))
    }
}

fn commit_timestamp(unix_seconds: Option<i64>) -> UtcDateTime {
    unix_seconds
        .and_then(|seconds| UtcDateTime::from_unix_timestamp(seconds).ok())
        .unwrap_or(UtcDateTime::UNIX_EPOCH)
}

fn pull_request_detail(pr: &octocrab::models::pulls::PullRequest) -> PullRequestDetail {
    let head_repo = pr.head.repo.as_ref().and_then(|r| r.full_name.clone()).unwrap_or_default();
    let base_repo = pr.base.repo.as_ref().and_then(|r| r.full_name.clone()).unwrap_or_default();
    let default_branch = pr
        .base
        .repo
        .as_ref()
        .and_then(|r| r.default_branch.clone())
        .unwrap_or_else(|| "main".to_string());
    PullRequestDetail {
        number: pr.number,
        title: pr.title.clone().unwrap_or_default(),
        body: pr.body.clone(),
        draft: pr.draft.unwrap_or(false),
        head: HeadRef {
            repo: head_repo,
            ref_name: pr.head.ref_field.clone(),
            sha: pr.head.sha.clone(),
        },
        base: BaseRef { repo: base_repo, ref_name: pr.base.ref_field.clone() },
        labels: pr.labels.iter().flatten().map(|l| l.name.clone()).collect(),
        default_branch,
    }
}

#[async_trait]
impl PullRequestApi for GitHubApi {
    async fn get_pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequestDetail> {
        let pr = self
            .client
            .pulls(&repo.owner, &repo.name)
            .get(number)
            .await
            .with_context(|| format!("Failed to fetch pull request {repo}#{number}"))?;
        Ok(pull_request_detail(&pr))
    }

    async fn list_files(&self, repo: &RepoRef, number: u64) -> Result<Vec<String>> {
        let page = self
            .client
            .pulls(&repo.owner, &repo.name)
            .list_files(number)
            .await
            .with_context(|| format!("Failed to list files of {repo}#{number}"))?;
        let files = self.client.all_pages(page).await?;
        Ok(files.into_iter().map(|f| f.filename).collect())
    }

    async fn list_commits(&self, repo: &RepoRef, number: u64) -> Result<Vec<CommitRecord>> {
        let page = self
            .client
            .pulls(&repo.owner, &repo.name)
            .pr_commits(number)
            .per_page(100)
            .send()
            .await
            .with_context(|| format!("Failed to list commits of {repo}#{number}"))?;
        let commits = self.client.all_pages(page).await?;
        Ok(commits
            .into_iter()
            .map(|item| CommitRecord {
                timestamp: commit_timestamp(
                    item.commit.author.as_ref().and_then(|a| a.date).map(|d| d.timestamp()),
                ),
                message: item.commit.message,
            })
            .collect())
    }

    async fn close_pull_request(&self, repo: &RepoRef, number: u64) -> Result<()> {
        self.client
            .pulls(&repo.owner, &repo.name)
            .update(number)
            .state(State::Closed)
            .send()
            .await
            .with_context(|| format!("Failed to close {repo}#{number}"))?;
        Ok(())
    }

    async fn delete_branch(&self, repo: &RepoRef, branch: &str) -> Result<()> {
        self.client
            .repos(&repo.owner, &repo.name)
            .delete_ref(&Reference::Branch(branch.to_string()))
            .await
            .with_context(|| format!("Failed to delete branch {branch} in {repo}"))?;
        Ok(())
    }

    async fn remove_label(&self, repo: &RepoRef, number: u64, label: &str) -> Result<bool> {
        match self.client.issues(&repo.owner, &repo.name).remove_label(number, label).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove {label} from {repo}#{number}"))
            }
        }
    }
}

#[async_trait]
impl LockConfigSource for GitHubApi {
    async fn get_lock_config(
        &self,
        repo: &RepoRef,
        git_ref: &str,
    ) -> Result<Option<LockConfig>, LockConfigError> {
        let text = self
            .fetch_file(repo, &self.lock_file_path, git_ref)
            .await
            .map_err(LockConfigError::Fetch)?;
        text.as_deref().map(LockConfig::parse).transpose()
    }
}

/// Title and body for a copied pull request, taken from the copy commit.
fn describe_from_commit(message: &str) -> (String, String) {
    let (title, body) = message.split_once('\n').unwrap_or((message, ""));
    let body = body.trim();
    let body = if body.is_empty() {
        REGENERATE_CHECKBOX_UNCHECKED.to_string()
    } else {
        format!("{body}\n\n{REGENERATE_CHECKBOX_UNCHECKED}")
    };
    (title.trim().to_string(), body)
}

#[async_trait]
impl PostBuildUpdater for GitHubApi {
    /// Copied pull requests keep the title and description of the commit that
    /// copied the code, with the regenerate checkbox reset.
    async fn update_after_post_processor(&self, repo: &RepoRef, number: u64) -> Result<()> {
        let pr = self.get_pull_request(repo, number).await?;
        if !pr.has_label(&self.copy_label) {
            return Ok(());
        }
        let commits = self.list_commits(repo, number).await?;
        let Some(copy_commit) = latest_commit_by_others(&commits, &self.commit_signature) else {
            tracing::debug!("{repo}#{number} has no copy commit to describe it");
            return Ok(());
        };
        let (title, body) = describe_from_commit(&copy_commit.message);
        let current_body = pr.body.as_deref().unwrap_or_default();
        if title == pr.title && body == current_body {
            return Ok(());
        }
        if current_body.contains(REGENERATE_CHECKBOX_CHECKED) {
            tracing::info!("Resetting regenerate checkbox on {repo}#{number}");
        }
        self.client
            .pulls(&repo.owner, &repo.name)
            .update(number)
            .title(title)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to update {repo}#{number}"))?;
        Ok(())
    }
}

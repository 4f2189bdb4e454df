use anyhow::{Context, Result};
use async_trait::async_trait;
use postproc_core::models::{Configs, RepoRef};
use postproc_engine::services::{ConfigRefresher, ConfigsStore};

use crate::{GitHubApi, is_not_found};

impl GitHubApi {
    /// Sha at the tip of `branch`, or `None` if the branch does not exist.
    async fn branch_head(&self, repo: &RepoRef, branch: &str) -> Result<Option<String>> {
        let result = self
            .client
            .repos(&repo.owner, &repo.name)
            .list_commits()
            .sha(branch)
            .per_page(1)
            .send()
            .await;
        match result {
            Ok(page) => Ok(page.items.into_iter().next().map(|c| c.sha)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to fetch head of {repo}@{branch}")),
        }
    }
}

/// Stored configs that no longer describe the tip of the default branch.
fn needs_refresh(current: Option<&Configs>, fresh: &Configs) -> bool {
    current.is_none_or(|current| current != fresh)
}

#[async_trait]
impl ConfigRefresher for GitHubApi {
    async fn refresh_configs(
        &self,
        store: &dyn ConfigsStore,
        current: Option<&Configs>,
        repo: &RepoRef,
        default_branch: &str,
        installation_id: u64,
    ) -> Result<()> {
        let Some(commit_hash) = self.branch_head(repo, default_branch).await? else {
            tracing::warn!("{repo} has no branch {default_branch}, not refreshing configs");
            return Ok(());
        };
        let fresh =
            Configs { installation_id, branch_name: default_branch.to_string(), commit_hash };
        if !needs_refresh(current, &fresh) {
            tracing::debug!("Configs for {repo} are up to date at {}", fresh.commit_hash);
            return Ok(());
        }
        store
            .store_configs(&repo.full_name(), &fresh)
            .await
            .with_context(|| format!("Failed to store configs for {repo}"))?;
        tracing::info!(
            "Refreshed configs for {repo} at {}@{}",
            fresh.branch_name,
            fresh.commit_hash
        );
        Ok(())
    }
}

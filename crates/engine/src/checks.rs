use anyhow::{Context as _, Result};
use postproc_core::models::{CheckPayload, CheckRun, RepoRef};

use crate::Context;

/// Keeps a single check run per head commit up to date.
pub struct CheckReconciler<'a> {
    ctx: &'a Context,
}

impl<'a> CheckReconciler<'a> {
    pub fn new(ctx: &'a Context) -> Self { Self { ctx } }

    pub async fn publish(
        &self,
        repo: &RepoRef,
        head_sha: &str,
        payload: &CheckPayload,
    ) -> Result<CheckRun> {
        let checks = &self.ctx.services.checks;
        let name = &self.ctx.policy.check_name;
        let existing = checks
            .find_latest_check(repo, head_sha, name)
            .await
            .with_context(|| format!("Failed to look up check runs for {repo}@{head_sha}"))?;
        let run = match existing {
            Some(existing) => {
                tracing::debug!("Updating check run {} on {repo}@{head_sha}", existing.id);
                checks
                    .update_check(repo, existing.id, payload)
                    .await
                    .with_context(|| format!("Failed to update check run {}", existing.id))?
            }
            None => checks
                .create_check(repo, head_sha, name, payload)
                .await
                .with_context(|| format!("Failed to create check run on {repo}@{head_sha}"))?,
        };
        tracing::info!(
            "Published {} check on {repo}@{head_sha}: {}",
            payload.conclusion,
            payload.summary
        );
        Ok(run)
    }
}

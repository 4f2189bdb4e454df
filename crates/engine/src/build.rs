use std::{collections::BTreeMap, time::Duration};

use anyhow::{Context as _, Result, bail};
use postproc_core::{
    config::PollConfig,
    models::{
        BuildResult, BuildStatus, CheckConclusion, CheckPayload, LockConfig, PullRequestDetail,
    },
};

use crate::{
    Context,
    services::{BuildHandle, BuildKind, BuildRequest},
};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl From<&PollConfig> for PollPolicy {
    fn from(config: &PollConfig) -> Self {
        Self {
            initial_interval: config.initial_interval(),
            max_interval: config.max_interval(),
            max_attempts: config.max_attempts,
        }
    }
}

impl PollPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_interval)
    }
}

pub struct BuildOrchestrator<'a> {
    ctx: &'a Context,
}

impl<'a> BuildOrchestrator<'a> {
    pub fn new(ctx: &'a Context) -> Self { Self { ctx } }

    /// Runs the post-processor container against the pull request and waits
    /// for it to finish.
    ///
    /// Returns `None` without starting a build when the pull request carries
    /// the ignore label.
    pub async fn trigger(
        &self,
        lock_config: &LockConfig,
        pr: &PullRequestDetail,
    ) -> Result<Option<CheckPayload>> {
        let ignore = &self.ctx.policy.labels.ignore;
        if pr.has_label(ignore) {
            tracing::info!(
                "{}#{} has the {ignore} label, not running a build",
                pr.base.repo,
                pr.number
            );
            return Ok(None);
        }

        let mut substitutions = self.pr_substitutions(pr);
        substitutions.insert("_CONTAINER".to_string(), lock_config.container());
        substitutions.insert("_DEFAULT_BRANCH".to_string(), pr.default_branch.clone());
        let request = BuildRequest { kind: BuildKind::PostProcess, substitutions };
        let handle = self
            .ctx
            .services
            .builds
            .run_build(&request)
            .await
            .with_context(|| {
                format!("Failed to start post-processor for {}#{}", pr.base.repo, pr.number)
            })?;
        tracing::info!("Started build {} for {}#{}", handle.id, pr.base.repo, pr.number);

        let result = self.wait_for_build(&handle).await?;
        let mut payload = summarize_build(&result);
        if payload.details_url.is_none() {
            payload.details_url = handle.log_url;
        }
        Ok(Some(payload))
    }

    /// Queues the regenerate build for a pull request without waiting on it.
    pub async fn trigger_regenerate(&self, pr: &PullRequestDetail) -> Result<BuildHandle> {
        let request =
            BuildRequest { kind: BuildKind::Regenerate, substitutions: self.pr_substitutions(pr) };
        let handle = self
            .ctx
            .services
            .builds
            .run_build(&request)
            .await
            .with_context(|| {
                format!("Failed to request regeneration of {}#{}", pr.base.repo, pr.number)
            })?;
        tracing::info!("Queued regenerate build {} for {}#{}", handle.id, pr.base.repo, pr.number);
        Ok(handle)
    }

    async fn wait_for_build(&self, handle: &BuildHandle) -> Result<BuildResult> {
        let poll = self.ctx.poll;
        let mut interval = poll.initial_interval;
        for attempt in 1..=poll.max_attempts {
            let result = self
                .ctx
                .services
                .builds
                .get_build(handle)
                .await
                .with_context(|| format!("Failed to fetch status of build {}", handle.id))?;
            if result.status.is_terminal() {
                return Ok(result);
            }
            tracing::debug!(
                "Build {} is {:?} (attempt {attempt}/{}), checking again in {interval:?}",
                handle.id,
                result.status,
                poll.max_attempts
            );
            if attempt < poll.max_attempts {
                tokio::time::sleep(interval).await;
                interval = poll.next_interval(interval);
            }
        }
        bail!("Build {} did not finish after {} status checks", handle.id, poll.max_attempts)
    }

    fn pr_substitutions(&self, pr: &PullRequestDetail) -> BTreeMap<String, String> {
        let head_owner = pr.head.repo.split_once('/').map(|(owner, _)| owner).unwrap_or_default();
        let mut substitutions = BTreeMap::from([
            ("_PR".to_string(), pr.number.to_string()),
            ("_REPOSITORY".to_string(), pr.head.repo.clone()),
            ("_PR_BRANCH".to_string(), pr.head.ref_name.clone()),
            ("_PR_OWNER".to_string(), head_owner.to_string()),
        ]);
        if let Some(installation_id) = self.ctx.installation_id {
            substitutions.insert("_INSTALLATION_ID".to_string(), installation_id.to_string());
        }
        substitutions
    }
}

/// Maps a finished build to the check run shown on the pull request.
pub fn summarize_build(result: &BuildResult) -> CheckPayload {
    let text = result
        .steps
        .iter()
        .map(|step| format!("- {} `{}`: {:?}", step_icon(step.status), step.name, step.status))
        .collect::<Vec<_>>()
        .join("\n");
    let payload = if result.status == BuildStatus::Succeeded {
        CheckPayload::new(
            CheckConclusion::Success,
            format!("successfully ran {} steps 🎉!", result.steps.len()),
            text,
        )
    } else {
        let failed = result.steps.iter().filter(|s| s.status == BuildStatus::Failed).count();
        CheckPayload::new(CheckConclusion::Failure, format!("{failed} steps failed 🙁"), text)
    };
    payload.with_details_url(result.log_url.clone())
}

fn step_icon(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Succeeded => "✅",
        BuildStatus::Failed => "❌",
        BuildStatus::Pending | BuildStatus::Running => "⏳",
    }
}

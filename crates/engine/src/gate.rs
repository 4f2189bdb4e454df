use anyhow::{Context as _, Result};
use postproc_core::models::{
    Capability, CheckConclusion, CheckPayload, LockConfig, LockConfigError, MergeGroupEvent,
    PullRequestAction, PullRequestDetail, PullRequestEvent, PullRequestSnapshot, RepoRef,
    WebhookEvent,
};

use crate::{
    Context,
    build::BuildOrchestrator,
    checks::CheckReconciler,
    lock::{LockManager, lock_key},
    loop_breaker::{has_loop, last_commit_is_post_processor},
    policy::regenerate_requested,
};

pub const FORK_SKIP_TEXT: &str = "Ignored by the post-processor because the pull request was \
                                  created from a fork and the labeler may not run it on forks.";

pub const LOOP_DETECTED_TEXT: &str = "The post-processor pushed the last 5 commits on this pull \
                                      request and appears to be stuck in a loop. Push a commit \
                                      by hand or investigate the post-processor before running \
                                      it again.";

const MERGE_QUEUE_SUMMARY: &str = "Not run in the merge queue";

/// Why an event was dropped without publishing anything.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SkipReason {
    OrgNotAllowed,
    ForkNotAllowed,
    /// Required data was missing from the payload.
    MissingContext,
    NotConfigured,
    LockHeld,
    LoopSuppressed,
    UnhandledLabel,
    UnhandledAction,
    UnhandledEvent,
    NotMerged,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Outcome {
    Skipped(SkipReason),
    Published(CheckConclusion),
    /// The check was published and the now empty pull request closed.
    Closed,
    RegenerateRequested,
    ConfigsRefreshed,
}

/// Decides what a webhook delivery should do and carries it out.
pub struct EventGate {
    ctx: Context,
}

impl EventGate {
    pub fn new(ctx: Context) -> Self { Self { ctx } }

    pub async fn handle(&self, event: &WebhookEvent) -> Result<Outcome> {
        match event {
            WebhookEvent::PullRequest(event) => self.handle_pull_request(event).await,
            WebhookEvent::MergeGroup(event) => self.handle_merge_group(event).await,
            WebhookEvent::Other(kind) => {
                tracing::debug!("Ignoring {kind} event");
                Ok(Outcome::Skipped(SkipReason::UnhandledEvent))
            }
        }
    }

    async fn handle_pull_request(&self, event: &PullRequestEvent) -> Result<Outcome> {
        let Some(target) = target_repository(event) else {
            tracing::error!("{} event is missing its repository, ignoring", event.action.as_str());
            return Ok(Outcome::Skipped(SkipReason::MissingContext));
        };
        if !self.ctx.policy.is_org_allowed(&target.owner) {
            tracing::info!("{target} is not allowed to run the post processor");
            return Ok(Outcome::Skipped(SkipReason::OrgNotAllowed));
        }
        if let Some(pr) = &event.pull_request
            && pr.is_fork()
            && !self.ctx.policy.allows_fork(&event.action)
        {
            tracing::info!(
                "head repo {} does not match base {}, skipping {}#{}",
                pr.head.repo,
                pr.base.repo,
                target,
                pr.number
            );
            return Ok(Outcome::Skipped(SkipReason::ForkNotAllowed));
        }

        if event.action == PullRequestAction::Closed {
            return self.handle_closed(event, &target).await;
        }
        let Some(pr) = &event.pull_request else {
            tracing::error!("{} event for {target} has no pull request", event.action.as_str());
            return Ok(Outcome::Skipped(SkipReason::MissingContext));
        };
        match &event.action {
            PullRequestAction::Opened | PullRequestAction::Synchronize => {
                self.handle_opened_or_synchronized(&target, pr).await
            }
            PullRequestAction::Labeled => self.handle_labeled(event, &target, pr).await,
            PullRequestAction::Edited => self.handle_edited(event, &target, pr).await,
            PullRequestAction::Closed | PullRequestAction::Other(_) => {
                tracing::debug!("Ignoring pull_request.{} for {target}", event.action.as_str());
                Ok(Outcome::Skipped(SkipReason::UnhandledAction))
            }
        }
    }

    async fn handle_merge_group(&self, event: &MergeGroupEvent) -> Result<Outcome> {
        // Required checks must report in every merge queue, allowed org or not
        let Some(repo) = RepoRef::parse(&event.repository) else {
            tracing::error!("merge_group event has invalid repository {:?}", event.repository);
            return Ok(Outcome::Skipped(SkipReason::MissingContext));
        };
        let payload = CheckPayload::new(
            CheckConclusion::Success,
            MERGE_QUEUE_SUMMARY,
            "The post-processor already ran on the pull request.",
        );
        CheckReconciler::new(&self.ctx).publish(&repo, &event.head_sha, &payload).await?;
        Ok(Outcome::Published(CheckConclusion::Success))
    }

    async fn handle_closed(&self, event: &PullRequestEvent, target: &RepoRef) -> Result<Outcome> {
        if !event.merged {
            tracing::debug!("Pull request in {target} was closed without merging");
            return Ok(Outcome::Skipped(SkipReason::NotMerged));
        }
        let (Some(installation_id), Some(org), Some(repository)) =
            (event.installation_id, event.organization.as_deref(), event.repository.as_ref())
        else {
            tracing::error!(
                "Merged pull request in {target} is missing installation id or organization, \
                 cannot refresh configs"
            );
            return Ok(Outcome::Skipped(SkipReason::MissingContext));
        };

        let repo = RepoRef::new(org, repository.name.as_str());
        let default_branch = repository.default_branch.as_deref().unwrap_or("main");
        let services = &self.ctx.services;
        let current = services
            .configs
            .get_configs(&repo.full_name())
            .await
            .with_context(|| format!("Failed to load stored configs for {repo}"))?;
        services
            .refresher
            .refresh_configs(
                services.configs.as_ref(),
                current.as_ref(),
                &repo,
                default_branch,
                installation_id,
            )
            .await
            .with_context(|| format!("Failed to refresh configs for {repo}"))?;
        Ok(Outcome::ConfigsRefreshed)
    }

    async fn handle_opened_or_synchronized(
        &self,
        target: &RepoRef,
        pr: &PullRequestSnapshot,
    ) -> Result<Outcome> {
        let key = lock_key(target, pr.number);
        let outcome = LockManager::new(self.ctx.services.locks.as_ref())
            .with_lock(&key, self.post_process_update(target, pr.number))
            .await?;
        Ok(outcome.unwrap_or(Outcome::Skipped(SkipReason::LockHeld)))
    }

    async fn post_process_update(&self, target: &RepoRef, number: u64) -> Result<Outcome> {
        let pulls = &self.ctx.services.pulls;
        let pr = pulls
            .get_pull_request(target, number)
            .await
            .with_context(|| format!("Failed to fetch {target}#{number}"))?;

        let lock_config = match self.load_lock_config(&pr).await? {
            Ok(lock_config) => lock_config,
            Err(outcome) => return Ok(outcome),
        };

        if pr.base.ref_name != pr.default_branch {
            tracing::info!(
                "{target}#{number} targets {} rather than {}, not running the post-processor",
                pr.base.ref_name,
                pr.default_branch
            );
            let payload = CheckPayload::new(
                CheckConclusion::Success,
                "Ignored by post-processor",
                format!(
                    "The base branch `{}` is not the default branch `{}`.",
                    pr.base.ref_name, pr.default_branch
                ),
            );
            return self.publish(target, &pr, &payload).await;
        }

        let commits = pulls
            .list_commits(target, number)
            .await
            .with_context(|| format!("Failed to list commits of {target}#{number}"))?;
        if has_loop(&commits, &self.ctx.policy.commit_signature) {
            tracing::warn!("Post-processor loop detected on {target}#{number}");
            return self.publish(target, &pr, &loop_payload()).await;
        }

        let payload = self.run_build(&lock_config, &pr).await?;
        let outcome = self.publish(target, &pr, &payload).await?;
        if self.close_if_empty(target, &pr).await? {
            return Ok(Outcome::Closed);
        }
        Ok(outcome)
    }

    async fn handle_labeled(
        &self,
        event: &PullRequestEvent,
        target: &RepoRef,
        pr: &PullRequestSnapshot,
    ) -> Result<Outcome> {
        let labels = &self.ctx.policy.labels;
        let Some(label) = event.label.as_deref() else {
            tracing::debug!("labeled event for {target}#{} has no label", pr.number);
            return Ok(Outcome::Skipped(SkipReason::UnhandledLabel));
        };

        if label == labels.copy_command {
            self.remove_label(target, pr.number, label).await?;
            let detail = self.fetch_pull_request(target, pr.number).await?;
            BuildOrchestrator::new(&self.ctx).trigger_regenerate(&detail).await?;
            return Ok(Outcome::RegenerateRequested);
        }
        if label != labels.run {
            tracing::info!("skipping non-owlbot label {label} on {target}#{}", pr.number);
            return Ok(Outcome::Skipped(SkipReason::UnhandledLabel));
        }

        let sender = event.sender.as_deref().unwrap_or_default();
        // The label is always consumed so it can be applied again
        self.remove_label(target, pr.number, label).await?;

        if pr.is_fork() && !self.ctx.policy.has_capability(sender, Capability::RunOnForks) {
            tracing::info!("skipping PR from fork {}#{} labeled by {sender}", target, pr.number);
            let payload = CheckPayload::new(
                CheckConclusion::Skipped,
                "Ignored by post-processor",
                FORK_SKIP_TEXT,
            );
            CheckReconciler::new(&self.ctx).publish(target, &pr.head.sha, &payload).await?;
            return Ok(Outcome::Published(CheckConclusion::Skipped));
        }

        let key = lock_key(target, pr.number);
        let outcome = LockManager::new(self.ctx.services.locks.as_ref())
            .with_lock(&key, self.post_process_labeled(target, pr.number, sender))
            .await?;
        Ok(outcome.unwrap_or(Outcome::Skipped(SkipReason::LockHeld)))
    }

    async fn post_process_labeled(
        &self,
        target: &RepoRef,
        number: u64,
        sender: &str,
    ) -> Result<Outcome> {
        let pulls = &self.ctx.services.pulls;
        let automation = self.ctx.policy.has_capability(sender, Capability::Automation);
        let mut looping = false;
        if automation {
            let commits = pulls
                .list_commits(target, number)
                .await
                .with_context(|| format!("Failed to list commits of {target}#{number}"))?;
            let signature = &self.ctx.policy.commit_signature;
            if last_commit_is_post_processor(&commits, signature) {
                tracing::info!(
                    "{sender} labeled {target}#{number} but the post-processor already ran on it"
                );
                return Ok(Outcome::Skipped(SkipReason::LoopSuppressed));
            }
            looping = has_loop(&commits, signature);
        }

        let pr = self.fetch_pull_request(target, number).await?;
        if looping {
            tracing::warn!("Post-processor loop detected on {target}#{number}");
            return self.publish(target, &pr, &loop_payload()).await;
        }
        let lock_config = match self.load_lock_config(&pr).await? {
            Ok(lock_config) => lock_config,
            Err(outcome) => return Ok(outcome),
        };

        let payload = self.run_build(&lock_config, &pr).await?;
        let outcome = self.publish(target, &pr, &payload).await?;
        self.ctx
            .services
            .updater
            .update_after_post_processor(target, number)
            .await
            .with_context(|| format!("Failed to update {target}#{number} after post-processing"))?;
        Ok(outcome)
    }

    async fn handle_edited(
        &self,
        event: &PullRequestEvent,
        target: &RepoRef,
        pr: &PullRequestSnapshot,
    ) -> Result<Outcome> {
        if !regenerate_requested(pr.body.as_deref(), event.previous_body.as_deref()) {
            return Ok(Outcome::Skipped(SkipReason::UnhandledAction));
        }
        tracing::info!("Regenerate checkbox ticked on {target}#{}", pr.number);
        let detail = self.fetch_pull_request(target, pr.number).await?;
        BuildOrchestrator::new(&self.ctx).trigger_regenerate(&detail).await?;
        Ok(Outcome::RegenerateRequested)
    }

    async fn fetch_pull_request(&self, target: &RepoRef, number: u64) -> Result<PullRequestDetail> {
        self.ctx
            .services
            .pulls
            .get_pull_request(target, number)
            .await
            .with_context(|| format!("Failed to fetch {target}#{number}"))
    }

    async fn remove_label(&self, target: &RepoRef, number: u64, label: &str) -> Result<()> {
        let removed = self
            .ctx
            .services
            .pulls
            .remove_label(target, number, label)
            .await
            .with_context(|| format!("Failed to remove {label} from {target}#{number}"))?;
        if !removed {
            tracing::debug!("{label} was already removed from {target}#{number}");
        }
        Ok(())
    }

    /// Loads the lock file from the head of the pull request. Returns the
    /// final outcome instead when there is nothing to build.
    async fn load_lock_config(
        &self,
        pr: &PullRequestDetail,
    ) -> Result<std::result::Result<LockConfig, Outcome>> {
        let head = RepoRef::parse(&pr.head.repo)
            .with_context(|| format!("Invalid head repository {:?}", pr.head.repo))?;
        match self.ctx.services.lock_configs.get_lock_config(&head, &pr.head.ref_name).await {
            Ok(Some(lock_config)) => Ok(Ok(lock_config)),
            Ok(None) => {
                tracing::info!(
                    "{head}@{} has no {}, skipping",
                    pr.head.ref_name,
                    self.ctx.policy.lock_file_path
                );
                Ok(Err(Outcome::Skipped(SkipReason::NotConfigured)))
            }
            Err(LockConfigError::Fetch(e)) => Err(e.context(format!(
                "Failed to fetch lock file from {head}@{}",
                pr.head.ref_name
            ))),
            Err(e) => {
                tracing::warn!("Invalid lock file in {head}@{}: {e}", pr.head.ref_name);
                let payload = CheckPayload::new(
                    CheckConclusion::Failure,
                    "Invalid lock file",
                    format!("Error: {e}."),
                );
                let base = base_repository(pr)?;
                Ok(Err(self.publish(&base, pr, &payload).await?))
            }
        }
    }

    async fn run_build(
        &self,
        lock_config: &LockConfig,
        pr: &PullRequestDetail,
    ) -> Result<CheckPayload> {
        let payload = BuildOrchestrator::new(&self.ctx).trigger(lock_config, pr).await?;
        Ok(payload.unwrap_or_else(|| {
            CheckPayload::new(
                CheckConclusion::Success,
                "Ignored by post-processor",
                format!("The pull request has the `{}` label.", self.ctx.policy.labels.ignore),
            )
        }))
    }

    async fn publish(
        &self,
        target: &RepoRef,
        pr: &PullRequestDetail,
        payload: &CheckPayload,
    ) -> Result<Outcome> {
        CheckReconciler::new(&self.ctx).publish(target, &pr.head.sha, payload).await?;
        Ok(Outcome::Published(payload.conclusion))
    }

    /// Closes a generated pull request that ended up with nothing to merge.
    async fn close_if_empty(&self, target: &RepoRef, pr: &PullRequestDetail) -> Result<bool> {
        let policy = &self.ctx.policy;
        if !policy.may_close(pr) {
            return Ok(false);
        }
        let pulls = &self.ctx.services.pulls;
        let files = pulls
            .list_files(target, pr.number)
            .await
            .with_context(|| format!("Failed to list files of {target}#{}", pr.number))?;
        // Labels and draft state may have changed while the build ran
        let current = self.fetch_pull_request(target, pr.number).await?;
        if !policy.should_close_empty_pull_request(&current, &files) {
            return Ok(false);
        }

        tracing::info!("Closing {target}#{} because it has nothing left to merge", pr.number);
        pulls
            .close_pull_request(target, pr.number)
            .await
            .with_context(|| format!("Failed to close {target}#{}", pr.number))?;
        let head = RepoRef::parse(&current.head.repo)
            .with_context(|| format!("Invalid head repository {:?}", current.head.repo))?;
        pulls
            .delete_branch(&head, &current.head.ref_name)
            .await
            .with_context(|| format!("Failed to delete {head}@{}", current.head.ref_name))?;
        Ok(true)
    }
}

fn target_repository(event: &PullRequestEvent) -> Option<RepoRef> {
    if let Some(pr) = &event.pull_request
        && let Some(repo) = RepoRef::parse(&pr.base.repo)
    {
        return Some(repo);
    }
    RepoRef::parse(&event.repository.as_ref()?.full_name)
}

fn base_repository(pr: &PullRequestDetail) -> Result<RepoRef> {
    RepoRef::parse(&pr.base.repo)
        .with_context(|| format!("Invalid base repository {:?}", pr.base.repo))
}

fn loop_payload() -> CheckPayload {
    CheckPayload::new(CheckConclusion::Failure, "Post-processor loop detected", LOOP_DETECTED_TEXT)
}

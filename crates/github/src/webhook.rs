use std::fmt::Display;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{FromRequest, Request},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use postproc_core::models::{
    BaseRef, HeadRef, MergeGroupEvent, PullRequestAction, PullRequestEvent, PullRequestSnapshot,
    RepositoryInfo, WebhookEvent,
};
use serde::Deserialize;

/// Extract a GitHub event payload. Deliveries are trusted as received.
#[derive(Clone)]
#[must_use]
pub struct GitHubEvent {
    pub delivery_id: Option<String>,
    pub event: WebhookEvent,
}

impl<S> FromRequest<S> for GitHubEvent
where S: Send + Sync
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(m: impl Display) -> Response {
            tracing::error!("{m}");
            (StatusCode::BAD_REQUEST, m.to_string()).into_response()
        }
        // Nothing borrowed from the request may be held across the body await
        let (kind, delivery_id) = {
            let headers = req.headers();
            (header_value(headers, "X-GitHub-Event"), header_value(headers, "X-GitHub-Delivery"))
        };
        let kind = kind.ok_or_else(|| err("X-GitHub-Event header missing"))?;
        let body = Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?;
        let event = parse_event(&kind, &body).map_err(|e| err(format!("{e:#}")))?;
        Ok(GitHubEvent { delivery_id, event })
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.to_string())
}

#[derive(Deserialize)]
struct Login {
    login: String,
}

#[derive(Deserialize)]
struct Installation {
    id: u64,
}

#[derive(Deserialize)]
struct RepositoryPayload {
    full_name: String,
    name: String,
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct LabelPayload {
    name: String,
}

#[derive(Deserialize)]
struct BranchPayload {
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(default)]
    sha: String,
    /// Null when the fork was deleted.
    repo: Option<BranchRepoPayload>,
}

#[derive(Deserialize)]
struct BranchRepoPayload {
    full_name: String,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    number: u64,
    head: BranchPayload,
    base: BranchPayload,
    #[serde(default)]
    labels: Vec<LabelPayload>,
    merged: Option<bool>,
    body: Option<String>,
}

#[derive(Deserialize)]
struct BodyChange {
    from: Option<String>,
}

#[derive(Deserialize)]
struct Changes {
    body: Option<BodyChange>,
}

#[derive(Deserialize)]
struct PullRequestEventPayload {
    action: String,
    pull_request: Option<PullRequestPayload>,
    repository: Option<RepositoryPayload>,
    organization: Option<Login>,
    installation: Option<Installation>,
    sender: Option<Login>,
    label: Option<LabelPayload>,
    merged: Option<bool>,
    changes: Option<Changes>,
}

#[derive(Deserialize)]
struct MergeGroup {
    head_sha: String,
}

#[derive(Deserialize)]
struct MergeGroupEventPayload {
    action: String,
    merge_group: MergeGroup,
    repository: RepositoryPayload,
    installation: Option<Installation>,
}

fn branch(payload: BranchPayload) -> (String, String, String) {
    (payload.repo.map(|r| r.full_name).unwrap_or_default(), payload.ref_name, payload.sha)
}

impl From<PullRequestEventPayload> for PullRequestEvent {
    fn from(payload: PullRequestEventPayload) -> Self {
        let action = PullRequestAction::parse(&payload.action);
        let merged = payload
            .merged
            .or_else(|| payload.pull_request.as_ref().and_then(|pr| pr.merged))
            .unwrap_or(false);
        let body_change = payload.changes.and_then(|c| c.body);
        let pull_request = payload.pull_request.map(|pr| {
            let (head_repo, head_ref, head_sha) = branch(pr.head);
            let (base_repo, base_ref, _) = branch(pr.base);
            PullRequestSnapshot {
                number: pr.number,
                head: HeadRef { repo: head_repo, ref_name: head_ref, sha: head_sha },
                base: BaseRef { repo: base_repo, ref_name: base_ref },
                labels: pr.labels.into_iter().map(|l| l.name).collect(),
                merged: pr.merged.unwrap_or(false),
                body: pr.body,
            }
        });
        // An edit that did not touch the body leaves it as it was
        let previous_body = match body_change {
            Some(change) => change.from,
            None => pull_request.as_ref().and_then(|pr| pr.body.clone()),
        };
        PullRequestEvent {
            action,
            pull_request,
            repository: payload.repository.map(|r| RepositoryInfo {
                full_name: r.full_name,
                name: r.name,
                default_branch: r.default_branch,
            }),
            organization: payload.organization.map(|o| o.login),
            installation_id: payload.installation.map(|i| i.id),
            sender: payload.sender.map(|s| s.login),
            label: payload.label.map(|l| l.name),
            merged,
            previous_body,
        }
    }
}

/// Parses a delivery given the value of its `X-GitHub-Event` header.
pub fn parse_event(kind: &str, body: &[u8]) -> Result<WebhookEvent> {
    match kind {
        "pull_request" => {
            let payload: PullRequestEventPayload =
                serde_json::from_slice(body).context("Invalid pull_request payload")?;
            Ok(WebhookEvent::PullRequest(Box::new(payload.into())))
        }
        "merge_group" => {
            let payload: MergeGroupEventPayload =
                serde_json::from_slice(body).context("Invalid merge_group payload")?;
            if payload.action != "checks_requested" {
                return Ok(WebhookEvent::Other(format!("merge_group.{}", payload.action)));
            }
            Ok(WebhookEvent::MergeGroup(MergeGroupEvent {
                head_sha: payload.merge_group.head_sha,
                repository: payload.repository.full_name,
                installation_id: payload.installation.map(|i| i.id),
            }))
        }
        other => Ok(WebhookEvent::Other(other.to_string())),
    }
}

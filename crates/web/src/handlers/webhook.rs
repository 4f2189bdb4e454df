use anyhow::Result;
use axum::{extract::State, http::StatusCode};
use postproc_core::models::WebhookEvent;
use postproc_engine::{EventGate, Outcome};
use postproc_github::webhook::GitHubEvent;

use crate::state::AppState;

/// Acknowledges the delivery right away and processes it in the background.
pub async fn webhook(
    State(state): State<AppState>,
    GitHubEvent { delivery_id, event }: GitHubEvent,
) -> StatusCode {
    let delivery = delivery_id.unwrap_or_else(|| "[unknown]".to_string());
    tracing::info!("Received delivery {delivery}: {}", describe(&event));
    tokio::spawn(process(state, delivery, event));
    StatusCode::ACCEPTED
}

async fn process(state: AppState, delivery: String, event: WebhookEvent) {
    let result: Result<Outcome> = async {
        let ctx = state.context(event.installation_id()).await?;
        EventGate::new(ctx).handle(&event).await
    }
    .await;
    match result {
        Ok(outcome) => tracing::info!("Delivery {delivery} finished: {outcome:?}"),
        Err(e) => tracing::error!("Delivery {delivery} failed: {e:?}"),
    }
}

fn describe(event: &WebhookEvent) -> String {
    match event {
        WebhookEvent::PullRequest(event) => {
            let repo = event
                .pull_request
                .as_ref()
                .map(|pr| format!("{}#{}", pr.base.repo, pr.number))
                .or_else(|| event.repository.as_ref().map(|r| r.full_name.clone()))
                .unwrap_or_else(|| "[unknown]".to_string());
            format!("pull_request.{} {repo}", event.action.as_str())
        }
        WebhookEvent::MergeGroup(event) => {
            format!("merge_group.checks_requested {}@{}", event.repository, event.head_sha)
        }
        WebhookEvent::Other(kind) => kind.clone(),
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use postproc_core::models::{CheckPayload, CheckRun, RepoRef};
use postproc_engine::services::CheckApi;
use serde::{Deserialize, Serialize};

use crate::GitHubApi;

#[derive(Serialize)]
struct CheckRunQuery<'a> {
    check_name: &'a str,
    filter: &'a str,
}

#[derive(Deserialize)]
struct CheckRunList {
    check_runs: Vec<CheckRunResponse>,
}

#[derive(Deserialize)]
struct CheckRunResponse {
    id: u64,
    name: String,
    head_sha: String,
    conclusion: Option<String>,
}

impl From<CheckRunResponse> for CheckRun {
    fn from(value: CheckRunResponse) -> Self {
        Self {
            id: value.id,
            name: value.name,
            head_sha: value.head_sha,
            conclusion: value.conclusion,
        }
    }
}

#[derive(Serialize)]
struct CheckRunOutput<'a> {
    title: &'a str,
    summary: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct CheckRunBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    head_sha: Option<&'a str>,
    status: &'static str,
    conclusion: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details_url: Option<&'a str>,
    output: CheckRunOutput<'a>,
}

impl<'a> CheckRunBody<'a> {
    fn completed(payload: &'a CheckPayload) -> Self {
        Self {
            name: None,
            head_sha: None,
            status: "completed",
            conclusion: payload.conclusion.as_str(),
            details_url: payload.details_url.as_deref(),
            output: CheckRunOutput {
                title: &payload.title,
                summary: &payload.summary,
                text: &payload.text,
            },
        }
    }
}

#[async_trait]
impl CheckApi for GitHubApi {
    async fn find_latest_check(
        &self,
        repo: &RepoRef,
        head_sha: &str,
        name: &str,
    ) -> Result<Option<CheckRun>> {
        let route = format!("/repos/{}/{}/commits/{}/check-runs", repo.owner, repo.name, head_sha);
        let list: CheckRunList = self
            .client
            .get(&route, Some(&CheckRunQuery { check_name: name, filter: "latest" }))
            .await
            .with_context(|| format!("Failed to list check runs for {repo}@{head_sha}"))?;
        // The API returns the newest run first
        Ok(list.check_runs.into_iter().find(|run| run.name == name).map(CheckRun::from))
    }

    async fn create_check(
        &self,
        repo: &RepoRef,
        head_sha: &str,
        name: &str,
        payload: &CheckPayload,
    ) -> Result<CheckRun> {
        let route = format!("/repos/{}/{}/check-runs", repo.owner, repo.name);
        let body = CheckRunBody {
            name: Some(name),
            head_sha: Some(head_sha),
            ..CheckRunBody::completed(payload)
        };
        let run: CheckRunResponse = self
            .client
            .post(&route, Some(&body))
            .await
            .with_context(|| format!("Failed to create check run for {repo}@{head_sha}"))?;
        Ok(run.into())
    }

    async fn update_check(
        &self,
        repo: &RepoRef,
        check_id: u64,
        payload: &CheckPayload,
    ) -> Result<CheckRun> {
        let route = format!("/repos/{}/{}/check-runs/{}", repo.owner, repo.name, check_id);
        let run: CheckRunResponse = self
            .client
            .patch(&route, Some(&CheckRunBody::completed(payload)))
            .await
            .with_context(|| format!("Failed to update check run {check_id} in {repo}"))?;
        Ok(run.into())
    }
}

#[cfg(test)]
mod tests {
    use postproc_core::models::CheckConclusion;

    use super::*;

    #[test]
    fn test_check_run_body() {
        let payload = CheckPayload::new(CheckConclusion::Failure, "1 steps failed 🙁", "- ❌ `build`")
            .with_details_url(Some("https://builds.example/b1".to_string()));
        let body = CheckRunBody {
            name: Some("OwlBot Post Processor"),
            head_sha: Some("abc123"),
            ..CheckRunBody::completed(&payload)
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "name": "OwlBot Post Processor",
                "head_sha": "abc123",
                "status": "completed",
                "conclusion": "failure",
                "details_url": "https://builds.example/b1",
                "output": {
                    "title": "1 steps failed 🙁",
                    "summary": "1 steps failed 🙁",
                    "text": "- ❌ `build`",
                },
            })
        );

        let update = serde_json::to_value(CheckRunBody::completed(&CheckPayload::new(
            CheckConclusion::Skipped,
            "Ignored",
            "",
        )))
        .unwrap();
        assert!(update.get("name").is_none());
        assert!(update.get("details_url").is_none());
        assert_eq!(update["conclusion"], "skipped");
    }
}

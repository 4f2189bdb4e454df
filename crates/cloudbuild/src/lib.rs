use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use postproc_core::{
    config::BuildConfig,
    models::{BuildResult, BuildStatus, BuildStep},
};
use postproc_engine::services::{BuildHandle, BuildKind, BuildRequest, BuildService};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Cloud Build REST client that runs builds from preconfigured triggers.
#[derive(Clone)]
pub struct CloudBuild {
    client: Client,
    config: BuildConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunTriggerRequest<'a> {
    project_id: &'a str,
    trigger_id: &'a str,
    source: RepoSource<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RepoSource<'a> {
    project_id: &'a str,
    substitutions: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct Operation {
    name: Option<String>,
    metadata: Option<OperationMetadata>,
}

#[derive(Deserialize)]
struct OperationMetadata {
    build: Option<Build>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Build {
    id: String,
    #[serde(default)]
    status: Option<String>,
    log_url: Option<String>,
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Deserialize)]
struct Step {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    status: Option<String>,
}

impl CloudBuild {
    pub fn new(config: &BuildConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("postproc/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create Cloud Build client")?;
        Ok(Self { client, config: config.clone() })
    }

    fn trigger_id(&self, kind: BuildKind) -> &str {
        match kind {
            BuildKind::PostProcess => &self.config.trigger_id,
            BuildKind::Regenerate => &self.config.regenerate_trigger_id,
        }
    }
}

#[async_trait]
impl BuildService for CloudBuild {
    async fn run_build(&self, request: &BuildRequest) -> Result<BuildHandle> {
        let trigger_id = self.trigger_id(request.kind);
        let project_id = self.config.project_id.as_str();
        let api_base = &self.config.api_base;
        let url = format!("{api_base}/projects/{project_id}/triggers/{trigger_id}:run");
        let body = RunTriggerRequest {
            project_id,
            trigger_id,
            source: RepoSource { project_id, substitutions: &request.substitutions },
        };
        let operation: Operation = self
            .client
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to run trigger {trigger_id}"))?
            .error_for_status()
            .with_context(|| format!("Cloud Build rejected trigger {trigger_id}"))?
            .json()
            .await
            .context("Failed to parse Cloud Build operation")?;
        let build = operation.metadata.and_then(|m| m.build).with_context(|| {
            format!("Operation {} has no build", operation.name.unwrap_or_default())
        })?;
        tracing::debug!("Trigger {trigger_id} started build {}", build.id);
        Ok(BuildHandle { id: build.id, log_url: build.log_url })
    }

    async fn get_build(&self, handle: &BuildHandle) -> Result<BuildResult> {
        let BuildConfig { api_base, project_id, .. } = &self.config;
        let url = format!("{api_base}/projects/{project_id}/builds/{}", handle.id);
        let build: Build = self
            .client
            .get(&url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .with_context(|| format!("Failed to fetch build {}", handle.id))?
            .error_for_status()
            .with_context(|| format!("Cloud Build rejected status request for {}", handle.id))?
            .json()
            .await
            .with_context(|| format!("Failed to parse build {}", handle.id))?;
        Ok(build_result(build))
    }
}

fn build_result(build: Build) -> BuildResult {
    BuildResult {
        status: map_status(build.status.as_deref()),
        steps: build
            .steps
            .into_iter()
            .map(|step| BuildStep {
                name: step.id.unwrap_or(step.name),
                status: map_status(step.status.as_deref()),
            })
            .collect(),
        log_url: build.log_url,
    }
}

fn map_status(status: Option<&str>) -> BuildStatus {
    match status.unwrap_or("STATUS_UNKNOWN") {
        "STATUS_UNKNOWN" | "PENDING" | "QUEUED" => BuildStatus::Pending,
        "WORKING" => BuildStatus::Running,
        "SUCCESS" => BuildStatus::Succeeded,
        // FAILURE, INTERNAL_ERROR, TIMEOUT, CANCELLED, EXPIRED
        _ => BuildStatus::Failed,
    }
}

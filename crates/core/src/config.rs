use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::Capability;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub github: GitHubConfig,
    pub build: BuildConfig,
    #[serde(default)]
    pub bot: BotConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    pub token: String,
    pub app: Option<GitHubAppConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubAppConfig {
    pub id: u64,
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildConfig {
    #[serde(default = "default_build_api_base")]
    pub api_base: String,
    pub project_id: String,
    /// Trigger that runs the post-processor container against a pull request.
    pub trigger_id: String,
    /// Trigger that regenerates a pull request from scratch.
    pub regenerate_trigger_id: String,
    pub access_token: String,
    #[serde(default)]
    pub poll: PollConfig,
}

fn default_build_api_base() -> String { "https://cloudbuild.googleapis.com/v1".to_string() }

/// Backoff schedule used while waiting for a build to finish.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_interval_secs: u64,
    pub max_interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { initial_interval_secs: 5, max_interval_secs: 60, max_attempts: 240 }
    }
}

impl PollConfig {
    pub fn initial_interval(&self) -> Duration { Duration::from_secs(self.initial_interval_secs) }

    pub fn max_interval(&self) -> Duration { Duration::from_secs(self.max_interval_secs) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BotConfig {
    /// Name of the check run published on every head commit.
    pub check_name: String,
    /// Organizations whose repositories may run the post-processor.
    pub allowed_orgs: Vec<String>,
    pub labels: LabelConfig,
    pub trusted_identities: Vec<TrustedIdentity>,
    pub lock_file_path: String,
    pub lock_ttl_secs: u64,
    /// Message used by the post-processor for its own commits.
    pub post_processor_commit_message: String,
}

pub const DEFAULT_POST_PROCESSOR_COMMIT_MESSAGE: &str = "🦉 Updates from OwlBot post-processor\n\n\
    See https://github.com/googleapis/repo-automation-bots/blob/main/packages/owl-bot/README.md";

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            check_name: "OwlBot Post Processor".to_string(),
            allowed_orgs: vec!["googleapis".to_string(), "GoogleCloudPlatform".to_string()],
            labels: LabelConfig::default(),
            trusted_identities: vec![
                TrustedIdentity::new("gcf-owl-bot[bot]", &[
                    Capability::RunOnForks,
                    Capability::Automation,
                ]),
                TrustedIdentity::new("yoshi-code-bot", &[Capability::RunOnForks]),
                TrustedIdentity::new("trusted-contributions-gcf[bot]", &[Capability::Automation]),
            ],
            lock_file_path: ".github/.OwlBot.lock.yaml".to_string(),
            lock_ttl_secs: 3600,
            post_processor_commit_message: DEFAULT_POST_PROCESSOR_COMMIT_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LabelConfig {
    /// Re-runs the post-processor on the pull request.
    pub run: String,
    /// Opts a pull request out of post-processing.
    pub ignore: String,
    /// Marks pull requests created by copying generated code.
    pub copy: String,
    /// Requests a freshly regenerated pull request.
    pub copy_command: String,
    /// Marks draft pull requests that only bump the lock file.
    pub lock_update: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            run: "owlbot:run".to_string(),
            ignore: "owlbot:ignore".to_string(),
            copy: "owl-bot-copy".to_string(),
            copy_command: "owlbot:copy-code".to_string(),
            lock_update: "owlbot:lock-update".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrustedIdentity {
    pub login: String,
    pub capabilities: Vec<Capability>,
}

impl TrustedIdentity {
    pub fn new(login: &str, capabilities: &[Capability]) -> Self {
        Self { login: login.to_string(), capabilities: capabilities.to_vec() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
server:
  port: 3000
db:
  url: sqlite://postproc.db
github:
  token: ghp_test
build:
  project_id: my-project
  trigger_id: post-process
  regenerate_trigger_id: regenerate
  access_token: ya29.test
"#,
        )
        .unwrap();
        assert_eq!(config.db.max_connections, 5);
        assert_eq!(config.build.api_base, "https://cloudbuild.googleapis.com/v1");
        assert_eq!(config.build.poll.initial_interval(), Duration::from_secs(5));
        assert_eq!(config.bot.labels.run, "owlbot:run");
        assert_eq!(config.bot.allowed_orgs, vec!["googleapis", "GoogleCloudPlatform"]);
        assert_eq!(config.bot.trusted_identities.len(), 3);
    }

    #[test]
    fn test_bot_overrides() {
        let config: BotConfig = serde_yaml::from_str(
            r#"
check_name: Post Processor
allowed_orgs: [acme]
labels:
  run: "bot:run"
trusted_identities:
  - login: release-bot[bot]
    capabilities: [automation]
"#,
        )
        .unwrap();
        assert_eq!(config.check_name, "Post Processor");
        assert_eq!(config.allowed_orgs, vec!["acme"]);
        assert_eq!(config.labels.run, "bot:run");
        // Unset labels keep their defaults
        assert_eq!(config.labels.ignore, "owlbot:ignore");
        assert_eq!(config.labels.lock_update, "owlbot:lock-update");
        assert_eq!(config.trusted_identities[0].capabilities, vec![Capability::Automation]);
        assert_eq!(config.lock_ttl_secs, 3600);
    }
}

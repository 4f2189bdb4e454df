pub mod checks;
pub mod configs;
pub mod pulls;
pub mod webhook;

use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use http::StatusCode;
use octocrab::{GitHubError, Octocrab, models::InstallationId};
use postproc_core::config::{BotConfig, GitHubConfig};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct GitHub {
    pub client: Octocrab,
    pub installations: Option<Arc<Mutex<Installations>>>,
}

pub struct Installations {
    pub app_client: Octocrab,
    pub clients: HashMap<InstallationId, Octocrab>,
}

impl Installations {
    pub fn client_for_installation(&mut self, installation_id: InstallationId) -> Result<Octocrab> {
        if let Some(client) = self.clients.get(&installation_id) {
            return Ok(client.clone());
        }
        let client = self
            .app_client
            .installation(installation_id)
            .with_context(|| {
                format!("Failed to create client for installation {installation_id}")
            })?;
        self.clients.insert(installation_id, client.clone());
        Ok(client)
    }
}

impl GitHub {
    pub async fn new(config: &GitHubConfig) -> Result<Arc<Self>> {
        let client = Octocrab::builder()
            .personal_token(config.token.clone())
            .build()
            .context("Failed to create GitHub client")?;
        let profile = client.current().user().await.context("Failed to fetch current user")?;
        tracing::info!("Logged in as {}", profile.login);

        let installations = if let Some(app_config) = &config.app {
            let app_client = Octocrab::builder()
                .app(
                    app_config.id.into(),
                    jsonwebtoken::EncodingKey::from_rsa_pem(app_config.private_key.as_bytes())?,
                )
                .build()
                .context("Failed to create GitHub app client")?;
            tracing::info!("Acting as GitHub app {}", app_config.id);
            Some(Arc::new(Mutex::new(Installations { app_client, clients: HashMap::new() })))
        } else {
            None
        };
        Ok(Arc::new(Self { client, installations }))
    }

    /// Client authenticated as the given installation, falling back to the
    /// personal token when no app is configured.
    pub async fn client_for(&self, installation_id: Option<u64>) -> Result<Octocrab> {
        if let (Some(installations), Some(id)) = (&self.installations, installation_id) {
            let mut installations = installations.lock().await;
            return installations.client_for_installation(InstallationId(id));
        }
        Ok(self.client.clone())
    }
}

/// Repository operations for one installation, shared by every collaborator
/// the engine needs from GitHub.
#[derive(Clone)]
pub struct GitHubApi {
    pub client: Octocrab,
    lock_file_path: String,
    copy_label: String,
    commit_signature: String,
}

impl GitHubApi {
    pub fn new(client: Octocrab, bot: &BotConfig) -> Self {
        Self {
            client,
            lock_file_path: bot.lock_file_path.clone(),
            copy_label: bot.labels.copy.clone(),
            commit_signature: bot.post_processor_commit_message.clone(),
        }
    }
}

pub(crate) fn is_not_found(err: &octocrab::Error) -> bool {
    matches!(
        err,
        octocrab::Error::GitHub { source, .. }
            if matches!(**source, GitHubError { status_code: StatusCode::NOT_FOUND, .. })
    )
}

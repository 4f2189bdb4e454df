use std::{sync::Arc, time::Duration};

use anyhow::Result;
use postproc_cloudbuild::CloudBuild;
use postproc_core::config::Config;
use postproc_db::{Database, locks::SqliteLockService};
use postproc_engine::{Context, Policy, Services, build::PollPolicy};
use postproc_github::{GitHub, GitHubApi};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub github: Arc<GitHub>,
    pub builds: Arc<CloudBuild>,
    pub locks: Arc<SqliteLockService>,
    pub policy: Arc<Policy>,
}

impl AppState {
    pub fn new(config: Arc<Config>, db: Database, github: Arc<GitHub>, builds: CloudBuild) -> Self {
        let ttl = Duration::from_secs(config.bot.lock_ttl_secs);
        let locks = SqliteLockService::new(db.clone(), ttl);
        let policy = Policy::from(&config.bot);
        Self {
            config,
            db,
            github,
            builds: Arc::new(builds),
            locks: Arc::new(locks),
            policy: Arc::new(policy),
        }
    }

    /// Wires the engine to the installation a delivery came from.
    pub async fn context(&self, installation_id: Option<u64>) -> Result<Context> {
        let client = self.github.client_for(installation_id).await?;
        let api = Arc::new(GitHubApi::new(client, &self.config.bot));
        Ok(Context {
            policy: self.policy.clone(),
            poll: PollPolicy::from(&self.config.build.poll),
            services: Services {
                pulls: api.clone(),
                checks: api.clone(),
                lock_configs: api.clone(),
                builds: self.builds.clone(),
                locks: self.locks.clone(),
                configs: Arc::new(self.db.clone()),
                refresher: api.clone(),
                updater: api,
            },
            installation_id,
        })
    }
}

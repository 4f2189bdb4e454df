pub mod build;
pub mod checks;
pub mod gate;
pub mod lock;
pub mod loop_breaker;
pub mod policy;
pub mod services;
#[cfg(test)]
mod testing;

use std::sync::Arc;

pub use gate::{EventGate, Outcome, SkipReason};
pub use policy::Policy;

use crate::{
    build::PollPolicy,
    services::{
        BuildService, CheckApi, ConfigRefresher, ConfigsStore, LockConfigSource, LockService,
        PostBuildUpdater, PullRequestApi,
    },
};

/// Collaborators the engine talks to.
#[derive(Clone)]
pub struct Services {
    pub pulls: Arc<dyn PullRequestApi>,
    pub checks: Arc<dyn CheckApi>,
    pub lock_configs: Arc<dyn LockConfigSource>,
    pub builds: Arc<dyn BuildService>,
    pub locks: Arc<dyn LockService>,
    pub configs: Arc<dyn ConfigsStore>,
    pub refresher: Arc<dyn ConfigRefresher>,
    pub updater: Arc<dyn PostBuildUpdater>,
}

/// Everything needed to process a single webhook delivery.
#[derive(Clone)]
pub struct Context {
    pub policy: Arc<Policy>,
    pub poll: PollPolicy,
    pub services: Services,
    /// Installation the delivery came from, forwarded to builds.
    pub installation_id: Option<u64>,
}

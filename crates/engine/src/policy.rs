use std::collections::{HashMap, HashSet};

use postproc_core::{
    config::{BotConfig, LabelConfig},
    models::{Capability, PullRequestAction, PullRequestDetail},
};

/// Line in a pull request body that asks for the pull request to be regenerated.
pub const REGENERATE_CHECKBOX_CHECKED: &str = "- [x] Regenerate this pull request now.";

/// Static decision rules, built once from [`BotConfig`].
#[derive(Debug, Clone)]
pub struct Policy {
    pub check_name: String,
    pub labels: LabelConfig,
    pub lock_file_path: String,
    /// Message of every commit the post-processor pushes.
    pub commit_signature: String,
    allowed_orgs: Vec<String>,
    capabilities: HashMap<String, HashSet<Capability>>,
}

impl From<&BotConfig> for Policy {
    fn from(config: &BotConfig) -> Self {
        let mut capabilities: HashMap<String, HashSet<Capability>> = HashMap::new();
        for identity in &config.trusted_identities {
            capabilities
                .entry(identity.login.to_ascii_lowercase())
                .or_default()
                .extend(identity.capabilities.iter().copied());
        }
        Self {
            check_name: config.check_name.clone(),
            labels: config.labels.clone(),
            lock_file_path: config.lock_file_path.clone(),
            commit_signature: config.post_processor_commit_message.clone(),
            allowed_orgs: config.allowed_orgs.clone(),
            capabilities,
        }
    }
}

impl Default for Policy {
    fn default() -> Self { Self::from(&BotConfig::default()) }
}

impl Policy {
    /// GitHub logins are case-insensitive.
    pub fn is_org_allowed(&self, org: &str) -> bool {
        self.allowed_orgs.iter().any(|allowed| allowed.eq_ignore_ascii_case(org))
    }

    pub fn has_capability(&self, login: &str, capability: Capability) -> bool {
        self.capabilities
            .get(&login.to_ascii_lowercase())
            .is_some_and(|caps| caps.contains(&capability))
    }

    /// Pull requests from forks are only looked at when labeled or closed.
    pub fn allows_fork(&self, action: &PullRequestAction) -> bool {
        matches!(action, PullRequestAction::Labeled | PullRequestAction::Closed)
    }

    /// Whether the pull request may end up closed once post-processing ran.
    pub fn may_close(&self, pr: &PullRequestDetail) -> bool {
        pr.has_label(&self.labels.copy) || pr.has_label(&self.labels.lock_update)
    }

    pub fn should_close_empty_pull_request(
        &self,
        pr: &PullRequestDetail,
        changed_files: &[String],
    ) -> bool {
        should_close_empty_pull_request(pr, changed_files, self)
    }
}

/// A pull request whose post-processing left nothing worth merging: a
/// copied-code pull request with no changes, or a draft lock update that
/// only touches the lock file.
pub fn should_close_empty_pull_request(
    pr: &PullRequestDetail,
    changed_files: &[String],
    policy: &Policy,
) -> bool {
    let labels = &policy.labels;
    if pr.has_label(&labels.ignore) {
        return false;
    }
    let empty_copy = pr.has_label(&labels.copy) && changed_files.is_empty();
    let lock_file_only = pr.draft
        && pr.has_label(&labels.lock_update)
        && matches!(changed_files, [file] if *file == policy.lock_file_path);
    empty_copy || lock_file_only
}

/// The regenerate checkbox was ticked by this edit.
pub fn regenerate_requested(body: Option<&str>, previous_body: Option<&str>) -> bool {
    let checked =
        |body: Option<&str>| body.is_some_and(|b| b.contains(REGENERATE_CHECKBOX_CHECKED));
    checked(body) && !checked(previous_body)
}

#[cfg(test)]
mod tests {
    use postproc_core::config::TrustedIdentity;

    use super::*;

    fn labels(names: &[&str]) -> Vec<String> { names.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn test_default_capabilities() {
        let policy = Policy::default();
        let cases = [
            ("gcf-owl-bot[bot]", Capability::RunOnForks, true),
            ("gcf-owl-bot[bot]", Capability::Automation, true),
            ("yoshi-code-bot", Capability::RunOnForks, true),
            ("yoshi-code-bot", Capability::Automation, false),
            ("trusted-contributions-gcf[bot]", Capability::Automation, true),
            ("trusted-contributions-gcf[bot]", Capability::RunOnForks, false),
            ("Yoshi-Code-Bot", Capability::RunOnForks, true),
            ("octocat", Capability::RunOnForks, false),
        ];
        for (login, capability, expected) in cases {
            assert_eq!(policy.has_capability(login, capability), expected, "{login} {capability:?}");
        }
    }

    #[test]
    fn test_configured_identities_merge() {
        let config = BotConfig {
            trusted_identities: vec![
                TrustedIdentity::new("release-bot", &[Capability::Automation]),
                TrustedIdentity::new("release-bot", &[Capability::RunOnForks]),
            ],
            ..Default::default()
        };
        let policy = Policy::from(&config);
        assert!(policy.has_capability("release-bot", Capability::Automation));
        assert!(policy.has_capability("release-bot", Capability::RunOnForks));
        assert!(!policy.has_capability("gcf-owl-bot[bot]", Capability::Automation));
    }

    #[test]
    fn test_org_allow_list() {
        let policy = Policy::default();
        assert!(policy.is_org_allowed("googleapis"));
        assert!(policy.is_org_allowed("googlecloudplatform"));
        assert!(!policy.is_org_allowed("googleapis-fork"));
    }

    #[test]
    fn test_fork_topology() {
        let policy = Policy::default();
        assert!(policy.allows_fork(&PullRequestAction::Labeled));
        assert!(policy.allows_fork(&PullRequestAction::Closed));
        assert!(!policy.allows_fork(&PullRequestAction::Opened));
        assert!(!policy.allows_fork(&PullRequestAction::Synchronize));
    }

    #[test]
    fn test_should_close_empty_pull_request() {
        const LOCK: &str = ".github/.OwlBot.lock.yaml";
        let policy = Policy::default();
        let cases: &[(&[&str], bool, &[&str], bool)] = &[
            (&["owl-bot-copy"], false, &[], true),
            (&["owl-bot-copy"], true, &[], true),
            (&["owl-bot-copy"], false, &["src/index.ts"], false),
            (&["owl-bot-copy"], false, &[LOCK], false),
            (&["owl-bot-copy", "owlbot:ignore"], false, &[], false),
            (&["owlbot:lock-update"], true, &[LOCK], true),
            (&["owlbot:lock-update"], false, &[LOCK], false),
            (&["owlbot:lock-update"], true, &[LOCK, "package.json"], false),
            (&["owlbot:lock-update"], true, &["package.json"], false),
            (&["owlbot:lock-update", "owlbot:ignore"], true, &[LOCK], false),
            (&[], true, &[LOCK], false),
            (&[], false, &[], false),
            (&["automerge"], false, &[], false),
        ];
        for &(pr_labels, draft, files, expected) in cases {
            let pr = PullRequestDetail { labels: labels(pr_labels), draft, ..Default::default() };
            assert_eq!(
                should_close_empty_pull_request(&pr, &labels(files), &policy),
                expected,
                "{pr_labels:?} draft={draft} {files:?}"
            );
        }
    }

    #[test]
    fn test_regenerate_requested() {
        let checked = "Changes\n\n- [x] Regenerate this pull request now.\n";
        let unchecked = "Changes\n\n- [ ] Regenerate this pull request now.\n";
        assert!(regenerate_requested(Some(checked), Some(unchecked)));
        assert!(regenerate_requested(Some(checked), None));
        assert!(!regenerate_requested(Some(checked), Some(checked)));
        assert!(!regenerate_requested(Some(unchecked), Some(checked)));
        assert!(!regenerate_requested(None, None));
    }
}

//! In-memory collaborators that record every call in a shared log.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use postproc_core::models::{
    BaseRef, BuildResult, BuildStatus, BuildStep, CheckPayload, CheckRun, CommitRecord, Configs,
    HeadRef, LockConfig, LockConfigError, PullRequestAction, PullRequestDetail, PullRequestEvent,
    PullRequestSnapshot, RepoRef, RepositoryInfo,
};
use time::UtcDateTime;

use crate::{
    Context, EventGate, Policy, Services,
    build::PollPolicy,
    lock::{Lock, LockError},
    services::{
        BuildHandle, BuildRequest, BuildService, CheckApi, ConfigRefresher, ConfigsStore,
        LockConfigSource, LockService, PostBuildUpdater, PullRequestApi,
    },
};

pub const INSTALLATION_ID: u64 = 1219791;

const LOCK_FILE: &str = "docker:\n  image: node\n  digest: sha256:9205bb385656cd196f5303b03983282c95c2dfab041d275465c525b501574e5c\n";

#[derive(Default)]
pub struct CallLog(Mutex<Vec<String>>);

impl CallLog {
    fn record(&self, call: String) { self.0.lock().unwrap().push(call); }

    fn snapshot(&self) -> Vec<String> { self.0.lock().unwrap().clone() }
}

pub fn snapshot(number: u64) -> PullRequestSnapshot {
    PullRequestSnapshot {
        number,
        head: HeadRef {
            repo: "googleapis/nodejs-dlp".to_string(),
            ref_name: "owl-bot-update".to_string(),
            sha: "abc123".to_string(),
        },
        base: BaseRef { repo: "googleapis/nodejs-dlp".to_string(), ref_name: "main".to_string() },
        ..Default::default()
    }
}

pub fn pull_request_event(action: PullRequestAction, pr: PullRequestSnapshot) -> PullRequestEvent {
    PullRequestEvent {
        action,
        pull_request: Some(pr),
        repository: Some(RepositoryInfo {
            full_name: "googleapis/nodejs-dlp".to_string(),
            name: "nodejs-dlp".to_string(),
            default_branch: Some("main".to_string()),
        }),
        organization: Some("googleapis".to_string()),
        installation_id: Some(INSTALLATION_ID),
        sender: None,
        label: None,
        merged: false,
        previous_body: None,
    }
}

fn sample_pull_request(number: u64) -> PullRequestDetail {
    let pr = snapshot(number);
    PullRequestDetail {
        number,
        title: "chore: update dependencies".to_string(),
        body: None,
        draft: false,
        head: pr.head,
        base: pr.base,
        labels: vec![],
        default_branch: "main".to_string(),
    }
}

pub struct FakeGitHub {
    calls: Arc<CallLog>,
    pull_request: Mutex<Option<PullRequestDetail>>,
    files: Mutex<Vec<String>>,
    commits: Mutex<Vec<CommitRecord>>,
    lock_file: Mutex<Option<String>>,
    existing_check: Mutex<Option<CheckRun>>,
    label_present: Mutex<bool>,
    published: Mutex<Vec<CheckPayload>>,
}

impl FakeGitHub {
    fn new(calls: Arc<CallLog>) -> Self {
        Self {
            calls,
            pull_request: Mutex::new(None),
            files: Mutex::new(vec!["README.md".to_string()]),
            commits: Mutex::new(vec![]),
            lock_file: Mutex::new(Some(LOCK_FILE.to_string())),
            existing_check: Mutex::new(None),
            label_present: Mutex::new(true),
            published: Mutex::new(vec![]),
        }
    }

    pub fn set_pull_request(&self, pr: PullRequestDetail) {
        *self.pull_request.lock().unwrap() = Some(pr);
    }

    pub fn set_files(&self, files: &[&str]) {
        *self.files.lock().unwrap() = files.iter().map(|f| f.to_string()).collect();
    }

    pub fn set_commits(&self, messages: &[&str]) {
        let start = UtcDateTime::from_unix_timestamp(1_600_000_000).unwrap();
        *self.commits.lock().unwrap() = messages
            .iter()
            .enumerate()
            .map(|(i, message)| CommitRecord {
                timestamp: start + time::Duration::minutes(i as i64),
                message: message.to_string(),
            })
            .collect();
    }

    pub fn set_lock_file(&self, text: Option<&str>) {
        *self.lock_file.lock().unwrap() = text.map(str::to_string);
    }

    pub fn set_existing_check(&self, id: u64, head_sha: &str) {
        *self.existing_check.lock().unwrap() = Some(CheckRun {
            id,
            name: Policy::default().check_name,
            head_sha: head_sha.to_string(),
            conclusion: None,
        });
    }

    pub fn set_label_present(&self, present: bool) { *self.label_present.lock().unwrap() = present; }

    pub fn published(&self) -> Vec<CheckPayload> { self.published.lock().unwrap().clone() }
}

#[async_trait]
impl PullRequestApi for FakeGitHub {
    async fn get_pull_request(&self, _repo: &RepoRef, number: u64) -> Result<PullRequestDetail> {
        self.calls.record(format!("get_pull_request {number}"));
        Ok(self.pull_request.lock().unwrap().clone().unwrap_or_else(|| sample_pull_request(number)))
    }

    async fn list_files(&self, _repo: &RepoRef, number: u64) -> Result<Vec<String>> {
        self.calls.record(format!("list_files {number}"));
        Ok(self.files.lock().unwrap().clone())
    }

    async fn list_commits(&self, _repo: &RepoRef, number: u64) -> Result<Vec<CommitRecord>> {
        self.calls.record(format!("list_commits {number}"));
        Ok(self.commits.lock().unwrap().clone())
    }

    async fn close_pull_request(&self, _repo: &RepoRef, number: u64) -> Result<()> {
        self.calls.record(format!("close_pull_request {number}"));
        Ok(())
    }

    async fn delete_branch(&self, repo: &RepoRef, branch: &str) -> Result<()> {
        self.calls.record(format!("delete_branch {repo} {branch}"));
        Ok(())
    }

    async fn remove_label(&self, _repo: &RepoRef, number: u64, label: &str) -> Result<bool> {
        self.calls.record(format!("remove_label {number} {label}"));
        Ok(*self.label_present.lock().unwrap())
    }
}

#[async_trait]
impl CheckApi for FakeGitHub {
    async fn find_latest_check(
        &self,
        _repo: &RepoRef,
        head_sha: &str,
        name: &str,
    ) -> Result<Option<CheckRun>> {
        self.calls.record(format!("find_latest_check {head_sha} {name}"));
        let existing = self.existing_check.lock().unwrap().clone();
        Ok(existing.filter(|run| run.head_sha == head_sha && run.name == name))
    }

    async fn create_check(
        &self,
        _repo: &RepoRef,
        head_sha: &str,
        name: &str,
        payload: &CheckPayload,
    ) -> Result<CheckRun> {
        self.calls.record(format!("create_check {head_sha} {}", payload.conclusion));
        self.published.lock().unwrap().push(payload.clone());
        Ok(CheckRun {
            id: 1,
            name: name.to_string(),
            head_sha: head_sha.to_string(),
            conclusion: Some(payload.conclusion.to_string()),
        })
    }

    async fn update_check(
        &self,
        _repo: &RepoRef,
        check_id: u64,
        payload: &CheckPayload,
    ) -> Result<CheckRun> {
        self.calls.record(format!("update_check {check_id} {}", payload.conclusion));
        self.published.lock().unwrap().push(payload.clone());
        let mut run = self.existing_check.lock().unwrap().clone().expect("no existing check");
        run.conclusion = Some(payload.conclusion.to_string());
        Ok(run)
    }
}

#[async_trait]
impl LockConfigSource for FakeGitHub {
    async fn get_lock_config(
        &self,
        repo: &RepoRef,
        git_ref: &str,
    ) -> Result<Option<LockConfig>, LockConfigError> {
        self.calls.record(format!("get_lock_config {repo}@{git_ref}"));
        let text = self.lock_file.lock().unwrap().clone();
        text.as_deref().map(LockConfig::parse).transpose()
    }
}

#[async_trait]
impl PostBuildUpdater for FakeGitHub {
    async fn update_after_post_processor(&self, _repo: &RepoRef, number: u64) -> Result<()> {
        self.calls.record(format!("update_after_post_processor {number}"));
        Ok(())
    }
}

pub struct FakeBuilds {
    calls: Arc<CallLog>,
    statuses: Mutex<VecDeque<BuildStatus>>,
    result: Mutex<BuildResult>,
    requests: Mutex<Vec<BuildRequest>>,
    polls: Mutex<usize>,
    fail_next_run: Mutex<bool>,
}

impl FakeBuilds {
    fn new(calls: Arc<CallLog>) -> Self {
        let steps = ["docker pull", "post-process", "git push"]
            .into_iter()
            .map(|name| BuildStep { name: name.to_string(), status: BuildStatus::Succeeded })
            .collect();
        Self {
            calls,
            statuses: Mutex::new(VecDeque::new()),
            result: Mutex::new(BuildResult { status: BuildStatus::Succeeded, steps, log_url: None }),
            requests: Mutex::new(vec![]),
            polls: Mutex::new(0),
            fail_next_run: Mutex::new(false),
        }
    }

    /// Queues a non-final status reported before the build finishes.
    pub fn push_status(&self, status: BuildStatus) { self.statuses.lock().unwrap().push_back(status); }

    pub fn finish(&self, result: BuildResult) { *self.result.lock().unwrap() = result; }

    pub fn fail_next_run(&self) { *self.fail_next_run.lock().unwrap() = true; }

    pub fn requests(&self) -> Vec<BuildRequest> { self.requests.lock().unwrap().clone() }

    pub fn polls(&self) -> usize { *self.polls.lock().unwrap() }
}

#[async_trait]
impl BuildService for FakeBuilds {
    async fn run_build(&self, request: &BuildRequest) -> Result<BuildHandle> {
        self.calls.record(format!("run_build {:?}", request.kind));
        if std::mem::take(&mut *self.fail_next_run.lock().unwrap()) {
            bail!("trigger not found");
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(BuildHandle { id: "b1".to_string(), log_url: Some("https://builds.example/b1".to_string()) })
    }

    async fn get_build(&self, handle: &BuildHandle) -> Result<BuildResult> {
        self.calls.record(format!("get_build {}", handle.id));
        *self.polls.lock().unwrap() += 1;
        if let Some(status) = self.statuses.lock().unwrap().pop_front() {
            return Ok(BuildResult { status, steps: vec![], log_url: None });
        }
        Ok(self.result.lock().unwrap().clone())
    }
}

pub struct FakeLocks {
    calls: Arc<CallLog>,
    contended: Mutex<bool>,
    released: Mutex<usize>,
}

impl FakeLocks {
    pub fn set_contended(&self, contended: bool) { *self.contended.lock().unwrap() = contended; }

    pub fn released(&self) -> usize { *self.released.lock().unwrap() }
}

#[async_trait]
impl LockService for FakeLocks {
    async fn acquire(&self, key: &str) -> Result<Lock, LockError> {
        self.calls.record(format!("acquire {key}"));
        if *self.contended.lock().unwrap() {
            return Err(LockError::Contended { key: key.to_string() });
        }
        Ok(Lock { key: key.to_string(), token: "token".to_string() })
    }

    async fn release(&self, lock: Lock) -> Result<()> {
        self.calls.record(format!("release {}", lock.key));
        *self.released.lock().unwrap() += 1;
        Ok(())
    }
}

pub struct FakeConfigs {
    calls: Arc<CallLog>,
}

#[async_trait]
impl ConfigsStore for FakeConfigs {
    async fn get_configs(&self, repo: &str) -> Result<Option<Configs>> {
        self.calls.record(format!("get_configs {repo}"));
        Ok(None)
    }

    async fn store_configs(&self, repo: &str, _configs: &Configs) -> Result<()> {
        self.calls.record(format!("store_configs {repo}"));
        Ok(())
    }
}

#[async_trait]
impl ConfigRefresher for FakeConfigs {
    async fn refresh_configs(
        &self,
        _store: &dyn ConfigsStore,
        _current: Option<&Configs>,
        repo: &RepoRef,
        default_branch: &str,
        installation_id: u64,
    ) -> Result<()> {
        self.calls.record(format!("refresh_configs {repo} {default_branch} {installation_id}"));
        Ok(())
    }
}

pub struct Harness {
    calls: Arc<CallLog>,
    pub github: Arc<FakeGitHub>,
    pub builds: Arc<FakeBuilds>,
    pub locks: Arc<FakeLocks>,
    pub configs: Arc<FakeConfigs>,
}

impl Default for Harness {
    fn default() -> Self {
        let calls = Arc::new(CallLog::default());
        Self {
            github: Arc::new(FakeGitHub::new(calls.clone())),
            builds: Arc::new(FakeBuilds::new(calls.clone())),
            locks: Arc::new(FakeLocks {
                calls: calls.clone(),
                contended: Mutex::new(false),
                released: Mutex::new(0),
            }),
            configs: Arc::new(FakeConfigs { calls: calls.clone() }),
            calls,
        }
    }
}

impl Harness {
    pub fn context(&self) -> Context {
        Context {
            policy: Arc::new(Policy::default()),
            poll: PollPolicy {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
                max_attempts: 5,
            },
            services: Services {
                pulls: self.github.clone(),
                checks: self.github.clone(),
                lock_configs: self.github.clone(),
                builds: self.builds.clone(),
                locks: self.locks.clone(),
                configs: self.configs.clone(),
                refresher: self.configs.clone(),
                updater: self.github.clone(),
            },
            installation_id: Some(INSTALLATION_ID),
        }
    }

    pub fn gate(&self) -> EventGate { EventGate::new(self.context()) }

    pub fn pull_request(&self, number: u64) -> PullRequestDetail { sample_pull_request(number) }

    pub fn calls(&self) -> Vec<String> { self.calls.snapshot() }
}

//! In-memory stand-ins for the external tools and services the
//! orchestration core talks to.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::models::{AccessGrant, Range, RangeState, User};
use crate::server::exec::{CommandRunner, CommandSpec, ExecError, LogMode};
use crate::server::process_table::{BuildingTemplate, ProcessControl};
use crate::server::notify::NotificationDispatcher;
use crate::server::range::store::RangeStore;
use crate::server::range::RangeController;
use crate::server::settings::{BuildSettings, HypervisorSettings};
use crate::server::state::{AppState, UserDirectory};
use crate::server::template::inventory::TemplateInventory;
use crate::server::template::registry::BuildRegistry;
use crate::server::template::TemplateService;
use crate::server::workspace::Workspace;

pub fn hypervisor() -> HypervisorSettings {
    HypervisorSettings {
        node: "pve1".to_string(),
        url: "https://10.0.0.1:8006".to_string(),
        hostname: None,
        invalid_cert: true,
        vm_storage_pool: "local".to_string(),
        vm_storage_format: "qcow2".to_string(),
        iso_storage_pool: "local".to_string(),
        nat_interface: "vmbr0".to_string(),
        api_token: None,
    }
}

fn exit_status(code: i32) -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(code << 8)
}

/// Records every command and writes a canned output to its log
#[derive(Default)]
pub struct RecordingRunner {
    started: Mutex<Vec<CommandSpec>>,
    output: Option<String>,
    fail: bool,
    delay: Duration,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl RecordingRunner {
    pub fn succeeding_with(output: &str) -> Self {
        Self {
            output: Some(output.to_string()),
            ..Default::default()
        }
    }

    pub fn failing_with(output: &str) -> Self {
        Self {
            output: Some(output.to_string()),
            fail: true,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn started(&self) -> Vec<CommandSpec> {
        self.started.lock().unwrap().clone()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<String, ExecError> {
        self.started.lock().unwrap().push(spec.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let output = self
            .output
            .clone()
            .unwrap_or_else(|| crate::server::exec::NO_OUTPUT.to_string());
        if let Some(parent) = spec.log.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut options = std::fs::OpenOptions::new();
        options.create(true);
        match spec.log.mode {
            LogMode::Append => options.append(true),
            LogMode::Truncate => options.write(true).truncate(true),
        };
        std::io::Write::write_all(&mut options.open(&spec.log.path)?, output.as_bytes())?;

        self.running.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            Err(ExecError::Exit {
                status: exit_status(2),
                output,
            })
        } else {
            Ok(output)
        }
    }
}

/// Template VMs held in memory; shared so fake builds can mark templates built
#[derive(Default, Clone)]
pub struct FakeInventory {
    pub built: Arc<Mutex<HashSet<String>>>,
}

impl FakeInventory {
    pub fn mark_built(&self, name: &str) {
        self.built.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl TemplateInventory for FakeInventory {
    async fn template_names(&self, _owner: &str, _password: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.built.lock().unwrap().iter().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Canned process table that records which pids were terminated
#[derive(Default)]
pub struct FakeProcesses {
    pub builds: Vec<BuildingTemplate>,
    pub packer_pids: Vec<(String, i32)>,
    pub playbook_pids: Vec<(String, i32)>,
    pub terminated: Mutex<Vec<i32>>,
}

impl FakeProcesses {
    pub fn terminated(&self) -> Vec<i32> {
        self.terminated.lock().unwrap().clone()
    }
}

impl ProcessControl for FakeProcesses {
    fn running_builds(&self) -> Vec<BuildingTemplate> {
        self.builds.clone()
    }

    fn packer_pids_for_user(&self, user: &str) -> Vec<i32> {
        self.packer_pids
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, pid)| *pid)
            .collect()
    }

    fn playbook_pid_for_user(&self, user: &str) -> Option<i32> {
        self.playbook_pids
            .iter()
            .find(|(u, _)| u == user)
            .map(|(_, pid)| *pid)
    }

    fn terminate_tree(&self, pid: i32) {
        self.terminated.lock().unwrap().push(pid);
    }
}

pub fn user(user_id: &str, username: &str) -> User {
    User {
        user_id: user_id.to_string(),
        name: format!("{} user", username),
        username: username.to_string(),
        is_admin: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn range(range_number: i32, user_id: &str) -> Range {
    Range {
        range_number,
        user_id: user_id.to_string(),
        name: format!("{}-range", user_id),
        testing_enabled: false,
        allowed_domains: Vec::new(),
        allowed_ips: Vec::new(),
        range_state: RangeState::NeverDeployed,
        last_deployment: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Ranges kept in memory, with the history of every state write
#[derive(Default)]
pub struct MemoryRangeStore {
    ranges: Mutex<Vec<Range>>,
    history: Mutex<Vec<(i32, RangeState)>>,
    pub grants: Vec<AccessGrant>,
}

impl MemoryRangeStore {
    pub fn with_range(range: Range) -> Self {
        let store = Self::default();
        store.ranges.lock().unwrap().push(range);
        store
    }

    pub fn range(&self, range_number: i32) -> Range {
        self.ranges
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.range_number == range_number)
            .cloned()
            .expect("range exists")
    }

    /// States written for `range_number`, oldest first
    pub fn history(&self, range_number: i32) -> Vec<RangeState> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == range_number)
            .map(|(_, s)| *s)
            .collect()
    }

    fn update(&self, range_number: i32, f: impl FnOnce(&mut Range)) {
        if let Some(range) = self
            .ranges
            .lock()
            .unwrap()
            .iter_mut()
            .find(|r| r.range_number == range_number)
        {
            f(range);
        }
    }
}

#[async_trait]
impl RangeStore for MemoryRangeStore {
    async fn find_owner_range(&self, user_id: &str) -> Result<Option<Range>> {
        Ok(self
            .ranges
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.user_id == user_id)
            .cloned())
    }

    async fn mark_deploying(&self, range_number: i32, at: DateTime<Utc>) -> Result<()> {
        self.history
            .lock()
            .unwrap()
            .push((range_number, RangeState::Deploying));
        self.update(range_number, |r| {
            r.range_state = RangeState::Deploying;
            r.last_deployment = Some(at);
        });
        Ok(())
    }

    async fn set_state(&self, range_number: i32, state: RangeState) -> Result<()> {
        self.history.lock().unwrap().push((range_number, state));
        self.update(range_number, |r| r.range_state = state);
        Ok(())
    }

    async fn reset_testing(&self, range_number: i32) -> Result<()> {
        self.update(range_number, |r| {
            r.testing_enabled = false;
            r.allowed_domains.clear();
            r.allowed_ips.clear();
        });
        Ok(())
    }

    async fn access_grants(&self, _user_id: &str) -> Result<Vec<AccessGrant>> {
        Ok(self.grants.clone())
    }
}

/// Users known to the owner middleware
#[derive(Default)]
pub struct FakeUsers {
    pub users: Vec<User>,
}

#[async_trait]
impl UserDirectory for FakeUsers {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self.users.iter().find(|u| u.username == username).cloned())
    }
}

/// Application state over `install_dir` with one tenant, `jdoe`, owning range 7
pub fn app_state(install_dir: &std::path::Path, processes: FakeProcesses) -> AppState {
    let workspace = Workspace::new(install_dir);
    let runner = Arc::new(RecordingRunner::default());
    let processes = Arc::new(processes);

    let ranges = RangeController::new(
        Arc::new(MemoryRangeStore::with_range(range(7, "JD"))),
        runner.clone(),
        processes.clone(),
        Arc::new(NotificationDispatcher::default()),
        workspace.clone(),
        hypervisor(),
        false,
    );
    let templates = TemplateService::new(
        workspace,
        Arc::new(BuildRegistry::new()),
        runner,
        Arc::new(FakeInventory::default()),
        processes,
        hypervisor(),
        &BuildSettings {
            launch_spacing_secs: 0,
            cancel_window_secs: 10,
            max_parallelism: 4,
        },
    );

    AppState {
        users: Arc::new(FakeUsers {
            users: vec![user("JD", "jdoe")],
        }),
        ranges: Arc::new(ranges),
        templates: Arc::new(templates),
    }
}

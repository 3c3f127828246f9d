use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::playbook::{playbook_names, PlaybookContext, PlaybookInvocation, PlaybookProfile};
use super::state_machine::validate_transition;
use super::store::RangeStore;
use crate::db::models::{Range, RangeState, User};
use crate::server::exec::CommandRunner;
use crate::server::faults::scan_fault_file;
use crate::server::notify::{NotificationDispatcher, NotificationPayload, NotifyError};
use crate::server::process_table::ProcessControl;
use crate::server::settings::HypervisorSettings;
use crate::server::workspace::Workspace;

/// Tags the range management playbook understands
pub const KNOWN_TAGS: &[&str] = &[
    "all",
    "additional-tools",
    "allow-share-access",
    "assign-ip",
    "custom-choco",
    "custom-groups",
    "dcs",
    "debug",
    "dns-rewrites",
    "domain-join",
    "install-office",
    "install-visual-studio",
    "network",
    "nexus",
    "share",
    "sysprep",
    "user-defined-roles",
    "vm-deploy",
    "windows",
];

const DESTROY_TAG: &str = "destroy-range";

#[derive(Debug, thiserror::Error)]
pub enum RangeError {
    #[error("The tag '{0}' does not exist on the server")]
    UnknownTag(String),

    #[error("No range found for user {0}")]
    RangeNotFound(String),

    #[error("The range has an active deployment running. Abort it first or deploy with force")]
    AlreadyDeploying,

    #[error("Testing enabled; a deploy requires internet access to succeed. Deploy with force to try anyway")]
    TestingEnabled,

    #[error("The role '{role}' does not exist on the server for user {range_id}")]
    UnknownRole { role: String, range_id: String },

    #[error("Could not get the hypervisor password for user {0}")]
    MissingCredentials(String),

    #[error("No playbook process found for user {0}")]
    NoPlaybookProcess(String),

    #[error(transparent)]
    Notification(#[from] NotifyError),

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Body of a deploy request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeployRequest {
    /// Comma separated tags; empty means `all`
    pub tags: String,
    pub force: bool,
    pub verbose: bool,
    pub only_roles: Vec<String>,
    pub limit: Option<String>,
}

/// Validate a comma separated tag list against [`KNOWN_TAGS`]
pub fn validate_tags(tags: &str) -> Result<String, RangeError> {
    if tags.is_empty() {
        return Ok("all".to_string());
    }
    for tag in tags.split(',') {
        if !KNOWN_TAGS.contains(&tag) {
            return Err(RangeError::UnknownTag(tag.to_string()));
        }
    }
    Ok(tags.to_string())
}

/// Drives deploy, destroy and abort for tenant ranges
#[derive(Clone)]
pub struct RangeController {
    store: Arc<dyn RangeStore>,
    runner: Arc<dyn CommandRunner>,
    processes: Arc<dyn ProcessControl>,
    notifier: Arc<NotificationDispatcher>,
    playbooks: PlaybookContext,
    workspace: Workspace,
    host: String,
}

impl RangeController {
    pub fn new(
        store: Arc<dyn RangeStore>,
        runner: Arc<dyn CommandRunner>,
        processes: Arc<dyn ProcessControl>,
        notifier: Arc<NotificationDispatcher>,
        workspace: Workspace,
        hypervisor: HypervisorSettings,
        enterprise_license: bool,
    ) -> Self {
        let host = hypervisor.hostname().to_string();
        Self {
            store,
            runner,
            processes,
            notifier,
            playbooks: PlaybookContext::new(workspace.clone(), hypervisor, enterprise_license),
            workspace,
            host,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    async fn owner_range(&self, owner: &User) -> Result<Range, RangeError> {
        self.store
            .find_owner_range(&owner.user_id)
            .await?
            .ok_or_else(|| RangeError::RangeNotFound(owner.user_id.clone()))
    }

    async fn profile(&self, owner: &User) -> Result<PlaybookProfile, RangeError> {
        if owner.is_root() {
            return Ok(PlaybookProfile::Root);
        }
        match self.workspace.read_password(&owner.username).await? {
            Some(password) => Ok(PlaybookProfile::Owner { password }),
            None => Err(RangeError::MissingCredentials(owner.username.clone())),
        }
    }

    /// Start a deployment and return once `DEPLOYING` is recorded.
    ///
    /// The returned handle resolves after the outcome was written and the
    /// owner notified.
    pub async fn deploy(
        &self,
        owner: &User,
        request: DeployRequest,
    ) -> Result<JoinHandle<()>, RangeError> {
        let tags = validate_tags(&request.tags)?;
        let range = self.owner_range(owner).await?;

        if range.range_state == RangeState::Deploying && !request.force {
            return Err(RangeError::AlreadyDeploying);
        }
        if range.testing_enabled && !request.force {
            return Err(RangeError::TestingEnabled);
        }

        let only_roles: Vec<String> = request
            .only_roles
            .into_iter()
            .filter(|r| !r.is_empty())
            .collect();
        for role in &only_roles {
            if !self.workspace.role_installed(&owner.username, role).await {
                return Err(RangeError::UnknownRole {
                    role: role.clone(),
                    range_id: range.user_id.clone(),
                });
            }
        }

        let profile = self.profile(owner).await?;
        let grants = self.store.access_grants(&owner.user_id).await?;

        self.store
            .mark_deploying(range.range_number, Utc::now())
            .await?;
        info!(range_id = %range.user_id, tags = %tags, force = request.force, "Range deploy started");

        let invocation = PlaybookInvocation::new(self.workspace.main_playbook())
            .tags(tags)
            .limit(request.limit)
            .verbose(request.verbose)
            .extra_var("only_roles", json!(only_roles));
        let spec = self
            .playbooks
            .command(owner, &range, &grants, &profile, &invocation);

        let this = self.clone();
        let owner = owner.clone();
        Ok(tokio::spawn(async move {
            if let Err(e) = this.playbooks.ensure_user_defined_roles(&owner.username).await {
                warn!(range_id = %range.user_id, "Failed to write user-defined roles placeholder: {}", e);
            }

            debug!(range_id = %range.user_id, "Running {}", spec.display());
            let started = Instant::now();
            let result = this.runner.run(&spec).await;
            let elapsed = started.elapsed();

            let success = match &result {
                Ok(_) => {
                    info!(range_id = %range.user_id, "Range deploy succeeded");
                    true
                }
                Err(e) => {
                    error!(range_id = %range.user_id, "Range deploy failed: {}", e);
                    false
                }
            };
            let outcome = if success {
                RangeState::Success
            } else {
                RangeState::Error
            };
            this.record_outcome(&range, outcome).await;

            let faults = if success {
                Vec::new()
            } else {
                scan_fault_file(&spec.log.path).await
            };
            let payload = NotificationPayload::new(
                success,
                &range.user_id,
                Some(this.host.clone()),
                &faults,
                false,
                elapsed,
            );
            if let Err(e) = this
                .notifier
                .send(&this.workspace.range_config(&owner.username), &payload)
                .await
            {
                warn!(range_id = %range.user_id, "Failed to send deploy notification: {}", e);
            }
        }))
    }

    /// Start destroying every VM of the owner's range
    pub async fn destroy(&self, owner: &User) -> Result<JoinHandle<()>, RangeError> {
        let range = self.owner_range(owner).await?;
        let profile = self.profile(owner).await?;
        let grants = self.store.access_grants(&owner.user_id).await?;

        self.store
            .set_state(range.range_number, RangeState::Destroying)
            .await?;
        info!(range_id = %range.user_id, "Range destroy started");

        let invocation =
            PlaybookInvocation::new(self.workspace.power_playbook()).tags(DESTROY_TAG);
        let spec = self
            .playbooks
            .command(owner, &range, &grants, &profile, &invocation);

        let this = self.clone();
        Ok(tokio::spawn(async move {
            debug!(range_id = %range.user_id, playbooks = ?playbook_names(&spec), "Running {}", spec.display());
            if let Err(e) = this.runner.run(&spec).await {
                error!(range_id = %range.user_id, "Range destroy failed: {}", e);
                let block = format!(
                    "==================\nError with {}\nrange {} ({})\n{}\n==================\n",
                    DESTROY_TAG, range.user_id, range.range_number, e
                );
                if let Err(e) = append_debug_log(&this.workspace, &block).await {
                    warn!("Failed to write destroy debug log: {}", e);
                }
                this.record_outcome(&range, RangeState::Error).await;
                return;
            }

            if range.testing_enabled {
                if let Err(e) = this.store.reset_testing(range.range_number).await {
                    error!(range_id = %range.user_id, "Failed to leave testing mode: {:#}", e);
                }
            }
            info!(range_id = %range.user_id, "Range destroyed");
            this.record_outcome(&range, RangeState::Destroyed).await;
        }))
    }

    /// Kill the owner's running playbook and mark the range aborted
    pub async fn abort(&self, owner: &User) -> Result<(), RangeError> {
        let pid = self
            .processes
            .playbook_pid_for_user(&owner.username)
            .ok_or_else(|| RangeError::NoPlaybookProcess(owner.username.clone()))?;
        info!(owner = %owner.username, pid, "Aborting playbook");
        self.processes.terminate_tree(pid);

        let range = self.owner_range(owner).await?;
        self.store
            .set_state(range.range_number, RangeState::Aborted)
            .await?;
        Ok(())
    }

    /// Send a test notification to the owner's configured destinations
    pub async fn notify_test(&self, owner: &User) -> Result<(), RangeError> {
        let payload = NotificationPayload::new(
            true,
            &owner.user_id,
            Some(self.host.clone()),
            &[],
            true,
            std::time::Duration::ZERO,
        );
        self.notifier
            .send(&self.workspace.range_config(&owner.username), &payload)
            .await?;
        Ok(())
    }

    /// Write a terminal state. A concurrent change, such as an abort, is
    /// logged but the write still happens.
    async fn record_outcome(&self, range: &Range, to: RangeState) {
        match self.store.find_owner_range(&range.user_id).await {
            Ok(Some(current)) => {
                if let Err(e) = validate_transition(&current.range_state, &to) {
                    warn!(range_id = %range.user_id, "Range changed while the playbook ran: {}", e);
                }
            }
            Ok(None) => warn!(range_id = %range.user_id, "Range disappeared while the playbook ran"),
            Err(e) => warn!(range_id = %range.user_id, "Failed to read range state: {:#}", e),
        }

        if let Err(e) = self.store.set_state(range.range_number, to).await {
            error!(range_id = %range.user_id, state = %to, "Failed to record range state: {:#}", e);
        }
    }
}

async fn append_debug_log(workspace: &Workspace, block: &str) -> std::io::Result<()> {
    let path = workspace.destroy_debug_log();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(block.as_bytes()).await?;
    file.flush().await
}

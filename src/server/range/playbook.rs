use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

use crate::db::models::{AccessGrant, Range, User};
use crate::server::exec::{CommandSpec, LogSink};
use crate::server::settings::HypervisorSettings;
use crate::server::workspace::Workspace;

const USER_DEFINED_ROLES_PLACEHOLDER: &str = r#"- name: Run debug task on localhost
  tags: [user-defined-roles]
  hosts: localhost
  gather_facts: false
  tasks:
    - name: No user-defined roles to run
      ansible.builtin.debug:
        msg: "No user-defined roles to run"
"#;

/// Inventory used when the playbook only acts on the server itself
const LOCAL_INVENTORY: &str = "127.0.0.1,";

/// Who the playbook runs for
#[derive(Debug, Clone)]
pub enum PlaybookProfile {
    /// A tenant, with the dynamic inventory and their hypervisor credentials
    Owner { password: String },
    /// The administrative account: local inventory, no tenant config
    Root,
}

/// One `ansible-playbook` run as requested by the controller
#[derive(Debug, Clone, Default)]
pub struct PlaybookInvocation {
    pub playbooks: Vec<PathBuf>,
    /// Overrides the contextual variables on key collisions
    pub extra_vars: Map<String, Value>,
    pub extra_var_files: Vec<PathBuf>,
    pub tags: Option<String>,
    pub limit: Option<String>,
    pub verbose: bool,
}

impl PlaybookInvocation {
    pub fn new(playbook: PathBuf) -> Self {
        Self {
            playbooks: vec![playbook],
            ..Default::default()
        }
    }

    pub fn tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    pub fn limit(mut self, limit: Option<String>) -> Self {
        self.limit = limit.filter(|l| !l.is_empty());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn extra_var(mut self, key: &str, value: Value) -> Self {
        self.extra_vars.insert(key.to_string(), value);
        self
    }
}

/// A non-empty limit must keep `localhost` so the control tasks still run
fn limit_with_localhost(limit: &str) -> String {
    if limit.contains("localhost") {
        limit.to_string()
    } else {
        format!("{},localhost", limit)
    }
}

/// Builds `ansible-playbook` command specs for a range
#[derive(Debug, Clone)]
pub struct PlaybookContext {
    workspace: Workspace,
    hypervisor: HypervisorSettings,
    enterprise_license: bool,
}

impl PlaybookContext {
    pub fn new(workspace: Workspace, hypervisor: HypervisorSettings, enterprise_license: bool) -> Self {
        Self {
            workspace,
            hypervisor,
            enterprise_license,
        }
    }

    fn context_vars(&self, owner: &User, range: &Range, grants: &[AccessGrant]) -> Map<String, Value> {
        let vars = json!({
            "username": owner.username,
            "range_id": owner.user_id,
            "range_second_octet": range.range_number,
            "access_grants_array": grants,
            "testing_enabled": range.testing_enabled,
            "enterprise_license": self.enterprise_license,
        });
        match vars {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    pub fn command(
        &self,
        owner: &User,
        range: &Range,
        grants: &[AccessGrant],
        profile: &PlaybookProfile,
        invocation: &PlaybookInvocation,
    ) -> CommandSpec {
        let ws = &self.workspace;
        let hv = &self.hypervisor;
        let username = owner.username.as_str();
        let ansible_home = ws.ansible_home(username);

        let mut vars = self.context_vars(owner, range, grants);
        vars.extend(invocation.extra_vars.clone());

        let mut var_files = vec![ws.server_config(), ws.ansible_server_config()];
        let inventory = match profile {
            PlaybookProfile::Owner { .. } => {
                var_files.push(ws.range_config(username));
                ws.inventory_script().display().to_string()
            }
            PlaybookProfile::Root => LOCAL_INVENTORY.to_string(),
        };
        var_files.extend(invocation.extra_var_files.iter().cloned());

        let mut args = vec![
            "-i".to_string(),
            inventory,
            "-c".to_string(),
            "local".to_string(),
        ];
        for file in &var_files {
            args.push("-e".to_string());
            args.push(format!("@{}", file.display()));
        }
        args.push("-e".to_string());
        args.push(Value::Object(vars).to_string());
        if let Some(limit) = invocation.limit.as_deref().filter(|l| !l.is_empty()) {
            args.push("--limit".to_string());
            args.push(limit_with_localhost(limit));
        }
        if let Some(tags) = invocation.tags.as_deref().filter(|t| !t.is_empty()) {
            args.push("--tags".to_string());
            args.push(tags.to_string());
        }
        if invocation.verbose {
            args.push("-v".to_string());
        }
        args.extend(invocation.playbooks.iter().map(|p| p.display().to_string()));

        let mut env = vec![
            ("ANSIBLE_NOCOLOR".to_string(), "true".to_string()),
            ("ANSIBLE_HOME".to_string(), ansible_home.display().to_string()),
            (
                "ANSIBLE_SSH_CONTROL_PATH_DIR".to_string(),
                ansible_home.join("cp").display().to_string(),
            ),
            (
                "ANSIBLE_ROLES_PATH".to_string(),
                format!(
                    "{}:{}",
                    ansible_home.join("roles").display(),
                    ws.global_roles_dir().display()
                ),
            ),
            ("PROXMOX_NODE".to_string(), hv.node.clone()),
            ("PROXMOX_INVALID_CERT".to_string(), hv.invalid_cert.to_string()),
            ("PROXMOX_URL".to_string(), hv.url.clone()),
            ("PROXMOX_HOSTNAME".to_string(), hv.hostname().to_string()),
        ];
        if let PlaybookProfile::Owner { password } = profile {
            env.extend([
                ("PROXMOX_USERNAME".to_string(), owner.pam_username()),
                ("PROXMOX_PASSWORD".to_string(), password.clone()),
                (
                    "RANGE_CONFIG".to_string(),
                    ws.range_config(username).display().to_string(),
                ),
                ("RANGE_NUMBER".to_string(), range.range_number.to_string()),
                ("RANGE_ID".to_string(), range.user_id.clone()),
            ]);
        }

        CommandSpec {
            program: "ansible-playbook".to_string(),
            args,
            working_dir: ws.range_management_dir(),
            env,
            log: LogSink::truncate(ws.ansible_log(username)),
        }
    }

    /// Write the placeholder `user-defined-roles.yml` into the owner's ansible
    /// home unless one exists already
    pub async fn ensure_user_defined_roles(&self, username: &str) -> std::io::Result<PathBuf> {
        let path = self.workspace.ansible_home(username).join("user-defined-roles.yml");
        if tokio::fs::try_exists(&path).await? {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, USER_DEFINED_ROLES_PLACEHOLDER).await?;
        tracing::debug!("Wrote placeholder {}", path.display());
        Ok(path)
    }
}

/// Path arguments of a spec, for log messages
pub fn playbook_names(spec: &CommandSpec) -> Vec<&str> {
    spec.args
        .iter()
        .filter(|a| a.ends_with(".yml") && !a.starts_with('@'))
        .filter_map(|a| Path::new(a).file_name().and_then(|n| n.to_str()))
        .collect()
}

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// On-disk layout of the installation and of each tenant's working directory.
///
/// Every path handed to external tools is derived here, so handlers and the
/// orchestration core never format paths themselves.
#[derive(Debug, Clone)]
pub struct Workspace {
    install_dir: PathBuf,
}

impl Workspace {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn users_dir(&self) -> PathBuf {
        self.install_dir.join("users")
    }

    pub fn user_dir(&self, username: &str) -> PathBuf {
        self.users_dir().join(username)
    }

    /// Marker whose fresh mtime halts template builds of `username`
    pub fn canary_path(&self, username: &str) -> PathBuf {
        self.user_dir(username).join(".stop-template-build")
    }

    pub fn range_config(&self, username: &str) -> PathBuf {
        self.user_dir(username).join("range-config.yml")
    }

    pub fn ansible_log(&self, username: &str) -> PathBuf {
        self.user_dir(username).join("ansible.log")
    }

    pub fn packer_log(&self, username: &str) -> PathBuf {
        self.user_dir(username).join("packer.log")
    }

    pub fn packer_debug_log(&self, username: &str) -> PathBuf {
        self.user_dir(username).join("packer-debug.log")
    }

    pub fn ansible_home(&self, username: &str) -> PathBuf {
        self.user_dir(username).join(".ansible")
    }

    pub fn user_packer_dir(&self, username: &str) -> PathBuf {
        self.user_dir(username).join("packer")
    }

    pub fn global_packer_dir(&self) -> PathBuf {
        self.install_dir.join("packer")
    }

    pub fn packer_plugin_dir(&self) -> PathBuf {
        self.install_dir.join("resources/packer/plugins")
    }

    pub fn global_roles_dir(&self) -> PathBuf {
        self.install_dir.join("resources/global-roles")
    }

    /// Shared log collecting the output of failed destroys across tenants
    pub fn destroy_debug_log(&self) -> PathBuf {
        self.users_dir().join("ansible-debug.log")
    }

    pub fn server_config(&self) -> PathBuf {
        self.install_dir.join("config.yml")
    }

    pub fn ansible_server_config(&self) -> PathBuf {
        self.install_dir.join("ansible/server-config.yml")
    }

    pub fn range_management_dir(&self) -> PathBuf {
        self.install_dir.join("ansible/range-management")
    }

    pub fn inventory_script(&self) -> PathBuf {
        self.range_management_dir().join("proxmox.py")
    }

    pub fn main_playbook(&self) -> PathBuf {
        self.range_management_dir().join("ludus.yml")
    }

    pub fn power_playbook(&self) -> PathBuf {
        self.range_management_dir().join("power.yml")
    }

    /// Whether `role` is installed for the tenant or globally.
    ///
    /// A name with two dots is a collection role (`namespace.collection.role`);
    /// it counts as installed when its collection is.
    pub async fn role_installed(&self, username: &str, role: &str) -> bool {
        if role.is_empty() || role.contains('/') || role.contains("..") {
            return false;
        }

        let candidates = if role.matches('.').count() == 2 {
            let mut parts = role.split('.');
            let (Some(namespace), Some(collection)) = (parts.next(), parts.next()) else {
                return false;
            };
            vec![self
                .ansible_home(username)
                .join("collections/ansible_collections")
                .join(namespace)
                .join(collection)]
        } else {
            vec![
                self.ansible_home(username).join("roles").join(role),
                self.global_roles_dir().join(role),
            ]
        };

        for path in candidates {
            if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
                return true;
            }
        }
        false
    }

    /// Read the tenant's hypervisor password.
    ///
    /// Returns `Ok(None)` when the password file is missing or empty.
    pub async fn read_password(&self, username: &str) -> Result<Option<String>> {
        let path = self.user_dir(username).join("proxmox_password");
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let password = contents.trim().to_string();
                Ok((!password.is_empty()).then_some(password))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}

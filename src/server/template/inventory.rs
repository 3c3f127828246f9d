use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::server::settings::HypervisorSettings;
use crate::server::workspace::Workspace;

/// One buildable template, recomputed per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSubject {
    pub name: String,
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
    pub built: bool,
}

/// Source of the template VMs that already exist on the hypervisor
#[async_trait]
pub trait TemplateInventory: Send + Sync {
    /// Names of all template VMs visible with `owner`'s credentials
    async fn template_names(&self, owner: &str, password: &str) -> Result<Vec<String>>;
}

/// First `...-template` token in a build definition
pub fn template_name_in(contents: &str) -> Option<&str> {
    lazy_static::lazy_static! {
        static ref TEMPLATE_NAME_RE: regex::Regex =
            regex::Regex::new(r#"(?m)[^"]*?-template"#).expect("valid regex");
    }
    TEMPLATE_NAME_RE.find(contents).map(|m| m.as_str())
}

pub fn read_template_name(path: &Path) -> std::io::Result<Option<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(template_name_in(&contents).map(str::to_string))
}

/// Recursively collect files under `dir` whose name ends with one of `suffixes`.
///
/// A missing directory yields no files.
pub fn find_build_files(dir: &Path, suffixes: &[&str]) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| suffixes.iter().any(|s| n.ends_with(s)))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Global build definitions plus the owner's own ones
pub fn discover_build_files(workspace: &Workspace, owner: &str) -> Result<Vec<PathBuf>> {
    let mut files = find_build_files(&workspace.global_packer_dir(), &["pkr.hcl", "pkr.json"])
        .context("Unable to list global build templates")?;
    files.extend(
        find_build_files(&workspace.user_packer_dir(owner), &[".hcl", ".json"])
            .context("Unable to list user build templates")?,
    );
    Ok(files)
}

/// Cross-reference build files with existing template VMs.
///
/// Files without a recognizable template name are skipped. Template VMs
/// without a build file are listed as built with no file.
pub fn build_subjects(files: &[PathBuf], template_vms: &[String]) -> Vec<BuildSubject> {
    let mut subjects: Vec<BuildSubject> = Vec::new();
    for file in files {
        let name = match read_template_name(file) {
            Ok(Some(name)) => name,
            Ok(None) => {
                tracing::warn!("Could not find template name in {}", file.display());
                continue;
            }
            Err(e) => {
                tracing::warn!("Error reading {}: {}", file.display(), e);
                continue;
            }
        };
        subjects.push(BuildSubject {
            built: template_vms.contains(&name),
            name,
            file_path: Some(file.clone()),
        });
    }

    for vm in template_vms {
        if !subjects.iter().any(|s| &s.name == vm) {
            subjects.push(BuildSubject {
                name: vm.clone(),
                file_path: None,
                built: true,
            });
        }
    }
    subjects
}

#[derive(Debug, Deserialize)]
struct ApiList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct VmResource {
    name: Option<String>,
    #[serde(default)]
    template: u8,
}

#[derive(Debug, Deserialize)]
struct Ticket {
    ticket: String,
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    data: Ticket,
}

/// Lists template VMs through the hypervisor's HTTP API.
///
/// Uses the configured API token when present, otherwise a ticket obtained
/// with the owner's own credentials.
pub struct HypervisorInventory {
    client: reqwest::Client,
    settings: HypervisorSettings,
}

impl HypervisorInventory {
    pub fn new(settings: HypervisorSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.invalid_cert)
            .build()
            .context("Failed to build hypervisor HTTP client")?;
        Ok(Self { client, settings })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api2/json{}", self.settings.url.trim_end_matches('/'), path)
    }

    async fn ticket(&self, owner: &str, password: &str) -> Result<String> {
        let response = self
            .client
            .post(self.api_url("/access/ticket"))
            .form(&[
                ("username", format!("{}@pam", owner)),
                ("password", password.to_string()),
            ])
            .send()
            .await
            .context("Failed to reach hypervisor API")?
            .error_for_status()
            .context("Hypervisor rejected credentials")?
            .json::<TicketResponse>()
            .await
            .context("Invalid ticket response from hypervisor")?;
        Ok(response.data.ticket)
    }
}

#[async_trait]
impl TemplateInventory for HypervisorInventory {
    async fn template_names(&self, owner: &str, password: &str) -> Result<Vec<String>> {
        let mut request = self
            .client
            .get(self.api_url("/cluster/resources"))
            .query(&[("type", "vm")]);

        request = match self.settings.api_token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => request.header("Authorization", format!("PVEAPIToken={}", token)),
            None => {
                let ticket = self.ticket(owner, password).await?;
                request.header("Cookie", format!("PVEAuthCookie={}", ticket))
            }
        };

        let resources = request
            .send()
            .await
            .context("Failed to reach hypervisor API")?
            .error_for_status()
            .context("Hypervisor refused to list VMs")?
            .json::<ApiList<VmResource>>()
            .await
            .context("Invalid VM list from hypervisor")?;

        Ok(resources
            .data
            .into_iter()
            .filter(|vm| vm.template == 1)
            .filter_map(|vm| vm.name)
            .collect())
    }
}

pub mod handlers;
pub mod inventory;
pub mod packer;
pub mod registry;
pub mod routes;
pub mod scheduler;

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::models::User;
use crate::server::cancel::{AbortScope, AbortTokens, CanaryFile};
use crate::server::exec::CommandRunner;
use crate::server::logs::{read_log, LogQuery, LogSlice};
use crate::server::process_table::{BuildingTemplate, ProcessControl};
use crate::server::settings::{BuildSettings, HypervisorSettings};
use crate::server::workspace::Workspace;
use inventory::{build_subjects, discover_build_files, BuildSubject, TemplateInventory};
use packer::PackerContext;
use registry::BuildRegistry;
use scheduler::{BuildOwner, BuildSummary, Selection, TemplateScheduler};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template '{0}' not found")]
    UnknownTemplate(String),

    #[error("Could not get the hypervisor password for user {0}")]
    MissingCredentials(String),

    #[error("No packer processes found for user {0}")]
    NoBuildProcess(String),

    #[error("Failed to signal build abort: {0}")]
    Signal(#[source] std::io::Error),

    #[error("{0:#}")]
    Inventory(#[from] anyhow::Error),
}

/// Body of a build request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuildRequest {
    /// Template name, `all` or empty for every unbuilt template
    pub template: String,
    /// Builds run at once; 0 means 1
    pub parallel: usize,
}

/// Template listing, building and aborting for tenants
pub struct TemplateService {
    workspace: Workspace,
    scheduler: TemplateScheduler,
    registry: Arc<BuildRegistry>,
    inventory: Arc<dyn TemplateInventory>,
    processes: Arc<dyn ProcessControl>,
    tokens: AbortTokens,
    canary: CanaryFile,
    cancel_window: Duration,
    max_parallelism: usize,
}

impl TemplateService {
    pub fn new(
        workspace: Workspace,
        registry: Arc<BuildRegistry>,
        runner: Arc<dyn CommandRunner>,
        inventory: Arc<dyn TemplateInventory>,
        processes: Arc<dyn ProcessControl>,
        hypervisor: HypervisorSettings,
        builds: &BuildSettings,
    ) -> Self {
        let scheduler = TemplateScheduler::new(
            Arc::clone(&registry),
            runner,
            Arc::clone(&inventory),
            PackerContext::new(workspace.clone(), hypervisor),
            builds.launch_spacing(),
        );
        Self {
            canary: CanaryFile::new(workspace.clone()),
            workspace,
            scheduler,
            registry,
            inventory,
            processes,
            tokens: AbortTokens::new(),
            cancel_window: builds.cancel_window(),
            max_parallelism: builds.max_parallelism.max(1),
        }
    }

    async fn password(&self, owner: &User) -> Result<String, TemplateError> {
        self.workspace
            .read_password(&owner.username)
            .await?
            .ok_or_else(|| TemplateError::MissingCredentials(owner.username.clone()))
    }

    async fn subjects_with(&self, owner: &User, password: &str) -> Result<Vec<BuildSubject>, TemplateError> {
        let template_vms = self
            .inventory
            .template_names(&owner.username, password)
            .await?;
        let files = discover_build_files(&self.workspace, &owner.username)?;
        Ok(build_subjects(&files, &template_vms))
    }

    /// Every known template and whether it is built
    pub async fn subjects(&self, owner: &User) -> Result<Vec<BuildSubject>, TemplateError> {
        let password = self.password(owner).await?;
        self.subjects_with(owner, &password).await
    }

    /// Start building the requested templates in the background
    pub async fn build(
        &self,
        owner: &User,
        request: BuildRequest,
    ) -> Result<(usize, JoinHandle<BuildSummary>), TemplateError> {
        let password = self.password(owner).await?;
        let subjects = self.subjects_with(owner, &password).await?;

        let selection = Selection::parse(&request.template);
        if let Selection::Named(name) = &selection {
            if !subjects.iter().any(|s| &s.name == name) {
                return Err(TemplateError::UnknownTemplate(name.clone()));
            }
        }

        let parallel = request.parallel.clamp(1, self.max_parallelism);
        if request.parallel > self.max_parallelism {
            warn!(
                owner = %owner.username,
                requested = request.parallel,
                "Capping template build parallelism at {}", self.max_parallelism
            );
        }
        let verbose = parallel == 1;

        let scope = AbortScope::new(
            owner.username.clone(),
            self.tokens.token(&owner.username),
            self.canary.clone(),
            self.cancel_window,
        );
        let build_owner = BuildOwner {
            username: owner.username.clone(),
            password,
            scope,
        };

        info!(owner = %owner.username, selection = ?selection, parallel, "Template build requested");
        let in_flight = self.registry.entries();
        if !in_flight.is_empty() {
            debug!(in_flight = ?in_flight, "Templates already queued or building");
        }
        let handle = self
            .scheduler
            .schedule(subjects, selection, build_owner, parallel, verbose);
        Ok((parallel, handle))
    }

    /// Stop the owner's pending and running template builds
    pub fn abort(&self, owner: &User) -> Result<usize, TemplateError> {
        let username = owner.username.as_str();
        self.canary.signal(username).map_err(TemplateError::Signal)?;
        self.tokens.cancel(username);

        let released = self.registry.release_all_for_owner(username);
        if released > 0 {
            info!(owner = %username, released, "Released queued template builds");
        }

        let pids = self.processes.packer_pids_for_user(username);
        if pids.is_empty() {
            return Err(TemplateError::NoBuildProcess(username.to_string()));
        }
        for pid in &pids {
            self.processes.terminate_tree(*pid);
        }
        Ok(pids.len())
    }

    /// Templates being built right now, by any owner
    pub fn status(&self) -> Vec<BuildingTemplate> {
        self.processes.running_builds()
    }

    pub async fn logs(&self, owner: &User, query: &LogQuery) -> std::io::Result<LogSlice> {
        read_log(&self.workspace.packer_log(&owner.username), query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::{hypervisor, user, FakeInventory, FakeProcesses, RecordingRunner};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        runner: Arc<RecordingRunner>,
        inventory: FakeInventory,
        processes: Arc<FakeProcesses>,
        registry: Arc<BuildRegistry>,
    }

    impl Fixture {
        fn new(processes: FakeProcesses) -> Self {
            let dir = TempDir::new().unwrap();
            let packer_dir = dir.path().join("packer");
            std::fs::create_dir_all(&packer_dir).unwrap();
            for name in ["win11", "debian12"] {
                std::fs::write(
                    packer_dir.join(format!("{}.pkr.hcl", name)),
                    format!("source \"proxmox-iso\" \"x\" {{\n  vm_name = \"{}-template\"\n}}\n", name),
                )
                .unwrap();
            }
            let user_dir = dir.path().join("users/jdoe");
            std::fs::create_dir_all(&user_dir).unwrap();
            std::fs::write(user_dir.join("proxmox_password"), "pw").unwrap();

            Self {
                dir,
                runner: Arc::new(RecordingRunner::default()),
                inventory: FakeInventory::default(),
                processes: Arc::new(processes),
                registry: Arc::new(BuildRegistry::new()),
            }
        }

        fn service(&self) -> TemplateService {
            TemplateService::new(
                Workspace::new(self.dir.path()),
                Arc::clone(&self.registry),
                self.runner.clone(),
                Arc::new(self.inventory.clone()),
                self.processes.clone(),
                hypervisor(),
                &BuildSettings {
                    launch_spacing_secs: 0,
                    cancel_window_secs: 10,
                    max_parallelism: 4,
                },
            )
        }
    }

    #[tokio::test]
    async fn test_subjects_cross_reference_inventory() {
        let fx = Fixture::new(FakeProcesses::default());
        fx.inventory.mark_built("win11-template");
        fx.inventory.mark_built("manual-template");

        let mut subjects = fx.service().subjects(&user("JD", "jdoe")).await.unwrap();
        subjects.sort_by(|a, b| a.name.cmp(&b.name));

        let summary: Vec<(&str, bool, bool)> = subjects
            .iter()
            .map(|s| (s.name.as_str(), s.built, s.file_path.is_some()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("debian12-template", false, true),
                ("manual-template", true, false),
                ("win11-template", true, true),
            ]
        );
    }

    #[tokio::test]
    async fn test_build_all_unbuilt() {
        let fx = Fixture::new(FakeProcesses::default());
        fx.inventory.mark_built("win11-template");

        let (parallel, handle) = fx
            .service()
            .build(&user("JD", "jdoe"), BuildRequest::default())
            .await
            .unwrap();
        let summary = handle.await.unwrap();

        assert_eq!(parallel, 1);
        assert_eq!(summary.admitted, 1);
        let started = fx.runner.started();
        assert!(started[0].display().ends_with("debian12.pkr.hcl"));
        // Single builds are verbose
        assert_eq!(started[0].env_value("PACKER_LOG"), Some("1"));
    }

    #[tokio::test]
    async fn test_unknown_template_is_rejected() {
        let fx = Fixture::new(FakeProcesses::default());
        let request = BuildRequest {
            template: "nope-template".to_string(),
            parallel: 1,
        };
        let err = fx
            .service()
            .build(&user("JD", "jdoe"), request)
            .await
            .unwrap_err();
        assert!(matches!(err, TemplateError::UnknownTemplate(name) if name == "nope-template"));
    }

    #[tokio::test]
    async fn test_parallelism_is_capped() {
        let fx = Fixture::new(FakeProcesses::default());
        let request = BuildRequest {
            template: "all".to_string(),
            parallel: 64,
        };
        let (parallel, handle) = fx
            .service()
            .build(&user("JD", "jdoe"), request)
            .await
            .unwrap();
        handle.await.unwrap();
        assert_eq!(parallel, 4);
        assert_eq!(fx.runner.started()[0].env_value("PACKER_LOG"), Some("0"));
    }

    #[tokio::test]
    async fn test_missing_password() {
        let fx = Fixture::new(FakeProcesses::default());
        let err = fx
            .service()
            .build(&user("AL", "alice"), BuildRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TemplateError::MissingCredentials(_)));
    }

    #[tokio::test]
    async fn test_abort_kills_owner_builds_and_releases_queue() {
        let fx = Fixture::new(FakeProcesses {
            packer_pids: vec![("jdoe".to_string(), 100), ("jdoe".to_string(), 101), ("alice".to_string(), 200)],
            ..Default::default()
        });
        fx.registry.try_admit("win11-template", "jdoe");
        fx.registry.try_admit("debian12-template", "alice");
        let service = fx.service();

        let killed = service.abort(&user("JD", "jdoe")).unwrap();

        assert_eq!(killed, 2);
        assert_eq!(fx.processes.terminated(), vec![100, 101]);
        assert_eq!(
            fx.registry.entries(),
            vec![("debian12-template".to_string(), "alice".to_string())]
        );
        assert!(CanaryFile::new(Workspace::new(fx.dir.path())).is_active("jdoe", Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_abort_without_processes() {
        let fx = Fixture::new(FakeProcesses::default());
        let err = fx.service().abort(&user("JD", "jdoe")).unwrap_err();
        assert!(matches!(err, TemplateError::NoBuildProcess(_)));
    }

    #[tokio::test]
    async fn test_abort_stops_later_admissions() {
        let fx = Fixture::new(FakeProcesses {
            packer_pids: vec![("jdoe".to_string(), 100)],
            ..Default::default()
        });
        let service = fx.service();
        service.abort(&user("JD", "jdoe")).unwrap();

        let (_, handle) = service
            .build(&user("JD", "jdoe"), BuildRequest::default())
            .await
            .unwrap();
        let summary = handle.await.unwrap();
        assert!(summary.aborted);
        assert!(fx.runner.started().is_empty());
    }

    #[test]
    fn test_status_reads_process_table() {
        let fx = Fixture::new(FakeProcesses {
            builds: vec![BuildingTemplate {
                name: "win11-template".to_string(),
                user: "jdoe".to_string(),
            }],
            ..Default::default()
        });
        assert_eq!(fx.service().status().len(), 1);
    }
}

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::server::cancel::AbortScope;
use crate::server::exec::CommandRunner;
use crate::server::template::inventory::{BuildSubject, TemplateInventory};
use crate::server::template::packer::PackerContext;
use crate::server::template::registry::BuildRegistry;

/// Which templates a build request covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Named(String),
}

impl Selection {
    /// `"all"` or an empty name select every template
    pub fn parse(name: &str) -> Self {
        if name.is_empty() || name == "all" {
            Selection::All
        } else {
            Selection::Named(name.to_string())
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Named(wanted) => wanted == name,
        }
    }
}

/// The tenant a batch of builds runs for
#[derive(Debug, Clone)]
pub struct BuildOwner {
    pub username: String,
    pub password: String,
    pub scope: AbortScope,
}

/// Outcome of one scheduling pass, for logging
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub admitted: usize,
    pub skipped_in_progress: usize,
    pub aborted: bool,
}

/// Admits template builds one by one and runs them with bounded parallelism
#[derive(Clone)]
pub struct TemplateScheduler {
    registry: Arc<BuildRegistry>,
    runner: Arc<dyn CommandRunner>,
    inventory: Arc<dyn TemplateInventory>,
    packer: PackerContext,
    launch_spacing: Duration,
}

impl TemplateScheduler {
    pub fn new(
        registry: Arc<BuildRegistry>,
        runner: Arc<dyn CommandRunner>,
        inventory: Arc<dyn TemplateInventory>,
        packer: PackerContext,
        launch_spacing: Duration,
    ) -> Self {
        Self {
            registry,
            runner,
            inventory,
            packer,
            launch_spacing,
        }
    }

    /// Start building every unbuilt subject matching `selection`.
    ///
    /// Returns immediately. The handle resolves once all admitted builds
    /// have finished.
    pub fn schedule(
        &self,
        subjects: Vec<BuildSubject>,
        selection: Selection,
        owner: BuildOwner,
        parallelism: usize,
        verbose: bool,
    ) -> JoinHandle<BuildSummary> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler
                .run(subjects, selection, owner, parallelism.max(1), verbose)
                .await
        })
    }

    async fn run(
        self,
        subjects: Vec<BuildSubject>,
        selection: Selection,
        owner: BuildOwner,
        parallelism: usize,
        verbose: bool,
    ) -> BuildSummary {
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut builds = JoinSet::new();
        let mut summary = BuildSummary::default();

        for subject in subjects {
            if owner.scope.is_aborted() {
                info!(owner = %owner.username, "Build abort requested, admitting no further templates");
                summary.aborted = true;
                break;
            }

            if subject.built || !selection.matches(&subject.name) {
                continue;
            }
            let Some(file) = subject.file_path.clone() else {
                continue;
            };

            let Some(guard) = self.registry.admit(&subject.name, &owner.username) else {
                debug!(template = %subject.name, "Template already queued or building, skipping");
                summary.skipped_in_progress += 1;
                continue;
            };

            // Blocks admission until a slot frees up
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            summary.admitted += 1;

            let task = BuildTask {
                name: subject.name,
                file,
                owner: owner.clone(),
                verbose,
                runner: Arc::clone(&self.runner),
                inventory: Arc::clone(&self.inventory),
                packer: self.packer.clone(),
            };
            builds.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                task.run().await;
            });

            tokio::time::sleep(self.launch_spacing).await;
        }

        while let Some(joined) = builds.join_next().await {
            if let Err(e) = joined {
                error!("Template build task failed: {}", e);
            }
        }

        info!(
            owner = %owner.username,
            admitted = summary.admitted,
            skipped_in_progress = summary.skipped_in_progress,
            aborted = summary.aborted,
            "Template build pass finished"
        );
        summary
    }
}

struct BuildTask {
    name: String,
    file: PathBuf,
    owner: BuildOwner,
    verbose: bool,
    runner: Arc<dyn CommandRunner>,
    inventory: Arc<dyn TemplateInventory>,
    packer: PackerContext,
}

impl BuildTask {
    async fn run(self) {
        let username = &self.owner.username;
        if self.owner.scope.is_aborted() {
            info!(template = %self.name, owner = %username, "Build aborted before start");
            return;
        }

        // Another request may have finished this template while we waited for a slot
        match self
            .inventory
            .template_names(username, &self.owner.password)
            .await
        {
            Ok(names) if names.contains(&self.name) => {
                info!(template = %self.name, "Template was built meanwhile, skipping");
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(
                template = %self.name,
                "Could not re-check template inventory, building anyway: {:#}", e
            ),
        }
        if self.owner.scope.is_aborted() {
            info!(template = %self.name, owner = %username, "Build aborted before start");
            return;
        }

        info!(template = %self.name, owner = %username, file = %self.file.display(), "Building template");
        match self
            .packer
            .build(
                self.runner.as_ref(),
                username,
                &self.owner.password,
                &self.file,
                self.verbose,
            )
            .await
        {
            Ok(_) => info!(template = %self.name, owner = %username, "Template build finished"),
            Err(e) => error!(template = %self.name, owner = %username, "Template build failed: {}", e),
        }
    }
}

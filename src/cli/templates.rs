use anyhow::{Context, Result};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Table};
use std::path::PathBuf;

use crate::server::cancel::CanaryFile;
use crate::server::process_table::{BuildingTemplate, ProcTable, ProcessControl};
use crate::server::workspace::Workspace;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum TemplateCommands {
    /// Show template builds currently running on this host
    Status,
    /// Stop a user's queued and running template builds
    Abort {
        /// Hypervisor username whose builds to stop
        #[arg(long, short)]
        user: String,
        /// Installation directory (defaults to the configured one)
        #[arg(long)]
        install_dir: Option<PathBuf>,
    },
}

pub async fn handle_template_command(cmd: TemplateCommands) -> Result<()> {
    match cmd {
        TemplateCommands::Status => {
            print_status(&ProcTable::default().running_builds());
            Ok(())
        }
        TemplateCommands::Abort { user, install_dir } => {
            let install_dir = match install_dir {
                Some(dir) => dir,
                None => {
                    crate::server::settings::Settings::new()
                        .context("Failed to load configuration; pass --install-dir")?
                        .paths
                        .install_dir
                }
            };
            abort_builds(&Workspace::new(install_dir), &ProcTable::default(), &user)
        }
    }
}

fn print_status(builds: &[BuildingTemplate]) {
    if builds.is_empty() {
        println!("No templates are being built");
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![Cell::new("TEMPLATE"), Cell::new("USER")]);

    for build in builds {
        table.add_row(vec![Cell::new(&build.name), Cell::new(&build.user)]);
    }

    println!("{}", table);
}

/// Touch the abort marker so the server admits no further builds, then kill
/// the user's packer processes
fn abort_builds(workspace: &Workspace, processes: &dyn ProcessControl, user: &str) -> Result<()> {
    CanaryFile::new(workspace.clone())
        .signal(user)
        .with_context(|| format!("Failed to touch abort marker for {}", user))?;

    let pids = processes.packer_pids_for_user(user);
    if pids.is_empty() {
        println!("No packer processes found for user {}", user);
        return Ok(());
    }
    for pid in &pids {
        processes.terminate_tree(*pid);
    }
    println!("Aborted {} packer process(es) for user {}", pids.len(), user);
    Ok(())
}

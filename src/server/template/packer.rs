use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::server::exec::{CommandRunner, CommandSpec, ExecError, LogSink};
use crate::server::settings::HypervisorSettings;
use crate::server::workspace::Workspace;

const PARALLEL_BANNER: &str =
    "\n\n=>================\n=> No logs will be written in parallel mode\n=>================\n\n";
const COMPLETE_BANNER: &str = "\n\n=>================\n=> Build complete!\n=>================\n\n";

/// Everything needed to turn a build file into a `packer build` invocation
#[derive(Debug, Clone)]
pub struct PackerContext {
    workspace: Workspace,
    hypervisor: HypervisorSettings,
}

impl PackerContext {
    pub fn new(workspace: Workspace, hypervisor: HypervisorSettings) -> Self {
        Self {
            workspace,
            hypervisor,
        }
    }

    pub fn command(&self, owner: &str, password: &str, file: &Path, verbose: bool) -> CommandSpec {
        let ws = &self.workspace;
        let hv = &self.hypervisor;
        let packer_dir = ws.user_packer_dir(owner);

        let vars = [
            ("proxmox_url", format!("{}/api2/json", hv.url)),
            ("proxmox_host", hv.node.clone()),
            ("proxmox_username", format!("{}@pam", owner)),
            ("proxmox_skip_tls_verify", hv.invalid_cert.to_string()),
            ("proxmox_pool", "SHARED".to_string()),
            ("proxmox_storage_pool", hv.vm_storage_pool.clone()),
            ("proxmox_storage_format", hv.vm_storage_format.clone()),
            ("iso_storage_pool", hv.iso_storage_pool.clone()),
            ("ansible_home", ws.ansible_home(owner).display().to_string()),
            ("ludus_nat_interface", hv.nat_interface.clone()),
        ];

        let mut args = vec!["build".to_string(), "-on-error=cleanup".to_string()];
        for (key, value) in vars {
            args.push("-var".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(file.display().to_string());

        let env = vec![
            (
                "PACKER_PLUGIN_PATH".to_string(),
                ws.packer_plugin_dir().display().to_string(),
            ),
            ("PKR_VAR_proxmox_password".to_string(), password.to_string()),
            (
                "PACKER_CONFIG_DIR".to_string(),
                packer_dir.display().to_string(),
            ),
            (
                "PACKER_CACHE_DIR".to_string(),
                packer_dir.join("packer_cache").display().to_string(),
            ),
            ("CHECKPOINT_DISABLE".to_string(), "1".to_string()),
            (
                "PACKER_LOG".to_string(),
                if verbose { "1" } else { "0" }.to_string(),
            ),
            (
                "PACKER_LOG_PATH".to_string(),
                ws.packer_log(owner).display().to_string(),
            ),
            (
                "TMPDIR".to_string(),
                packer_dir.join("tmp").display().to_string(),
            ),
        ];

        let working_dir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| ws.install_dir().to_path_buf());

        CommandSpec {
            program: "packer".to_string(),
            args,
            working_dir,
            env,
            log: LogSink::append(ws.packer_debug_log(owner)),
        }
    }

    /// Run one build and keep `packer.log` meaningful for the owner.
    ///
    /// Verbose builds start from a fresh debug log and either announce
    /// completion or copy the debug log over on failure. Parallel builds only
    /// leave a banner since their interleaved output would be unreadable.
    pub async fn build(
        &self,
        runner: &dyn CommandRunner,
        owner: &str,
        password: &str,
        file: &Path,
        verbose: bool,
    ) -> Result<String, ExecError> {
        let ws = &self.workspace;
        let packer_log = ws.packer_log(owner);
        let debug_log = ws.packer_debug_log(owner);

        tokio::fs::create_dir_all(ws.user_packer_dir(owner).join("tmp")).await?;

        if verbose {
            if let Err(e) = tokio::fs::remove_file(&debug_log).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove stale {}: {}", debug_log.display(), e);
                }
            }
        } else {
            append(&packer_log, PARALLEL_BANNER.as_bytes()).await?;
        }

        let spec = self.command(owner, password, file, verbose);
        let result = runner.run(&spec).await;

        if verbose {
            let finish = match &result {
                Ok(_) => append(&packer_log, COMPLETE_BANNER.as_bytes()).await,
                Err(_) => match tokio::fs::read(&debug_log).await {
                    Ok(contents) => append(&packer_log, &contents).await,
                    Err(e) => Err(e),
                },
            };
            if let Err(e) = finish {
                tracing::warn!("Failed to update {}: {}", packer_log.display(), e);
            }
        }

        result
    }
}

async fn append(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::{hypervisor, RecordingRunner};
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_command_shape() {
        let ctx = PackerContext::new(Workspace::new("/opt/labrange"), hypervisor());
        let file = PathBuf::from("/opt/labrange/packer/debian/debian12.pkr.hcl");

        let spec = ctx.command("jdoe", "s3cret", &file, true);

        assert_eq!(spec.program, "packer");
        assert_eq!(spec.args[0], "build");
        assert_eq!(spec.args[1], "-on-error=cleanup");
        assert!(spec
            .args
            .contains(&"proxmox_url=https://10.0.0.1:8006/api2/json".to_string()));
        assert!(spec.args.contains(&"proxmox_username=jdoe@pam".to_string()));
        assert!(spec.args.contains(&"proxmox_pool=SHARED".to_string()));
        assert!(spec
            .args
            .contains(&"ansible_home=/opt/labrange/users/jdoe/.ansible".to_string()));
        // Build templates declare the NAT bridge under this name
        assert!(spec
            .args
            .contains(&"ludus_nat_interface=vmbr0".to_string()));
        assert_eq!(spec.args.last().unwrap(), &file.display().to_string());
        assert!(!spec.args.iter().any(|a| a.contains("s3cret")));

        assert_eq!(spec.env_value("PKR_VAR_proxmox_password"), Some("s3cret"));
        assert_eq!(spec.env_value("PACKER_LOG"), Some("1"));
        assert_eq!(spec.env_value("CHECKPOINT_DISABLE"), Some("1"));
        assert_eq!(
            spec.working_dir,
            PathBuf::from("/opt/labrange/packer/debian")
        );
        assert_eq!(
            spec.log.path,
            PathBuf::from("/opt/labrange/users/jdoe/packer-debug.log")
        );
    }

    #[tokio::test]
    async fn test_parallel_build_writes_banner() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        let ctx = PackerContext::new(ws.clone(), hypervisor());
        let runner = RecordingRunner::default();

        ctx.build(&runner, "jdoe", "pw", &dir.path().join("a.pkr.hcl"), false)
            .await
            .unwrap();

        let log = std::fs::read_to_string(ws.packer_log("jdoe")).unwrap();
        assert!(log.contains("No logs will be written in parallel mode"));
        assert_eq!(runner.started().len(), 1);
    }

    #[tokio::test]
    async fn test_verbose_failure_copies_debug_log() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        let ctx = PackerContext::new(ws.clone(), hypervisor());
        let runner = RecordingRunner::failing_with("==> error: VM creation failed");

        std::fs::create_dir_all(ws.user_dir("jdoe")).unwrap();
        std::fs::write(ws.packer_debug_log("jdoe"), "stale output from last week").unwrap();

        let result = ctx
            .build(&runner, "jdoe", "pw", &dir.path().join("a.pkr.hcl"), true)
            .await;
        assert!(result.is_err());

        let log = std::fs::read_to_string(ws.packer_log("jdoe")).unwrap();
        assert!(log.contains("VM creation failed"));
        assert!(!log.contains("stale output"));
    }

    #[tokio::test]
    async fn test_verbose_success_writes_complete_banner() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        let ctx = PackerContext::new(ws.clone(), hypervisor());
        let runner = RecordingRunner::default();

        ctx.build(&runner, "jdoe", "pw", &dir.path().join("a.pkr.hcl"), true)
            .await
            .unwrap();

        let log = std::fs::read_to_string(ws.packer_log("jdoe")).unwrap();
        assert!(log.contains("Build complete!"));
    }
}

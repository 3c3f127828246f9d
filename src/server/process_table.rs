use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::server::template::inventory::read_template_name;

/// A template build observed in the OS process table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildingTemplate {
    #[serde(rename = "template")]
    pub name: String,
    pub user: String,
}

/// Lookup and signalling of the external tool processes a tenant started
pub trait ProcessControl: Send + Sync {
    /// Templates currently being built by any `packer build` process
    fn running_builds(&self) -> Vec<BuildingTemplate>;

    /// Packer processes acting on behalf of `user`
    fn packer_pids_for_user(&self, user: &str) -> Vec<i32>;

    /// The ansible process whose environment carries `user`'s credentials
    fn playbook_pid_for_user(&self, user: &str) -> Option<i32>;

    /// SIGINT then SIGTERM to the children of `pid`, then SIGINT to `pid`
    fn terminate_tree(&self, pid: i32);
}

/// Process information read from a procfs mount
#[derive(Debug, Clone)]
pub struct ProcTable {
    root: PathBuf,
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new("/proc")
    }
}

#[derive(Debug, Clone)]
struct ProcEntry {
    pid: i32,
    args: Vec<String>,
}

impl ProcEntry {
    fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

impl ProcTable {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pids(&self) -> Vec<i32> {
        let Ok(dir) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut pids: Vec<i32> = dir
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        pids
    }

    fn read_nul_separated(path: &Path) -> Option<Vec<String>> {
        let raw = std::fs::read(path).ok()?;
        Some(
            raw.split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect(),
        )
    }

    fn processes(&self) -> Vec<ProcEntry> {
        self.pids()
            .into_iter()
            .filter_map(|pid| {
                let args =
                    Self::read_nul_separated(&self.root.join(pid.to_string()).join("cmdline"))?;
                (!args.is_empty()).then_some(ProcEntry { pid, args })
            })
            .collect()
    }

    fn environ(&self, pid: i32) -> Vec<String> {
        Self::read_nul_separated(&self.root.join(pid.to_string()).join("environ"))
            .unwrap_or_default()
    }

    /// Parent pid from `/proc/<pid>/stat`; the command name may contain spaces
    fn parent_of(&self, pid: i32) -> Option<i32> {
        let stat = std::fs::read_to_string(self.root.join(pid.to_string()).join("stat")).ok()?;
        let after_comm = &stat[stat.rfind(')')? + 1..];
        after_comm.split_whitespace().nth(1)?.parse().ok()
    }

    fn children_of(&self, pid: i32) -> Vec<i32> {
        self.pids()
            .into_iter()
            .filter(|candidate| self.parent_of(*candidate) == Some(pid))
            .collect()
    }
}

/// User named by a `key=<user>@pam` argument
fn pam_user(arg: &str) -> Option<String> {
    if !arg.ends_with("@pam") {
        return None;
    }
    let user = arg
        .split('@')
        .next()
        .and_then(|head| head.split_once('='))
        .map(|(_, user)| user.to_string());
    Some(user.unwrap_or_else(|| "UNKNOWN".to_string()))
}

impl ProcessControl for ProcTable {
    fn running_builds(&self) -> Vec<BuildingTemplate> {
        let mut builds: Vec<BuildingTemplate> = Vec::new();
        for process in self.processes() {
            if !process.command_line().contains("packer build") {
                continue;
            }

            let mut name = String::new();
            let mut user = String::new();
            for arg in &process.args {
                if arg.ends_with(".hcl") {
                    name = match read_template_name(Path::new(arg)) {
                        Ok(Some(found)) => found,
                        Ok(None) => format!("could not find template name in {}", arg),
                        Err(_) => format!("error reading file: {}", arg),
                    };
                }
                if let Some(found) = pam_user(arg) {
                    user = found;
                }
            }

            let build = BuildingTemplate { name, user };
            if !builds.contains(&build) {
                builds.push(build);
            }
        }
        builds
    }

    fn packer_pids_for_user(&self, user: &str) -> Vec<i32> {
        let marker = format!("{}@pam", user);
        self.processes()
            .into_iter()
            .filter(|p| {
                let line = p.command_line();
                line.contains("packer") && line.contains(&marker)
            })
            .map(|p| p.pid)
            .collect()
    }

    fn playbook_pid_for_user(&self, user: &str) -> Option<i32> {
        let marker = format!("{}@pam", user);
        self.processes()
            .into_iter()
            .filter(|p| p.command_line().contains("ansible"))
            .find(|p| self.environ(p.pid).iter().any(|var| var.contains(&marker)))
            .map(|p| {
                tracing::info!(pid = p.pid, "Process has '{}' in its environment", marker);
                p.pid
            })
    }

    fn terminate_tree(&self, pid: i32) {
        let children = self.children_of(pid);
        for child in &children {
            send_signal(*child, Signal::Interrupt);
        }
        // Children spawned by packer ignore SIGINT
        for child in &children {
            send_signal(*child, Signal::Terminate);
        }
        send_signal(pid, Signal::Interrupt);
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Terminate,
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: Signal) {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        Signal::Interrupt => NixSignal::SIGINT,
        Signal::Terminate => NixSignal::SIGTERM,
    };
    if let Err(e) = kill(Pid::from_raw(pid), nix_signal) {
        tracing::debug!(pid, signal = ?nix_signal, "Failed to signal process: {}", e);
    }
}

#[cfg(not(unix))]
fn send_signal(pid: i32, signal: Signal) {
    tracing::debug!(pid, ?signal, "Process signalling is not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_process(root: &Path, pid: i32, ppid: i32, args: &[&str], env: &[&str]) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let mut cmdline = args.join("\0");
        cmdline.push('\0');
        std::fs::write(dir.join("cmdline"), cmdline).unwrap();
        std::fs::write(dir.join("environ"), env.join("\0")).unwrap();
        std::fs::write(
            dir.join("stat"),
            format!("{} (some (odd) name) S {} 1 1 0 -1", pid, ppid),
        )
        .unwrap();
    }

    #[test]
    fn test_pam_user() {
        assert_eq!(
            pam_user("proxmox_username=jdoe@pam"),
            Some("jdoe".to_string())
        );
        assert_eq!(pam_user("jdoe@pam"), Some("UNKNOWN".to_string()));
        assert_eq!(pam_user("jdoe"), None);
    }

    #[test]
    fn test_running_builds_dedups_and_extracts_names() {
        let proc_dir = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let hcl = files.path().join("debian12.pkr.hcl");
        std::fs::write(&hcl, "source \"proxmox-iso\" \"x\" {\n  vm_name = \"debian-12-x64-server-template\"\n}\n").unwrap();
        let hcl = hcl.display().to_string();

        let args = [
            "packer",
            "build",
            "-on-error=cleanup",
            "-var",
            "proxmox_username=jdoe@pam",
            hcl.as_str(),
        ];
        fake_process(proc_dir.path(), 100, 1, &args, &[]);
        fake_process(proc_dir.path(), 101, 1, &args, &[]);
        fake_process(proc_dir.path(), 102, 1, &["sshd", "-D"], &[]);

        let table = ProcTable::new(proc_dir.path());
        assert_eq!(
            table.running_builds(),
            vec![BuildingTemplate {
                name: "debian-12-x64-server-template".to_string(),
                user: "jdoe".to_string(),
            }]
        );
        assert_eq!(table.packer_pids_for_user("jdoe"), vec![100, 101]);
        assert!(table.packer_pids_for_user("alice").is_empty());
    }

    #[test]
    fn test_playbook_pid_matches_environment() {
        let proc_dir = TempDir::new().unwrap();
        fake_process(
            proc_dir.path(),
            200,
            1,
            &["/usr/bin/python3", "/usr/bin/ansible-playbook", "ludus.yml"],
            &["PATH=/usr/bin", "PROXMOX_USERNAME=alice@pam"],
        );
        fake_process(
            proc_dir.path(),
            201,
            1,
            &["/usr/bin/python3", "/usr/bin/ansible-playbook", "ludus.yml"],
            &["PROXMOX_USERNAME=jdoe@pam"],
        );

        let table = ProcTable::new(proc_dir.path());
        assert_eq!(table.playbook_pid_for_user("jdoe"), Some(201));
        assert_eq!(table.playbook_pid_for_user("bob"), None);
    }

    #[test]
    fn test_children_from_stat() {
        let proc_dir = TempDir::new().unwrap();
        fake_process(proc_dir.path(), 300, 1, &["packer"], &[]);
        fake_process(proc_dir.path(), 301, 300, &["packer-plugin-proxmox"], &[]);
        fake_process(proc_dir.path(), 302, 300, &["ansible-playbook"], &[]);
        fake_process(proc_dir.path(), 303, 301, &["ssh"], &[]);

        let table = ProcTable::new(proc_dir.path());
        assert_eq!(table.children_of(300), vec![301, 302]);
        assert_eq!(table.parent_of(303), Some(301));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_terminate_tree_stops_real_process() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        ProcTable::default().terminate_tree(child.id() as i32);

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(nix::libc::SIGINT));
    }
}

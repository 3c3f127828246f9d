use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Text returned for commands that finished without writing anything
pub const NO_OUTPUT: &str = "Command processed (no output).";

/// Variables copied from the server's environment unless the command overrides them
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "LANG", "USER", "TMPDIR"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Append,
    Truncate,
}

/// Durable log file receiving the combined stdout/stderr of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSink {
    pub path: PathBuf,
    pub mode: LogMode,
}

impl LogSink {
    pub fn append(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: LogMode::Append,
        }
    }

    pub fn truncate(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: LogMode::Truncate,
        }
    }
}

/// A fully described external program invocation.
///
/// Secrets belong in `env`, never in `args`: args are written to the log
/// and to tracing output.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub log: LogSink,
}

impl CommandSpec {
    /// Human readable command line, without environment
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process exited with {status}")]
    Exit { status: ExitStatus, output: String },
    #[error("I/O error while running command: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs external programs to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command and return its captured output.
    async fn run(&self, spec: &CommandSpec) -> Result<String, ExecError>;
}

/// Runs commands as OS child processes
pub struct ProcessRunner {
    max_capture_bytes: usize,
}

impl ProcessRunner {
    pub fn new(max_capture_bytes: usize) -> Self {
        Self { max_capture_bytes }
    }

    fn command(spec: &CommandSpec) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for key in PASSTHROUGH_ENV {
            if spec.env_value(key).is_none() {
                if let Ok(value) = std::env::var(key) {
                    command.env(key, value);
                }
            }
        }
        command.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command
    }
}

/// Keeps the most recent `limit` bytes written to it
struct TailBuffer {
    data: Vec<u8>,
    limit: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.limit {
            self.data.clear();
            self.data
                .extend_from_slice(&chunk[chunk.len() - self.limit..]);
            return;
        }
        self.data.extend_from_slice(chunk);
        if self.data.len() > self.limit {
            let excess = self.data.len() - self.limit;
            self.data.drain(..excess);
        }
    }

    fn into_text(self) -> String {
        if self.data.is_empty() {
            NO_OUTPUT.to_string()
        } else {
            String::from_utf8_lossy(&self.data).into_owned()
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<String, ExecError> {
        if let Some(parent) = spec.log.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        match spec.log.mode {
            LogMode::Append => options.append(true),
            LogMode::Truncate => options.write(true).truncate(true),
        };
        let mut log = options.open(&spec.log.path).await?;

        tracing::debug!(
            command = %spec.display(),
            working_dir = %spec.working_dir.display(),
            log = %spec.log.path.display(),
            "Running command"
        );
        log.write_all(format!("{}\n", spec.display()).as_bytes())
            .await?;

        let mut child = match Self::command(spec).spawn() {
            Ok(child) => child,
            Err(source) => {
                let _ = log
                    .write_all(format!("Failed to start {}: {}\n", spec.program, source).as_bytes())
                    .await;
                let _ = log.flush().await;
                return Err(ExecError::Spawn {
                    program: spec.program.clone(),
                    source,
                });
            }
        };

        let stdout = child
            .stdout
            .take()
            .map(|s| ReaderStream::new(s).boxed())
            .unwrap_or_else(|| futures::stream::empty::<std::io::Result<Bytes>>().boxed());
        let stderr = child
            .stderr
            .take()
            .map(|s| ReaderStream::new(s).boxed())
            .unwrap_or_else(|| futures::stream::empty::<std::io::Result<Bytes>>().boxed());
        let mut output = futures::stream::select(stdout, stderr);

        let mut capture = TailBuffer::new(self.max_capture_bytes);
        let mut pump_result: std::io::Result<()> = Ok(());
        while let Some(chunk) = output.next().await {
            let written = match chunk {
                Ok(chunk) => {
                    capture.push(&chunk);
                    log.write_all(&chunk).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                pump_result = Err(e);
                break;
            }
        }
        drop(output);

        let status = child.wait().await;
        let flushed = log.flush().await;
        drop(log);

        pump_result?;
        let status = status?;
        flushed?;

        let text = capture.into_text();
        if status.success() {
            Ok(text)
        } else {
            Err(ExecError::Exit {
                status,
                output: text,
            })
        }
    }
}

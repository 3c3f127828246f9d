use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

use crate::server::workspace::Workspace;

/// Per-owner marker file whose recent modification means "stop building".
///
/// The file works across processes: `labrange templates abort` touches it
/// and the server observes it before admitting or starting a build.
#[derive(Debug, Clone)]
pub struct CanaryFile {
    workspace: Workspace,
}

impl CanaryFile {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    pub fn path(&self, owner: &str) -> PathBuf {
        self.workspace.canary_path(owner)
    }

    /// Create the marker if needed and set its mtime to now
    pub fn signal(&self, owner: &str) -> std::io::Result<()> {
        let path = self.path(owner);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.set_modified(SystemTime::now())?;
        tracing::info!(owner = %owner, path = %path.display(), "Touched build abort marker");
        Ok(())
    }

    /// True iff the marker exists and was modified within `window`.
    ///
    /// Unreadable metadata counts as not cancelled.
    pub fn is_active(&self, owner: &str, window: Duration) -> bool {
        let modified = match std::fs::metadata(self.path(owner)).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age < window,
            // mtime in the future
            Err(_) => true,
        }
    }
}

/// Everything a build loop consults before starting new work for one owner
#[derive(Debug, Clone)]
pub struct AbortScope {
    owner: String,
    token: CancellationToken,
    canary: CanaryFile,
    window: Duration,
}

impl AbortScope {
    pub fn new(
        owner: impl Into<String>,
        token: CancellationToken,
        canary: CanaryFile,
        window: Duration,
    ) -> Self {
        Self {
            owner: owner.into(),
            token,
            canary,
            window,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled() || self.canary.is_active(&self.owner, self.window)
    }
}

/// In-process cancellation tokens, one live token per owner.
///
/// Cancelling retires the token so later requests start with a fresh one.
#[derive(Debug, Default)]
pub struct AbortTokens {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl AbortTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current token for `owner`
    pub fn token(&self, owner: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .entry(owner.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    pub fn cancel(&self, owner: &str) {
        let token = {
            let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
            tokens.remove(owner)
        };
        if let Some(token) = token {
            token.cancel();
        }
    }
}

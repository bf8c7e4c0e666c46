//! Sandbox abstraction layer.
//!
//! Defines the [`SandboxClient`] trait every remote execution provider
//! implements, the [`SessionRegistry`] that maps projects to their live session,
//! and the [`SandboxHealthClient`] that turns provider lease data into status
//! results.
//!
//! Providers are stateless with respect to "the current sandbox": every call
//! names the session it targets. Which session belongs to which project is the
//! registry's business.

pub mod e2b;
pub mod health;
pub mod registry;

pub use health::{OwnerStatusProbe, SandboxHealthClient};
pub use registry::SessionRegistry;

use crate::model::SandboxSession;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Directories skipped when collecting files out of a sandbox.
pub const SKIP_DIRS: &[&str] = &["node_modules", ".next", ".git", "dist", "build", ".cache"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Timeout(String),
    #[error("sandbox API returned {status}: {body}")]
    Api { status: u16, body: String },
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Output from a command executed inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Lease information reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInfo {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl SandboxInfo {
    pub fn into_session(self, preview_url: Option<String>) -> SandboxSession {
        SandboxSession {
            session_id: self.session_id,
            preview_url,
            start_time: self.started_at,
            end_time: self.end_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Provider-agnostic sandbox interface.
#[async_trait]
pub trait SandboxClient: Send + Sync {
    /// Start a new sandbox from `template` with a lease of `timeout_ms`.
    async fn create_sandbox(&self, template: &str, timeout_ms: u64) -> ProviderResult<SandboxInfo>;

    /// Current lease of a session.
    async fn get_info(&self, session_id: &str) -> ProviderResult<SandboxInfo>;

    /// Reset the lease so the session ends `duration_ms` from now.
    async fn set_timeout(&self, session_id: &str, duration_ms: u64) -> ProviderResult<()>;

    /// Terminate a session. Terminating an unknown session is not an error.
    async fn kill_sandbox(&self, session_id: &str) -> ProviderResult<()>;

    /// Run a shell command inside the sandbox.
    async fn run_command(
        &self,
        session_id: &str,
        command: &str,
        workdir: &str,
        timeout_ms: u64,
    ) -> ProviderResult<CommandOutput>;

    /// Write content to a file path inside the sandbox, creating parent directories.
    async fn write_file(&self, session_id: &str, path: &str, content: &str) -> ProviderResult<()>;

    async fn read_file(&self, session_id: &str, path: &str) -> ProviderResult<String>;

    async fn list_dir(&self, session_id: &str, path: &str) -> ProviderResult<Vec<DirEntry>>;

    /// Public preview URL for a port.
    async fn get_preview_url(&self, session_id: &str, port: u16) -> ProviderResult<String>;

    /// Walk `workdir` (skipping [`SKIP_DIRS`]) and return `absolute path -> content`.
    ///
    /// Unreadable entries are skipped; only a failure to list `workdir` itself is
    /// an error.
    async fn collect_snapshot_files(
        &self,
        session_id: &str,
        workdir: &str,
    ) -> ProviderResult<HashMap<String, String>> {
        let root = workdir.trim_end_matches('/');
        let mut files = HashMap::new();
        let mut dirs_to_visit = vec![root.to_string()];

        while let Some(dir) = dirs_to_visit.pop() {
            let entries = match self.list_dir(session_id, &dir).await {
                Ok(entries) => entries,
                Err(e) if dir == root => return Err(e),
                Err(e) => {
                    tracing::debug!(dir = %dir, error = %e, "skipping unlistable directory");
                    continue;
                }
            };

            for entry in entries {
                if SKIP_DIRS.contains(&entry.name.as_str()) {
                    continue;
                }
                let full_path = format!("{dir}/{}", entry.name);
                if entry.is_dir {
                    dirs_to_visit.push(full_path);
                    continue;
                }
                match self.read_file(session_id, &full_path).await {
                    Ok(content) => {
                        files.insert(full_path, content);
                    }
                    Err(e) => {
                        tracing::debug!(path = %full_path, error = %e, "skipping unreadable file");
                    }
                }
            }
        }

        Ok(files)
    }
}

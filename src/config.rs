//! TOML configuration.
//!
//! Lookup order: explicit `--config` path, `$SANDSYNC_CONFIG`, the platform
//! config directory, then built-in defaults. Every field has a default, so an
//! empty file is a valid configuration.

use crate::error::{SyncError, SyncResult};
use crate::reconcile::LoopSettings;
use crate::rpc::{OriginMatcher, RpcSettings};
use crate::sync::OrchestratorSettings;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "SANDSYNC_CONFIG";
pub const DB_PATH_ENV: &str = "SANDSYNC_DB_PATH";
pub const API_KEY_ENV: &str = "E2B_API_KEY";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "sandsync", "sandsync")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// SQLite database. `~` and `$VARS` are expanded.
    pub db_path: String,
    pub sandbox: SandboxConfig,
    pub status: StatusConfig,
    pub rpc: RpcConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let db_path = project_dirs()
            .map(|dirs| dirs.data_dir().join("sandsync.db").display().to_string())
            .unwrap_or_else(|| "sandsync.db".to_string());
        Self {
            db_path,
            sandbox: SandboxConfig::default(),
            status: StatusConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Falls back to `$E2B_API_KEY`.
    pub api_key: Option<String>,
    pub api_base: String,
    pub template: String,
    /// Lease length given to created and resumed sessions.
    pub timeout_ms: u64,
    pub workdir: String,
    pub preview_port: u16,
    /// Run in `workdir` after files are pushed.
    pub bootstrap_commands: Vec<String>,
    pub command_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let orchestrator = OrchestratorSettings::default();
        Self {
            api_key: None,
            api_base: "https://api.e2b.dev".to_string(),
            template: orchestrator.template,
            timeout_ms: orchestrator.timeout_ms,
            workdir: orchestrator.workdir,
            preview_port: orchestrator.preview_port,
            bootstrap_commands: orchestrator.bootstrap_commands,
            command_timeout_ms: orchestrator.command_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub interval_secs: u64,
    pub burst_window_ms: u64,
    pub unhealthy_after: u32,
    pub backoff_after: u32,
    /// Poll this server's status route instead of asking the provider directly.
    pub endpoint: Option<String>,
    pub token: Option<String>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            burst_window_ms: 1000,
            unhealthy_after: 3,
            backoff_after: 5,
            endpoint: None,
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_ms: u64,
    /// `"*"` accepts every origin; otherwise one origin or a comma-separated list.
    pub allowed_origin: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            allowed_origin: "*".to_string(),
        }
    }
}

impl SyncConfig {
    /// Resolve, read and validate the configuration, then apply env overrides.
    pub fn load(explicit: Option<&Path>) -> SyncResult<Self> {
        let path = Self::resolve_path(explicit, std::env::var(CONFIG_ENV).ok());
        let mut config = match &path {
            Some(path) => Self::load_from(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        tracing::debug!(path = ?path, "configuration loaded");
        Ok(config)
    }

    /// Which file to read, if any. A default-location file that does not exist
    /// is not an error; an explicitly named one is read and may fail.
    pub fn resolve_path(explicit: Option<&Path>, from_env: Option<String>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Some(path) = from_env.filter(|p| !p.trim().is_empty()) {
            return Some(PathBuf::from(path));
        }
        project_dirs()
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .filter(|path| path.is_file())
    }

    pub fn load_from(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Validation(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
            .map_err(|e| SyncError::Validation(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|k| !k.is_empty()) {
            self.sandbox.api_key = Some(key);
        }
        if let Some(path) = lookup(DB_PATH_ENV).filter(|p| !p.is_empty()) {
            self.db_path = path;
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        let zero = [
            ("sandbox.timeout_ms", self.sandbox.timeout_ms),
            ("sandbox.command_timeout_ms", self.sandbox.command_timeout_ms),
            ("status.interval_secs", self.status.interval_secs),
            ("status.burst_window_ms", self.status.burst_window_ms),
            ("rpc.timeout_ms", self.rpc.timeout_ms),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);
        if let Some((key, _)) = zero {
            return Err(SyncError::Validation(format!("{key} must be greater than zero")));
        }
        if self.status.unhealthy_after == 0 || self.status.backoff_after == 0 {
            return Err(SyncError::Validation(
                "status error thresholds must be greater than zero".to_string(),
            ));
        }
        if !self.sandbox.workdir.starts_with('/') {
            return Err(SyncError::Validation(format!(
                "sandbox.workdir must be absolute, got {}",
                self.sandbox.workdir
            )));
        }
        Ok(())
    }

    pub fn db_path(&self) -> SyncResult<PathBuf> {
        let expanded = shellexpand::full(&self.db_path)
            .map_err(|e| SyncError::Validation(format!("db_path: {e}")))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            interval: Duration::from_secs(self.status.interval_secs),
            burst_window: Duration::from_millis(self.status.burst_window_ms),
            unhealthy_after: self.status.unhealthy_after,
            backoff_after: self.status.backoff_after,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            template: self.sandbox.template.clone(),
            timeout_ms: self.sandbox.timeout_ms,
            workdir: self.sandbox.workdir.clone(),
            preview_port: self.sandbox.preview_port,
            bootstrap_commands: self.sandbox.bootstrap_commands.clone(),
            command_timeout_ms: self.sandbox.command_timeout_ms,
        }
    }

    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings {
            timeout: Duration::from_millis(self.rpc.timeout_ms),
            allowed_origin: OriginMatcher::parse(&self.rpc.allowed_origin),
        }
    }
}

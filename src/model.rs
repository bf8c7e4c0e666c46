//! Domain types: projects, version snapshots, sandbox sessions and status results.
//!
//! Wire-facing types serialise in camelCase to match the preview/editor clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative file path to file content.
pub type FileMap = BTreeMap<String, String>;

/// Package name to version spec.
pub type DependencyMap = BTreeMap<String, String>;

/// A durable project and its current file state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub files: FileMap,
    pub dependencies: DependencyMap,
    pub version: i64,
    pub last_saved_at: DateTime<Utc>,
    pub sandbox: Option<SandboxSession>,
}

/// Current file mapping plus the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFiles {
    pub files: FileMap,
    pub dependencies: DependencyMap,
    pub version: i64,
}

/// Result of an accepted file write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedProject {
    pub id: String,
    pub version: i64,
    pub last_saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Manual,
    Auto,
    Sync,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Sync => "sync",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "manual" => Some(Self::Manual),
            "auto" => Some(Self::Auto),
            "sync" => Some(Self::Sync),
            _ => None,
        }
    }
}

/// Input for creating a version snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVersion {
    pub project_id: String,
    pub files: FileMap,
    pub dependencies: DependencyMap,
    pub message: String,
    pub change_type: ChangeType,
}

/// Immutable full-state snapshot of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    pub id: String,
    pub project_id: String,
    pub sequence: i64,
    pub files: FileMap,
    pub dependencies: DependencyMap,
    pub message: String,
    pub change_type: ChangeType,
    pub created_at: DateTime<Utc>,
}

/// A leased remote execution session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSession {
    pub session_id: String,
    pub preview_url: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SandboxSession {
    /// The session is dead at or after `end_time`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }

    /// Whole minutes left on the lease, zero once expired.
    pub fn remaining_minutes_at(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_minutes().max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Running,
    Expired,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionRequired {
    #[default]
    None,
    SyncNeeded,
}

/// Session snapshot embedded in a status result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatusInfo {
    pub sandbox_id: String,
    pub url: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub remaining_time_minutes: i64,
}

/// One reconciliation tick's view of a project's sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCheckResult {
    pub success: bool,
    pub status: SandboxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxStatusInfo>,
    pub message: String,
    #[serde(default)]
    pub action_required: ActionRequired,
}

impl StatusCheckResult {
    pub fn running(session: &SandboxSession, now: DateTime<Utc>) -> Self {
        let remaining = session.remaining_minutes_at(now);
        Self {
            success: true,
            status: SandboxStatus::Running,
            sandbox: Some(SandboxStatusInfo::from_session(session, now)),
            message: format!("Sandbox is running ({remaining} min remaining)"),
            action_required: ActionRequired::None,
        }
    }

    pub fn expired(session: &SandboxSession, now: DateTime<Utc>) -> Self {
        Self {
            success: true,
            status: SandboxStatus::Expired,
            sandbox: Some(SandboxStatusInfo::from_session(session, now)),
            message: "Sandbox lease has expired".to_string(),
            action_required: ActionRequired::SyncNeeded,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            success: true,
            status: SandboxStatus::NotFound,
            sandbox: None,
            message: message.into(),
            action_required: ActionRequired::SyncNeeded,
        }
    }

    /// Result reported when the probe itself failed.
    pub fn probe_failed(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            status: SandboxStatus::NotFound,
            sandbox: None,
            message: format!("Status check failed: {error}"),
            action_required: ActionRequired::SyncNeeded,
        }
    }

    /// Courtesy result for a check issued right after another one.
    pub fn likely_running() -> Self {
        Self {
            success: true,
            status: SandboxStatus::Running,
            sandbox: None,
            message: "Sandbox likely still running (checked moments ago)".to_string(),
            action_required: ActionRequired::None,
        }
    }
}

impl SandboxStatusInfo {
    pub fn from_session(session: &SandboxSession, now: DateTime<Utc>) -> Self {
        Self {
            sandbox_id: session.session_id.clone(),
            url: session.preview_url.clone(),
            start_time: session.start_time,
            end_time: session.end_time,
            remaining_time_minutes: session.remaining_minutes_at(now),
        }
    }
}

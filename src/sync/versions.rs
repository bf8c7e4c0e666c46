//! Version history: create, page through, fetch and restore snapshots.
//!
//! History is append-only. Restoring writes an old snapshot back as the current
//! state under a new version number and leaves newer snapshots in place.

use crate::error::SyncResult;
use crate::model::{ChangeType, NewVersion, Project, VersionSnapshot};
use crate::store::ProjectStore;
use serde::Serialize;
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Clamp caller-supplied paging to `1..=MAX_PAGE_SIZE` and a non-negative offset.
pub fn clamp_page(limit: Option<i64>, offset: Option<i64>) -> (usize, usize) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = offset.unwrap_or(0).max(0);
    (limit as usize, offset as usize)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub project: Project,
    pub restored_from: i64,
    pub snapshot_id: Option<String>,
}

pub struct VersionHistory {
    store: Arc<dyn ProjectStore>,
}

impl VersionHistory {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, owner_id: &str, version: NewVersion) -> SyncResult<VersionSnapshot> {
        self.store.create_version(owner_id, version).await
    }

    /// Newest first.
    pub async fn list(
        &self,
        owner_id: &str,
        project_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> SyncResult<Vec<VersionSnapshot>> {
        let (limit, offset) = clamp_page(limit, offset);
        self.store
            .list_versions(owner_id, project_id, limit, offset)
            .await
    }

    pub async fn get(&self, owner_id: &str, version_id: &str) -> SyncResult<VersionSnapshot> {
        self.store.get_version(owner_id, version_id).await
    }

    /// Make a snapshot's files and dependencies the current project state.
    pub async fn restore(&self, owner_id: &str, version_id: &str) -> SyncResult<RestoreOutcome> {
        let source = self.store.get_version(owner_id, version_id).await?;
        let project = self.store.restore_version(owner_id, version_id).await?;
        tracing::info!(
            project_id = %project.id,
            restored_from = source.sequence,
            version = project.version,
            "version restored"
        );

        let record = NewVersion {
            project_id: project.id.clone(),
            files: project.files.clone(),
            dependencies: project.dependencies.clone(),
            message: format!("Restored from version {}", source.sequence),
            change_type: ChangeType::Manual,
        };
        let snapshot_id = match self.store.create_version(owner_id, record).await {
            Ok(snapshot) => Some(snapshot.id),
            Err(e) => {
                tracing::warn!(project_id = %project.id, error = %e, "restore snapshot failed");
                None
            }
        };

        Ok(RestoreOutcome {
            project,
            restored_from: source.sequence,
            snapshot_id,
        })
    }
}

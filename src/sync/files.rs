//! File synchronization: full replace and partial merge of a project's files,
//! with guards against accidental mass overwrites and best-effort auto snapshots.
//!
//! Writes are last-write-wins at the granularity of the whole file mapping.
//! Two concurrent merges touching the same path can lose one writer's change.

use crate::error::{SyncError, SyncResult};
use crate::model::{ChangeType, FileMap, NewVersion, SavedProject};
use crate::store::ProjectStore;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use std::sync::Arc;

/// A full replace is refused when more than this many files are empty...
pub const MAX_EMPTY_FILES: usize = 3;
/// ...or when more than this fraction of all files is empty.
pub const MAX_EMPTY_RATIO: f64 = 0.5;

/// Paths whose content is empty after trimming whitespace, sorted.
pub fn empty_paths(files: &FileMap) -> Vec<String> {
    files
        .iter()
        .filter(|(_, content)| content.trim().is_empty())
        .map(|(path, _)| path.clone())
        .collect()
}

/// Reject a full replace that would blank out too many files.
pub fn check_mass_overwrite(files: &FileMap) -> SyncResult<()> {
    let empty = empty_paths(files);
    let total = files.len();
    let too_many = empty.len() > MAX_EMPTY_FILES;
    let too_large_share = total > 0 && (empty.len() as f64) > (total as f64) * MAX_EMPTY_RATIO;

    if too_many || too_large_share {
        return Err(SyncError::DangerousOverwrite {
            empty: empty.len(),
            total,
            paths: empty,
        });
    }
    Ok(())
}

/// Reject a partial merge carrying any empty file.
pub fn check_partial_content(files: &FileMap) -> SyncResult<()> {
    let empty = empty_paths(files);
    if empty.is_empty() {
        Ok(())
    } else {
        Err(SyncError::EmptyContent { paths: empty })
    }
}

/// File paths must be relative, non-empty and stay inside the project.
pub fn validate_paths(files: &FileMap) -> SyncResult<()> {
    for path in files.keys() {
        if path.trim().is_empty() {
            return Err(SyncError::Validation("file path must not be empty".to_string()));
        }
        if path.contains('\0') {
            return Err(SyncError::Validation(format!("file path {path:?} contains NUL")));
        }
        let escapes = Path::new(path).components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(SyncError::Validation(format!(
                "file path {path:?} must be relative to the project root"
            )));
        }
    }
    Ok(())
}

/// Who is writing. Only affects logging and the snapshot's change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteSource {
    #[default]
    Editor,
    Agent,
    Sync,
}

/// Optional caller context for a partial merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeMetadata {
    #[serde(default)]
    pub source: WriteSource,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceOutcome {
    pub project: SavedProject,
    pub file_count: usize,
    /// Id of the auto snapshot, when one was recorded.
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub project: SavedProject,
    pub changed_paths: Vec<String>,
    pub total_files: usize,
    pub snapshot_id: Option<String>,
}

/// Applies edits to durable project files.
pub struct FileSync {
    store: Arc<dyn ProjectStore>,
}

impl FileSync {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }

    /// Replace the project's whole file mapping.
    ///
    /// Refused as a whole when too many files would be empty; never partially applied.
    pub async fn replace_files(
        &self,
        owner_id: &str,
        project_id: &str,
        files: FileMap,
    ) -> SyncResult<ReplaceOutcome> {
        self.replace_files_as(owner_id, project_id, files, ChangeType::Auto)
            .await
    }

    pub(crate) async fn replace_files_as(
        &self,
        owner_id: &str,
        project_id: &str,
        files: FileMap,
        change_type: ChangeType,
    ) -> SyncResult<ReplaceOutcome> {
        validate_paths(&files)?;
        check_mass_overwrite(&files)?;

        let file_count = files.len();
        let project = self
            .store
            .update_files(owner_id, project_id, files.clone())
            .await?;
        tracing::info!(
            project_id = %project_id,
            version = project.version,
            files = file_count,
            "project files replaced"
        );

        let snapshot_id = if file_count > 0 {
            self.snapshot(
                owner_id,
                project_id,
                files,
                format!("Auto-save: Updated {file_count} files"),
                change_type,
            )
            .await
        } else {
            None
        };

        Ok(ReplaceOutcome {
            project,
            file_count,
            snapshot_id,
        })
    }

    /// Overlay `changes` onto the current files; paths not mentioned are untouched.
    pub async fn merge_files(
        &self,
        owner_id: &str,
        project_id: &str,
        changes: FileMap,
        metadata: MergeMetadata,
    ) -> SyncResult<MergeOutcome> {
        validate_paths(&changes)?;
        check_partial_content(&changes)?;
        if changes.is_empty() {
            return Err(SyncError::Validation("no files to update".to_string()));
        }

        let current = self.store.get_files(owner_id, project_id).await?;
        let changed_paths: Vec<String> = changes.keys().cloned().collect();
        let mut merged = current.files;
        merged.extend(changes);
        let total_files = merged.len();

        let project = self
            .store
            .update_files(owner_id, project_id, merged.clone())
            .await?;
        tracing::info!(
            project_id = %project_id,
            version = project.version,
            changed = changed_paths.len(),
            source = ?metadata.source,
            "project files merged"
        );

        let change_type = match metadata.source {
            WriteSource::Sync => ChangeType::Sync,
            WriteSource::Editor | WriteSource::Agent => ChangeType::Auto,
        };
        let message = metadata
            .message
            .unwrap_or_else(|| format!("Auto-save: Updated {} files", changed_paths.len()));
        let snapshot_id = self
            .snapshot(owner_id, project_id, merged, message, change_type)
            .await;

        Ok(MergeOutcome {
            project,
            changed_paths,
            total_files,
            snapshot_id,
        })
    }

    /// Best-effort snapshot of a write that already succeeded.
    async fn snapshot(
        &self,
        owner_id: &str,
        project_id: &str,
        files: FileMap,
        message: String,
        change_type: ChangeType,
    ) -> Option<String> {
        let dependencies = match self.store.get_files(owner_id, project_id).await {
            Ok(current) => current.dependencies,
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "auto snapshot skipped");
                return None;
            }
        };

        let version = NewVersion {
            project_id: project_id.to_string(),
            files,
            dependencies,
            message,
            change_type,
        };
        match self.store.create_version(owner_id, version).await {
            Ok(snapshot) => Some(snapshot.id),
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "auto snapshot failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DependencyMap, Project, ProjectFiles, SandboxSession, VersionSnapshot};
    use crate::store::SqliteStore;
    use async_trait::async_trait;

    fn files(pairs: &[(&str, &str)]) -> FileMap {
        pairs
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    async fn setup(initial: &[(&str, &str)]) -> (FileSync, Arc<SqliteStore>, Project) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let project = store
            .create_project("owner", files(initial), DependencyMap::new())
            .await
            .unwrap();
        (FileSync::new(store.clone()), store, project)
    }

    #[test]
    fn mass_overwrite_thresholds() {
        // 3 of 10 empty: under both limits.
        let mut ok = FileMap::new();
        for i in 0..10 {
            ok.insert(format!("f{i}.ts"), if i < 3 { " \n".into() } else { "x".into() });
        }
        assert!(check_mass_overwrite(&ok).is_ok());

        // 4 of 10 empty: more than three.
        let mut four = ok.clone();
        four.insert("f3.ts".into(), String::new());
        let err = check_mass_overwrite(&four).unwrap_err();
        assert_eq!(err.offending_paths(), ["f0.ts", "f1.ts", "f2.ts", "f3.ts"]);

        // 2 of 3 empty: more than half.
        let share = files(&[("a", ""), ("b", "\t"), ("c", "x")]);
        assert!(matches!(
            check_mass_overwrite(&share),
            Err(SyncError::DangerousOverwrite { empty: 2, total: 3, .. })
        ));

        // 1 of 2 empty: exactly half is allowed.
        assert!(check_mass_overwrite(&files(&[("a", ""), ("b", "x")])).is_ok());
        assert!(check_mass_overwrite(&FileMap::new()).is_ok());
    }

    #[test]
    fn paths_must_stay_in_project() {
        assert!(validate_paths(&files(&[("src/app/page.tsx", "x")])).is_ok());
        for bad in ["", "../etc/passwd", "/abs/file.ts", "a/../../b"] {
            assert!(
                matches!(validate_paths(&files(&[(bad, "x")])), Err(SyncError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn dangerous_replace_changes_nothing() {
        let (sync, store, project) = setup(&[("a.ts", "x"), ("b.ts", "y"), ("c.ts", "z")]).await;

        let err = sync
            .replace_files(
                "owner",
                &project.id,
                files(&[("a.ts", ""), ("b.ts", "  "), ("c.ts", "z")]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::DangerousOverwrite { .. }));

        let after = store.get_files("owner", &project.id).await.unwrap();
        assert_eq!(after.files, project.files);
        assert_eq!(after.version, project.version);
        assert!(store
            .list_versions("owner", &project.id, 10, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn replace_bumps_version_and_snapshots() {
        let (sync, store, project) = setup(&[("a.ts", "x")]).await;

        let outcome = sync
            .replace_files("owner", &project.id, files(&[("a.ts", "1"), ("b.ts", "2")]))
            .await
            .unwrap();
        assert_eq!(outcome.project.version, project.version + 1);
        assert!(outcome.project.last_saved_at > project.last_saved_at);
        assert_eq!(outcome.file_count, 2);

        let versions = store
            .list_versions("owner", &project.id, 10, 0)
            .await
            .unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(Some(versions[0].id.clone()), outcome.snapshot_id);
        assert_eq!(versions[0].message, "Auto-save: Updated 2 files");
        assert_eq!(versions[0].change_type, ChangeType::Auto);
    }

    #[tokio::test]
    async fn empty_replace_is_accepted_without_snapshot() {
        let (sync, store, project) = setup(&[("a.ts", "x")]).await;
        let outcome = sync
            .replace_files("owner", &project.id, FileMap::new())
            .await
            .unwrap();
        assert_eq!(outcome.project.version, 2);
        assert!(outcome.snapshot_id.is_none());
        assert!(store
            .list_versions("owner", &project.id, 10, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn partial_merge_with_empty_file_changes_nothing() {
        let (sync, store, project) = setup(&[("a.ts", "x"), ("b.ts", "y")]).await;

        let err = sync
            .merge_files(
                "owner",
                &project.id,
                files(&[("a.ts", "new"), ("b.ts", "\n")]),
                MergeMetadata::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::EmptyContent {
                paths: vec!["b.ts".into()]
            }
        );

        let after = store.get_files("owner", &project.id).await.unwrap();
        assert_eq!(after.files, project.files);
        assert_eq!(after.version, project.version);
    }

    #[tokio::test]
    async fn merge_overlays_and_reports_changed_paths() {
        let (sync, _store, project) = setup(&[("a.ts", "x"), ("b.ts", "y")]).await;

        let outcome = sync
            .merge_files(
                "owner",
                &project.id,
                files(&[("b.ts", "z"), ("c.ts", "new")]),
                MergeMetadata {
                    source: WriteSource::Agent,
                    message: Some("agent edit".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.changed_paths, vec!["b.ts", "c.ts"]);
        assert_eq!(outcome.total_files, 3);
        assert_eq!(outcome.project.version, 2);
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let (sync, _store, _project) = setup(&[]).await;
        let err = sync
            .merge_files(
                "owner",
                "missing",
                files(&[("a.ts", "x")]),
                MergeMetadata::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    /// Store whose snapshot writes always fail.
    struct NoSnapshots(SqliteStore);

    #[async_trait]
    impl ProjectStore for NoSnapshots {
        async fn create_project(
            &self,
            owner_id: &str,
            files: FileMap,
            dependencies: DependencyMap,
        ) -> SyncResult<Project> {
            self.0.create_project(owner_id, files, dependencies).await
        }
        async fn get_project(&self, owner_id: &str, project_id: &str) -> SyncResult<Project> {
            self.0.get_project(owner_id, project_id).await
        }
        async fn get_files(&self, owner_id: &str, project_id: &str) -> SyncResult<ProjectFiles> {
            self.0.get_files(owner_id, project_id).await
        }
        async fn update_files(
            &self,
            owner_id: &str,
            project_id: &str,
            files: FileMap,
        ) -> SyncResult<SavedProject> {
            self.0.update_files(owner_id, project_id, files).await
        }
        async fn create_version(
            &self,
            _owner_id: &str,
            _version: NewVersion,
        ) -> SyncResult<VersionSnapshot> {
            Err(SyncError::Storage("disk full".into()))
        }
        async fn list_versions(
            &self,
            owner_id: &str,
            project_id: &str,
            limit: usize,
            offset: usize,
        ) -> SyncResult<Vec<VersionSnapshot>> {
            self.0.list_versions(owner_id, project_id, limit, offset).await
        }
        async fn get_version(&self, owner_id: &str, version_id: &str) -> SyncResult<VersionSnapshot> {
            self.0.get_version(owner_id, version_id).await
        }
        async fn restore_version(&self, owner_id: &str, version_id: &str) -> SyncResult<Project> {
            self.0.restore_version(owner_id, version_id).await
        }
        async fn load_session(
            &self,
            owner_id: &str,
            project_id: &str,
        ) -> SyncResult<Option<SandboxSession>> {
            self.0.load_session(owner_id, project_id).await
        }
        async fn save_session(
            &self,
            owner_id: &str,
            project_id: &str,
            session: &SandboxSession,
        ) -> SyncResult<()> {
            self.0.save_session(owner_id, project_id, session).await
        }
        async fn clear_session(&self, owner_id: &str, project_id: &str) -> SyncResult<()> {
            self.0.clear_session(owner_id, project_id).await
        }
    }

    #[tokio::test]
    async fn snapshot_failure_does_not_fail_the_write() {
        let store = Arc::new(NoSnapshots(SqliteStore::open_in_memory().unwrap()));
        let project = store
            .create_project("owner", files(&[("a.ts", "x")]), DependencyMap::new())
            .await
            .unwrap();
        let sync = FileSync::new(store.clone());

        let outcome = sync
            .replace_files("owner", &project.id, files(&[("a.ts", "y")]))
            .await
            .unwrap();
        assert!(outcome.snapshot_id.is_none());
        assert_eq!(
            store.get_files("owner", &project.id).await.unwrap().files["a.ts"],
            "y"
        );
    }
}

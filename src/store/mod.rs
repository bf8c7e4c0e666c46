//! Durable project storage: files, dependency manifest, version history and the
//! project's current sandbox session.
//!
//! [`ProjectStore`] is the seam the sync engine talks to. [`SqliteStore`] is the
//! bundled implementation; each table's SQL lives in its own submodule as free
//! functions over a `&Connection`.
//!
//! Every call is scoped to an owner id. A project owned by someone else is
//! reported exactly like a missing one.

pub mod project;
pub mod session;
pub mod versions;

use crate::error::{SyncError, SyncResult};
use crate::model::{
    DependencyMap, FileMap, NewVersion, Project, ProjectFiles, SandboxSession, SavedProject,
    VersionSnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

/// Initialize the database and create tables if needed.
pub fn init_db(db_path: &Path) -> SyncResult<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SyncError::Storage(format!("cannot create {}: {e}", parent.display())))?;
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    create_schema(&conn)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys=ON;

         CREATE TABLE IF NOT EXISTS projects (
             id TEXT PRIMARY KEY,
             owner_id TEXT NOT NULL,
             files TEXT NOT NULL,
             dependencies TEXT NOT NULL,
             version INTEGER NOT NULL,
             last_saved_at TEXT NOT NULL,
             created_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS project_versions (
             id TEXT PRIMARY KEY,
             project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
             sequence INTEGER NOT NULL,
             files TEXT NOT NULL,
             dependencies TEXT NOT NULL,
             message TEXT NOT NULL,
             change_type TEXT NOT NULL,
             created_at TEXT NOT NULL,
             UNIQUE (project_id, sequence)
         );

         CREATE INDEX IF NOT EXISTS idx_project_versions_project
             ON project_versions (project_id, sequence DESC);

         CREATE TABLE IF NOT EXISTS sandbox_sessions (
             project_id TEXT PRIMARY KEY REFERENCES projects(id) ON DELETE CASCADE,
             session_id TEXT NOT NULL,
             preview_url TEXT,
             start_time TEXT NOT NULL,
             end_time TEXT NOT NULL,
             updated_at TEXT NOT NULL
         );",
    )?;
    Ok(())
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SyncError::Storage(format!("corrupt timestamp {raw:?}: {e}")))
}

/// Durable storage operations the sync engine depends on.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Create a project at version 1.
    async fn create_project(
        &self,
        owner_id: &str,
        files: FileMap,
        dependencies: DependencyMap,
    ) -> SyncResult<Project>;

    async fn get_project(&self, owner_id: &str, project_id: &str) -> SyncResult<Project>;

    async fn get_files(&self, owner_id: &str, project_id: &str) -> SyncResult<ProjectFiles>;

    /// Replace the full file mapping, bumping `version` by one.
    async fn update_files(
        &self,
        owner_id: &str,
        project_id: &str,
        files: FileMap,
    ) -> SyncResult<SavedProject>;

    async fn create_version(
        &self,
        owner_id: &str,
        version: NewVersion,
    ) -> SyncResult<VersionSnapshot>;

    /// Snapshots newest first.
    async fn list_versions(
        &self,
        owner_id: &str,
        project_id: &str,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<VersionSnapshot>>;

    async fn get_version(&self, owner_id: &str, version_id: &str) -> SyncResult<VersionSnapshot>;

    /// Write a snapshot's files and dependencies back as the current state.
    async fn restore_version(&self, owner_id: &str, version_id: &str) -> SyncResult<Project>;

    async fn load_session(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> SyncResult<Option<SandboxSession>>;

    async fn save_session(
        &self,
        owner_id: &str,
        project_id: &str,
        session: &SandboxSession,
    ) -> SyncResult<()>;

    async fn clear_session(&self, owner_id: &str, project_id: &str) -> SyncResult<()>;
}

/// SQLite-backed [`ProjectStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> SyncResult<Self> {
        Ok(Self {
            conn: Mutex::new(init_db(db_path)?),
        })
    }

    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn project_not_found(project_id: &str) -> SyncError {
    SyncError::NotFound(format!("project {project_id}"))
}

fn version_not_found(version_id: &str) -> SyncError {
    SyncError::NotFound(format!("version {version_id}"))
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn create_project(
        &self,
        owner_id: &str,
        files: FileMap,
        dependencies: DependencyMap,
    ) -> SyncResult<Project> {
        let conn = self.conn.lock();
        project::insert_project(&conn, owner_id, &files, &dependencies)
    }

    async fn get_project(&self, owner_id: &str, project_id: &str) -> SyncResult<Project> {
        let conn = self.conn.lock();
        project::load_project(&conn, owner_id, project_id)?
            .ok_or_else(|| project_not_found(project_id))
    }

    async fn get_files(&self, owner_id: &str, project_id: &str) -> SyncResult<ProjectFiles> {
        let conn = self.conn.lock();
        project::load_files(&conn, owner_id, project_id)?
            .ok_or_else(|| project_not_found(project_id))
    }

    async fn update_files(
        &self,
        owner_id: &str,
        project_id: &str,
        files: FileMap,
    ) -> SyncResult<SavedProject> {
        let conn = self.conn.lock();
        project::write_state(&conn, owner_id, project_id, &files, None)?
            .ok_or_else(|| project_not_found(project_id))
    }

    async fn create_version(
        &self,
        owner_id: &str,
        version: NewVersion,
    ) -> SyncResult<VersionSnapshot> {
        let conn = self.conn.lock();
        let project_id = version.project_id.clone();
        versions::insert_version(&conn, owner_id, version)?
            .ok_or_else(|| project_not_found(&project_id))
    }

    async fn list_versions(
        &self,
        owner_id: &str,
        project_id: &str,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<VersionSnapshot>> {
        let conn = self.conn.lock();
        versions::list_versions(&conn, owner_id, project_id, limit, offset)?
            .ok_or_else(|| project_not_found(project_id))
    }

    async fn get_version(&self, owner_id: &str, version_id: &str) -> SyncResult<VersionSnapshot> {
        let conn = self.conn.lock();
        versions::load_version(&conn, owner_id, version_id)?
            .ok_or_else(|| version_not_found(version_id))
    }

    async fn restore_version(&self, owner_id: &str, version_id: &str) -> SyncResult<Project> {
        let conn = self.conn.lock();
        let snapshot = versions::load_version(&conn, owner_id, version_id)?
            .ok_or_else(|| version_not_found(version_id))?;

        project::write_state(
            &conn,
            owner_id,
            &snapshot.project_id,
            &snapshot.files,
            Some(&snapshot.dependencies),
        )?
        .ok_or_else(|| project_not_found(&snapshot.project_id))?;

        project::load_project(&conn, owner_id, &snapshot.project_id)?
            .ok_or_else(|| project_not_found(&snapshot.project_id))
    }

    async fn load_session(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> SyncResult<Option<SandboxSession>> {
        let conn = self.conn.lock();
        if !project::is_owned_by(&conn, owner_id, project_id)? {
            return Err(project_not_found(project_id));
        }
        session::load_session(&conn, project_id)
    }

    async fn save_session(
        &self,
        owner_id: &str,
        project_id: &str,
        session: &SandboxSession,
    ) -> SyncResult<()> {
        let conn = self.conn.lock();
        if !project::is_owned_by(&conn, owner_id, project_id)? {
            return Err(project_not_found(project_id));
        }
        session::save_session(&conn, project_id, session)
    }

    async fn clear_session(&self, owner_id: &str, project_id: &str) -> SyncResult<()> {
        let conn = self.conn.lock();
        if !project::is_owned_by(&conn, owner_id, project_id)? {
            return Err(project_not_found(project_id));
        }
        session::clear_session(&conn, project_id)
    }
}

//! Project rows: current file mapping, dependency manifest and version counter.
//!
//! Files and dependencies are stored as JSON maps `{"path": "content"}`.

use super::{format_ts, parse_ts, session};
use crate::error::SyncResult;
use crate::model::{DependencyMap, FileMap, Project, ProjectFiles, SavedProject};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

/// `lastSavedAt` for a write that follows one saved at `previous`.
///
/// Strictly later than `previous` even if the wall clock has not advanced.
pub fn next_saved_at(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

pub fn insert_project(
    conn: &Connection,
    owner_id: &str,
    files: &FileMap,
    dependencies: &DependencyMap,
) -> SyncResult<Project> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();

    conn.execute(
        "INSERT INTO projects (id, owner_id, files, dependencies, version, last_saved_at, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
        params![
            id,
            owner_id,
            serde_json::to_string(files)?,
            serde_json::to_string(dependencies)?,
            format_ts(now)
        ],
    )?;

    Ok(Project {
        id,
        owner_id: owner_id.to_string(),
        files: files.clone(),
        dependencies: dependencies.clone(),
        version: 1,
        last_saved_at: now,
        sandbox: None,
    })
}

pub fn is_owned_by(conn: &Connection, owner_id: &str, project_id: &str) -> SyncResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM projects WHERE id = ?1 AND owner_id = ?2",
            params![project_id, owner_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

struct ProjectRow {
    files: String,
    dependencies: String,
    version: i64,
    last_saved_at: String,
}

fn load_row(conn: &Connection, owner_id: &str, project_id: &str) -> SyncResult<Option<ProjectRow>> {
    let row = conn
        .query_row(
            "SELECT files, dependencies, version, last_saved_at
             FROM projects WHERE id = ?1 AND owner_id = ?2",
            params![project_id, owner_id],
            |row| {
                Ok(ProjectRow {
                    files: row.get(0)?,
                    dependencies: row.get(1)?,
                    version: row.get(2)?,
                    last_saved_at: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn load_files(
    conn: &Connection,
    owner_id: &str,
    project_id: &str,
) -> SyncResult<Option<ProjectFiles>> {
    let Some(row) = load_row(conn, owner_id, project_id)? else {
        return Ok(None);
    };
    Ok(Some(ProjectFiles {
        files: serde_json::from_str(&row.files)?,
        dependencies: serde_json::from_str(&row.dependencies)?,
        version: row.version,
    }))
}

pub fn load_project(
    conn: &Connection,
    owner_id: &str,
    project_id: &str,
) -> SyncResult<Option<Project>> {
    let Some(row) = load_row(conn, owner_id, project_id)? else {
        return Ok(None);
    };
    Ok(Some(Project {
        id: project_id.to_string(),
        owner_id: owner_id.to_string(),
        files: serde_json::from_str(&row.files)?,
        dependencies: serde_json::from_str(&row.dependencies)?,
        version: row.version,
        last_saved_at: parse_ts(&row.last_saved_at)?,
        sandbox: session::load_session(conn, project_id)?,
    }))
}

/// Persist `files` (and `dependencies`, when given) as the current state.
///
/// Returns `None` when the project does not exist for this owner.
pub fn write_state(
    conn: &Connection,
    owner_id: &str,
    project_id: &str,
    files: &FileMap,
    dependencies: Option<&DependencyMap>,
) -> SyncResult<Option<SavedProject>> {
    let tx = conn.unchecked_transaction()?;

    let Some(row) = load_row(&tx, owner_id, project_id)? else {
        return Ok(None);
    };

    let version = row.version + 1;
    let last_saved_at = next_saved_at(parse_ts(&row.last_saved_at)?);
    let files_json = serde_json::to_string(files)?;

    match dependencies {
        Some(deps) => tx.execute(
            "UPDATE projects SET files = ?1, dependencies = ?2, version = ?3, last_saved_at = ?4
             WHERE id = ?5",
            params![
                files_json,
                serde_json::to_string(deps)?,
                version,
                format_ts(last_saved_at),
                project_id
            ],
        )?,
        None => tx.execute(
            "UPDATE projects SET files = ?1, version = ?2, last_saved_at = ?3 WHERE id = ?4",
            params![files_json, version, format_ts(last_saved_at), project_id],
        )?,
    };

    tx.commit()?;

    Ok(Some(SavedProject {
        id: project_id.to_string(),
        version,
        last_saved_at,
    }))
}

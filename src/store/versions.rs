//! Version snapshots: append-only full copies of a project's files.

use super::{format_ts, parse_ts, project};
use crate::error::{SyncError, SyncResult};
use crate::model::{ChangeType, NewVersion, VersionSnapshot};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Append a snapshot with the project's next sequence number.
///
/// Returns `None` when the project does not exist for this owner.
pub fn insert_version(
    conn: &Connection,
    owner_id: &str,
    version: NewVersion,
) -> SyncResult<Option<VersionSnapshot>> {
    let tx = conn.unchecked_transaction()?;

    if !project::is_owned_by(&tx, owner_id, &version.project_id)? {
        return Ok(None);
    }

    let sequence: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM project_versions WHERE project_id = ?1",
        params![version.project_id],
        |row| row.get(0),
    )?;

    let id = uuid::Uuid::new_v4().to_string();
    let created_at = Utc::now();

    tx.execute(
        "INSERT INTO project_versions
             (id, project_id, sequence, files, dependencies, message, change_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            version.project_id,
            sequence,
            serde_json::to_string(&version.files)?,
            serde_json::to_string(&version.dependencies)?,
            version.message,
            version.change_type.as_str(),
            format_ts(created_at)
        ],
    )?;

    tx.commit()?;

    Ok(Some(VersionSnapshot {
        id,
        project_id: version.project_id,
        sequence,
        files: version.files,
        dependencies: version.dependencies,
        message: version.message,
        change_type: version.change_type,
        created_at,
    }))
}

struct VersionRow {
    id: String,
    project_id: String,
    sequence: i64,
    files: String,
    dependencies: String,
    message: String,
    change_type: String,
    created_at: String,
}

impl VersionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            sequence: row.get(2)?,
            files: row.get(3)?,
            dependencies: row.get(4)?,
            message: row.get(5)?,
            change_type: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_snapshot(self) -> SyncResult<VersionSnapshot> {
        let change_type = ChangeType::parse(&self.change_type).ok_or_else(|| {
            SyncError::Storage(format!("unknown change type {:?}", self.change_type))
        })?;
        Ok(VersionSnapshot {
            id: self.id,
            project_id: self.project_id,
            sequence: self.sequence,
            files: serde_json::from_str(&self.files)?,
            dependencies: serde_json::from_str(&self.dependencies)?,
            message: self.message,
            change_type,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

const VERSION_COLUMNS: &str =
    "v.id, v.project_id, v.sequence, v.files, v.dependencies, v.message, v.change_type, v.created_at";

/// Snapshots newest first. `None` when the project is not visible to this owner.
pub fn list_versions(
    conn: &Connection,
    owner_id: &str,
    project_id: &str,
    limit: usize,
    offset: usize,
) -> SyncResult<Option<Vec<VersionSnapshot>>> {
    if !project::is_owned_by(conn, owner_id, project_id)? {
        return Ok(None);
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {VERSION_COLUMNS} FROM project_versions v
         WHERE v.project_id = ?1
         ORDER BY v.sequence DESC
         LIMIT ?2 OFFSET ?3"
    ))?;

    let rows = stmt
        .query_map(
            params![project_id, limit as i64, offset as i64],
            VersionRow::from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(VersionRow::into_snapshot)
        .collect::<SyncResult<Vec<_>>>()
        .map(Some)
}

pub fn load_version(
    conn: &Connection,
    owner_id: &str,
    version_id: &str,
) -> SyncResult<Option<VersionSnapshot>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {VERSION_COLUMNS} FROM project_versions v
                 JOIN projects p ON p.id = v.project_id
                 WHERE v.id = ?1 AND p.owner_id = ?2"
            ),
            params![version_id, owner_id],
            VersionRow::from_row,
        )
        .optional()?;

    row.map(VersionRow::into_snapshot).transpose()
}

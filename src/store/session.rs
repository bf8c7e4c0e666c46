//! Sandbox session persistence: remember each project's sandbox so it can be
//! resumed across process restarts.

use super::{format_ts, parse_ts};
use crate::error::SyncResult;
use crate::model::SandboxSession;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

/// Load the persisted session for a project, if any.
pub fn load_session(conn: &Connection, project_id: &str) -> SyncResult<Option<SandboxSession>> {
    let row = conn
        .query_row(
            "SELECT session_id, preview_url, start_time, end_time
             FROM sandbox_sessions WHERE project_id = ?1",
            params![project_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((session_id, preview_url, start, end)) => Ok(Some(SandboxSession {
            session_id,
            preview_url,
            start_time: parse_ts(&start)?,
            end_time: parse_ts(&end)?,
        })),
    }
}

/// Persist the project's session (upsert).
pub fn save_session(
    conn: &Connection,
    project_id: &str,
    session: &SandboxSession,
) -> SyncResult<()> {
    conn.execute(
        "INSERT INTO sandbox_sessions (project_id, session_id, preview_url, start_time, end_time, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(project_id) DO UPDATE SET
             session_id = excluded.session_id,
             preview_url = excluded.preview_url,
             start_time = excluded.start_time,
             end_time = excluded.end_time,
             updated_at = excluded.updated_at",
        params![
            project_id,
            session.session_id,
            session.preview_url,
            format_ts(session.start_time),
            format_ts(session.end_time),
            format_ts(Utc::now())
        ],
    )?;
    Ok(())
}

/// Forget the project's session (killed or expired).
pub fn clear_session(conn: &Connection, project_id: &str) -> SyncResult<()> {
    conn.execute(
        "DELETE FROM sandbox_sessions WHERE project_id = ?1",
        params![project_id],
    )?;
    Ok(())
}

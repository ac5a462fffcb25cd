//! Sync run log. Observability only; nothing reads it for correctness.

use rusqlite::params;

use crate::db::{now_timestamp, DbState};
use crate::error::Result;
use crate::models::SyncLogEntry;

/// Open a `running` log row and return its id.
pub fn begin(db: &DbState, sync_type: &str) -> Result<i64> {
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO sync_log (sync_type, status, started_at) VALUES (?1, 'running', ?2)",
        params![sync_type, now_timestamp()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Close a log row with the run's counts.
pub fn finish(
    db: &DbState,
    id: i64,
    synced: usize,
    failed: usize,
    error: Option<&str>,
) -> Result<()> {
    let status = if failed == 0 && error.is_none() {
        "completed"
    } else {
        "failed"
    };
    let conn = db.lock()?;
    conn.execute(
        "UPDATE sync_log
         SET status = ?2, finished_at = ?3, synced_count = ?4, failed_count = ?5,
             error_message = ?6
         WHERE id = ?1",
        params![id, status, now_timestamp(), synced as i64, failed as i64, error],
    )?;
    Ok(())
}

pub fn recent(db: &DbState, limit: usize) -> Result<Vec<SyncLogEntry>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, sync_type, status, started_at, finished_at, synced_count, failed_count,
                error_message
         FROM sync_log
         ORDER BY id DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(SyncLogEntry {
                id: row.get(0)?,
                sync_type: row.get(1)?,
                status: row.get(2)?,
                started_at: row.get(3)?,
                finished_at: row.get(4)?,
                synced_count: row.get(5)?,
                failed_count: row.get(6)?,
                error_message: row.get(7)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Keep only the newest `keep` rows.
pub fn prune(db: &DbState, keep: usize) -> Result<usize> {
    let conn = db.lock()?;
    let removed = conn.execute(
        "DELETE FROM sync_log
         WHERE id NOT IN (SELECT id FROM sync_log ORDER BY id DESC LIMIT ?1)",
        params![keep as i64],
    )?;
    Ok(removed)
}

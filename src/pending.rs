//! Pending sale queue.
//!
//! A pending transaction and its lines are written in one transaction and
//! removed in one transaction (lines first, then the parent). Rows are only
//! mutated by the sync engine after creation.

use rusqlite::{params, params_from_iter, Connection, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{now_timestamp, DbState};
use crate::error::{Error, Result};
use crate::models::{PendingStatus, PendingTransaction, PendingTransactionLine, TransactionPayload};

/// Attempt count at which a pending sale stops being retried automatically.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

const SELECT_COLUMNS: &str = "local_id, customer_id, payment_method, subtotal, discount_total, \
                              total, notes, created_at, attempt, last_attempt_at, status, \
                              error_message";

fn row_to_pending(row: &Row<'_>) -> rusqlite::Result<PendingTransaction> {
    let status_text: String = row.get(10)?;
    let status = status_text.parse::<PendingStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(PendingTransaction {
        local_id: row.get(0)?,
        customer_id: row.get(1)?,
        payment_method: row.get(2)?,
        subtotal: row.get(3)?,
        discount_total: row.get(4)?,
        total: row.get(5)?,
        notes: row.get(6)?,
        created_at: row.get(7)?,
        attempt: row.get(8)?,
        last_attempt_at: row.get(9)?,
        status,
        error_message: row.get(11)?,
        lines: Vec::new(),
    })
}

fn load_lines(conn: &Connection, local_id: &str) -> Result<Vec<PendingTransactionLine>> {
    let mut stmt = conn.prepare(
        "SELECT line_no, product_id, quantity, unit_price, discount, subtotal
         FROM pending_transaction_lines
         WHERE local_id = ?1
         ORDER BY line_no ASC",
    )?;
    let lines = stmt
        .query_map(params![local_id], |row| {
            Ok(PendingTransactionLine {
                line_no: row.get(0)?,
                product_id: row.get(1)?,
                quantity: row.get(2)?,
                unit_price: row.get(3)?,
                discount: row.get(4)?,
                subtotal: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(lines)
}

/// Record a sale in the pending queue and return its new local id.
///
/// The parent row (status `pending`, attempt 0) and every line are written
/// in a single transaction; any failure leaves nothing behind and is
/// returned to the caller.
pub fn enqueue_pending_transaction(db: &DbState, payload: &TransactionPayload) -> Result<String> {
    payload.validate()?;
    let totals = payload.totals();
    let local_id = Uuid::new_v4().to_string();
    let created_at = now_timestamp();

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO pending_transactions (
             local_id, customer_id, payment_method, subtotal, discount_total, total,
             notes, created_at, attempt, status
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 'pending')",
        params![
            local_id,
            payload.customer_id,
            payload.payment_method.trim(),
            totals.subtotal,
            totals.discount_total,
            totals.total,
            payload.notes,
            created_at,
        ],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO pending_transaction_lines (
                 local_id, line_no, product_id, quantity, unit_price, discount, subtotal
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for (idx, item) in payload.items.iter().enumerate() {
            stmt.execute(params![
                local_id,
                (idx + 1) as i64,
                item.product_id,
                item.quantity,
                item.unit_price,
                item.discount.unwrap_or(0.0),
                item.subtotal(),
            ])?;
        }
    }
    tx.commit()?;

    info!(
        local_id = %local_id,
        lines = payload.items.len(),
        total = totals.total,
        "Sale queued for sync"
    );
    Ok(local_id)
}

/// Pending transactions in the given states, oldest first, with their lines.
/// An empty status list means every state.
pub fn list_pending_transactions(
    db: &DbState,
    statuses: &[PendingStatus],
) -> Result<Vec<PendingTransaction>> {
    let conn = db.lock()?;
    let filter = if statuses.is_empty() {
        String::new()
    } else {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        format!("WHERE status IN ({placeholders})")
    };
    // rowid breaks ties between rows created in the same millisecond.
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM pending_transactions {filter}
         ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(params_from_iter(statuses.iter().map(|s| s.as_str())), row_to_pending)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for row in &mut rows {
        row.lines = load_lines(&conn, &row.local_id)?;
    }
    Ok(rows)
}

pub fn get_pending_transaction(db: &DbState, local_id: &str) -> Result<Option<PendingTransaction>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM pending_transactions WHERE local_id = ?1"
    ))?;
    let mut rows = stmt.query_map(params![local_id], row_to_pending)?;
    match rows.next() {
        Some(row) => {
            let mut pending = row?;
            pending.lines = load_lines(&conn, local_id)?;
            Ok(Some(pending))
        }
        None => Ok(None),
    }
}

/// Move a pending transaction to `status` and stamp `last_attempt_at`.
///
/// Marking `failed` records a completed attempt: `attempt` goes up by one,
/// never past `max_attempts`. Once the cap is reached the row stays
/// `failed` whatever status was requested. Returns false for unknown ids.
pub fn mark_pending_transaction_status(
    db: &DbState,
    local_id: &str,
    status: PendingStatus,
    error: Option<&str>,
    max_attempts: i64,
) -> Result<bool> {
    let bump: i64 = if status == PendingStatus::Failed { 1 } else { 0 };
    let conn = db.lock()?;
    let changed = conn.execute(
        "UPDATE pending_transactions
         SET attempt = MIN(attempt + ?2, MAX(?3, attempt)),
             status = CASE WHEN MIN(attempt + ?2, MAX(?3, attempt)) >= ?3
                           THEN 'failed' ELSE ?4 END,
             error_message = ?5,
             last_attempt_at = ?6
         WHERE local_id = ?1",
        params![
            local_id,
            bump,
            max_attempts,
            status.as_str(),
            error,
            now_timestamp()
        ],
    )?;
    debug!(local_id = %local_id, status = %status, changed, "Pending status updated");
    Ok(changed > 0)
}

/// Mark a row that has reached the attempt cap as terminally failed without
/// touching `attempt`.
pub fn mark_pending_transaction_exhausted(
    db: &DbState,
    local_id: &str,
    error: &str,
) -> Result<bool> {
    let conn = db.lock()?;
    let changed = conn.execute(
        "UPDATE pending_transactions
         SET status = 'failed', error_message = ?2
         WHERE local_id = ?1",
        params![local_id, error],
    )?;
    Ok(changed > 0)
}

/// Delete a pending transaction and its lines. Removing an id that no
/// longer exists is a no-op.
pub fn remove_pending_transaction(db: &DbState, local_id: &str) -> Result<bool> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM pending_transaction_lines WHERE local_id = ?1",
        params![local_id],
    )?;
    let removed = tx.execute(
        "DELETE FROM pending_transactions WHERE local_id = ?1",
        params![local_id],
    )?;
    tx.commit()?;
    if removed > 0 {
        debug!(local_id = %local_id, "Pending transaction removed");
    }
    Ok(removed > 0)
}

/// Rows in `syncing` belong to a run that died before finishing. Put them
/// back to `pending` without counting an attempt.
pub fn recover_interrupted(db: &DbState) -> Result<usize> {
    let conn = db.lock()?;
    let recovered = conn.execute(
        "UPDATE pending_transactions SET status = 'pending' WHERE status = 'syncing'",
        [],
    )?;
    if recovered > 0 {
        warn!(recovered, "Recovered pending transactions left in syncing state");
    }
    Ok(recovered)
}

/// Manually put a failed transaction back in the queue with a fresh
/// attempt budget.
pub fn reset_pending_transaction(db: &DbState, local_id: &str) -> Result<()> {
    let conn = db.lock()?;
    let changed = conn.execute(
        "UPDATE pending_transactions
         SET status = 'pending', attempt = 0, error_message = NULL
         WHERE local_id = ?1 AND status = 'failed'",
        params![local_id],
    )?;
    if changed == 0 {
        return Err(Error::Validation(format!(
            "no failed pending transaction with id {local_id}"
        )));
    }
    info!(local_id = %local_id, "Pending transaction reset for retry");
    Ok(())
}

/// Number of rows in the given states (all states when empty).
pub fn count_pending(db: &DbState, statuses: &[PendingStatus]) -> Result<i64> {
    let conn = db.lock()?;
    if statuses.is_empty() {
        return Ok(conn.query_row("SELECT COUNT(*) FROM pending_transactions", [], |row| {
            row.get(0)
        })?);
    }
    let placeholders = vec!["?"; statuses.len()].join(", ");
    let sql = format!("SELECT COUNT(*) FROM pending_transactions WHERE status IN ({placeholders})");
    Ok(conn.query_row(
        &sql,
        params_from_iter(statuses.iter().map(|s| s.as_str())),
        |row| row.get(0),
    )?)
}

/// Rows an automatic sync run would still attempt. Failed rows at the
/// attempt cap wait for a manual reset and are not counted.
pub fn count_retryable(db: &DbState, max_attempts: i64) -> Result<i64> {
    let conn = db.lock()?;
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM pending_transactions
         WHERE status != 'failed' OR attempt < ?1",
        params![max_attempts],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransactionItem;

    fn sale(lines: &[(i64, i64, f64)]) -> TransactionPayload {
        TransactionPayload {
            customer_id: Some(4),
            items: lines
                .iter()
                .map(|&(product_id, quantity, unit_price)| TransactionItem {
                    product_id,
                    quantity,
                    unit_price,
                    discount: None,
                })
                .collect(),
            payment_method: "cash".into(),
            notes: Some("table 3".into()),
        }
    }

    #[test]
    fn enqueue_stores_parent_and_lines() {
        let db = DbState::in_memory().unwrap();
        let id = enqueue_pending_transaction(&db, &sale(&[(1, 2, 1.5), (2, 1, 4.0)])).unwrap();

        let row = get_pending_transaction(&db, &id).unwrap().expect("row");
        assert_eq!(row.status, PendingStatus::Pending);
        assert_eq!(row.attempt, 0);
        assert_eq!(row.lines.len(), 2);
        assert_eq!(row.total, 7.0);
        let line_sum: f64 = row.lines.iter().map(|l| l.subtotal).sum();
        assert!((line_sum - row.total).abs() < 1e-9);
        assert_eq!(row.to_payload(), sale(&[(1, 2, 1.5), (2, 1, 4.0)]));
    }

    #[test]
    fn enqueue_generates_unique_ids() {
        let db = DbState::in_memory().unwrap();
        let a = enqueue_pending_transaction(&db, &sale(&[(1, 1, 1.0)])).unwrap();
        remove_pending_transaction(&db, &a).unwrap();
        let b = enqueue_pending_transaction(&db, &sale(&[(1, 1, 1.0)])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn enqueue_rejects_invalid_payload_without_writing() {
        let db = DbState::in_memory().unwrap();
        let err = enqueue_pending_transaction(&db, &sale(&[(1, 0, 1.0)]));
        assert!(matches!(err, Err(Error::Validation(_))));
        assert_eq!(count_pending(&db, &[]).unwrap(), 0);
    }

    #[test]
    fn failed_line_insert_leaves_no_parent() {
        let db = DbState::in_memory().unwrap();
        {
            let conn = db.lock().unwrap();
            conn.execute_batch(
                "CREATE TRIGGER reject_line BEFORE INSERT ON pending_transaction_lines
                 WHEN NEW.product_id = 666
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        }
        let err = enqueue_pending_transaction(&db, &sale(&[(1, 1, 1.0), (666, 1, 1.0)]));
        assert!(matches!(err, Err(Error::Storage(_))));
        assert_eq!(count_pending(&db, &[]).unwrap(), 0);
        let conn = db.lock().unwrap();
        let lines: i64 = conn
            .query_row("SELECT COUNT(*) FROM pending_transaction_lines", [], |r| r.get(0))
            .unwrap();
        assert_eq!(lines, 0);
    }

    #[test]
    fn list_orders_oldest_first_and_filters() {
        let db = DbState::in_memory().unwrap();
        let a = enqueue_pending_transaction(&db, &sale(&[(1, 1, 1.0)])).unwrap();
        let b = enqueue_pending_transaction(&db, &sale(&[(2, 1, 1.0)])).unwrap();
        let c = enqueue_pending_transaction(&db, &sale(&[(3, 1, 1.0)])).unwrap();
        mark_pending_transaction_status(&db, &b, PendingStatus::Syncing, None, 5).unwrap();

        let ids: Vec<_> = list_pending_transactions(&db, &[])
            .unwrap()
            .into_iter()
            .map(|p| p.local_id)
            .collect();
        assert_eq!(ids, vec![a.clone(), b, c.clone()]);

        let waiting: Vec<_> =
            list_pending_transactions(&db, &[PendingStatus::Pending, PendingStatus::Failed])
                .unwrap()
                .into_iter()
                .map(|p| p.local_id)
                .collect();
        assert_eq!(waiting, vec![a, c]);
    }

    #[test]
    fn failed_marks_bump_attempt_up_to_cap() {
        let db = DbState::in_memory().unwrap();
        let id = enqueue_pending_transaction(&db, &sale(&[(1, 1, 1.0)])).unwrap();

        mark_pending_transaction_status(&db, &id, PendingStatus::Syncing, None, 3).unwrap();
        let row = get_pending_transaction(&db, &id).unwrap().unwrap();
        assert_eq!(row.attempt, 0);
        assert!(row.last_attempt_at.is_some());

        for expected in 1..=3 {
            mark_pending_transaction_status(&db, &id, PendingStatus::Failed, Some("HTTP 500"), 3)
                .unwrap();
            let row = get_pending_transaction(&db, &id).unwrap().unwrap();
            assert_eq!(row.attempt, expected);
            assert_eq!(row.status, PendingStatus::Failed);
            assert_eq!(row.error_message.as_deref(), Some("HTTP 500"));
        }

        mark_pending_transaction_status(&db, &id, PendingStatus::Failed, Some("again"), 3).unwrap();
        assert_eq!(get_pending_transaction(&db, &id).unwrap().unwrap().attempt, 3);

        mark_pending_transaction_exhausted(&db, &id, "gave up").unwrap();
        let row = get_pending_transaction(&db, &id).unwrap().unwrap();
        assert_eq!(row.attempt, 3);
        assert_eq!(row.error_message.as_deref(), Some("gave up"));
    }

    #[test]
    fn remove_is_idempotent() {
        let db = DbState::in_memory().unwrap();
        let id = enqueue_pending_transaction(&db, &sale(&[(1, 1, 1.0), (2, 2, 2.0)])).unwrap();
        assert!(remove_pending_transaction(&db, &id).unwrap());
        assert!(!remove_pending_transaction(&db, &id).unwrap());
        assert!(get_pending_transaction(&db, &id).unwrap().is_none());
        assert_eq!(count_pending(&db, &[]).unwrap(), 0);
    }

    #[test]
    fn recover_and_reset() {
        let db = DbState::in_memory().unwrap();
        let id = enqueue_pending_transaction(&db, &sale(&[(1, 1, 1.0)])).unwrap();
        mark_pending_transaction_status(&db, &id, PendingStatus::Syncing, None, 5).unwrap();
        assert_eq!(recover_interrupted(&db).unwrap(), 1);
        assert_eq!(
            get_pending_transaction(&db, &id).unwrap().unwrap().status,
            PendingStatus::Pending
        );

        assert!(reset_pending_transaction(&db, &id).is_err());

        mark_pending_transaction_status(&db, &id, PendingStatus::Failed, Some("x"), 5).unwrap();
        reset_pending_transaction(&db, &id).unwrap();
        let row = get_pending_transaction(&db, &id).unwrap().unwrap();
        assert_eq!(row.status, PendingStatus::Pending);
        assert_eq!(row.attempt, 0);
        assert!(row.error_message.is_none());
        assert_eq!(count_pending(&db, &[PendingStatus::Pending]).unwrap(), 1);
    }

    #[test]
    fn count_retryable_skips_exhausted_rows() {
        let db = DbState::in_memory().unwrap();
        let dead = enqueue_pending_transaction(&db, &sale(&[(1, 1, 1.0)])).unwrap();
        for _ in 0..3 {
            mark_pending_transaction_status(&db, &dead, PendingStatus::Failed, Some("x"), 3)
                .unwrap();
        }
        assert_eq!(count_retryable(&db, 3).unwrap(), 0);
        assert_eq!(count_pending(&db, &[]).unwrap(), 1);

        let retry = enqueue_pending_transaction(&db, &sale(&[(2, 1, 1.0)])).unwrap();
        mark_pending_transaction_status(&db, &retry, PendingStatus::Failed, Some("x"), 3).unwrap();
        assert_eq!(count_retryable(&db, 3).unwrap(), 1);

        enqueue_pending_transaction(&db, &sale(&[(3, 1, 1.0)])).unwrap();
        assert_eq!(count_retryable(&db, 3).unwrap(), 2);
    }
}

//! Recent transaction history cache. Disposable: rebuilt on every refresh.

use rusqlite::params;
use tracing::info;

use crate::db::{now_timestamp, DbState};
use crate::error::Result;
use crate::models::{RemoteTransaction, TransactionCacheEntry};

/// Default number of recent transactions kept for offline history.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Replace the cache with the `limit` most recent transactions.
pub fn replace_transaction_cache(
    db: &DbState,
    transactions: Vec<RemoteTransaction>,
    limit: usize,
) -> Result<usize> {
    let cached_at = now_timestamp();
    let mut entries: Vec<TransactionCacheEntry> = transactions
        .into_iter()
        .map(|tx| TransactionCacheEntry::from_remote(tx, &cached_at))
        .collect();
    // Newest first; rows without a timestamp sort last.
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    entries.truncate(limit);

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM transactions_cache", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO transactions_cache (
                 id, transaction_number, customer_id, customer_name, total,
                 payment_method, status, item_count, created_at, cached_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for e in &entries {
            stmt.execute(params![
                e.id,
                e.transaction_number,
                e.customer_id,
                e.customer_name,
                e.total,
                e.payment_method,
                e.status,
                e.item_count,
                e.created_at,
                e.cached_at,
            ])?;
        }
    }
    tx.commit()?;
    info!(count = entries.len(), "Transaction history cache replaced");
    Ok(entries.len())
}

pub fn list_transaction_cache(db: &DbState, limit: usize) -> Result<Vec<TransactionCacheEntry>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, transaction_number, customer_id, customer_name, total, payment_method,
                status, item_count, created_at, cached_at
         FROM transactions_cache
         ORDER BY created_at DESC, id DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(TransactionCacheEntry {
                id: row.get(0)?,
                transaction_number: row.get(1)?,
                customer_id: row.get(2)?,
                customer_name: row.get(3)?,
                total: row.get(4)?,
                payment_method: row.get(5)?,
                status: row.get(6)?,
                item_count: row.get(7)?,
                created_at: row.get(8)?,
                cached_at: row.get(9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

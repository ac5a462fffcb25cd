//! Product catalog cache.
//!
//! The cache is only ever replaced wholesale from a successful remote fetch.
//! The single exception is the speculative stock decrement applied when a
//! sale is queued offline.

use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use crate::db::DbState;
use crate::error::Result;
use crate::models::CatalogItem;

const SELECT_COLUMNS: &str = "id, name, sku, barcode, price, cost_price, stock_quantity, \
                              is_active, last_synced_at";

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<CatalogItem> {
    Ok(CatalogItem {
        id: row.get(0)?,
        name: row.get(1)?,
        sku: row.get(2)?,
        barcode: row.get(3)?,
        price: row.get(4)?,
        cost_price: row.get(5)?,
        stock_quantity: row.get(6)?,
        is_active: row.get::<_, i64>(7)? != 0,
        last_synced_at: row.get(8)?,
    })
}

/// Replace the whole catalog in one transaction. If any insert fails the
/// previous catalog is left untouched.
pub fn replace_catalog(db: &DbState, items: &[CatalogItem]) -> Result<usize> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM products_cache", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO products_cache (
                 id, name, sku, barcode, price, cost_price, stock_quantity,
                 is_active, last_synced_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for item in items {
            stmt.execute(params![
                item.id,
                item.name,
                item.sku,
                item.barcode,
                item.price,
                item.cost_price,
                item.stock_quantity,
                item.is_active as i64,
                item.last_synced_at,
            ])?;
        }
    }
    tx.commit()?;
    info!(count = items.len(), "Product cache replaced");
    Ok(items.len())
}

/// All cached products, active first, then by name.
pub fn list_catalog(db: &DbState) -> Result<Vec<CatalogItem>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM products_cache ORDER BY is_active DESC, name ASC"
    ))?;
    let items = stmt
        .query_map([], row_to_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

pub fn get_catalog_item(db: &DbState, id: i64) -> Result<Option<CatalogItem>> {
    let conn = db.lock()?;
    let item = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM products_cache WHERE id = ?1"),
            params![id],
            row_to_item,
        )
        .optional()?;
    Ok(item)
}

/// Exact barcode lookup, used by the scanner path while offline.
pub fn find_by_barcode(db: &DbState, barcode: &str) -> Result<Option<CatalogItem>> {
    let barcode = barcode.trim();
    if barcode.is_empty() {
        return Ok(None);
    }
    let conn = db.lock()?;
    let item = conn
        .query_row(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM products_cache WHERE barcode = ?1 LIMIT 1"
            ),
            params![barcode],
            row_to_item,
        )
        .optional()?;
    Ok(item)
}

/// Search active products by name prefix/substring, SKU, or barcode.
pub fn search_catalog(db: &DbState, query: &str, limit: usize) -> Result<Vec<CatalogItem>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let pattern = format!("%{}%", escape_like(query));
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM products_cache
         WHERE is_active = 1
           AND (name LIKE ?1 ESCAPE '\\' OR sku = ?2 OR barcode = ?2)
         ORDER BY CASE WHEN barcode = ?2 OR sku = ?2 THEN 0 ELSE 1 END, name ASC
         LIMIT ?3"
    ))?;
    let items = stmt
        .query_map(params![pattern, query, limit as i64], row_to_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

pub(crate) fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Speculatively reduce cached stock: `stock = max(0, stock - qty)`.
/// Returns false when the product is not cached.
pub fn decrement_catalog_stock(db: &DbState, id: i64, qty: i64) -> Result<bool> {
    let conn = db.lock()?;
    let changed = conn.execute(
        "UPDATE products_cache
         SET stock_quantity = MAX(0, stock_quantity - ?2)
         WHERE id = ?1",
        params![id, qty.max(0)],
    )?;
    debug!(product_id = id, qty, changed, "Speculative stock decrement");
    Ok(changed > 0)
}

pub fn catalog_count(db: &DbState) -> Result<i64> {
    let conn = db.lock()?;
    Ok(conn.query_row("SELECT COUNT(*) FROM products_cache", [], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, name: &str, stock: i64) -> CatalogItem {
        CatalogItem {
            id,
            name: name.to_string(),
            sku: Some(format!("SKU-{id}")),
            barcode: Some(format!("590000000{id:04}")),
            price: 2.5,
            cost_price: None,
            stock_quantity: stock,
            is_active: true,
            last_synced_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn replace_swaps_the_whole_catalog() {
        let db = DbState::in_memory().unwrap();
        replace_catalog(&db, &[item(1, "Tea", 5), item(2, "Coffee", 3)]).unwrap();
        replace_catalog(&db, &[item(3, "Juice", 9)]).unwrap();

        let all = list_catalog(&db).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Juice");
    }

    #[test]
    fn failed_replace_keeps_previous_catalog() {
        let db = DbState::in_memory().unwrap();
        replace_catalog(&db, &[item(1, "Tea", 5), item(2, "Coffee", 3)]).unwrap();

        // Duplicate primary key makes the bulk insert fail half way.
        let err = replace_catalog(&db, &[item(7, "Water", 1), item(7, "Water again", 1)]);
        assert!(err.is_err());

        let all = list_catalog(&db).unwrap();
        let names: Vec<_> = all.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Coffee", "Tea"]);
    }

    #[test]
    fn decrement_clamps_at_zero() {
        let db = DbState::in_memory().unwrap();
        replace_catalog(&db, &[item(1, "Tea", 1)]).unwrap();

        assert!(decrement_catalog_stock(&db, 1, 1).unwrap());
        assert!(decrement_catalog_stock(&db, 1, 1).unwrap());
        assert_eq!(get_catalog_item(&db, 1).unwrap().unwrap().stock_quantity, 0);

        assert!(!decrement_catalog_stock(&db, 99, 1).unwrap());
    }

    #[test]
    fn search_matches_name_sku_and_barcode() {
        let db = DbState::in_memory().unwrap();
        let mut inactive = item(3, "Green tea", 1);
        inactive.is_active = false;
        replace_catalog(&db, &[item(1, "Black tea", 5), item(2, "Coffee", 3), inactive]).unwrap();

        let by_name = search_catalog(&db, "tea", 10).unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].id, 1);

        let by_sku = search_catalog(&db, "SKU-2", 10).unwrap();
        assert_eq!(by_sku[0].id, 2);

        let by_barcode = find_by_barcode(&db, "5900000000002").unwrap().unwrap();
        assert_eq!(by_barcode.id, 2);

        assert!(search_catalog(&db, "  ", 10).unwrap().is_empty());
        assert!(search_catalog(&db, "100%", 10).unwrap().is_empty());
    }
}

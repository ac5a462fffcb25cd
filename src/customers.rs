//! Customer cache.
//!
//! Remote customers are replaced on refresh; customers created while offline
//! are kept as `is_local` placeholder rows that a refresh never removes.

use rusqlite::{params, Row};
use tracing::info;
use uuid::Uuid;

use crate::catalog::escape_like;
use crate::db::{now_timestamp, DbState};
use crate::error::{Error, Result};
use crate::models::{CachedCustomer, Customer, NewCustomer};

const SELECT_COLUMNS: &str =
    "remote_id, local_id, name, email, phone, address, is_local, last_synced_at";

fn row_to_customer(row: &Row<'_>) -> rusqlite::Result<CachedCustomer> {
    Ok(CachedCustomer {
        remote_id: row.get(0)?,
        local_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        address: row.get(5)?,
        is_local: row.get::<_, i64>(6)? != 0,
        last_synced_at: row.get(7)?,
    })
}

impl CachedCustomer {
    pub fn from_remote(customer: Customer, synced_at: &str) -> Self {
        Self {
            remote_id: Some(customer.id),
            local_id: None,
            name: customer.name,
            email: customer.email,
            phone: customer.phone,
            address: customer.address,
            is_local: false,
            last_synced_at: Some(synced_at.to_string()),
        }
    }
}

/// Replace every non-local customer row in one transaction.
pub fn replace_customers(db: &DbState, customers: &[Customer]) -> Result<usize> {
    let synced_at = now_timestamp();
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM customers_cache WHERE is_local = 0", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO customers_cache (
                 remote_id, name, email, phone, address, is_local, last_synced_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        )?;
        for c in customers {
            stmt.execute(params![c.id, c.name, c.email, c.phone, c.address, synced_at])?;
        }
    }
    tx.commit()?;
    info!(count = customers.len(), "Customer cache replaced");
    Ok(customers.len())
}

pub fn list_customers(db: &DbState) -> Result<Vec<CachedCustomer>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM customers_cache ORDER BY name ASC, row_id ASC"
    ))?;
    let rows = stmt
        .query_map([], row_to_customer)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Search by name substring or phone digits.
pub fn search_customers(db: &DbState, query: &str, limit: usize) -> Result<Vec<CachedCustomer>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let name_pattern = format!("%{}%", escape_like(query));
    let digits: String = query.chars().filter(char::is_ascii_digit).collect();
    let phone_pattern = if digits.is_empty() {
        None
    } else {
        Some(format!("%{digits}%"))
    };

    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM customers_cache
         WHERE name LIKE ?1 ESCAPE '\\'
            OR (?2 IS NOT NULL
                AND REPLACE(REPLACE(REPLACE(phone, ' ', ''), '-', ''), '+', '') LIKE ?2)
         ORDER BY name ASC
         LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(params![name_pattern, phone_pattern, limit as i64], row_to_customer)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Store a customer created while offline. The row is kept across refreshes.
pub fn create_local_customer(db: &DbState, new: &NewCustomer) -> Result<CachedCustomer> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(Error::Validation("customer name is required".into()));
    }
    let local_id = Uuid::new_v4().to_string();
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO customers_cache (local_id, name, email, phone, address, is_local)
         VALUES (?1, ?2, ?3, ?4, ?5, 1)",
        params![local_id, name, new.email, new.phone, new.address],
    )?;
    info!(local_id = %local_id, "Local customer created");
    Ok(CachedCustomer {
        remote_id: None,
        local_id: Some(local_id),
        name: name.to_string(),
        email: new.email.clone(),
        phone: new.phone.clone(),
        address: new.address.clone(),
        is_local: true,
        last_synced_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(id: i64, name: &str, phone: &str) -> Customer {
        Customer {
            id,
            name: name.to_string(),
            email: None,
            phone: Some(phone.to_string()),
            address: None,
        }
    }

    #[test]
    fn refresh_keeps_local_placeholders() {
        let db = DbState::in_memory().unwrap();
        replace_customers(&db, &[remote(1, "Anna", "+30 690 000 0001")]).unwrap();
        let local = create_local_customer(
            &db,
            &NewCustomer {
                name: "Walk-in Bob".into(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(local.is_local);

        replace_customers(&db, &[remote(2, "Chris", "690-000-0002")]).unwrap();

        let all = list_customers(&db).unwrap();
        let names: Vec<_> = all.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Chris", "Walk-in Bob"]);
        assert!(all.iter().any(|c| c.local_id == local.local_id));
    }

    #[test]
    fn search_by_name_and_phone() {
        let db = DbState::in_memory().unwrap();
        replace_customers(
            &db,
            &[
                remote(1, "Anna", "+30 690 000 0001"),
                remote(2, "Chris", "690-000-0002"),
            ],
        )
        .unwrap();

        let by_name = search_customers(&db, "ann", 10).unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].remote_id, Some(1));

        let by_phone = search_customers(&db, "0000002", 10).unwrap();
        assert_eq!(by_phone.len(), 1);
        assert_eq!(by_phone[0].remote_id, Some(2));
    }

    #[test]
    fn local_customer_requires_name() {
        let db = DbState::in_memory().unwrap();
        let err = create_local_customer(&db, &NewCustomer::default());
        assert!(matches!(err, Err(Error::Validation(_))));
    }
}

//! Offline login credentials.
//!
//! One row per login identifier holding a salted bcrypt verifier (never the
//! password), the last known user profile, and the last session token. Rows
//! are upserted on every successful online login and read only when logging
//! in offline.

use rusqlite::{params, OptionalExtension};
use tracing::{info, warn};

use crate::db::{now_timestamp, DbState};
use crate::error::Result;
use crate::models::{CredentialCheck, UserProfile};

/// Login identifiers are matched case-insensitively.
fn normalize_login(login: &str) -> String {
    login.trim().to_lowercase()
}

/// Store (or replace) the offline credential for `login`.
pub fn upsert_credential(
    db: &DbState,
    login: &str,
    password: &str,
    profile: &UserProfile,
    token: Option<&str>,
    hash_cost: u32,
) -> Result<()> {
    let login = normalize_login(login);
    // Hash before taking the lock; bcrypt is deliberately slow.
    let verifier = bcrypt::hash(password, hash_cost)?;
    let profile_json = serde_json::to_string(profile)?;

    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO offline_credentials
            (login, password_hash, profile_json, session_token, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(login) DO UPDATE SET
            password_hash = excluded.password_hash,
            profile_json = excluded.profile_json,
            session_token = excluded.session_token,
            updated_at = excluded.updated_at",
        params![login, verifier, profile_json, token, now_timestamp()],
    )?;
    info!(login = %login, "Offline credential cached");
    Ok(())
}

/// Check `password` against the stored verifier for `login`.
///
/// An unknown login or a wrong password yields `valid: false`; only storage
/// failures are returned as errors.
pub fn verify_credential(db: &DbState, login: &str, password: &str) -> Result<CredentialCheck> {
    let login = normalize_login(login);
    let row: Option<(String, String, Option<String>)> = {
        let conn = db.lock()?;
        conn.query_row(
            "SELECT password_hash, profile_json, session_token
             FROM offline_credentials WHERE login = ?1",
            params![login],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
    };

    let Some((verifier, profile_json, token)) = row else {
        return Ok(CredentialCheck::invalid());
    };

    let matches = match bcrypt::verify(password, &verifier) {
        Ok(m) => m,
        Err(e) => {
            warn!(login = %login, error = %e, "Stored offline verifier is unreadable");
            false
        }
    };
    if !matches {
        warn!(login = %login, "Offline login rejected");
        return Ok(CredentialCheck::invalid());
    }

    let profile = match serde_json::from_str::<UserProfile>(&profile_json) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!(login = %login, error = %e, "Cached user profile is unreadable");
            None
        }
    };
    Ok(CredentialCheck {
        valid: true,
        profile,
        token,
    })
}

/// Forget the offline credential for `login`.
pub fn remove_credential(db: &DbState, login: &str) -> Result<bool> {
    let conn = db.lock()?;
    let removed = conn.execute(
        "DELETE FROM offline_credentials WHERE login = ?1",
        params![normalize_login(login)],
    )?;
    Ok(removed > 0)
}

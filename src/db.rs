//! Local SQLite database layer for the offline store.
//!
//! Uses rusqlite with WAL mode and foreign keys on. Provides schema
//! migrations, the `sync_meta` key/value helpers, and the shared
//! connection state used by every store module.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection. Callers must drop the guard before awaiting.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::Lock(e.to_string()))
    }

    /// Open a fully migrated in-memory store.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

const META_LAST_SYNC: &str = "last_successful_sync";

/// Timestamp format used for every TEXT time column: RFC 3339 UTC with
/// milliseconds, which sorts lexicographically.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Initialize the database at `{data_dir}/pos-offline.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. A file that cannot be opened is moved
/// aside (not deleted, it may hold unsynced sales) and a fresh one created.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join("pos-offline.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), moving file aside and retrying once",
                first_err
            );
            if db_path.exists() {
                let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
                match move_aside(&db_path, &stamp) {
                    Ok(aside) => warn!("Damaged database kept at {}", aside.display()),
                    Err(e) => {
                        error!("Could not move damaged database aside: {e}");
                        return Err(first_err);
                    }
                }
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// `path` with `suffix` appended to the file name (`x.db` -> `x.db-wal`).
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Rename the database and its `-wal`/`-shm` companions to
/// `{name}.corrupt-{stamp}` so the set still opens as one database.
///
/// Committed pages can live only in the WAL, so the companions move with
/// the main file. A companion that cannot be moved is removed instead;
/// the fresh database must not pick it up.
fn move_aside(db_path: &Path, stamp: &str) -> std::io::Result<PathBuf> {
    let aside = with_suffix(db_path, &format!(".corrupt-{stamp}"));
    fs::rename(db_path, &aside)?;
    for companion in ["-wal", "-shm"] {
        let from = with_suffix(db_path, companion);
        if !from.exists() {
            continue;
        }
        let to = with_suffix(&aside, companion);
        if let Err(e) = fs::rename(&from, &to) {
            warn!("Could not move {} aside ({e}), removing it", from.display());
            fs::remove_file(&from)?;
        }
    }
    Ok(aside)
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    // Touch the schema so a corrupt file fails here rather than mid-sync.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub(crate) fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        apply_migration(conn, 1, MIGRATION_V1)?;
    }
    if current < 2 {
        apply_migration(conn, 2, MIGRATION_V2)?;
    }
    if current < 3 {
        apply_migration(conn, 3, MIGRATION_V3)?;
    }

    Ok(())
}

/// Apply one migration inside its own transaction, recording the version.
fn apply_migration(conn: &Connection, version: i32, sql: &str) -> Result<()> {
    let batch = format!(
        "BEGIN IMMEDIATE;
         {sql}
         INSERT INTO schema_version (version) VALUES ({version});
         COMMIT;"
    );
    if let Err(source) = conn.execute_batch(&batch) {
        error!("Migration v{version} failed: {source}");
        let _ = conn.execute_batch("ROLLBACK;");
        return Err(Error::Migration { version, source });
    }
    info!("Applied migration v{version}");
    Ok(())
}

/// Migration v1: read caches for products and customers, pending sale queue.
const MIGRATION_V1: &str = "
    -- products_cache (mirror of remote products, replaced wholesale)
    CREATE TABLE IF NOT EXISTS products_cache (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        sku TEXT,
        barcode TEXT,
        price REAL NOT NULL DEFAULT 0,
        cost_price REAL,
        stock_quantity INTEGER NOT NULL DEFAULT 0 CHECK (stock_quantity >= 0),
        is_active INTEGER NOT NULL DEFAULT 1,
        last_synced_at TEXT NOT NULL
    );

    -- customers_cache (remote rows plus offline-created placeholders)
    CREATE TABLE IF NOT EXISTS customers_cache (
        row_id INTEGER PRIMARY KEY AUTOINCREMENT,
        remote_id INTEGER UNIQUE,
        local_id TEXT UNIQUE,
        name TEXT NOT NULL,
        email TEXT,
        phone TEXT,
        address TEXT,
        is_local INTEGER NOT NULL DEFAULT 0,
        last_synced_at TEXT,
        CHECK ((is_local = 1 AND local_id IS NOT NULL) OR (is_local = 0 AND remote_id IS NOT NULL))
    );

    -- pending_transactions (sales waiting for the remote service)
    CREATE TABLE IF NOT EXISTS pending_transactions (
        local_id TEXT PRIMARY KEY,
        customer_id INTEGER,
        payment_method TEXT NOT NULL,
        subtotal REAL NOT NULL DEFAULT 0,
        discount_total REAL NOT NULL DEFAULT 0,
        total REAL NOT NULL,
        notes TEXT,
        created_at TEXT NOT NULL,
        attempt INTEGER NOT NULL DEFAULT 0 CHECK (attempt >= 0),
        last_attempt_at TEXT,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'syncing', 'failed')),
        error_message TEXT
    );

    -- pending_transaction_lines (owned by a pending transaction)
    CREATE TABLE IF NOT EXISTS pending_transaction_lines (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        local_id TEXT NOT NULL,
        line_no INTEGER NOT NULL,
        product_id INTEGER NOT NULL,
        quantity INTEGER NOT NULL CHECK (quantity > 0),
        unit_price REAL NOT NULL,
        discount REAL NOT NULL DEFAULT 0,
        subtotal REAL NOT NULL,
        UNIQUE(local_id, line_no),
        FOREIGN KEY(local_id) REFERENCES pending_transactions(local_id) ON DELETE CASCADE
    );

    -- Indexes
    CREATE INDEX IF NOT EXISTS idx_products_cache_name ON products_cache(name);
    CREATE INDEX IF NOT EXISTS idx_products_cache_barcode ON products_cache(barcode);
    CREATE INDEX IF NOT EXISTS idx_products_cache_sku ON products_cache(sku);
    CREATE INDEX IF NOT EXISTS idx_customers_cache_name ON customers_cache(name);
    CREATE INDEX IF NOT EXISTS idx_customers_cache_phone ON customers_cache(phone);
    CREATE INDEX IF NOT EXISTS idx_pending_transactions_status ON pending_transactions(status);
    CREATE INDEX IF NOT EXISTS idx_pending_transactions_created_at
        ON pending_transactions(created_at);
    CREATE INDEX IF NOT EXISTS idx_pending_lines_local_id ON pending_transaction_lines(local_id);
";

/// Migration v2: transaction history cache and offline login credentials.
const MIGRATION_V2: &str = "
    -- transactions_cache (recent remote transactions for offline history)
    CREATE TABLE IF NOT EXISTS transactions_cache (
        id INTEGER PRIMARY KEY,
        transaction_number TEXT,
        customer_id INTEGER,
        customer_name TEXT,
        total REAL NOT NULL DEFAULT 0,
        payment_method TEXT,
        status TEXT,
        item_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT,
        cached_at TEXT NOT NULL
    );

    -- offline_credentials (one row per login identifier)
    CREATE TABLE IF NOT EXISTS offline_credentials (
        login TEXT PRIMARY KEY,
        password_hash TEXT NOT NULL,
        profile_json TEXT NOT NULL,
        session_token TEXT,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_transactions_cache_created_at
        ON transactions_cache(created_at);
";

/// Migration v3: sync run log and the key/value meta table.
const MIGRATION_V3: &str = "
    -- sync_log (one row per sync run, observability only)
    CREATE TABLE IF NOT EXISTS sync_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sync_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'running'
            CHECK (status IN ('running', 'completed', 'failed')),
        started_at TEXT NOT NULL,
        finished_at TEXT,
        synced_count INTEGER NOT NULL DEFAULT 0,
        failed_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT
    );

    -- sync_meta (key/value)
    CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sync_log_started_at ON sync_log(started_at);
";

// ---------------------------------------------------------------------------
// Meta helpers
// ---------------------------------------------------------------------------

/// Get a single meta value.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM sync_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Insert or update a meta value.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_meta (key, value, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![key, value, now_timestamp()],
    )?;
    Ok(())
}

/// Time of the last sync run that reached the end of its queue pass.
pub fn last_sync_time(db: &DbState) -> Result<Option<DateTime<Utc>>> {
    let conn = db.lock()?;
    let raw = get_meta(&conn, META_LAST_SYNC)?;
    Ok(raw
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}

pub fn set_last_sync_time(db: &DbState, at: DateTime<Utc>) -> Result<()> {
    let conn = db.lock()?;
    set_meta(
        &conn,
        META_LAST_SYNC,
        &at.to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

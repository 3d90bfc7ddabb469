//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Holds the terminal's settings (including the
//! persisted draft slot) and, when the terminal runs against the embedded
//! backend, the authoritative transaction and expense tables.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Shared database handle.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Open (or create) the database at `db_path` and bring the schema up to date.
///
/// On open failure the file is renamed to `*.corrupt-<timestamp>` and opening
/// is retried once. Only the parent directory is created; the caller picks
/// the file name.
pub fn init(db_path: &Path) -> Result<DbState, String> {
    if let Some(dir) = db_path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(|e| format!("Failed to create data dir: {e}"))?;
        }
    }

    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), moving it aside and retrying once",
                first_err
            );
            if db_path.exists() {
                let aside = db_path.with_extension(format!(
                    "corrupt-{}",
                    chrono::Utc::now().format("%Y%m%d%H%M%S")
                ));
                if let Err(e) = fs::rename(db_path, &aside) {
                    warn!("Failed to move {} aside: {e}", db_path.display());
                }
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: db_path.to_path_buf(),
    })
}

/// Fresh in-memory database with the full schema. Used by tests and demos.
pub fn open_in_memory() -> Result<DbState, String> {
    let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: settings store (also holds draft slots).
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| format!("migrate v1: {e}"))
}

/// Migration v2: committed sales. `submission_id` is the idempotency key.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pos_transactions (
            id TEXT PRIMARY KEY,
            submission_id TEXT NOT NULL,
            customer_reference TEXT,
            payment_amount REAL NOT NULL DEFAULT 0,
            voucher_amount REAL NOT NULL DEFAULT 0,
            grand_total REAL NOT NULL DEFAULT 0,
            change_amount REAL NOT NULL DEFAULT 0,
            operator_id TEXT NOT NULL,
            effective_date TEXT,
            committed_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_pos_transactions_submission
            ON pos_transactions(submission_id);
        CREATE INDEX IF NOT EXISTS idx_pos_transactions_committed
            ON pos_transactions(committed_at);

        CREATE TABLE IF NOT EXISTS pos_transaction_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id TEXT NOT NULL REFERENCES pos_transactions(id) ON DELETE CASCADE,
            line_no INTEGER NOT NULL,
            product_reference TEXT NOT NULL,
            display_name TEXT NOT NULL,
            unit_price REAL NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity >= 1),
            discount REAL NOT NULL DEFAULT 0 CHECK (discount >= 0)
        );
        CREATE INDEX IF NOT EXISTS idx_pos_transaction_items_tx
            ON pos_transaction_items(transaction_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| format!("migrate v2: {e}"))
}

/// Migration v3: expense ledger.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS expenses (
            id TEXT PRIMARY KEY,
            amount REAL NOT NULL CHECK (amount >= 0),
            description TEXT NOT NULL,
            expense_type TEXT NOT NULL DEFAULT 'other',
            expense_date TEXT NOT NULL,
            source_submission_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_expenses_date ON expenses(expense_date);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_expenses_source_submission
            ON expenses(source_submission_id) WHERE source_submission_id IS NOT NULL;

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| format!("migrate v3: {e}"))
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a setting. `Ok(None)` when absent.
pub fn get_setting(
    conn: &Connection,
    category: &str,
    key: &str,
) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .optional()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Delete a setting. Succeeds when the row does not exist.
pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

//! Local SQLite database layer for Van Sales.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! a unit-of-work helper for multi-row writes, and the shared `DbState`
//! handle every service takes by reference.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Shared handle holding the database connection.
///
/// The mutex is the only serialisation point for store access; callers must
/// not hold the guard across an `.await`.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Open a fresh, fully migrated in-memory database.
    pub fn open_in_memory() -> Result<DbState> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/vansales.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. An open failure is returned as is and
/// the file is left alone; only a file SQLite reports as corrupt or not a
/// database is moved aside to `vansales.db.corrupt-<ts>` before starting
/// over.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| Error::Config(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("vansales.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(Error::Store(e)) if is_corrupt(&e) => {
            let moved_to = quarantine(&db_path)?;
            error!(
                "Database at {} is unreadable ({e}), moved to {}",
                db_path.display(),
                moved_to.display()
            );
            open_and_configure(&db_path)?
        }
        Err(e) => {
            error!("Database open failed: {e}");
            return Err(e);
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

fn is_corrupt(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Rename the database and its WAL/SHM side files out of the way.
fn quarantine(db_path: &Path) -> Result<PathBuf> {
    let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%d%H%M%S"));
    let moved_to = PathBuf::from(format!("{}.{suffix}", db_path.display()));
    fs::rename(db_path, &moved_to)
        .map_err(|e| Error::Config(format!("Failed to move corrupt database aside: {e}")))?;
    for side in ["-wal", "-shm"] {
        let from = PathBuf::from(format!("{}{side}", db_path.display()));
        if from.exists() {
            let to = PathBuf::from(format!("{}{side}", moved_to.display()));
            if let Err(e) = fs::rename(&from, &to) {
                warn!("Failed to move {} aside: {e}", from.display());
            }
        }
    }
    Ok(moved_to)
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
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
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

fn apply(conn: &Connection, version: i32, sql: &str) -> Result<()> {
    conn.execute_batch(sql).map_err(|e| {
        error!("Migration v{version} failed: {e}");
        Error::Store(e)
    })?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )?;
    info!("Applied migration v{version}");
    Ok(())
}

/// Migration v1: settings, sales invoices and the sync queue.
fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        1,
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- sales invoices issued from a van (amounts are decimal TEXT)
        CREATE TABLE IF NOT EXISTS invoices (
            id TEXT PRIMARY KEY,
            invoice_number TEXT NOT NULL UNIQUE,
            van_id TEXT NOT NULL,
            customer_code TEXT,
            invoice_date TEXT NOT NULL,
            total_amount TEXT NOT NULL DEFAULT '0',
            paid_amount TEXT NOT NULL DEFAULT '0',
            payment_mode TEXT NOT NULL CHECK (payment_mode IN ('cash', 'credit', 'card', 'cheque')),
            created_at TEXT NOT NULL
        );

        -- sync_queue (outbox of pending remote writes)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('insert', 'update')),
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'in_progress', 'synced', 'failed')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            retry_delay_ms INTEGER NOT NULL DEFAULT 5000,
            next_retry_at TEXT,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            synced_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_invoices_van_date ON invoices(van_id, invoice_date);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_type, entity_id);
        ",
    )
}

/// Migration v2: day close, expenses and settlements.
fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        2,
        "
        CREATE TABLE IF NOT EXISTS day_closes (
            id TEXT PRIMARY KEY,
            van_id TEXT NOT NULL,
            close_date TEXT NOT NULL,
            total_sales TEXT NOT NULL DEFAULT '0',
            total_cash_collected TEXT NOT NULL DEFAULT '0',
            total_expenses TEXT NOT NULL DEFAULT '0',
            variance TEXT NOT NULL DEFAULT '0',
            opening_stock_value TEXT NOT NULL DEFAULT '0',
            closing_stock_value TEXT NOT NULL DEFAULT '0',
            status TEXT NOT NULL DEFAULT 'closed' CHECK (status IN ('closed', 'settled')),
            notes TEXT,
            closed_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(van_id, close_date)
        );

        CREATE TABLE IF NOT EXISTS day_close_expenses (
            id TEXT PRIMARY KEY,
            day_close_id TEXT NOT NULL,
            expense_type TEXT NOT NULL CHECK (expense_type IN ('fuel', 'parking', 'toll', 'other')),
            amount TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            FOREIGN KEY(day_close_id) REFERENCES day_closes(id) ON DELETE CASCADE
        );

        -- one settlement per day close
        CREATE TABLE IF NOT EXISTS settlements (
            id TEXT PRIMARY KEY,
            van_id TEXT NOT NULL,
            day_close_id TEXT NOT NULL UNIQUE,
            warehouse_id TEXT NOT NULL,
            settlement_date TEXT NOT NULL,
            stock_returned_value TEXT NOT NULL DEFAULT '0',
            cash_deposited TEXT NOT NULL DEFAULT '0',
            notes TEXT,
            settled_by TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(day_close_id) REFERENCES day_closes(id)
        );

        CREATE INDEX IF NOT EXISTS idx_day_closes_van_status ON day_closes(van_id, status);
        CREATE INDEX IF NOT EXISTS idx_day_close_expenses_parent ON day_close_expenses(day_close_id);
        CREATE INDEX IF NOT EXISTS idx_settlements_van ON settlements(van_id);
        ",
    )
}

/// Migration v3: master data rows keyed by business code.
fn migrate_v3(conn: &Connection) -> Result<()> {
    apply(
        conn,
        3,
        "
        CREATE TABLE IF NOT EXISTS master_rows (
            kind TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            attributes TEXT NOT NULL DEFAULT '{}',
            sync_state TEXT NOT NULL DEFAULT 'pending'
                CHECK (sync_state IN ('pending', 'synced', 'conflict')),
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (kind, code)
        );

        CREATE INDEX IF NOT EXISTS idx_master_rows_sync_state ON master_rows(kind, sync_state);
        ",
    )
}

// ---------------------------------------------------------------------------
// Unit of work
// ---------------------------------------------------------------------------

/// Run `f` inside `BEGIN IMMEDIATE … COMMIT`, rolling back on any error.
///
/// `IMMEDIATE` takes the write lock up front so that read-then-write checks
/// inside `f` (status preconditions, duplicate checks) cannot interleave
/// with another writer.
pub fn with_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(value) => match conn.execute_batch("COMMIT") {
            Ok(()) => Ok(value),
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        },
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a setting value by category and key.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
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

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .expect("pragma setup");
        conn
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_day_close_unique_per_van_and_date() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO day_closes (id, van_id, close_date, created_at, updated_at)
             VALUES ('dc-1', 'van-1', '2025-01-15', datetime('now'), datetime('now'))",
            [],
        )
        .expect("insert day close");

        let dup = conn.execute(
            "INSERT INTO day_closes (id, van_id, close_date, created_at, updated_at)
             VALUES ('dc-2', 'van-1', '2025-01-15', datetime('now'), datetime('now'))",
            [],
        );
        assert!(dup.is_err(), "second close for same van/date should be rejected");

        let other_van = conn.execute(
            "INSERT INTO day_closes (id, van_id, close_date, created_at, updated_at)
             VALUES ('dc-3', 'van-2', '2025-01-15', datetime('now'), datetime('now'))",
            [],
        );
        assert!(other_van.is_ok());

        let bad_status = conn.execute(
            "INSERT INTO day_closes (id, van_id, close_date, status, created_at, updated_at)
             VALUES ('dc-4', 'van-3', '2025-01-15', 'open', datetime('now'), datetime('now'))",
            [],
        );
        assert!(bad_status.is_err(), "invalid status should be rejected");
    }

    #[test]
    fn test_settlement_unique_per_day_close() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO day_closes (id, van_id, close_date, created_at, updated_at)
             VALUES ('dc-1', 'van-1', '2025-01-15', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO settlements (id, van_id, day_close_id, warehouse_id, settlement_date, created_at)
             VALUES ('st-1', 'van-1', 'dc-1', 'wh-1', '2025-01-15', datetime('now'))",
            [],
        )
        .expect("first settlement");

        let dup = conn.execute(
            "INSERT INTO settlements (id, van_id, day_close_id, warehouse_id, settlement_date, created_at)
             VALUES ('st-2', 'van-1', 'dc-1', 'wh-1', '2025-01-15', datetime('now'))",
            [],
        );
        assert!(dup.is_err(), "second settlement should be rejected");

        let orphan = conn.execute(
            "INSERT INTO settlements (id, van_id, day_close_id, warehouse_id, settlement_date, created_at)
             VALUES ('st-3', 'van-1', 'missing', 'wh-1', '2025-01-15', datetime('now'))",
            [],
        );
        assert!(orphan.is_err(), "settlement must reference a day close");
    }

    #[test]
    fn test_expenses_cascade_with_day_close() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO day_closes (id, van_id, close_date, created_at, updated_at)
             VALUES ('dc-1', 'van-1', '2025-01-15', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO day_close_expenses (id, day_close_id, expense_type, amount, created_at)
             VALUES ('ex-1', 'dc-1', 'fuel', '10.000', datetime('now'))",
            [],
        )
        .unwrap();

        let bad_type = conn.execute(
            "INSERT INTO day_close_expenses (id, day_close_id, expense_type, amount, created_at)
             VALUES ('ex-2', 'dc-1', 'lunch', '1.000', datetime('now'))",
            [],
        );
        assert!(bad_type.is_err(), "invalid expense_type should be rejected");

        conn.execute("DELETE FROM day_closes WHERE id = 'dc-1'", [])
            .unwrap();
        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM day_close_expenses", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_with_transaction_rolls_back_on_error() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let result: Result<()> = with_transaction(&conn, |tx| {
            set_setting(tx, "sync", "company_id", "C1")?;
            Err(Error::validation("abort"))
        });
        assert!(result.is_err());
        assert!(get_setting(&conn, "sync", "company_id").is_none());

        with_transaction(&conn, |tx| set_setting(tx, "sync", "company_id", "C1"))
            .expect("commit");
        assert_eq!(
            get_setting(&conn, "sync", "company_id"),
            Some("C1".to_string())
        );
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        set_setting(&conn, "sync", "site_id", "S1").expect("set");
        assert_eq!(get_setting(&conn, "sync", "site_id"), Some("S1".to_string()));

        set_setting(&conn, "sync", "site_id", "S2").expect("update");
        assert_eq!(get_setting(&conn, "sync", "site_id"), Some("S2".to_string()));
        assert!(get_setting(&conn, "sync", "company_id").is_none());
    }

    #[test]
    fn test_init_creates_file_database() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = init(dir.path()).expect("init");
        assert!(db.db_path.exists());
        drop(db);

        // Re-opening an existing database keeps the schema.
        let db = init(dir.path()).expect("re-init");
        let conn = db.conn.lock().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_init_keeps_data_when_database_is_locked() {
        let dir = tempfile::tempdir().expect("temp dir");
        {
            let db = init(dir.path()).expect("init");
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO day_closes (id, van_id, close_date, created_at, updated_at)
                 VALUES ('dc-1', 'van-1', '2025-01-15', datetime('now'), datetime('now'))",
                [],
            )
            .unwrap();
        }

        let locker = Connection::open(dir.path().join("vansales.db")).unwrap();
        locker
            .execute_batch(
                "PRAGMA locking_mode = EXCLUSIVE;
                 BEGIN EXCLUSIVE;
                 INSERT INTO local_settings (setting_category, setting_key, setting_value)
                 VALUES ('sync', 'site_id', 'S1');",
            )
            .unwrap();

        let locked = init(dir.path());
        assert!(matches!(locked, Err(Error::Store(_))));

        locker.execute_batch("ROLLBACK").unwrap();
        drop(locker);

        let db = init(dir.path()).expect("re-init after lock released");
        let conn = db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM day_closes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_init_moves_unreadable_file_aside() {
        let dir = tempfile::tempdir().expect("temp dir");
        let garbage = vec![b'x'; 4096];
        std::fs::write(dir.path().join("vansales.db"), &garbage).unwrap();

        let db = init(dir.path()).expect("init over unreadable file");
        drop(db);

        let moved: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with("vansales.db.corrupt-"))
            })
            .collect();
        assert_eq!(moved.len(), 1);
        assert_eq!(std::fs::read(moved[0].path()).unwrap(), garbage);
    }
}

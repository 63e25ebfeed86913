//! Local SQLite database layer for the sale queue.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the
//! `local_settings` key/value helpers, and the shared connection handle the
//! queue store is built on.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::error::{Result, SyncError};

/// Shared database handle. The mutex is the only synchronization the store
/// needs: every statement runs while holding it.
pub struct Database {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

impl Database {
    /// Open (or create) the database file and run pending migrations.
    ///
    /// Unlike a cache, a damaged queue file is never deleted: it may hold
    /// sales that exist nowhere else. Failures surface as `StoreUnavailable`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| {
                SyncError::StoreUnavailable(format!("create data dir {}: {e}", dir.display()))
            })?;
        }

        info!("Opening sale queue database at {}", path.display());
        let conn = open_and_configure(path)
            .map_err(|e| SyncError::StoreUnavailable(format!("sqlite open: {e}")))?;
        run_migrations(&conn)
            .map_err(|e| SyncError::StoreUnavailable(format!("migrations: {e}")))?;

        info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        })
    }

    /// Volatile database, used for tests and as the fallback when the durable
    /// file cannot be opened.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn is_durable(&self) -> bool {
        self.db_path.is_some()
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SyncError::LockPoisoned)
    }

    /// Read a value from `local_settings`.
    pub fn local_setting_get(&self, category: &str, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        local_setting_get(&conn, category, key)
    }

    /// Upsert a value into `local_settings`.
    pub fn local_setting_set(&self, category: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        local_setting_set(&conn, category, key, value)
    }
}

pub(crate) fn local_setting_get(
    conn: &Connection,
    category: &str,
    key: &str,
) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT setting_value FROM local_settings
             WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

pub(crate) fn local_setting_set(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<()> {
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

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;

    // FULL sync: a sale acknowledged to the cashier must survive power loss.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = FULL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
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

    Ok(())
}

/// Migration v1: settings store and the pending sale queue.
fn migrate_v1(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS pending_sales (
            local_id TEXT PRIMARY KEY,
            idempotency_key TEXT UNIQUE NOT NULL,
            offline_receipt_number TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            server_transaction_id TEXT,
            server_receipt_number TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_pending_sales_status ON pending_sales(status);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key
            ON local_settings(setting_category, setting_key);

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        e
    })?;

    info!("Applied migration v1 (local_settings + pending_sales)");
    Ok(())
}

/// Migration v2: FIFO index for the actionable-records scan.
fn migrate_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        BEGIN;
        CREATE INDEX IF NOT EXISTS idx_pending_sales_status_created
            ON pending_sales(status, created_at);
        INSERT INTO schema_version (version) VALUES (2);
        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        e
    })?;

    info!("Applied migration v2 (pending_sales FIFO index)");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

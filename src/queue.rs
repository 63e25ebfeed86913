//! Durable queue of pending sales.
//!
//! One row per sale in `pending_sales`, keyed by `local_id` with a unique
//! `idempotency_key`. Every mutation runs inside a SQLite transaction so a
//! crash never leaves a half-updated record behind.

use chrono::{DateTime, Local, NaiveDate, SecondsFormat, Utc};
use rusqlite::{ffi, params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::{self, Database};
use crate::error::{Result, SyncError};
use crate::models::{PendingSale, PendingSaleUpdate, SalePayload, SaleStatus, ServerReceipt};

const RECEIPT_COUNTER_CATEGORY: &str = "offline_receipts";

const SELECT_COLUMNS: &str = "local_id, idempotency_key, offline_receipt_number, payload,
     created_at, status, retry_count, last_error, server_transaction_id,
     server_receipt_number";

/// Crash-surviving store of `PendingSale` records.
#[derive(Clone)]
pub struct QueueStore {
    db: Arc<Database>,
}

impl QueueStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open the durable store at `path`. If that fails, fall back to a
    /// volatile in-memory store so the till keeps working; the error is
    /// returned alongside so it can be shown to the operator.
    pub fn open_or_volatile(path: &Path) -> Result<(Self, Option<SyncError>)> {
        match Database::open(path) {
            Ok(db) => Ok((Self::new(Arc::new(db)), None)),
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "Durable sale queue unavailable; queued sales will not survive a restart"
                );
                let db = Database::open_in_memory()?;
                Ok((Self::new(Arc::new(db)), Some(e)))
            }
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn is_durable(&self) -> bool {
        self.db.is_durable()
    }

    /// Insert a new record.
    pub fn add(&self, record: &PendingSale) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let conn = self.db.lock()?;
        let inserted = conn.execute(
            "INSERT INTO pending_sales (
                 local_id, idempotency_key, offline_receipt_number, payload, created_at,
                 status, retry_count, last_error, server_transaction_id, server_receipt_number
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.local_id,
                record.idempotency_key,
                record.offline_receipt_number,
                payload,
                format_timestamp(&record.created_at),
                record.status.as_str(),
                record.retry_count,
                record.last_error,
                record.server_transaction_id,
                record.server_receipt_number,
            ],
        );

        match inserted {
            Ok(_) => {
                debug!(
                    local_id = %record.local_id,
                    receipt = %record.offline_receipt_number,
                    "Queued pending sale"
                );
                Ok(())
            }
            Err(e) if is_duplicate_idempotency_key(&e) => {
                warn!(
                    idempotency_key = %record.idempotency_key,
                    "Rejected duplicate idempotency key"
                );
                Err(SyncError::DuplicateIdempotencyKey(
                    record.idempotency_key.clone(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// PENDING and FAILED records, oldest first.
    pub fn get_actionable(&self) -> Result<Vec<PendingSale>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM pending_sales
             WHERE status IN ('pending', 'failed')
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map([], row_to_sale)?;
        collect_rows(rows)
    }

    /// Every record, newest first, for the inspection screen.
    pub fn get_all(&self) -> Result<Vec<PendingSale>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM pending_sales
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map([], row_to_sale)?;
        collect_rows(rows)
    }

    pub fn get(&self, local_id: &str) -> Result<Option<PendingSale>> {
        let conn = self.db.lock()?;
        fetch_one(&conn, local_id)
    }

    pub fn find_by_idempotency_key(&self, key: &str) -> Result<Option<PendingSale>> {
        let conn = self.db.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM pending_sales WHERE idempotency_key = ?1"),
                params![key],
                row_to_sale,
            )
            .optional()?;
        Ok(record)
    }

    /// Merge `update` into the record and return the stored result.
    pub fn update(&self, local_id: &str, update: &PendingSaleUpdate) -> Result<PendingSale> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut record = fetch_one(&tx, local_id)?
            .ok_or_else(|| SyncError::RecordNotFound(local_id.to_string()))?;
        update.apply_to(&mut record);

        tx.execute(
            "UPDATE pending_sales
             SET status = ?1,
                 retry_count = ?2,
                 last_error = ?3,
                 server_transaction_id = ?4,
                 server_receipt_number = ?5,
                 updated_at = datetime('now')
             WHERE local_id = ?6",
            params![
                record.status.as_str(),
                record.retry_count,
                record.last_error,
                record.server_transaction_id,
                record.server_receipt_number,
                local_id,
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Delete a record. Returns whether a row existed.
    pub fn remove(&self, local_id: &str) -> Result<bool> {
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM pending_sales WHERE local_id = ?1",
            params![local_id],
        )?;
        Ok(removed > 0)
    }

    /// Delete every record. Callers must have confirmed with the operator.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        let removed = conn.execute("DELETE FROM pending_sales", [])?;
        info!(removed, "Cleared sale queue");
        Ok(removed)
    }

    pub fn count_actionable(&self) -> Result<usize> {
        self.count_where("status IN ('pending', 'failed')")
    }

    pub fn count_failed(&self) -> Result<usize> {
        self.count_where("status = 'failed'")
    }

    fn count_where(&self, where_clause: &str) -> Result<usize> {
        let conn = self.db.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM pending_sales WHERE {where_clause}"),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Clean up after an interrupted process: records stranded in SYNCING go
    /// back to PENDING and any row left as SYNCED is purged. Returns how many
    /// records were requeued. Only valid while no sync cycle is running.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let requeued = tx.execute(
            "UPDATE pending_sales SET status = 'pending', updated_at = datetime('now')
             WHERE status = 'syncing'",
            [],
        )?;
        let purged = tx.execute("DELETE FROM pending_sales WHERE status = 'synced'", [])?;
        tx.commit()?;

        if requeued > 0 {
            info!(requeued, "Requeued sales interrupted mid-sync");
        }
        if purged > 0 {
            info!(purged, "Purged sales already accepted by the server");
        }
        Ok(requeued)
    }

    /// Finish a record the server accepted: its server identity is attached
    /// and the row deleted in one transaction, so SYNCED never reaches disk.
    pub fn complete(&self, local_id: &str, receipt: &ServerReceipt) -> Result<PendingSale> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut record = fetch_one(&tx, local_id)?
            .ok_or_else(|| SyncError::RecordNotFound(local_id.to_string()))?;
        tx.execute(
            "DELETE FROM pending_sales WHERE local_id = ?1",
            params![local_id],
        )?;
        tx.commit()?;

        PendingSaleUpdate {
            status: Some(SaleStatus::Synced),
            server_transaction_id: Some(receipt.transaction_id.clone()),
            server_receipt_number: Some(receipt.receipt_number.clone()),
            ..PendingSaleUpdate::default()
        }
        .apply_to(&mut record);
        Ok(record)
    }

    /// Validate, number and persist a new sale in one step.
    pub fn enqueue(&self, payload: SalePayload) -> Result<PendingSale> {
        payload.validate()?;
        let receipt = self.next_offline_receipt_number()?;
        let record = PendingSale::new(payload, receipt);
        self.add(&record)?;
        Ok(record)
    }

    /// Like `enqueue`, but keeps an idempotency key that may already have
    /// reached the server.
    pub fn enqueue_with_key(
        &self,
        payload: SalePayload,
        idempotency_key: String,
        offline_receipt_number: String,
    ) -> Result<PendingSale> {
        payload.validate()?;
        let record =
            PendingSale::with_idempotency_key(payload, offline_receipt_number, idempotency_key);
        self.add(&record)?;
        Ok(record)
    }

    /// Next `OFF-YYYYMMDD-NNNN` label from the persistent per-day counter.
    pub fn next_offline_receipt_number(&self) -> Result<String> {
        self.offline_receipt_number_for(Local::now().date_naive())
    }

    pub(crate) fn offline_receipt_number_for(&self, date: NaiveDate) -> Result<String> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let day = date.format("%Y%m%d").to_string();
        let current: u32 = db::local_setting_get(&tx, RECEIPT_COUNTER_CATEGORY, &day)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        // NNNN is four digits; wrap rather than widen the label.
        let next = current % 9999 + 1;
        db::local_setting_set(&tx, RECEIPT_COUNTER_CATEGORY, &day, &next.to_string())?;
        tx.commit()?;

        Ok(format_offline_receipt(date, next))
    }
}

pub fn format_offline_receipt(date: NaiveDate, sequence: u32) -> String {
    format!("OFF-{}-{:04}", date.format("%Y%m%d"), sequence)
}

/// Fixed-width UTC timestamps so lexical order equals chronological order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn fetch_one(conn: &Connection, local_id: &str) -> Result<Option<PendingSale>> {
    let record = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM pending_sales WHERE local_id = ?1"),
            params![local_id],
            row_to_sale,
        )
        .optional()?;
    Ok(record)
}

fn row_to_sale(row: &Row<'_>) -> rusqlite::Result<PendingSale> {
    let payload_text: String = row.get(3)?;
    let payload = serde_json::from_str(&payload_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_text: String = row.get(4)?;
    let created_at = DateTime::parse_from_rfc3339(&created_text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let status_text: String = row.get(5)?;
    let status = status_text.parse::<SaleStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::<dyn std::error::Error + Send + Sync>::from(e),
        )
    })?;

    Ok(PendingSale {
        local_id: row.get(0)?,
        idempotency_key: row.get(1)?,
        offline_receipt_number: row.get(2)?,
        payload,
        created_at,
        status,
        retry_count: row.get(6)?,
        last_error: row.get(7)?,
        server_transaction_id: row.get(8)?,
        server_receipt_number: row.get(9)?,
    })
}

fn collect_rows<I>(rows: I) -> Result<Vec<PendingSale>>
where
    I: Iterator<Item = rusqlite::Result<PendingSale>>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Only the `idempotency_key` UNIQUE index counts; a primary-key clash or a
/// NOT NULL failure stays a storage error.
fn is_duplicate_idempotency_key(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(message)) => {
            e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                && message.contains("pending_sales.idempotency_key")
        }
        _ => false,
    }
}

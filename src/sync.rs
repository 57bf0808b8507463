//! Master-data dual-write coordinator.
//!
//! Writes land in the local store first, together with an outbox entry in
//! `sync_queue`, inside one transaction. The coordinator then tries to
//! mirror the write to the remote API right away; if that fails the caller
//! still gets its row back with a deferred warning, and the background loop
//! retries the entry with exponential backoff until it lands or exhausts
//! its retries.
//!
//! Outbox invariants:
//! - entries for one code are pushed in id order: an entry waits while any
//!   earlier entry for its code is still pending, in flight or failed
//! - only `pending`/`failed` entries are coalesced; an `in_progress` entry is
//!   never rewritten under the pusher
//! - the DB lock is never held across a network call

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::MasterApi;
use crate::config::{Session, SyncConfig};
use crate::db::{self, DbState};
use crate::error::{Error, Result};
use crate::master::{
    self, MasterDraft, MasterKind, MasterRow, MasterSyncState, MasterUpdate, MergeReport,
};

const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
const MAX_RETRY_DELAY_MS: i64 = 300_000;
const CYCLE_BATCH_SIZE: i64 = 100;

// ---------------------------------------------------------------------------
// Background state
// ---------------------------------------------------------------------------

/// Shared state of the background sync loop.
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub last_sync: Arc<Mutex<Option<String>>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_sync: Arc::new(Mutex::new(None)),
        }
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemoteStatus {
    Synced,
    /// Saved locally; the outbox will retry the remote write.
    Deferred { warning: String },
}

/// Result of a local-first write. The local row is always present.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub row: MasterRow,
    pub remote: RemoteStatus,
}

impl WriteOutcome {
    pub fn warning(&self) -> Option<&str> {
        match &self.remote {
            RemoteStatus::Synced => None,
            RemoteStatus::Deferred { warning } => Some(warning),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncCycleReport {
    pub synced: usize,
    pub failed: usize,
    /// Entries left for a later cycle because an earlier one for the same
    /// code has not synced yet.
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending: i64,
    pub in_progress: i64,
    pub failed: i64,
    pub synced: i64,
    pub conflicts: i64,
    pub is_running: bool,
    pub last_sync: Option<String>,
}

// ---------------------------------------------------------------------------
// Outbox rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueOp {
    Insert,
    Update,
}

impl QueueOp {
    fn as_str(&self) -> &'static str {
        match self {
            QueueOp::Insert => "insert",
            QueueOp::Update => "update",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "insert" => Some(QueueOp::Insert),
            "update" => Some(QueueOp::Update),
            _ => None,
        }
    }
}

/// Snapshot stored in `sync_queue.payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedWrite {
    row: MasterRow,
    modified_by: String,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    id: i64,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: String,
    retry_count: i64,
    max_retries: i64,
    retry_delay_ms: i64,
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

fn queue_timestamp(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let jitter = deterministic_jitter_ms(seed);
    queue_timestamp(Utc::now() + ChronoDuration::milliseconds(bounded + jitter))
}

/// Add (or fold into an existing unsent entry) a remote write for `row`.
fn enqueue_write(
    conn: &Connection,
    op: QueueOp,
    row: &MasterRow,
    modified_by: &str,
    max_retries: i64,
) -> Result<i64> {
    let entity_type = row.kind.queue_entity_type();
    let payload = serde_json::to_string(&QueuedWrite {
        row: row.clone(),
        modified_by: modified_by.to_string(),
    })?;

    let unsent: Option<i64> = conn
        .query_row(
            "SELECT id FROM sync_queue
             WHERE entity_type = ?1 AND entity_id = ?2 AND status IN ('pending', 'failed')
             ORDER BY id DESC LIMIT 1",
            params![entity_type, row.code],
            |r| r.get(0),
        )
        .optional()?;

    if let Some(id) = unsent {
        // A queued insert absorbs later edits; the operation is kept.
        conn.execute(
            "UPDATE sync_queue SET
                payload = ?1, status = 'pending', retry_count = 0, retry_delay_ms = ?2,
                max_retries = ?3, next_retry_at = NULL, last_error = NULL,
                updated_at = datetime('now')
             WHERE id = ?4",
            params![payload, DEFAULT_RETRY_DELAY_MS, max_retries, id],
        )?;
        debug!(queue_id = id, entity_id = %row.code, "coalesced into pending outbox entry");
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key,
                                 status, max_retries, retry_delay_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
        params![
            entity_type,
            row.code,
            op.as_str(),
            payload,
            format!("{entity_type}:{}:{}", row.code, Uuid::new_v4()),
            max_retries,
            DEFAULT_RETRY_DELAY_MS,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_entry(row: &rusqlite::Row) -> rusqlite::Result<QueueEntry> {
    Ok(QueueEntry {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        operation: row.get(3)?,
        payload: row.get(4)?,
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        retry_delay_ms: row.get(7)?,
    })
}

const ENTRY_COLUMNS: &str =
    "id, entity_type, entity_id, operation, payload, retry_count, max_retries, retry_delay_ms";

/// Move a pending entry to `in_progress`. `None` if someone else has it.
fn claim_entry(db: &DbState, id: i64) -> Result<Option<QueueEntry>> {
    let conn = db.conn.lock()?;
    let claimed = conn.execute(
        "UPDATE sync_queue SET status = 'in_progress', updated_at = datetime('now')
         WHERE id = ?1 AND status = 'pending'",
        params![id],
    )?;
    if claimed == 0 {
        return Ok(None);
    }
    let entry = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1"),
            params![id],
            map_entry,
        )
        .optional()?;
    Ok(entry)
}

/// Whether an older entry for the same code has not reached the remote yet.
fn has_earlier_outstanding(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    id: i64,
) -> Result<bool> {
    let earlier: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue
         WHERE entity_type = ?1 AND entity_id = ?2 AND id < ?3
           AND status IN ('pending', 'in_progress', 'failed')",
        params![entity_type, entity_id, id],
        |r| r.get(0),
    )?;
    Ok(earlier > 0)
}

fn due_entries(db: &DbState) -> Result<Vec<QueueEntry>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM sync_queue
         WHERE status = 'pending' AND entity_type LIKE 'master:%'
           AND (next_retry_at IS NULL OR next_retry_at <= ?1)
         ORDER BY id
         LIMIT ?2"
    ))?;
    let entries = stmt
        .query_map(params![queue_timestamp(Utc::now()), CYCLE_BATCH_SIZE], map_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

fn mark_entry_synced(db: &DbState, entry: &QueueEntry, kind: MasterKind) -> Result<()> {
    let conn = db.conn.lock()?;
    db::with_transaction(&conn, |tx| {
        tx.execute(
            "UPDATE sync_queue SET status = 'synced', synced_at = datetime('now'),
                    last_error = NULL, next_retry_at = NULL, updated_at = datetime('now')
             WHERE id = ?1",
            params![entry.id],
        )?;
        let outstanding: i64 = tx.query_row(
            "SELECT COUNT(*) FROM sync_queue
             WHERE entity_type = ?1 AND entity_id = ?2
               AND status IN ('pending', 'in_progress', 'failed')",
            params![entry.entity_type, entry.entity_id],
            |r| r.get(0),
        )?;
        if outstanding == 0 {
            master::set_sync_state(tx, kind, &entry.entity_id, MasterSyncState::Synced, None)?;
        }
        Ok(())
    })
}

/// Record a failed push: back off, or give up after `max_retries`.
fn mark_entry_failed(db: &DbState, entry: &QueueEntry, kind: MasterKind, error: &str) -> Result<bool> {
    let new_count = entry.retry_count + 1;
    let exhausted = new_count >= entry.max_retries;
    let delay = entry.retry_delay_ms.max(DEFAULT_RETRY_DELAY_MS);
    let next_delay = (delay * 2).min(MAX_RETRY_DELAY_MS);
    let next_retry_at = (!exhausted).then(|| schedule_next_retry(delay, entry.id));

    let conn = db.conn.lock()?;
    db::with_transaction(&conn, |tx| {
        tx.execute(
            "UPDATE sync_queue SET
                status = ?1, retry_count = ?2, retry_delay_ms = ?3, next_retry_at = ?4,
                last_error = ?5, updated_at = datetime('now')
             WHERE id = ?6",
            params![
                if exhausted { "failed" } else { "pending" },
                new_count,
                next_delay,
                next_retry_at,
                error,
                entry.id
            ],
        )?;
        // Keep the row's current sync state (pending or conflict).
        tx.execute(
            "UPDATE master_rows SET last_error = ?3 WHERE kind = ?1 AND code = ?2",
            params![kind.as_str(), entry.entity_id, error],
        )?;
        Ok(())
    })?;
    Ok(exhausted)
}

/// Hand a claimed entry back to the queue when its outcome could not be
/// recorded, so later writes for the code are not stuck behind it.
fn release_entry(db: &DbState, id: i64) {
    let released = db.conn.lock().map_err(Error::from).and_then(|conn| {
        conn.execute(
            "UPDATE sync_queue SET status = 'pending', updated_at = datetime('now')
             WHERE id = ?1 AND status = 'in_progress'",
            params![id],
        )
        .map_err(Error::from)
    });
    match released {
        Ok(_) => warn!(queue_id = id, "outbox entry released after a store error"),
        Err(e) => warn!(queue_id = id, "could not release outbox entry: {e}"),
    }
}

/// Send one claimed entry to the remote API.
async fn push_entry<A: MasterApi + ?Sized>(api: &A, entry: &QueueEntry) -> Result<MasterKind> {
    let kind = MasterKind::from_queue_entity_type(&entry.entity_type).ok_or_else(|| {
        Error::validation(format!("unknown outbox entity type {}", entry.entity_type))
    })?;
    let op = QueueOp::parse(&entry.operation).ok_or_else(|| {
        Error::validation(format!("unknown outbox operation {}", entry.operation))
    })?;
    let write: QueuedWrite = serde_json::from_str(&entry.payload)?;
    let fields = write.row.to_remote_fields();
    match op {
        QueueOp::Insert => {
            api.create(kind, &fields, &write.modified_by).await?;
        }
        QueueOp::Update => {
            api.update(kind, &write.row.code, &fields, &write.modified_by)
                .await?;
        }
    }
    Ok(kind)
}

/// Push a claimed entry and record the outcome. Returns the push error, if
/// any, after it has been persisted on the entry.
async fn process_entry<A: MasterApi + ?Sized>(
    db: &DbState,
    api: &A,
    entry: &QueueEntry,
) -> Result<()> {
    let kind = MasterKind::from_queue_entity_type(&entry.entity_type);
    match push_entry(api, entry).await {
        Ok(kind) => {
            if let Err(e) = mark_entry_synced(db, entry, kind) {
                release_entry(db, entry.id);
                return Err(e);
            }
            info!(queue_id = entry.id, kind = kind.as_str(), code = %entry.entity_id, "master write synced");
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            match kind {
                Some(kind) => {
                    let exhausted = match mark_entry_failed(db, entry, kind, &message) {
                        Ok(exhausted) => exhausted,
                        Err(store_err) => {
                            release_entry(db, entry.id);
                            return Err(store_err);
                        }
                    };
                    if exhausted {
                        warn!(queue_id = entry.id, code = %entry.entity_id, error = %message, "master write failed permanently");
                    } else {
                        warn!(queue_id = entry.id, code = %entry.entity_id, error = %message, "master write deferred");
                    }
                }
                None => {
                    let conn = db.conn.lock()?;
                    conn.execute(
                        "UPDATE sync_queue SET status = 'failed', last_error = ?1,
                                updated_at = datetime('now')
                         WHERE id = ?2",
                        params![message, entry.id],
                    )?;
                }
            }
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Background cycle
// ---------------------------------------------------------------------------

/// Drain due outbox entries once.
pub async fn run_sync_cycle<A: MasterApi + ?Sized>(db: &DbState, api: &A) -> Result<SyncCycleReport> {
    let mut report = SyncCycleReport::default();

    for due in due_entries(db)? {
        let waiting = {
            let conn = db.conn.lock()?;
            has_earlier_outstanding(&conn, &due.entity_type, &due.entity_id, due.id)?
        };
        if waiting {
            debug!(queue_id = due.id, code = %due.entity_id, "outbox entry waits on an earlier one");
            report.skipped += 1;
            continue;
        }
        let Some(entry) = claim_entry(db, due.id)? else {
            continue;
        };
        match process_entry(db, api, &entry).await {
            Ok(()) => report.synced += 1,
            Err(Error::Store(e)) => return Err(Error::Store(e)),
            Err(Error::Lock) => return Err(Error::Lock),
            Err(_) => report.failed += 1,
        }
    }
    Ok(report)
}

/// Entries left `in_progress` by a previous process go back to `pending`.
pub fn requeue_interrupted(db: &DbState) -> Result<usize> {
    let conn = db.conn.lock()?;
    let requeued = conn.execute(
        "UPDATE sync_queue SET status = 'pending', updated_at = datetime('now')
         WHERE status = 'in_progress'",
        [],
    )?;
    if requeued > 0 {
        info!(requeued, "requeued interrupted outbox entries");
    }
    Ok(requeued)
}

/// Give exhausted entries a fresh set of retries.
pub fn retry_failed(db: &DbState) -> Result<usize> {
    let conn = db.conn.lock()?;
    let reset = conn.execute(
        "UPDATE sync_queue SET status = 'pending', retry_count = 0, retry_delay_ms = ?1,
                next_retry_at = NULL, updated_at = datetime('now')
         WHERE status = 'failed'",
        params![DEFAULT_RETRY_DELAY_MS],
    )?;
    info!(reset, "failed outbox entries reset for retry");
    Ok(reset)
}

pub fn get_sync_status(db: &DbState, sync_state: &SyncState) -> Result<SyncStatus> {
    let conn = db.conn.lock()?;
    let mut counts: HashMap<String, i64> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM sync_queue
             WHERE entity_type LIKE 'master:%' GROUP BY status",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }
    }
    let conflicts: i64 = conn.query_row(
        "SELECT COUNT(*) FROM master_rows WHERE sync_state = 'conflict'",
        [],
        |r| r.get(0),
    )?;
    let count = |status: &str| counts.get(status).copied().unwrap_or(0);

    Ok(SyncStatus {
        pending: count("pending"),
        in_progress: count("in_progress"),
        failed: count("failed"),
        synced: count("synced"),
        conflicts,
        is_running: sync_state.is_running.load(Ordering::SeqCst),
        last_sync: sync_state.last_sync.lock().ok().and_then(|g| g.clone()),
    })
}

/// Run [`run_sync_cycle`] every `interval_secs` until `cancel` fires.
pub fn start_sync_loop<A: MasterApi + 'static>(
    db: Arc<DbState>,
    api: Arc<A>,
    sync_state: Arc<SyncState>,
    interval_secs: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    sync_state.is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!("Sync loop started (interval: {interval_secs}s)");
        if let Err(e) = requeue_interrupted(&db) {
            warn!("Could not requeue interrupted outbox entries: {e}");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
            }

            match run_sync_cycle(&db, api.as_ref()).await {
                Ok(report) => {
                    if report.synced > 0 || report.failed > 0 {
                        info!(
                            synced = report.synced,
                            failed = report.failed,
                            skipped = report.skipped,
                            "Sync cycle complete"
                        );
                    }
                    sync_state.touch();
                }
                Err(e) => warn!("Sync cycle failed: {e}"),
            }
        }

        sync_state.is_running.store(false, Ordering::SeqCst);
        info!("Sync loop stopped");
    })
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

fn deferred(kind: MasterKind, code: &str, verb: &str, detail: &str) -> RemoteStatus {
    RemoteStatus::Deferred {
        warning: format!(
            "{} {code} {verb} locally but failed to sync with server; it will retry later ({detail})",
            kind.entity()
        ),
    }
}

/// Local-first writer and refresher for master data.
pub struct MasterSync<A: MasterApi> {
    db: Arc<DbState>,
    api: Arc<A>,
    config: SyncConfig,
    session: Session,
}

impl<A: MasterApi> MasterSync<A> {
    pub fn new(db: Arc<DbState>, api: Arc<A>, config: SyncConfig, session: Session) -> Self {
        Self {
            db,
            api,
            config,
            session,
        }
    }

    /// Create locally, queue the remote insert, then try to push it.
    pub async fn create(&self, kind: MasterKind, draft: &MasterDraft) -> Result<WriteOutcome> {
        let (row, entry_id) = {
            let conn = self.db.conn.lock()?;
            db::with_transaction(&conn, |tx| {
                let row = master::insert_draft(tx, kind, draft)?;
                let id = enqueue_write(
                    tx,
                    QueueOp::Insert,
                    &row,
                    &self.session.user_id,
                    self.config.max_retries,
                )?;
                Ok((row, id))
            })?
        };
        info!(kind = kind.as_str(), code = %row.code, "master row created locally");
        self.push_now(kind, row, entry_id, "created").await
    }

    /// Update locally by code, queue the remote update, then try to push it.
    pub async fn update(
        &self,
        kind: MasterKind,
        code: &str,
        update: &MasterUpdate,
    ) -> Result<WriteOutcome> {
        let code = code.trim();
        let (row, entry_id) = {
            let conn = self.db.conn.lock()?;
            db::with_transaction(&conn, |tx| {
                let row = master::apply_update(tx, kind, code, update)?;
                let id = enqueue_write(
                    tx,
                    QueueOp::Update,
                    &row,
                    &self.session.user_id,
                    self.config.max_retries,
                )?;
                Ok((row, id))
            })?
        };
        info!(kind = kind.as_str(), code = %row.code, "master row updated locally");
        self.push_now(kind, row, entry_id, "updated").await
    }

    async fn push_now(
        &self,
        kind: MasterKind,
        row: MasterRow,
        entry_id: i64,
        verb: &str,
    ) -> Result<WriteOutcome> {
        // An earlier entry for this code still in the queue must go first.
        let earlier = {
            let conn = self.db.conn.lock()?;
            has_earlier_outstanding(&conn, &kind.queue_entity_type(), &row.code, entry_id)?
        };
        if earlier {
            let remote = deferred(kind, &row.code, verb, "an earlier change is still waiting");
            return Ok(WriteOutcome { row, remote });
        }

        let Some(entry) = claim_entry(&self.db, entry_id)? else {
            let remote = deferred(kind, &row.code, verb, "the background sync is sending it");
            return Ok(WriteOutcome { row, remote });
        };

        let remote = match process_entry(&self.db, self.api.as_ref(), &entry).await {
            Ok(()) => RemoteStatus::Synced,
            Err(e @ (Error::Store(_) | Error::Lock)) => return Err(e),
            Err(e) => deferred(kind, &row.code, verb, &e.to_string()),
        };
        let row = master::get_master_row(&self.db, kind, &row.code)?.unwrap_or(row);
        Ok(WriteOutcome { row, remote })
    }

    async fn fetch_remote_rows(&self, kind: MasterKind) -> Result<Vec<MasterRow>> {
        let values = self.api.fetch_all(kind).await?;
        let mut by_code: HashMap<String, MasterRow> = HashMap::new();
        let mut order = Vec::new();
        for value in &values {
            match MasterRow::from_remote(kind, value) {
                Ok(row) => {
                    if by_code.contains_key(&row.code) {
                        warn!(kind = kind.as_str(), code = %row.code, "duplicate code in remote collection, keeping last");
                    } else {
                        order.push(row.code.clone());
                    }
                    by_code.insert(row.code.clone(), row);
                }
                Err(e) => warn!(kind = kind.as_str(), "skipping remote row: {e}"),
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|code| by_code.remove(&code))
            .collect())
    }

    /// Pull the remote collection and merge it by code, keeping unsynced
    /// local rows. A failed fetch leaves the local table untouched.
    pub async fn refresh_from_remote(&self, kind: MasterKind) -> Result<MergeReport> {
        let rows = self.fetch_remote_rows(kind).await?;
        master::merge_remote(&self.db, kind, &rows)
    }

    /// Hard reset: replace the local table with the remote collection.
    ///
    /// Local rows not yet mirrored to the remote are discarded, and so are
    /// their outbox entries.
    pub async fn replace_from_remote(&self, kind: MasterKind) -> Result<usize> {
        let rows = self.fetch_remote_rows(kind).await?;
        let conn = self.db.conn.lock()?;
        let (removed, inserted, dropped) = db::with_transaction(&conn, |tx| {
            let removed = master::clear_rows(tx, kind)?;
            let inserted = master::insert_rows(tx, kind, &rows)?;
            let dropped = tx.execute(
                "DELETE FROM sync_queue WHERE entity_type = ?1 AND status IN ('pending', 'failed')",
                params![kind.queue_entity_type()],
            )?;
            Ok((removed, inserted, dropped))
        })?;
        warn!(
            kind = kind.as_str(),
            removed,
            inserted,
            dropped_outbox = dropped,
            "master table replaced from remote"
        );
        Ok(inserted)
    }

    /// Run one outbox cycle now and stamp `last_sync`.
    pub async fn force_sync(&self, sync_state: &SyncState) -> Result<SyncCycleReport> {
        let report = run_sync_cycle(&self.db, self.api.as_ref()).await?;
        sync_state.touch();
        info!(synced = report.synced, failed = report.failed, "Force sync complete");
        Ok(report)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::collections::BTreeMap;

    /// In-memory stand-in for the remote master API.
    #[derive(Default)]
    struct FakeApi {
        offline: AtomicBool,
        rows: Mutex<BTreeMap<(String, String), Value>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn seed(&self, kind: MasterKind, value: Value) {
            let code = value
                .get(format!("{}Code", kind.field_prefix()))
                .and_then(Value::as_str)
                .unwrap()
                .to_string();
            self.rows
                .lock()
                .unwrap()
                .insert((kind.as_str().to_string(), code), value);
        }

        fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn remote_row(&self, kind: MasterKind, code: &str) -> Option<Value> {
            self.rows
                .lock()
                .unwrap()
                .get(&(kind.as_str().to_string(), code.to_string()))
                .cloned()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn check_online(&self) -> Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(Error::remote("Cannot reach server at http://fake"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MasterApi for FakeApi {
        async fn fetch_all(&self, kind: MasterKind) -> Result<Vec<Value>> {
            self.check_online()?;
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|((k, _), _)| k.as_str() == kind.as_str())
                .map(|(_, v)| v.clone())
                .collect())
        }

        async fn create(
            &self,
            kind: MasterKind,
            fields: &Map<String, Value>,
            _modified_by: &str,
        ) -> Result<Value> {
            self.check_online()?;
            let code = fields[&format!("{}Code", kind.field_prefix())]
                .as_str()
                .unwrap()
                .to_string();
            self.calls
                .lock()
                .unwrap()
                .push(format!("POST {} {code}", kind.entity()));
            let mut rows = self.rows.lock().unwrap();
            let key = (kind.as_str().to_string(), code.clone());
            if rows.contains_key(&key) {
                return Err(Error::remote(format!("HTTP 409: {code} already exists")));
            }
            rows.insert(key, Value::Object(fields.clone()));
            Ok(Value::Object(fields.clone()))
        }

        async fn update(
            &self,
            kind: MasterKind,
            code: &str,
            fields: &Map<String, Value>,
            _modified_by: &str,
        ) -> Result<Option<Value>> {
            self.check_online()?;
            self.calls
                .lock()
                .unwrap()
                .push(format!("PUT {} {code}", kind.entity()));
            let mut rows = self.rows.lock().unwrap();
            let key = (kind.as_str().to_string(), code.to_string());
            if !rows.contains_key(&key) {
                return Err(Error::remote("HTTP 404"));
            }
            rows.insert(key, Value::Object(fields.clone()));
            Ok(None)
        }
    }

    fn setup() -> (Arc<DbState>, Arc<FakeApi>, MasterSync<FakeApi>) {
        let db = Arc::new(DbState::open_in_memory().expect("in-memory db"));
        let api = Arc::new(FakeApi::default());
        let config = SyncConfig::new("http://localhost:9", "C1", "S1").unwrap();
        let sync = MasterSync::new(db.clone(), api.clone(), config, Session::new("admin"));
        (db, api, sync)
    }

    /// Pretend the backoff delay has elapsed.
    fn make_due(db: &DbState) {
        db.conn
            .lock()
            .unwrap()
            .execute("UPDATE sync_queue SET next_retry_at = NULL", [])
            .unwrap();
    }

    fn entry(code: &str, op: &str, status: &str, retries: i64) -> (String, String, String, i64) {
        (code.to_string(), op.to_string(), status.to_string(), retries)
    }

    fn queue_rows(db: &DbState) -> Vec<(String, String, String, i64)> {
        let conn = db.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT entity_id, operation, status, retry_count FROM sync_queue ORDER BY id")
            .unwrap();
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        rows
    }

    #[tokio::test]
    async fn test_online_create_is_synced_immediately() {
        let (db, api, sync) = setup();
        let outcome = sync
            .create(MasterKind::Route, &MasterDraft::new("R-01", "North"))
            .await
            .unwrap();

        assert_eq!(outcome.remote, RemoteStatus::Synced);
        assert_eq!(outcome.row.sync_state, MasterSyncState::Synced);
        assert_eq!(api.calls(), vec!["POST Route R-01"]);
        assert_eq!(
            api.remote_row(MasterKind::Route, "R-01").unwrap()["routeName"],
            json!("North")
        );
        assert_eq!(queue_rows(&db), vec![entry("R-01", "insert", "synced", 0)]);
    }

    #[tokio::test]
    async fn test_create_with_remote_failure_keeps_local_row() {
        let (db, api, sync) = setup();
        api.set_offline(true);

        let outcome = sync
            .create(MasterKind::CustomerCategory, &MasterDraft::new("CAT-01", "Retail"))
            .await
            .unwrap();

        let warning = outcome.warning().expect("deferred warning");
        assert!(warning.contains("it will retry later"), "{warning}");
        let stored = master::get_master_row(&db, MasterKind::CustomerCategory, "CAT-01")
            .unwrap()
            .expect("row kept locally");
        assert_eq!(stored.sync_state, MasterSyncState::Pending);
        assert!(stored.last_error.is_some());
        assert_eq!(
            queue_rows(&db),
            vec![entry("CAT-01", "insert", "pending", 1)]
        );
    }

    #[tokio::test]
    async fn test_deferred_write_is_retried_by_cycle() {
        let (db, api, sync) = setup();
        api.set_offline(true);
        sync.create(MasterKind::Route, &MasterDraft::new("R-01", "North"))
            .await
            .unwrap();

        // Backoff not elapsed yet.
        api.set_offline(false);
        let report = run_sync_cycle(&db, api.as_ref()).await.unwrap();
        assert_eq!(report, SyncCycleReport::default());

        make_due(&db);
        let report = run_sync_cycle(&db, api.as_ref()).await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(api.remote_row(MasterKind::Route, "R-01").is_some());
        let row = master::get_master_row(&db, MasterKind::Route, "R-01")
            .unwrap()
            .unwrap();
        assert_eq!(row.sync_state, MasterSyncState::Synced);
    }

    #[tokio::test]
    async fn test_backoff_doubles_then_gives_up() {
        let db = Arc::new(DbState::open_in_memory().unwrap());
        let api = Arc::new(FakeApi::default());
        let mut config = SyncConfig::new("http://localhost:9", "C1", "S1").unwrap();
        config.max_retries = 2;
        let sync = MasterSync::new(db.clone(), api.clone(), config, Session::new("admin"));
        api.set_offline(true);

        sync.create(MasterKind::Van, &MasterDraft::new("VAN-07", "Van 7"))
            .await
            .unwrap();
        let delay: i64 = db
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT retry_delay_ms FROM sync_queue", [], |r| r.get(0))
            .unwrap();
        assert_eq!(delay, 10_000);

        make_due(&db);
        let report = run_sync_cycle(&db, api.as_ref()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(
            queue_rows(&db),
            vec![entry("VAN-07", "insert", "failed", 2)]
        );
        let status = get_sync_status(&db, &SyncState::new()).unwrap();
        assert_eq!(status.failed, 1);

        api.set_offline(false);
        assert_eq!(retry_failed(&db).unwrap(), 1);
        let report = run_sync_cycle(&db, api.as_ref()).await.unwrap();
        assert_eq!(report.synced, 1);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let at = schedule_next_retry(10 * MAX_RETRY_DELAY_MS, 7);
        let parsed = chrono::DateTime::parse_from_rfc3339(&at).unwrap();
        let ahead = parsed.with_timezone(&Utc) - Utc::now();
        assert!(ahead <= ChronoDuration::milliseconds(MAX_RETRY_DELAY_MS + 750));
        assert_eq!(deterministic_jitter_ms(7), deterministic_jitter_ms(-7));
    }

    #[tokio::test]
    async fn test_update_coalesces_into_pending_insert() {
        let (db, api, sync) = setup();
        api.set_offline(true);
        sync.create(MasterKind::Route, &MasterDraft::new("R-01", "North"))
            .await
            .unwrap();
        let update = MasterUpdate {
            name: Some("North loop".into()),
            ..Default::default()
        };
        let outcome = sync.update(MasterKind::Route, "R-01", &update).await.unwrap();
        assert!(outcome.warning().is_some());
        assert_eq!(queue_rows(&db).len(), 1);

        api.set_offline(false);
        make_due(&db);
        run_sync_cycle(&db, api.as_ref()).await.unwrap();
        assert_eq!(api.calls(), vec!["POST Route R-01"]);
        assert_eq!(
            api.remote_row(MasterKind::Route, "R-01").unwrap()["routeName"],
            json!("North loop")
        );
    }

    #[tokio::test]
    async fn test_update_is_keyed_by_code() {
        let (db, api, sync) = setup();
        sync.create(MasterKind::CustomerCategory, &MasterDraft::new("CAT-01", "Retail"))
            .await
            .unwrap();
        let mut update = MasterUpdate::default();
        update
            .attributes
            .insert("discountPercentage".into(), json!(12.5));
        let outcome = sync
            .update(MasterKind::CustomerCategory, " CAT-01 ", &update)
            .await
            .unwrap();

        assert_eq!(outcome.remote, RemoteStatus::Synced);
        assert_eq!(
            api.calls(),
            vec!["POST CustomerCategory CAT-01", "PUT CustomerCategory CAT-01"]
        );
        let remote = api.remote_row(MasterKind::CustomerCategory, "CAT-01").unwrap();
        assert_eq!(remote["discountPercentage"], json!(12.5));
        assert_eq!(get_sync_status(&db, &SyncState::new()).unwrap().synced, 2);

        let missing = sync.update(MasterKind::CustomerCategory, "NOPE", &update).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failure_holds_back_later_entries_for_same_code() {
        let (db, api, _sync) = setup();
        let row = {
            let conn = db.conn.lock().unwrap();
            let row = master::insert_draft(&conn, MasterKind::Item, &MasterDraft::new("IT-1", "Soap"))
                .unwrap();
            enqueue_write(&conn, QueueOp::Insert, &row, "admin", 5).unwrap();
            // Park the insert so the follow-up edit gets its own entry.
            conn.execute("UPDATE sync_queue SET status = 'in_progress'", [])
                .unwrap();
            enqueue_write(&conn, QueueOp::Update, &row, "admin", 5).unwrap();
            conn.execute("UPDATE sync_queue SET status = 'pending'", [])
                .unwrap();
            row
        };
        assert_eq!(queue_rows(&db).len(), 2);

        api.set_offline(true);
        let report = run_sync_cycle(&db, api.as_ref()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);

        api.set_offline(false);
        make_due(&db);
        let report = run_sync_cycle(&db, api.as_ref()).await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(api.calls(), vec!["POST Item IT-1", "PUT Item IT-1"]);
        assert!(api.remote_row(MasterKind::Item, &row.code).is_some());
    }

    #[tokio::test]
    async fn test_later_entry_waits_while_earlier_one_is_backing_off_or_in_flight() {
        let (db, api, _sync) = setup();
        {
            let conn = db.conn.lock().unwrap();
            let row = master::insert_draft(&conn, MasterKind::Item, &MasterDraft::new("IT-1", "Soap"))
                .unwrap();
            enqueue_write(&conn, QueueOp::Insert, &row, "admin", 5).unwrap();
            conn.execute("UPDATE sync_queue SET status = 'in_progress'", [])
                .unwrap();
            enqueue_write(&conn, QueueOp::Update, &row, "admin", 5).unwrap();
            // Insert still waiting out its backoff, update due now.
            conn.execute(
                "UPDATE sync_queue SET status = 'pending', next_retry_at = ?1
                 WHERE operation = 'insert'",
                params![queue_timestamp(Utc::now() + ChronoDuration::minutes(5))],
            )
            .unwrap();
        }

        let report = run_sync_cycle(&db, api.as_ref()).await.unwrap();
        assert!(api.calls().is_empty());
        assert_eq!(
            report,
            SyncCycleReport {
                synced: 0,
                failed: 0,
                skipped: 1
            }
        );

        db.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE sync_queue SET status = 'in_progress' WHERE operation = 'insert'",
                [],
            )
            .unwrap();
        let report = run_sync_cycle(&db, api.as_ref()).await.unwrap();
        assert!(api.calls().is_empty());
        assert_eq!(report.skipped, 1);

        requeue_interrupted(&db).unwrap();
        make_due(&db);
        let report = run_sync_cycle(&db, api.as_ref()).await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(api.calls(), vec!["POST Item IT-1", "PUT Item IT-1"]);
    }

    #[tokio::test]
    async fn test_entry_is_released_when_sync_result_cannot_be_stored() {
        let (db, api, sync) = setup();
        api.set_offline(true);
        sync.create(MasterKind::Route, &MasterDraft::new("R-01", "North"))
            .await
            .unwrap();
        db.conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER refuse_synced BEFORE UPDATE ON sync_queue
                 WHEN NEW.status = 'synced'
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        api.set_offline(false);
        make_due(&db);
        let err = run_sync_cycle(&db, api.as_ref()).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(queue_rows(&db)[0].2, "pending");
    }

    #[tokio::test]
    async fn test_refresh_merges_and_keeps_unsynced_rows() {
        let (db, api, sync) = setup();
        api.seed(MasterKind::Route, json!({ "routeCode": "R-01", "routeName": "North" }));
        api.seed(MasterKind::Route, json!({ "routeCode": "R-02", "routeName": "South" }));

        api.set_offline(true);
        sync.create(MasterKind::Route, &MasterDraft::new("R-LOCAL", "Not yet sent"))
            .await
            .unwrap();

        api.set_offline(false);
        let report = sync.refresh_from_remote(MasterKind::Route).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.preserved_pending, 1);

        let codes: Vec<String> = master::get_master_rows(&db, MasterKind::Route)
            .unwrap()
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(codes, vec!["R-01", "R-02", "R-LOCAL"]);
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_local_table_untouched() {
        let (db, api, sync) = setup();
        sync.create(MasterKind::Warehouse, &MasterDraft::new("WH-1", "Main"))
            .await
            .unwrap();

        api.set_offline(true);
        let err = sync.refresh_from_remote(MasterKind::Warehouse).await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
        let err = sync.replace_from_remote(MasterKind::Warehouse).await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
        assert_eq!(master::get_master_rows(&db, MasterKind::Warehouse).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_unsynced_row_is_flagged_then_pushed_as_update() {
        let (db, api, sync) = setup();
        api.set_offline(true);
        sync.create(MasterKind::Route, &MasterDraft::new("R-01", "Local name"))
            .await
            .unwrap();
        api.seed(MasterKind::Route, json!({ "routeCode": "R-01", "routeName": "Remote name" }));

        api.set_offline(false);
        let report = sync.refresh_from_remote(MasterKind::Route).await.unwrap();
        assert_eq!(report.conflicts, vec!["R-01".to_string()]);
        let row = master::get_master_row(&db, MasterKind::Route, "R-01")
            .unwrap()
            .unwrap();
        assert_eq!(row.sync_state, MasterSyncState::Conflict);
        assert_eq!(row.name, "Local name");
        assert_eq!(queue_rows(&db)[0].1, "update");
        assert_eq!(get_sync_status(&db, &SyncState::new()).unwrap().conflicts, 1);

        make_due(&db);
        run_sync_cycle(&db, api.as_ref()).await.unwrap();
        assert_eq!(api.calls(), vec!["PUT Route R-01"]);
        let row = master::get_master_row(&db, MasterKind::Route, "R-01")
            .unwrap()
            .unwrap();
        assert_eq!(row.sync_state, MasterSyncState::Synced);
        assert_eq!(
            api.remote_row(MasterKind::Route, "R-01").unwrap()["routeName"],
            json!("Local name")
        );
    }

    #[tokio::test]
    async fn test_replace_from_remote_discards_unsynced_rows() {
        let (db, api, sync) = setup();
        api.seed(MasterKind::Route, json!({ "routeCode": "R-01", "routeName": "North" }));
        api.set_offline(true);
        sync.create(MasterKind::Route, &MasterDraft::new("R-LOCAL", "Not yet sent"))
            .await
            .unwrap();

        api.set_offline(false);
        let inserted = sync.replace_from_remote(MasterKind::Route).await.unwrap();
        assert_eq!(inserted, 1);
        let codes: Vec<String> = master::get_master_rows(&db, MasterKind::Route)
            .unwrap()
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(codes, vec!["R-01"]);
        assert_eq!(get_sync_status(&db, &SyncState::new()).unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_sync_loop_stops_on_cancel() {
        let (db, api, _sync) = setup();
        let state = Arc::new(SyncState::new());
        let cancel = CancellationToken::new();

        let handle = start_sync_loop(db, api, state.clone(), 3600, cancel.clone());
        assert!(state.is_running.load(Ordering::SeqCst));

        cancel.cancel();
        handle.await.unwrap();
        assert!(!state.is_running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_interrupted_entries_are_requeued() {
        let (db, api, sync) = setup();
        api.set_offline(true);
        sync.create(MasterKind::Customer, &MasterDraft::new("CU-1", "Corner shop"))
            .await
            .unwrap();
        db.conn
            .lock()
            .unwrap()
            .execute("UPDATE sync_queue SET status = 'in_progress'", [])
            .unwrap();

        assert_eq!(requeue_interrupted(&db).unwrap(), 1);
        assert_eq!(queue_rows(&db)[0].2, "pending");
    }
}

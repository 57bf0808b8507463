//! Local master-data rows (routes, customer categories, warehouses, vans,
//! items, customers).
//!
//! Every master type is keyed by its business `code`, both in the local
//! `master_rows` table and in the remote API. Codes are immutable once a row
//! exists; `MasterUpdate` has no way to change one.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::data_helpers::{require_text, value_bool, value_str};
use crate::db::{self, DbState};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterKind {
    Route,
    CustomerCategory,
    Warehouse,
    Van,
    Item,
    Customer,
}

impl MasterKind {
    pub const ALL: [MasterKind; 6] = [
        MasterKind::Route,
        MasterKind::CustomerCategory,
        MasterKind::Warehouse,
        MasterKind::Van,
        MasterKind::Item,
        MasterKind::Customer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MasterKind::Route => "route",
            MasterKind::CustomerCategory => "customer_category",
            MasterKind::Warehouse => "warehouse",
            MasterKind::Van => "van",
            MasterKind::Item => "item",
            MasterKind::Customer => "customer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    /// Remote collection name.
    pub fn entity(&self) -> &'static str {
        match self {
            MasterKind::Route => "Route",
            MasterKind::CustomerCategory => "CustomerCategory",
            MasterKind::Warehouse => "Warehouse",
            MasterKind::Van => "Van",
            MasterKind::Item => "Item",
            MasterKind::Customer => "Customer",
        }
    }

    /// Prefix of the remote code/name fields (`routeCode`, `categoryName`).
    pub fn field_prefix(&self) -> &'static str {
        match self {
            MasterKind::Route => "route",
            MasterKind::CustomerCategory => "category",
            MasterKind::Warehouse => "warehouse",
            MasterKind::Van => "van",
            MasterKind::Item => "item",
            MasterKind::Customer => "customer",
        }
    }

    pub(crate) fn queue_entity_type(&self) -> String {
        format!("master:{}", self.as_str())
    }

    pub(crate) fn from_queue_entity_type(raw: &str) -> Option<Self> {
        raw.strip_prefix("master:").and_then(Self::parse)
    }

    fn code_key(&self) -> String {
        format!("{}Code", self.field_prefix())
    }

    fn name_key(&self) -> String {
        format!("{}Name", self.field_prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterSyncState {
    /// Written locally, not yet confirmed by the remote.
    Pending,
    Synced,
    /// Local unsynced edit collided with a different remote version.
    Conflict,
}

impl MasterSyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasterSyncState::Pending => "pending",
            MasterSyncState::Synced => "synced",
            MasterSyncState::Conflict => "conflict",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "synced" => MasterSyncState::Synced,
            "conflict" => MasterSyncState::Conflict,
            _ => MasterSyncState::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRow {
    pub kind: MasterKind,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    /// Kind-specific fields, e.g. `discountPercentage` for categories.
    pub attributes: Map<String, Value>,
    pub sync_state: MasterSyncState,
    pub last_error: Option<String>,
    pub updated_at: String,
}

/// Envelope and identity keys that never become row attributes.
const RESERVED_REMOTE_KEYS: &[&str] = &[
    "code",
    "name",
    "description",
    "active",
    "compID",
    "siteID",
    "lastModifiedBy",
    "lastModifiedOn",
    "id",
];

impl MasterRow {
    /// Fields sent to the remote API (without the tenant envelope).
    pub fn to_remote_fields(&self) -> Map<String, Value> {
        let mut fields = self.attributes.clone();
        fields.insert(self.kind.code_key(), Value::String(self.code.clone()));
        fields.insert(self.kind.name_key(), Value::String(self.name.clone()));
        fields.insert(
            "description".into(),
            self.description
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        fields.insert("active".into(), Value::Bool(self.active));
        fields
    }

    /// Build a synced row from a remote JSON object.
    pub fn from_remote(kind: MasterKind, remote: &Value) -> Result<MasterRow> {
        let obj = remote
            .as_object()
            .ok_or_else(|| Error::remote(format!("{} row is not an object", kind.entity())))?;
        let code_key = kind.code_key();
        let name_key = kind.name_key();
        let code = value_str(remote, &[code_key.as_str(), "code"]).ok_or_else(|| {
            Error::remote(format!("{} row without a code: {remote}", kind.entity()))
        })?;
        let name = value_str(remote, &[name_key.as_str(), "name"]).unwrap_or_else(|| code.clone());
        let description = value_str(remote, &["description"]);
        let active = value_bool(remote, &["active", "isActive"]).unwrap_or(true);

        let attributes = obj
            .iter()
            .filter(|(k, _)| {
                !RESERVED_REMOTE_KEYS.contains(&k.as_str())
                    && **k != code_key
                    && **k != name_key
                    && k.as_str() != "isActive"
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(MasterRow {
            kind,
            code,
            name,
            description,
            active,
            attributes,
            sync_state: MasterSyncState::Synced,
            last_error: None,
            updated_at: Utc::now().to_rfc3339(),
        })
    }

    /// Business content equality, ignoring sync bookkeeping.
    pub fn same_content(&self, other: &MasterRow) -> bool {
        self.kind == other.kind
            && self.code == other.code
            && self.name == other.name
            && self.description == other.description
            && self.active == other.active
            && self.attributes == other.attributes
    }
}

/// Input for a new master row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterDraft {
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub attributes: Map<String, Value>,
}

impl MasterDraft {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }
}

/// Partial update of a master row, addressed by code. There is no code field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterUpdate {
    pub name: Option<String>,
    /// `Some(None)` clears the description.
    pub description: Option<Option<String>>,
    pub active: Option<bool>,
    /// Merged into the existing attributes; a `null` value removes the key.
    pub attributes: Map<String, Value>,
}

impl MasterUpdate {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.active.is_none()
            && self.attributes.is_empty()
    }
}

/// Outcome of reconciling a remote collection into the local table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    /// Local rows not yet confirmed by the remote that were kept.
    pub preserved_pending: usize,
    /// Codes whose unsynced local edit differs from the remote version.
    pub conflicts: Vec<String>,
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

const ROW_COLUMNS: &str =
    "kind, code, name, description, active, attributes, sync_state, last_error, updated_at";

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<MasterRow> {
    let kind_raw: String = row.get(0)?;
    let attributes_raw: String = row.get(5)?;
    let sync_raw: String = row.get(6)?;
    let kind = MasterKind::parse(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown master kind {kind_raw}").into(),
        )
    })?;
    let attributes = serde_json::from_str::<Map<String, Value>>(&attributes_raw).unwrap_or_else(
        |e| {
            warn!(kind = %kind_raw, error = %e, "master row with unreadable attributes");
            Map::new()
        },
    );
    Ok(MasterRow {
        kind,
        code: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        attributes,
        sync_state: MasterSyncState::parse(&sync_raw),
        last_error: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub(crate) fn load_rows(conn: &Connection, kind: MasterKind) -> Result<Vec<MasterRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ROW_COLUMNS} FROM master_rows WHERE kind = ?1 ORDER BY code"
    ))?;
    let rows = stmt
        .query_map(params![kind.as_str()], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn load_row(conn: &Connection, kind: MasterKind, code: &str) -> Result<Option<MasterRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {ROW_COLUMNS} FROM master_rows WHERE kind = ?1 AND code = ?2"),
            params![kind.as_str(), code],
            map_row,
        )
        .optional()?;
    Ok(row)
}

pub fn get_master_rows(db: &DbState, kind: MasterKind) -> Result<Vec<MasterRow>> {
    let conn = db.conn.lock()?;
    load_rows(&conn, kind)
}

pub fn get_master_row(db: &DbState, kind: MasterKind, code: &str) -> Result<Option<MasterRow>> {
    let conn = db.conn.lock()?;
    load_row(&conn, kind, code.trim())
}

// ---------------------------------------------------------------------------
// Writes (connection-level, composable inside a transaction)
// ---------------------------------------------------------------------------

fn write_row(conn: &Connection, row: &MasterRow) -> Result<()> {
    conn.execute(
        "INSERT INTO master_rows (kind, code, name, description, active, attributes,
                                  sync_state, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            row.kind.as_str(),
            row.code,
            row.name,
            row.description,
            row.active as i64,
            serde_json::to_string(&row.attributes)?,
            row.sync_state.as_str(),
            row.last_error,
            row.updated_at,
        ],
    )?;
    Ok(())
}

fn overwrite_row(conn: &Connection, row: &MasterRow) -> Result<()> {
    conn.execute(
        "UPDATE master_rows SET
            name = ?3, description = ?4, active = ?5, attributes = ?6,
            sync_state = ?7, last_error = ?8, updated_at = ?9
         WHERE kind = ?1 AND code = ?2",
        params![
            row.kind.as_str(),
            row.code,
            row.name,
            row.description,
            row.active as i64,
            serde_json::to_string(&row.attributes)?,
            row.sync_state.as_str(),
            row.last_error,
            row.updated_at,
        ],
    )?;
    Ok(())
}

/// Validate a draft and insert it as a pending row.
pub(crate) fn insert_draft(
    conn: &Connection,
    kind: MasterKind,
    draft: &MasterDraft,
) -> Result<MasterRow> {
    let code = require_text(&draft.code, "code")?;
    let name = require_text(&draft.name, "name")?;

    if load_row(conn, kind, &code)?.is_some() {
        return Err(Error::conflict(format!(
            "{} with code {code} already exists",
            kind.entity()
        )));
    }

    let row = MasterRow {
        kind,
        code,
        name,
        description: draft
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(String::from),
        active: true,
        attributes: draft.attributes.clone(),
        sync_state: MasterSyncState::Pending,
        last_error: None,
        updated_at: Utc::now().to_rfc3339(),
    };
    write_row(conn, &row)?;
    Ok(row)
}

/// Apply a partial update by code; the row becomes pending again.
pub(crate) fn apply_update(
    conn: &Connection,
    kind: MasterKind,
    code: &str,
    update: &MasterUpdate,
) -> Result<MasterRow> {
    if update.is_empty() {
        return Err(Error::validation("Nothing to update"));
    }
    let mut row = load_row(conn, kind, code)?
        .ok_or_else(|| Error::not_found(format!("{} {code}", kind.entity())))?;

    if let Some(name) = &update.name {
        row.name = require_text(name, "name")?;
    }
    if let Some(description) = &update.description {
        row.description = description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(String::from);
    }
    if let Some(active) = update.active {
        row.active = active;
    }
    for (key, value) in &update.attributes {
        if value.is_null() {
            row.attributes.remove(key);
        } else {
            row.attributes.insert(key.clone(), value.clone());
        }
    }
    // A conflict stays flagged until the local version is pushed.
    if row.sync_state == MasterSyncState::Synced {
        row.sync_state = MasterSyncState::Pending;
    }
    row.updated_at = Utc::now().to_rfc3339();
    overwrite_row(conn, &row)?;
    Ok(row)
}

pub(crate) fn set_sync_state(
    conn: &Connection,
    kind: MasterKind,
    code: &str,
    state: MasterSyncState,
    last_error: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE master_rows SET sync_state = ?3, last_error = ?4
         WHERE kind = ?1 AND code = ?2",
        params![kind.as_str(), code, state.as_str(), last_error],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Store-level operations
// ---------------------------------------------------------------------------

/// Insert a row locally only (no outbox entry).
pub fn create_master_row(db: &DbState, kind: MasterKind, draft: &MasterDraft) -> Result<MasterRow> {
    let conn = db.conn.lock()?;
    db::with_transaction(&conn, |tx| insert_draft(tx, kind, draft))
}

/// Update a row locally only (no outbox entry).
pub fn update_master_row(
    db: &DbState,
    kind: MasterKind,
    code: &str,
    update: &MasterUpdate,
) -> Result<MasterRow> {
    let conn = db.conn.lock()?;
    db::with_transaction(&conn, |tx| apply_update(tx, kind, code.trim(), update))
}

pub(crate) fn clear_rows(conn: &Connection, kind: MasterKind) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM master_rows WHERE kind = ?1",
        params![kind.as_str()],
    )?;
    Ok(removed)
}

pub(crate) fn insert_rows(conn: &Connection, kind: MasterKind, rows: &[MasterRow]) -> Result<usize> {
    for row in rows {
        if row.kind != kind {
            return Err(Error::validation(format!(
                "{} row {} passed to {} bulk insert",
                row.kind.entity(),
                row.code,
                kind.entity()
            )));
        }
        write_row(conn, row)?;
    }
    Ok(rows.len())
}

/// Remove every local row of `kind`.
pub fn clear_table(db: &DbState, kind: MasterKind) -> Result<usize> {
    let conn = db.conn.lock()?;
    let removed = clear_rows(&conn, kind)?;
    info!(kind = kind.as_str(), removed, "master table cleared");
    Ok(removed)
}

/// Insert rows as-is in one transaction. Any duplicate aborts the batch.
pub fn bulk_insert(db: &DbState, kind: MasterKind, rows: &[MasterRow]) -> Result<usize> {
    let conn = db.conn.lock()?;
    db::with_transaction(&conn, |tx| insert_rows(tx, kind, rows))
}

/// Reconcile a remote collection into the local table by code.
///
/// Remote rows win over synced local rows; local rows that are still
/// pending are never dropped. A pending local row that differs from its
/// remote counterpart is flagged `conflict` and its queued insert (if any)
/// becomes an update, since the code now exists remotely.
pub(crate) fn merge_remote_rows(
    conn: &Connection,
    kind: MasterKind,
    remote_rows: &[MasterRow],
) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    let mut local: HashMap<String, MasterRow> = load_rows(conn, kind)?
        .into_iter()
        .map(|r| (r.code.clone(), r))
        .collect();

    for remote in remote_rows {
        match local.remove(&remote.code) {
            None => {
                write_row(conn, remote)?;
                report.inserted += 1;
            }
            Some(existing) if existing.sync_state == MasterSyncState::Synced => {
                if !existing.same_content(remote) {
                    overwrite_row(conn, remote)?;
                    report.updated += 1;
                }
            }
            Some(existing) if existing.same_content(remote) => {
                // The remote already has exactly what we queued.
                set_sync_state(conn, kind, &existing.code, MasterSyncState::Synced, None)?;
                conn.execute(
                    "UPDATE sync_queue SET status = 'synced', synced_at = datetime('now'),
                            updated_at = datetime('now')
                     WHERE entity_type = ?1 AND entity_id = ?2
                       AND status IN ('pending', 'failed')",
                    params![kind.queue_entity_type(), existing.code],
                )?;
            }
            Some(existing) => {
                set_sync_state(
                    conn,
                    kind,
                    &existing.code,
                    MasterSyncState::Conflict,
                    Some("remote version differs from unsynced local edit"),
                )?;
                conn.execute(
                    "UPDATE sync_queue SET operation = 'update', updated_at = datetime('now')
                     WHERE entity_type = ?1 AND entity_id = ?2
                       AND operation = 'insert' AND status IN ('pending', 'failed')",
                    params![kind.queue_entity_type(), existing.code],
                )?;
                report.conflicts.push(existing.code);
            }
        }
    }

    for (code, leftover) in local {
        if leftover.sync_state == MasterSyncState::Synced {
            conn.execute(
                "DELETE FROM master_rows WHERE kind = ?1 AND code = ?2",
                params![kind.as_str(), code],
            )?;
            report.removed += 1;
        } else {
            report.preserved_pending += 1;
        }
    }

    report.conflicts.sort();
    Ok(report)
}

/// Store-level entry point for [`merge_remote_rows`].
pub fn merge_remote(db: &DbState, kind: MasterKind, remote_rows: &[MasterRow]) -> Result<MergeReport> {
    let conn = db.conn.lock()?;
    let report = db::with_transaction(&conn, |tx| merge_remote_rows(tx, kind, remote_rows))?;
    info!(
        kind = kind.as_str(),
        inserted = report.inserted,
        updated = report.updated,
        removed = report.removed,
        preserved = report.preserved_pending,
        conflicts = report.conflicts.len(),
        "master rows merged from remote"
    );
    Ok(report)
}

// ===========================================================================
// Tests
// ===========================================================================

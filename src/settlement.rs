//! Settlement: the van returns unsold stock and deposits cash against a
//! closed day. Creating one is the only way a day close becomes `settled`.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::Session;
use crate::data_helpers::{date_at, date_text, decimal_at, money, money_text, require_text};
use crate::day_close::{self, DayCloseStatus};
use crate::db::{self, DbState};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: String,
    pub van_id: String,
    pub day_close_id: String,
    pub warehouse_id: String,
    pub settlement_date: NaiveDate,
    pub stock_returned_value: Decimal,
    pub cash_deposited: Decimal,
    pub notes: Option<String>,
    pub settled_by: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettlementDraft {
    /// Selected day close; must still be `closed`.
    pub day_close_id: Option<String>,
    pub warehouse_id: Option<String>,
    /// Defaults to today.
    pub settlement_date: Option<NaiveDate>,
    pub stock_returned_value: Decimal,
    pub cash_deposited: Decimal,
    pub notes: Option<String>,
}

fn validate(draft: &SettlementDraft) -> Result<(String, String)> {
    let day_close_id = draft
        .day_close_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::validation("Please select a day close"))?;
    let warehouse_id = draft
        .warehouse_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::validation("Please select a warehouse"))?;
    if draft.stock_returned_value < Decimal::ZERO {
        return Err(Error::validation("Stock returned value cannot be negative"));
    }
    if draft.cash_deposited < Decimal::ZERO {
        return Err(Error::validation("Cash deposited cannot be negative"));
    }
    Ok((day_close_id.to_string(), warehouse_id.to_string()))
}

/// Insert the settlement and flip its day close to `settled` in one
/// transaction. Either both rows change or neither does.
pub fn create_settlement(
    db: &DbState,
    session: &Session,
    draft: &SettlementDraft,
) -> Result<Settlement> {
    let van_id = session.require_van()?.to_string();
    let (day_close_id, warehouse_id) = validate(draft)?;
    let settled_by = require_text(&session.user_id, "user")?;

    let conn = db.conn.lock()?;
    let settlement = db::with_transaction(&conn, |tx| {
        let day_close = day_close::load_day_close(tx, &day_close_id)?
            .ok_or_else(|| Error::not_found(format!("Day close {day_close_id}")))?;
        if day_close.van_id != van_id {
            return Err(Error::validation(format!(
                "Day close {day_close_id} belongs to van {}",
                day_close.van_id
            )));
        }
        if day_close.status != DayCloseStatus::Closed {
            return Err(Error::conflict(format!(
                "Day close {day_close_id} is already settled"
            )));
        }

        let settlement = Settlement {
            id: Uuid::new_v4().to_string(),
            van_id: van_id.clone(),
            day_close_id: day_close_id.clone(),
            warehouse_id: warehouse_id.clone(),
            settlement_date: draft.settlement_date.unwrap_or_else(day_close::today),
            stock_returned_value: money(draft.stock_returned_value),
            cash_deposited: money(draft.cash_deposited),
            notes: draft
                .notes
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from),
            settled_by: Some(settled_by.clone()),
            created_at: Utc::now().to_rfc3339(),
        };

        let inserted = tx.execute(
            "INSERT INTO settlements (
                id, van_id, day_close_id, warehouse_id, settlement_date,
                stock_returned_value, cash_deposited, notes, settled_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                settlement.id,
                settlement.van_id,
                settlement.day_close_id,
                settlement.warehouse_id,
                date_text(settlement.settlement_date),
                money_text(settlement.stock_returned_value),
                money_text(settlement.cash_deposited),
                settlement.notes,
                settlement.settled_by,
                settlement.created_at,
            ],
        );
        if let Err(e) = inserted {
            let err = Error::from(e);
            if err.is_unique_violation() {
                return Err(Error::conflict(format!(
                    "Day close {day_close_id} already has a settlement"
                )));
            }
            return Err(err);
        }

        day_close::transition_status(tx, &day_close_id, DayCloseStatus::Settled)?;
        Ok(settlement)
    })?;

    info!(
        settlement_id = %settlement.id,
        day_close_id = %settlement.day_close_id,
        warehouse_id = %settlement.warehouse_id,
        cash_deposited = %settlement.cash_deposited,
        "Day settled"
    );
    Ok(settlement)
}

const SETTLEMENT_COLUMNS: &str = "id, van_id, day_close_id, warehouse_id, settlement_date,
    stock_returned_value, cash_deposited, notes, settled_by, created_at";

fn map_settlement(row: &rusqlite::Row) -> rusqlite::Result<Settlement> {
    Ok(Settlement {
        id: row.get(0)?,
        van_id: row.get(1)?,
        day_close_id: row.get(2)?,
        warehouse_id: row.get(3)?,
        settlement_date: date_at(row, 4)?,
        stock_returned_value: decimal_at(row, 5)?,
        cash_deposited: decimal_at(row, 6)?,
        notes: row.get(7)?,
        settled_by: row.get(8)?,
        created_at: row.get(9)?,
    })
}

/// Settlements of a van, newest first.
pub fn get_settlements(db: &DbState, van_id: &str) -> Result<Vec<Settlement>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SETTLEMENT_COLUMNS} FROM settlements
         WHERE van_id = ?1 ORDER BY settlement_date DESC, created_at DESC"
    ))?;
    let rows = stmt
        .query_map(params![van_id], map_settlement)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn load_for_day_close(conn: &Connection, day_close_id: &str) -> Result<Option<Settlement>> {
    let settlement = conn
        .query_row(
            &format!("SELECT {SETTLEMENT_COLUMNS} FROM settlements WHERE day_close_id = ?1"),
            params![day_close_id],
            map_settlement,
        )
        .optional()?;
    Ok(settlement)
}

pub fn get_settlement_for(db: &DbState, day_close_id: &str) -> Result<Option<Settlement>> {
    let conn = db.conn.lock()?;
    load_for_day_close(&conn, day_close_id)
}

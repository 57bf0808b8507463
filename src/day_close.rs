//! Day close: end-of-day aggregation of a van's sales, expense capture, and
//! the `closed` record that a settlement later moves to `settled`.
//!
//! Totals are never entered by hand. Sales and cash come from the van's
//! invoices for the day; `variance = total_cash_collected - total_expenses`
//! and is recomputed whenever the expense list changes, and again from the
//! stored invoices inside the close transaction.

use chrono::{Local, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Session;
use crate::data_helpers::{date_at, date_text, decimal_at, money, money_text};
use crate::db::{self, DbState};
use crate::error::{Error, Result};
use crate::invoices::{load_invoices, PaymentMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayCloseStatus {
    Closed,
    Settled,
}

impl DayCloseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayCloseStatus::Closed => "closed",
            DayCloseStatus::Settled => "settled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "closed" => Some(DayCloseStatus::Closed),
            "settled" => Some(DayCloseStatus::Settled),
            _ => None,
        }
    }

    /// `closed -> settled` is the only legal edge. There is no reopen.
    pub fn can_transition_to(&self, next: DayCloseStatus) -> bool {
        matches!((self, next), (DayCloseStatus::Closed, DayCloseStatus::Settled))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseType {
    Fuel,
    Parking,
    Toll,
    Other,
}

impl ExpenseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpenseType::Fuel => "fuel",
            ExpenseType::Parking => "parking",
            ExpenseType::Toll => "toll",
            ExpenseType::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fuel" => Some(ExpenseType::Fuel),
            "parking" => Some(ExpenseType::Parking),
            "toll" => Some(ExpenseType::Toll),
            "other" => Some(ExpenseType::Other),
            _ => None,
        }
    }
}

/// Sales figures for one van and one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DayCloseTotals {
    pub total_sales: Decimal,
    /// Paid amounts of cash invoices only.
    pub total_cash_collected: Decimal,
    pub invoice_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseDraft {
    pub expense_type: ExpenseType,
    pub amount: Decimal,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: String,
    pub day_close_id: String,
    pub expense_type: ExpenseType,
    pub amount: Decimal,
    pub description: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayClose {
    pub id: String,
    pub van_id: String,
    pub close_date: NaiveDate,
    pub total_sales: Decimal,
    pub total_cash_collected: Decimal,
    pub total_expenses: Decimal,
    pub variance: Decimal,
    pub opening_stock_value: Decimal,
    pub closing_stock_value: Decimal,
    pub status: DayCloseStatus,
    pub notes: Option<String>,
    pub closed_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Editable fields of a stored day close. Financial fields are locked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayClosePatch {
    /// `Some("")` clears the notes.
    pub notes: Option<String>,
}

/// The device-local calendar date.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

fn summarize_conn(conn: &Connection, van_id: &str, date: NaiveDate) -> Result<DayCloseTotals> {
    let invoices = load_invoices(conn, van_id, date, date)?;
    let mut totals = DayCloseTotals {
        invoice_count: invoices.len(),
        ..Default::default()
    };
    for invoice in &invoices {
        totals.total_sales += invoice.total_amount;
        if invoice.payment_mode == PaymentMode::Cash {
            totals.total_cash_collected += invoice.paid_amount;
        }
    }
    totals.total_sales = money(totals.total_sales);
    totals.total_cash_collected = money(totals.total_cash_collected);
    Ok(totals)
}

/// Sum the van's invoices for `date`. No invoices yields zeros.
pub fn summarize_day(db: &DbState, van_id: &str, date: NaiveDate) -> Result<DayCloseTotals> {
    let conn = db.conn.lock()?;
    summarize_conn(&conn, van_id, date)
}

// ---------------------------------------------------------------------------
// Draft (the open state)
// ---------------------------------------------------------------------------

/// An unsaved day close. Nothing is persisted until [`close_day`].
#[derive(Debug, Clone, Serialize)]
pub struct DayCloseDraft {
    van_id: String,
    close_date: NaiveDate,
    totals: DayCloseTotals,
    expenses: Vec<ExpenseDraft>,
    opening_stock_value: Decimal,
    closing_stock_value: Decimal,
    notes: Option<String>,
}

impl DayCloseDraft {
    /// Load the day's totals for the session's van. `date` defaults to today.
    pub fn prepare(db: &DbState, session: &Session, date: Option<NaiveDate>) -> Result<Self> {
        let van_id = session.require_van()?.to_string();
        let close_date = date.unwrap_or_else(today);
        let totals = summarize_day(db, &van_id, close_date)?;
        Ok(Self {
            van_id,
            close_date,
            totals,
            expenses: Vec::new(),
            opening_stock_value: Decimal::ZERO,
            closing_stock_value: Decimal::ZERO,
            notes: None,
        })
    }

    pub fn van_id(&self) -> &str {
        &self.van_id
    }

    pub fn close_date(&self) -> NaiveDate {
        self.close_date
    }

    pub fn totals(&self) -> DayCloseTotals {
        self.totals
    }

    pub fn expenses(&self) -> &[ExpenseDraft] {
        &self.expenses
    }

    /// Append an expense. Rejected amounts leave the list untouched.
    pub fn add_expense(
        &mut self,
        expense_type: ExpenseType,
        amount: Decimal,
        description: impl Into<String>,
    ) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::validation("Expense amount must be greater than zero"));
        }
        self.expenses.push(ExpenseDraft {
            expense_type,
            amount: money(amount),
            description: description.into().trim().to_string(),
        });
        Ok(())
    }

    pub fn remove_expense(&mut self, index: usize) -> Option<ExpenseDraft> {
        (index < self.expenses.len()).then(|| self.expenses.remove(index))
    }

    pub fn total_expenses(&self) -> Decimal {
        money(self.expenses.iter().map(|e| e.amount).sum())
    }

    pub fn variance(&self) -> Decimal {
        money(self.totals.total_cash_collected - self.total_expenses())
    }

    pub fn set_stock_values(&mut self, opening: Decimal, closing: Decimal) -> Result<()> {
        if opening < Decimal::ZERO || closing < Decimal::ZERO {
            return Err(Error::validation("Stock values cannot be negative"));
        }
        self.opening_stock_value = money(opening);
        self.closing_stock_value = money(closing);
        Ok(())
    }

    pub fn set_notes(&mut self, notes: impl Into<String>) {
        let notes = notes.into().trim().to_string();
        self.notes = (!notes.is_empty()).then_some(notes);
    }
}

// ---------------------------------------------------------------------------
// open -> closed
// ---------------------------------------------------------------------------

const DAY_CLOSE_COLUMNS: &str = "id, van_id, close_date, total_sales, total_cash_collected,
    total_expenses, variance, opening_stock_value, closing_stock_value, status, notes,
    closed_by, created_at, updated_at";

fn map_day_close(row: &rusqlite::Row) -> rusqlite::Result<DayClose> {
    let status_raw: String = row.get(9)?;
    let status = DayCloseStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            format!("unknown day close status {status_raw}").into(),
        )
    })?;
    Ok(DayClose {
        id: row.get(0)?,
        van_id: row.get(1)?,
        close_date: date_at(row, 2)?,
        total_sales: decimal_at(row, 3)?,
        total_cash_collected: decimal_at(row, 4)?,
        total_expenses: decimal_at(row, 5)?,
        variance: decimal_at(row, 6)?,
        opening_stock_value: decimal_at(row, 7)?,
        closing_stock_value: decimal_at(row, 8)?,
        status,
        notes: row.get(10)?,
        closed_by: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

pub(crate) fn load_day_close(conn: &Connection, id: &str) -> Result<Option<DayClose>> {
    let day_close = conn
        .query_row(
            &format!("SELECT {DAY_CLOSE_COLUMNS} FROM day_closes WHERE id = ?1"),
            params![id],
            map_day_close,
        )
        .optional()?;
    Ok(day_close)
}

/// Persist the draft as a `closed` day close with its expenses, atomically.
///
/// Sales and cash totals are re-read from the invoices inside the
/// transaction, so the stored figures match the store at commit time.
pub fn close_day(db: &DbState, session: &Session, draft: &DayCloseDraft) -> Result<DayClose> {
    let van_id = session.require_van()?;
    if van_id != draft.van_id {
        return Err(Error::validation(format!(
            "Draft belongs to van {}, selected van is {van_id}",
            draft.van_id
        )));
    }
    if draft.expenses.iter().any(|e| e.amount <= Decimal::ZERO) {
        return Err(Error::validation("Expense amount must be greater than zero"));
    }

    let conn = db.conn.lock()?;
    let day_close = db::with_transaction(&conn, |tx| {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM day_closes WHERE van_id = ?1 AND close_date = ?2",
                params![draft.van_id, date_text(draft.close_date)],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(Error::conflict(format!(
                "Day already closed for van {} on {}",
                draft.van_id, draft.close_date
            )));
        }

        let totals = summarize_conn(tx, &draft.van_id, draft.close_date)?;
        if totals != draft.totals {
            warn!(
                van_id = %draft.van_id,
                draft_sales = %draft.totals.total_sales,
                stored_sales = %totals.total_sales,
                "Invoices changed since the draft was prepared, using stored totals"
            );
        }
        let total_expenses = draft.total_expenses();
        let now = Utc::now().to_rfc3339();
        let day_close = DayClose {
            id: Uuid::new_v4().to_string(),
            van_id: draft.van_id.clone(),
            close_date: draft.close_date,
            total_sales: totals.total_sales,
            total_cash_collected: totals.total_cash_collected,
            total_expenses,
            variance: money(totals.total_cash_collected - total_expenses),
            opening_stock_value: draft.opening_stock_value,
            closing_stock_value: draft.closing_stock_value,
            status: DayCloseStatus::Closed,
            notes: draft.notes.clone(),
            closed_by: Some(session.user_id.clone()),
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        tx.execute(
            "INSERT INTO day_closes (
                id, van_id, close_date, total_sales, total_cash_collected,
                total_expenses, variance, opening_stock_value, closing_stock_value,
                status, notes, closed_by, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                day_close.id,
                day_close.van_id,
                date_text(day_close.close_date),
                money_text(day_close.total_sales),
                money_text(day_close.total_cash_collected),
                money_text(day_close.total_expenses),
                money_text(day_close.variance),
                money_text(day_close.opening_stock_value),
                money_text(day_close.closing_stock_value),
                day_close.status.as_str(),
                day_close.notes,
                day_close.closed_by,
                now,
            ],
        )?;

        for expense in &draft.expenses {
            tx.execute(
                "INSERT INTO day_close_expenses (id, day_close_id, expense_type, amount, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    day_close.id,
                    expense.expense_type.as_str(),
                    money_text(expense.amount),
                    expense.description,
                    now,
                ],
            )?;
        }
        Ok(day_close)
    })?;

    info!(
        day_close_id = %day_close.id,
        van_id = %day_close.van_id,
        close_date = %day_close.close_date,
        expenses = draft.expenses.len(),
        variance = %day_close.variance,
        "Day closed"
    );
    Ok(day_close)
}

// ---------------------------------------------------------------------------
// Reads and the notes-only patch
// ---------------------------------------------------------------------------

/// Day closes of a van, newest first, optionally filtered by status.
pub fn get_day_closes(
    db: &DbState,
    van_id: &str,
    status: Option<DayCloseStatus>,
) -> Result<Vec<DayClose>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {DAY_CLOSE_COLUMNS} FROM day_closes
         WHERE van_id = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY close_date DESC"
    ))?;
    let rows = stmt
        .query_map(params![van_id, status.map(|s| s.as_str())], map_day_close)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_day_close(db: &DbState, id: &str) -> Result<DayClose> {
    let conn = db.conn.lock()?;
    load_day_close(&conn, id)?.ok_or_else(|| Error::not_found(format!("Day close {id}")))
}

pub fn get_expenses(db: &DbState, day_close_id: &str) -> Result<Vec<Expense>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, day_close_id, expense_type, amount, description, created_at
         FROM day_close_expenses WHERE day_close_id = ?1
         ORDER BY created_at, rowid",
    )?;
    let expenses = stmt
        .query_map(params![day_close_id], |row| {
            let type_raw: String = row.get(2)?;
            let expense_type = ExpenseType::parse(&type_raw).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    format!("unknown expense type {type_raw}").into(),
                )
            })?;
            Ok(Expense {
                id: row.get(0)?,
                day_close_id: row.get(1)?,
                expense_type,
                amount: decimal_at(row, 3)?,
                description: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(expenses)
}

/// Change the notes of a day close that has not been settled yet.
pub fn update_day_close(db: &DbState, id: &str, patch: &DayClosePatch) -> Result<DayClose> {
    let Some(notes) = patch.notes.as_deref() else {
        return Err(Error::validation("Nothing to update"));
    };
    let notes = notes.trim();
    let notes = (!notes.is_empty()).then_some(notes);

    let conn = db.conn.lock()?;
    db::with_transaction(&conn, |tx| {
        let current = load_day_close(tx, id)?
            .ok_or_else(|| Error::not_found(format!("Day close {id}")))?;
        if current.status != DayCloseStatus::Closed {
            return Err(Error::conflict("Settled day closes cannot be edited"));
        }
        tx.execute(
            "UPDATE day_closes SET notes = ?1, updated_at = ?2 WHERE id = ?3",
            params![notes, Utc::now().to_rfc3339(), id],
        )?;
        load_day_close(tx, id)?.ok_or_else(|| Error::not_found(format!("Day close {id}")))
    })
}

/// Move a day close along a lifecycle edge inside the caller's transaction.
pub(crate) fn transition_status(
    conn: &Connection,
    id: &str,
    next: DayCloseStatus,
) -> Result<()> {
    let current = load_day_close(conn, id)?
        .ok_or_else(|| Error::not_found(format!("Day close {id}")))?;
    if !current.status.can_transition_to(next) {
        return Err(Error::conflict(format!(
            "Day close {id} is {} and cannot become {}",
            current.status.as_str(),
            next.as_str()
        )));
    }
    conn.execute(
        "UPDATE day_closes SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![
            next.as_str(),
            Utc::now().to_rfc3339(),
            id,
            current.status.as_str()
        ],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

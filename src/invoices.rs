//! Sales invoices issued from a van. The day-close aggregator is the only
//! reader; invoices are written once and never edited here.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::data_helpers::{date_at, date_text, decimal_at, money, money_text, require_text};
use crate::db::DbState;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    Cash,
    Credit,
    Card,
    Cheque,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Cash => "cash",
            PaymentMode::Credit => "credit",
            PaymentMode::Card => "card",
            PaymentMode::Cheque => "cheque",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cash" => Some(PaymentMode::Cash),
            "credit" => Some(PaymentMode::Credit),
            "card" => Some(PaymentMode::Card),
            "cheque" | "check" => Some(PaymentMode::Cheque),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub invoice_number: String,
    pub van_id: String,
    pub customer_code: Option<String>,
    pub invoice_date: NaiveDate,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub payment_mode: PaymentMode,
    pub created_at: String,
}

/// Fields supplied when an invoice is issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    pub invoice_number: String,
    pub van_id: String,
    pub customer_code: Option<String>,
    pub invoice_date: NaiveDate,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub payment_mode: PaymentMode,
}

pub fn record_invoice(db: &DbState, invoice: &NewInvoice) -> Result<Invoice> {
    let invoice_number = require_text(&invoice.invoice_number, "invoice number")?;
    let van_id = require_text(&invoice.van_id, "van")?;
    if invoice.total_amount < Decimal::ZERO || invoice.paid_amount < Decimal::ZERO {
        return Err(Error::validation("Invoice amounts cannot be negative"));
    }
    if invoice.paid_amount > invoice.total_amount {
        return Err(Error::validation("Paid amount exceeds invoice total"));
    }

    let record = Invoice {
        id: Uuid::new_v4().to_string(),
        invoice_number,
        van_id,
        customer_code: invoice
            .customer_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from),
        invoice_date: invoice.invoice_date,
        total_amount: money(invoice.total_amount),
        paid_amount: money(invoice.paid_amount),
        payment_mode: invoice.payment_mode,
        created_at: Utc::now().to_rfc3339(),
    };

    let conn = db.conn.lock()?;
    let inserted = conn.execute(
        "INSERT INTO invoices (id, invoice_number, van_id, customer_code, invoice_date,
                               total_amount, paid_amount, payment_mode, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id,
            record.invoice_number,
            record.van_id,
            record.customer_code,
            date_text(record.invoice_date),
            money_text(record.total_amount),
            money_text(record.paid_amount),
            record.payment_mode.as_str(),
            record.created_at,
        ],
    );
    if let Err(e) = inserted {
        let err = Error::from(e);
        if err.is_unique_violation() {
            return Err(Error::conflict(format!(
                "Invoice {} already exists",
                record.invoice_number
            )));
        }
        return Err(err);
    }

    info!(
        invoice_id = %record.id,
        van_id = %record.van_id,
        total = %record.total_amount,
        mode = record.payment_mode.as_str(),
        "Invoice recorded"
    );
    Ok(record)
}

/// Invoices of a van with `from <= invoice_date <= to`, oldest first.
pub fn get_invoices(db: &DbState, van_id: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<Invoice>> {
    if from > to {
        return Err(Error::validation("Start date is after end date"));
    }
    let conn = db.conn.lock()?;
    load_invoices(&conn, van_id, from, to)
}

pub(crate) fn load_invoices(
    conn: &Connection,
    van_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<Invoice>> {
    let mut stmt = conn.prepare(
        "SELECT id, invoice_number, van_id, customer_code, invoice_date,
                total_amount, paid_amount, payment_mode, created_at
         FROM invoices
         WHERE van_id = ?1 AND invoice_date >= ?2 AND invoice_date <= ?3
         ORDER BY invoice_date, created_at",
    )?;
    let invoices = stmt
        .query_map(params![van_id, date_text(from), date_text(to)], |row| {
            let mode_raw: String = row.get(7)?;
            let payment_mode = PaymentMode::parse(&mode_raw).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    rusqlite::types::Type::Text,
                    format!("unknown payment mode {mode_raw}").into(),
                )
            })?;
            Ok(Invoice {
                id: row.get(0)?,
                invoice_number: row.get(1)?,
                van_id: row.get(2)?,
                customer_code: row.get(3)?,
                invoice_date: date_at(row, 4)?,
                total_amount: decimal_at(row, 5)?,
                paid_amount: decimal_at(row, 6)?,
                payment_mode,
                created_at: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(invoices)
}

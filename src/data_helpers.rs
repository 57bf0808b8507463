//! Small conversions shared by the store modules.
//!
//! Money is kept as `Decimal` in memory and as TEXT in SQLite so that sums
//! never pick up binary floating point drift.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Number of decimal places money is stored with.
pub const MONEY_SCALE: u32 = 3;

pub(crate) fn money(amount: Decimal) -> Decimal {
    amount.round_dp(MONEY_SCALE)
}

/// Render a decimal for a TEXT column, fixed at three places.
pub(crate) fn money_text(amount: Decimal) -> String {
    let mut rounded = money(amount);
    rounded.rescale(MONEY_SCALE);
    rounded.to_string()
}

/// Read a decimal TEXT column. REAL/INTEGER values written by older tooling
/// are accepted too.
pub(crate) fn decimal_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Decimal> {
    use rusqlite::types::{FromSqlError, ValueRef};
    match row.get_ref(idx)? {
        ValueRef::Text(raw) => {
            let text = String::from_utf8_lossy(raw);
            Decimal::from_str(text.trim()).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        }
        ValueRef::Integer(v) => Ok(Decimal::from(v)),
        ValueRef::Real(v) => Decimal::try_from(v).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Real, Box::new(e))
        }),
        ValueRef::Null => Ok(Decimal::ZERO),
        ValueRef::Blob(_) => Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Blob,
            Box::new(FromSqlError::InvalidType),
        )),
    }
}

pub(crate) fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn date_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    let day = raw.get(..10).unwrap_or(raw.as_str());
    NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// First non-empty string found under any of `keys`.
pub(crate) fn value_str(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// First boolean found under any of `keys`; accepts 0/1 and "true"/"false".
pub(crate) fn value_bool(v: &Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        match v.get(*key) {
            Some(Value::Bool(b)) => return Some(*b),
            Some(Value::Number(n)) => return n.as_i64().map(|n| n != 0),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => return Some(true),
                "false" | "0" | "no" => return Some(false),
                _ => {}
            },
            _ => {}
        }
    }
    None
}

pub(crate) fn require_text(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(format!("Missing {field}")));
    }
    Ok(trimmed.to_string())
}

//! Movement model: the accounting record derived 1:1 from an invoice.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use super::invoice::{decimal_column, decode_err};

/// Credit or debit to the company's books.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    /// Credit to the books.
    Income,
    /// Debit to the books.
    Expense,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Income => "income",
            MovementKind::Expense => "expense",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "income" => Some(MovementKind::Income),
            "expense" => Some(MovementKind::Expense),
            _ => None,
        }
    }
}

/// A derived accounting movement. `invoice_id` is unique: at most one
/// movement per invoice, enforced by the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movement {
    pub movement_id: Uuid,
    pub invoice_id: Uuid,
    pub company_id: Uuid,
    pub kind: MovementKind,
    pub amount: Decimal,
    pub description: Option<String>,
    pub movement_date: NaiveDate,
    pub created_utc: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Movement {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        Ok(Movement {
            movement_id: row.try_get("movement_id")?,
            invoice_id: row.try_get("invoice_id")?,
            company_id: row.try_get("company_id")?,
            kind: MovementKind::from_string(&kind).ok_or_else(|| decode_err("kind", &kind))?,
            amount: decimal_column(row, "amount")?,
            description: row.try_get("description")?,
            movement_date: row.try_get("movement_date")?,
            created_utc: row.try_get("created_utc")?,
        })
    }
}

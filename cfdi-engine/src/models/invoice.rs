//! Invoice model: one structured record derived from a raw CFDI document.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::str::FromStr;
use uuid::Uuid;

/// Whether the company issued the invoice or received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Issued,
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Issued => "issued",
            Direction::Received => "received",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "issued" => Some(Direction::Issued),
            "received" => Some(Direction::Received),
            _ => None,
        }
    }
}

/// CFDI voucher type. The authority assigns a single-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeCode {
    /// Income-type voucher (`I`).
    Income,
    /// Expense-type voucher (`E`, credit note).
    Expense,
    /// Payment complement (`P`). Excluded from movement generation by
    /// default.
    Payment,
}

impl TypeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeCode::Income => "income",
            TypeCode::Expense => "expense",
            TypeCode::Payment => "payment",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "income" => Some(TypeCode::Income),
            "expense" => Some(TypeCode::Expense),
            "payment" => Some(TypeCode::Payment),
            _ => None,
        }
    }

    /// Parse the authority's single-letter voucher code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(TypeCode::Income),
            "E" => Some(TypeCode::Expense),
            "P" => Some(TypeCode::Payment),
            _ => None,
        }
    }
}

/// A structured invoice record. `(company_id, cfdi_uuid)` is unique;
/// `cfdi_uuid` and `direction` are immutable once set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub company_id: Uuid,
    /// Fiscal folio assigned by the authority.
    pub cfdi_uuid: Uuid,
    pub direction: Direction,
    pub type_code: TypeCode,
    pub issue_date: NaiveDateTime,
    pub subtotal: Decimal,
    pub total: Decimal,
    pub issuer_rfc: String,
    pub issuer_name: Option<String>,
    pub receiver_rfc: String,
    pub receiver_name: Option<String>,
    /// PUE (single) or PPD (deferred/installments).
    pub payment_method: Option<String>,
    pub payment_form: Option<String>,
    pub currency: Option<String>,
    pub description: Option<String>,
    /// Key of the raw document in the document store.
    pub document_ref: String,
    pub created_utc: DateTime<Utc>,
}

// SQLite has no decimal or enum column types; amounts are stored as TEXT
// and decoded here.
impl<'r> FromRow<'r, SqliteRow> for Invoice {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let direction: String = row.try_get("direction")?;
        let type_code: String = row.try_get("type_code")?;
        Ok(Invoice {
            invoice_id: row.try_get("invoice_id")?,
            company_id: row.try_get("company_id")?,
            cfdi_uuid: row.try_get("cfdi_uuid")?,
            direction: Direction::from_string(&direction)
                .ok_or_else(|| decode_err("direction", &direction))?,
            type_code: TypeCode::from_string(&type_code)
                .ok_or_else(|| decode_err("type_code", &type_code))?,
            issue_date: row.try_get("issue_date")?,
            subtotal: decimal_column(row, "subtotal")?,
            total: decimal_column(row, "total")?,
            issuer_rfc: row.try_get("issuer_rfc")?,
            issuer_name: row.try_get("issuer_name")?,
            receiver_rfc: row.try_get("receiver_rfc")?,
            receiver_name: row.try_get("receiver_name")?,
            payment_method: row.try_get("payment_method")?,
            payment_form: row.try_get("payment_form")?,
            currency: row.try_get("currency")?,
            description: row.try_get("description")?,
            document_ref: row.try_get("document_ref")?,
            created_utc: row.try_get("created_utc")?,
        })
    }
}

pub(crate) fn decimal_column(row: &SqliteRow, column: &str) -> Result<Decimal, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    Decimal::from_str(&raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

pub(crate) fn decode_err(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("unrecognized value '{value}'").into(),
    }
}

//! Company model: one registered taxpayer whose invoices are synchronized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A registered company, identified by its tax identifier (RFC).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Company {
    pub company_id: Uuid,
    pub rfc: String,
    pub name: String,
    pub created_utc: DateTime<Utc>,
}

//! Structured store: the only writer of invoices and movements.
//!
//! Deduplication rests on the storage-level uniqueness constraints
//! (`UNIQUE (company_id, cfdi_uuid)`, `movements.invoice_id UNIQUE`), not
//! on in-process locks, so ingestion stays correct when replayed or when
//! a rebuild runs concurrently with a live sync.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use sync_core::SyncError;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::classify::{classify, ClassificationPolicy};
use crate::models::{Company, Direction, Invoice, Movement};
use crate::parser::ParsedInvoice;

/// Result of one `ingest` call. `AlreadyExisted` covers both a prior
/// ingestion and a concurrent one that won the insert race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    AlreadyExisted,
}

/// Anomalies reported by `verify_integrity`. Detection only; nothing is
/// mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// Movement-eligible invoice without a movement.
    MissingMovement { cfdi_uuid: Uuid },
    /// More than one invoice row for one fiscal folio.
    DuplicateIdentifier { cfdi_uuid: Uuid, count: i64 },
    /// Movement whose invoice row is gone.
    OrphanedMovement { movement_id: Uuid },
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection pool.
    ///
    /// SQLite is single-writer; one pooled connection serializes write
    /// transactions without busy-snapshot errors.
    #[instrument(skip(database_url))]
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| SyncError::Config(anyhow::anyhow!("bad database URL: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| SyncError::Persistence(anyhow::anyhow!("failed to connect: {}", e)))?;

        info!(max_connections, "Database connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<(), SyncError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Persistence(anyhow::anyhow!("health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), SyncError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SyncError::Persistence(anyhow::anyhow!("migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Companies
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn create_company(&self, rfc: &str, name: &str) -> Result<Company, SyncError> {
        let company = Company {
            company_id: Uuid::new_v4(),
            rfc: rfc.trim().to_uppercase(),
            name: name.trim().to_string(),
            created_utc: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO companies (company_id, rfc, name, created_utc) VALUES (?, ?, ?, ?)",
        )
        .bind(company.company_id)
        .bind(&company.rfc)
        .bind(&company.name)
        .bind(company.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                SyncError::DataIntegrity(anyhow::anyhow!("company {} already registered", rfc))
            }
            _ => SyncError::Persistence(anyhow::anyhow!("failed to create company: {}", e)),
        })?;

        info!(company_id = %company.company_id, rfc = %company.rfc, "Company created");
        Ok(company)
    }

    pub async fn get_company_by_rfc(&self, rfc: &str) -> Result<Option<Company>, SyncError> {
        let company = sqlx::query_as::<_, Company>(
            "SELECT company_id, rfc, name, created_utc FROM companies WHERE rfc = ?",
        )
        .bind(rfc.trim().to_uppercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(company)
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Upsert one parsed invoice and its derived movement inside a single
    /// transaction.
    ///
    /// Identity fields (`cfdi_uuid`, `direction`) are compared on
    /// re-ingestion; a mismatch is a `DataIntegrity` error, never an
    /// update. An invoice that exists without its movement (interrupted
    /// earlier run) gets the missing movement created here, so replaying
    /// a batch closes that gap.
    #[instrument(skip(self, company, parsed, policy), fields(company = %company.rfc, cfdi_uuid = %parsed.cfdi_uuid))]
    pub async fn ingest(
        &self,
        company: &Company,
        parsed: &ParsedInvoice,
        direction: Direction,
        document_ref: &str,
        policy: ClassificationPolicy,
    ) -> Result<IngestOutcome, SyncError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT invoice_id, direction FROM invoices WHERE company_id = ? AND cfdi_uuid = ?",
        )
        .bind(company.company_id)
        .bind(parsed.cfdi_uuid)
        .fetch_optional(&mut *tx)
        .await?;

        let (invoice_id, outcome) = match existing {
            Some(row) => (check_identity(&row, parsed.cfdi_uuid, direction)?, IngestOutcome::AlreadyExisted),
            None => {
                let invoice_id = Uuid::new_v4();
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO invoices (
                        invoice_id, company_id, cfdi_uuid, direction, type_code,
                        issue_date, subtotal, total,
                        issuer_rfc, issuer_name, receiver_rfc, receiver_name,
                        payment_method, payment_form, currency, description,
                        document_ref, created_utc
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (company_id, cfdi_uuid) DO NOTHING
                    "#,
                )
                .bind(invoice_id)
                .bind(company.company_id)
                .bind(parsed.cfdi_uuid)
                .bind(direction.as_str())
                .bind(parsed.type_code.as_str())
                .bind(parsed.issue_date)
                .bind(parsed.subtotal.to_string())
                .bind(parsed.total.to_string())
                .bind(&parsed.issuer_rfc)
                .bind(&parsed.issuer_name)
                .bind(&parsed.receiver_rfc)
                .bind(&parsed.receiver_name)
                .bind(&parsed.payment_method)
                .bind(&parsed.payment_form)
                .bind(&parsed.currency)
                .bind(&parsed.description)
                .bind(document_ref)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if inserted == 0 {
                    // A concurrent ingest for the same identifier won the
                    // race; fall back to the already-existed path.
                    let row = sqlx::query(
                        "SELECT invoice_id, direction FROM invoices WHERE company_id = ? AND cfdi_uuid = ?",
                    )
                    .bind(company.company_id)
                    .bind(parsed.cfdi_uuid)
                    .fetch_one(&mut *tx)
                    .await?;
                    (check_identity(&row, parsed.cfdi_uuid, direction)?, IngestOutcome::AlreadyExisted)
                } else {
                    (invoice_id, IngestOutcome::Created)
                }
            }
        };

        if let Some(kind) = classify(
            direction,
            parsed.type_code,
            parsed.payment_method.as_deref(),
            policy,
        ) {
            let counterparty = match direction {
                Direction::Issued => &parsed.receiver_rfc,
                Direction::Received => &parsed.issuer_rfc,
            };
            sqlx::query(
                r#"
                INSERT INTO movements (
                    movement_id, invoice_id, company_id, kind, amount,
                    description, movement_date, created_utc
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (invoice_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(invoice_id)
            .bind(company.company_id)
            .bind(kind.as_str())
            .bind(parsed.total.to_string())
            .bind(format!("Factura {}", counterparty))
            .bind(parsed.issue_date.date())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if outcome == IngestOutcome::Created {
            info!(invoice_id = %invoice_id, "Invoice ingested");
        }

        Ok(outcome)
    }

    /// Re-parse recovery: create the movement for every movement-eligible
    /// invoice that lost its own (interrupted run, historical bug).
    /// Returns the number created.
    #[instrument(skip(self, company, policy), fields(company = %company.rfc))]
    pub async fn create_missing_movements(
        &self,
        company: &Company,
        policy: ClassificationPolicy,
    ) -> Result<u64, SyncError> {
        let orphans = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT i.* FROM invoices i
            LEFT JOIN movements m ON m.invoice_id = i.invoice_id
            WHERE i.company_id = ? AND m.movement_id IS NULL
            "#,
        )
        .bind(company.company_id)
        .fetch_all(&self.pool)
        .await?;

        let mut created = 0u64;
        for invoice in orphans {
            let Some(kind) = classify(
                invoice.direction,
                invoice.type_code,
                invoice.payment_method.as_deref(),
                policy,
            ) else {
                continue;
            };
            let counterparty = match invoice.direction {
                Direction::Issued => &invoice.receiver_rfc,
                Direction::Received => &invoice.issuer_rfc,
            };
            let inserted = sqlx::query(
                r#"
                INSERT INTO movements (
                    movement_id, invoice_id, company_id, kind, amount,
                    description, movement_date, created_utc
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (invoice_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(invoice.invoice_id)
            .bind(company.company_id)
            .bind(kind.as_str())
            .bind(invoice.total.to_string())
            .bind(format!("Factura {}", counterparty))
            .bind(invoice.issue_date.date())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();
            created += inserted;
        }

        if created > 0 {
            info!(created, "Missing movements repaired");
        }
        Ok(created)
    }

    /// Update non-identity fields of an existing invoice from a fresh
    /// parse of its document. `cfdi_uuid` and `direction` are immutable;
    /// movements are not touched. Returns whether a row was updated.
    #[instrument(skip(self, company, parsed), fields(company = %company.rfc, cfdi_uuid = %parsed.cfdi_uuid))]
    pub async fn refresh_invoice_fields(
        &self,
        company: &Company,
        parsed: &ParsedInvoice,
    ) -> Result<bool, SyncError> {
        let updated = sqlx::query(
            r#"
            UPDATE invoices SET
                type_code = ?, issue_date = ?, subtotal = ?, total = ?,
                issuer_name = ?, receiver_name = ?,
                payment_method = ?, payment_form = ?, currency = ?, description = ?
            WHERE company_id = ? AND cfdi_uuid = ?
            "#,
        )
        .bind(parsed.type_code.as_str())
        .bind(parsed.issue_date)
        .bind(parsed.subtotal.to_string())
        .bind(parsed.total.to_string())
        .bind(&parsed.issuer_name)
        .bind(&parsed.receiver_name)
        .bind(&parsed.payment_method)
        .bind(&parsed.payment_form)
        .bind(&parsed.currency)
        .bind(&parsed.description)
        .bind(company.company_id)
        .bind(parsed.cfdi_uuid)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    // -------------------------------------------------------------------------
    // Integrity & queries
    // -------------------------------------------------------------------------

    /// Detect anomalies without mutating state: missing movements,
    /// duplicate identifiers, orphaned movements.
    #[instrument(skip(self, company, policy), fields(company = %company.rfc))]
    pub async fn verify_integrity(
        &self,
        company: &Company,
        policy: ClassificationPolicy,
    ) -> Result<Vec<Anomaly>, SyncError> {
        let mut anomalies = Vec::new();

        let without_movement = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT i.* FROM invoices i
            LEFT JOIN movements m ON m.invoice_id = i.invoice_id
            WHERE i.company_id = ? AND m.movement_id IS NULL
            "#,
        )
        .bind(company.company_id)
        .fetch_all(&self.pool)
        .await?;

        for invoice in without_movement {
            if classify(
                invoice.direction,
                invoice.type_code,
                invoice.payment_method.as_deref(),
                policy,
            )
            .is_some()
            {
                anomalies.push(Anomaly::MissingMovement {
                    cfdi_uuid: invoice.cfdi_uuid,
                });
            }
        }

        // Structurally impossible under the unique index; checked anyway
        // so a damaged database is reported rather than trusted.
        let duplicates = sqlx::query(
            r#"
            SELECT cfdi_uuid, COUNT(*) AS n FROM invoices
            WHERE company_id = ?
            GROUP BY cfdi_uuid HAVING COUNT(*) > 1
            "#,
        )
        .bind(company.company_id)
        .fetch_all(&self.pool)
        .await?;
        for row in duplicates {
            anomalies.push(Anomaly::DuplicateIdentifier {
                cfdi_uuid: row.try_get("cfdi_uuid")?,
                count: row.try_get("n")?,
            });
        }

        let orphans = sqlx::query(
            r#"
            SELECT m.movement_id FROM movements m
            LEFT JOIN invoices i ON i.invoice_id = m.invoice_id
            WHERE m.company_id = ? AND i.invoice_id IS NULL
            "#,
        )
        .bind(company.company_id)
        .fetch_all(&self.pool)
        .await?;
        for row in orphans {
            anomalies.push(Anomaly::OrphanedMovement {
                movement_id: row.try_get("movement_id")?,
            });
        }

        if !anomalies.is_empty() {
            warn!(count = anomalies.len(), "Integrity anomalies detected");
        }
        Ok(anomalies)
    }

    pub async fn list_invoices(&self, company: &Company) -> Result<Vec<Invoice>, SyncError> {
        let invoices = sqlx::query_as::<_, Invoice>(
            "SELECT * FROM invoices WHERE company_id = ? ORDER BY issue_date, cfdi_uuid",
        )
        .bind(company.company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    pub async fn list_movements(&self, company: &Company) -> Result<Vec<Movement>, SyncError> {
        let movements = sqlx::query_as::<_, Movement>(
            "SELECT * FROM movements WHERE company_id = ? ORDER BY movement_date, movement_id",
        )
        .bind(company.company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(movements)
    }

    pub async fn get_invoice(
        &self,
        company: &Company,
        cfdi_uuid: Uuid,
    ) -> Result<Option<Invoice>, SyncError> {
        let invoice = sqlx::query_as::<_, Invoice>(
            "SELECT * FROM invoices WHERE company_id = ? AND cfdi_uuid = ?",
        )
        .bind(company.company_id)
        .bind(cfdi_uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    /// Latest issue date among a company's invoices; the natural default
    /// start for the next synchronization.
    pub async fn last_invoice_date(
        &self,
        company: &Company,
    ) -> Result<Option<chrono::NaiveDateTime>, SyncError> {
        let row = sqlx::query("SELECT MAX(issue_date) AS latest FROM invoices WHERE company_id = ?")
            .bind(company.company_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("latest")?)
    }
}

/// Re-ingestion must present the same identity; a direction flip means a
/// forged or corrupted document.
fn check_identity(
    row: &sqlx::sqlite::SqliteRow,
    cfdi_uuid: Uuid,
    direction: Direction,
) -> Result<Uuid, SyncError> {
    let stored: String = row.try_get("direction")?;
    if Direction::from_string(&stored) != Some(direction) {
        return Err(SyncError::DataIntegrity(anyhow::anyhow!(
            "invoice {} stored as '{}', re-ingested as '{}'",
            cfdi_uuid,
            stored,
            direction.as_str()
        )));
    }
    Ok(row.try_get("invoice_id")?)
}

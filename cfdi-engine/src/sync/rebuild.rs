//! Reconciliation rebuilder: re-derive the structured database from the
//! document store alone.
//!
//! The store is ground truth, so a rebuild against an empty database
//! reproduces exactly the invoices and movements a normal sync produced,
//! and a rebuild against a populated database is a no-op thanks to
//! idempotent ingestion.

use sync_core::SyncError;
use tracing::{info, instrument, warn};

use crate::classify::ClassificationPolicy;
use crate::models::{Company, Direction};
use crate::parser::parse_cfdi;
use crate::services::{Database, IngestOutcome};
use crate::store::DocumentStore;

#[derive(Debug, Default, Clone)]
pub struct RebuildReport {
    pub documents: u64,
    pub ingested: u64,
    pub already_ingested: u64,
    pub malformed: u64,
    pub failed: u64,
}

#[derive(Debug, Default, Clone)]
pub struct RefreshReport {
    pub documents: u64,
    pub updated: u64,
    pub missing_invoice: u64,
    pub malformed: u64,
}

pub struct Rebuilder {
    database: Database,
    store: DocumentStore,
    policy: ClassificationPolicy,
}

impl Rebuilder {
    pub fn new(database: Database, store: DocumentStore, policy: ClassificationPolicy) -> Self {
        Self {
            database,
            store,
            policy,
        }
    }

    /// Replay every stored document for a company through parsing and
    /// ingestion. Malformed documents are counted and skipped; only
    /// storage-layer failures abort the replay.
    #[instrument(skip(self, company), fields(company = %company.rfc))]
    pub async fn rebuild_company(&self, company: &Company) -> Result<RebuildReport, SyncError> {
        let identifiers = self.store.list(&company.rfc).await?;
        let mut report = RebuildReport::default();

        for cfdi_uuid in identifiers {
            report.documents += 1;
            let bytes = self.store.get(&company.rfc, cfdi_uuid).await?;

            let parsed = match parse_cfdi(&bytes) {
                Ok(parsed) => parsed,
                Err(SyncError::MalformedDocument(e)) => {
                    warn!(cfdi_uuid = %cfdi_uuid, error = %e, "Skipping malformed stored document");
                    report.malformed += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if parsed.cfdi_uuid != cfdi_uuid {
                warn!(
                    cfdi_uuid = %cfdi_uuid,
                    parsed_uuid = %parsed.cfdi_uuid,
                    "Stored document carries a different fiscal folio, skipping"
                );
                report.failed += 1;
                continue;
            }

            let direction = derive_direction(&company.rfc, &parsed.issuer_rfc);
            let document_ref = DocumentStore::key(&company.rfc, cfdi_uuid);

            match self
                .database
                .ingest(company, &parsed, direction, &document_ref, self.policy)
                .await
            {
                Ok(IngestOutcome::Created) => report.ingested += 1,
                Ok(IngestOutcome::AlreadyExisted) => report.already_ingested += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(cfdi_uuid = %cfdi_uuid, error = %e, "Replay of document failed, continuing");
                    report.failed += 1;
                }
            }
        }

        info!(
            documents = report.documents,
            ingested = report.ingested,
            already_ingested = report.already_ingested,
            malformed = report.malformed,
            failed = report.failed,
            "Rebuild finished"
        );
        Ok(report)
    }

    /// Re-parse stored documents and refresh the non-identity fields of
    /// their invoices. Fiscal folio and direction are never touched.
    #[instrument(skip(self, company), fields(company = %company.rfc))]
    pub async fn refresh_company(&self, company: &Company) -> Result<RefreshReport, SyncError> {
        let identifiers = self.store.list(&company.rfc).await?;
        let mut report = RefreshReport::default();

        for cfdi_uuid in identifiers {
            report.documents += 1;
            let bytes = self.store.get(&company.rfc, cfdi_uuid).await?;

            let parsed = match parse_cfdi(&bytes) {
                Ok(parsed) => parsed,
                Err(SyncError::MalformedDocument(e)) => {
                    warn!(cfdi_uuid = %cfdi_uuid, error = %e, "Skipping malformed stored document");
                    report.malformed += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if self.database.refresh_invoice_fields(company, &parsed).await? {
                report.updated += 1;
            } else {
                report.missing_invoice += 1;
            }
        }

        info!(
            documents = report.documents,
            updated = report.updated,
            missing_invoice = report.missing_invoice,
            malformed = report.malformed,
            "Refresh finished"
        );
        Ok(report)
    }
}

/// An invoice the company itself issued names the company as issuer;
/// everything else in its store was received.
pub(crate) fn derive_direction(company_rfc: &str, issuer_rfc: &str) -> Direction {
    if issuer_rfc.eq_ignore_ascii_case(company_rfc) {
        Direction::Issued
    } else {
        Direction::Received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_from_issuer_rfc() {
        assert_eq!(
            derive_direction("AAA010101AAA", "AAA010101AAA"),
            Direction::Issued
        );
        assert_eq!(
            derive_direction("AAA010101AAA", "BBB020202BBB"),
            Direction::Received
        );
        assert_eq!(
            derive_direction("AAA010101AAA", "aaa010101aaa"),
            Direction::Issued
        );
    }
}

//! Download orchestrator.
//!
//! Splits a requested date range into authority-sized manifest windows,
//! fetches each manifest with retry, and pipelines document download,
//! storage, parsing, and ingestion across a bounded worker pool. Failure
//! of one window or one document never discards work already completed.

use chrono::{Duration as ChronoDuration, NaiveDate};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use sync_core::{retry_call, RetryConfig, SyncError};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{DirectionFilter, SyncSummary, WindowFailure};
use crate::classify::ClassificationPolicy;
use crate::models::{Company, Direction};
use crate::parser::parse_cfdi;
use crate::sat::{AuthorityClient, CredentialContext, DateWindow};
use crate::services::{Database, IngestOutcome};
use crate::store::DocumentStore;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Widest span the authority accepts for one manifest query, in days.
    pub max_window_days: u32,
    /// Concurrent document pipelines per manifest.
    pub worker_count: usize,
    pub retry: RetryConfig,
    pub policy: ClassificationPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_window_days: 30,
            worker_count: 4,
            retry: RetryConfig::default(),
            policy: ClassificationPolicy::default(),
        }
    }
}

/// Split an inclusive date range into inclusive windows of at most
/// `max_window_days` days. Windows tile the range exactly: no gap, no
/// overlap.
pub fn split_range(start: NaiveDate, end: NaiveDate, max_window_days: u32) -> Vec<DateWindow> {
    let span = ChronoDuration::days(max_window_days.max(1) as i64 - 1);
    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let window_end = (cursor + span).min(end);
        windows.push(DateWindow {
            start: cursor,
            end: window_end,
        });
        cursor = window_end + ChronoDuration::days(1);
    }
    windows
}

enum DocOutcome {
    Ingested { downloaded: bool },
    AlreadyIngested { downloaded: bool },
    Malformed,
    Cancelled,
}

pub struct SyncOrchestrator {
    client: Arc<dyn AuthorityClient>,
    database: Database,
    store: DocumentStore,
    options: SyncOptions,
}

impl SyncOrchestrator {
    pub fn new(
        client: Arc<dyn AuthorityClient>,
        database: Database,
        store: DocumentStore,
        options: SyncOptions,
    ) -> Self {
        Self {
            client,
            database,
            store,
            options,
        }
    }

    /// Synchronize a company's invoices over a date range, covering the
    /// directions the filter selects. Returns the run summary; `Err`
    /// only for fatal conditions (rejected credential, storage failure,
    /// bad arguments).
    #[instrument(skip(self, company, credential, cancel), fields(company = %company.rfc, start = %start, end = %end, filter = ?filter))]
    pub async fn sync_range(
        &self,
        company: &Company,
        credential: &CredentialContext,
        start: NaiveDate,
        end: NaiveDate,
        filter: DirectionFilter,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        if start > end {
            return Err(SyncError::Config(anyhow::anyhow!(
                "range start {} is after end {}",
                start,
                end
            )));
        }

        let directions = filter.directions();
        let windows = split_range(start, end, self.options.max_window_days);
        let mut summary = SyncSummary {
            windows_total: (windows.len() * directions.len()) as u32,
            ..Default::default()
        };

        'directions: for &direction in directions {
            for window in &windows {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    break 'directions;
                }
                if summary.quota_exhausted {
                    break 'directions;
                }

                let manifest = self
                    .with_renewal("fetch_manifest", || {
                        self.client.fetch_manifest(credential, *window, direction)
                    })
                    .await;

                let identifiers = match manifest {
                    Ok(identifiers) => identifiers,
                    Err(SyncError::QuotaExceeded(reason)) => {
                        warn!(window = %window, %reason, "Quota exhausted, abandoning remaining windows");
                        summary.quota_exhausted = true;
                        summary.windows_failed += 1;
                        summary.window_failures.push(WindowFailure {
                            window: *window,
                            direction,
                            reason,
                        });
                        break 'directions;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(window = %window, error = %e, "Window failed, continuing with next");
                        summary.windows_failed += 1;
                        summary.window_failures.push(WindowFailure {
                            window: *window,
                            direction,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };

                summary.discovered += identifiers.len() as u64;
                self.process_manifest(
                    company, credential, *window, direction, identifiers, cancel, &mut summary,
                )
                .await?;
                if !summary.quota_exhausted {
                    summary.windows_completed += 1;
                }
            }
        }

        info!(
            windows_completed = summary.windows_completed,
            windows_failed = summary.windows_failed,
            ingested = summary.ingested,
            already_ingested = summary.already_ingested,
            malformed = summary.malformed,
            failed_documents = summary.failed_documents,
            quota_exhausted = summary.quota_exhausted,
            cancelled = summary.cancelled,
            "Synchronization run finished"
        );
        Ok(summary)
    }

    /// Run the document pipeline for one manifest with bounded
    /// concurrency, folding per-document outcomes into the summary.
    #[allow(clippy::too_many_arguments)]
    async fn process_manifest(
        &self,
        company: &Company,
        credential: &CredentialContext,
        window: DateWindow,
        direction: Direction,
        identifiers: Vec<Uuid>,
        cancel: &CancellationToken,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        let mut results = stream::iter(identifiers)
            .map(|id| self.process_document(company, credential, direction, id, cancel))
            .buffer_unordered(self.options.worker_count.max(1));

        while let Some(result) = results.next().await {
            match result {
                Ok(DocOutcome::Ingested { downloaded }) => {
                    summary.ingested += 1;
                    if downloaded {
                        summary.downloaded += 1;
                    } else {
                        summary.reused_local += 1;
                    }
                }
                Ok(DocOutcome::AlreadyIngested { downloaded }) => {
                    summary.already_ingested += 1;
                    if downloaded {
                        summary.downloaded += 1;
                    } else {
                        summary.reused_local += 1;
                    }
                }
                Ok(DocOutcome::Malformed) => summary.malformed += 1,
                Ok(DocOutcome::Cancelled) => summary.cancelled = true,
                Err(SyncError::QuotaExceeded(reason)) => {
                    warn!(%reason, "Quota exhausted mid-manifest, abandoning remaining documents");
                    summary.quota_exhausted = true;
                    summary.windows_failed += 1;
                    summary.window_failures.push(WindowFailure {
                        window,
                        direction,
                        reason,
                    });
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Document failed, continuing with next");
                    summary.failed_documents += 1;
                }
            }
        }
        Ok(())
    }

    /// Fetch (or reuse), store, parse, and ingest one document.
    async fn process_document(
        &self,
        company: &Company,
        credential: &CredentialContext,
        direction: Direction,
        cfdi_uuid: Uuid,
        cancel: &CancellationToken,
    ) -> Result<DocOutcome, SyncError> {
        if cancel.is_cancelled() {
            return Ok(DocOutcome::Cancelled);
        }

        let (bytes, downloaded) = if self.store.contains(&company.rfc, cfdi_uuid).await {
            (self.store.get(&company.rfc, cfdi_uuid).await?, false)
        } else {
            let bytes = self
                .with_renewal("fetch_document", || {
                    self.client.fetch_document(credential, cfdi_uuid)
                })
                .await?;
            self.store.put(&company.rfc, cfdi_uuid, &bytes).await?;
            (bytes, true)
        };

        let parsed = match parse_cfdi(&bytes) {
            Ok(parsed) => parsed,
            Err(SyncError::MalformedDocument(e)) => {
                warn!(cfdi_uuid = %cfdi_uuid, error = %e, "Skipping malformed document");
                return Ok(DocOutcome::Malformed);
            }
            Err(e) => return Err(e),
        };

        if parsed.cfdi_uuid != cfdi_uuid {
            return Err(SyncError::DataIntegrity(anyhow::anyhow!(
                "document {} carries fiscal folio {}",
                cfdi_uuid,
                parsed.cfdi_uuid
            )));
        }

        let outcome = self
            .database
            .ingest(
                company,
                &parsed,
                direction,
                &DocumentStore::key(&company.rfc, cfdi_uuid),
                self.options.policy,
            )
            .await?;

        Ok(match outcome {
            IngestOutcome::Created => DocOutcome::Ingested { downloaded },
            IngestOutcome::AlreadyExisted => DocOutcome::AlreadyIngested { downloaded },
        })
    }

    /// Retrying call wrapper with one transparent session renewal: an
    /// expired session invalidates the cache and retries once; a second
    /// expiry means renewal is not taking effect and the credential is
    /// treated as rejected.
    async fn with_renewal<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        match retry_call(&self.options.retry, operation, &f).await {
            Err(SyncError::AuthExpired) => {
                info!(operation, "Session expired, renewing");
                self.client.invalidate_session().await;
                match retry_call(&self.options.retry, operation, &f).await {
                    Err(SyncError::AuthExpired) => Err(SyncError::AuthRejected(anyhow::anyhow!(
                        "session renewal did not take effect"
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }
}

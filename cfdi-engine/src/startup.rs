//! Engine assembly: wires configuration into the database, document
//! store, and authority client, and exposes the engine's operations.

use chrono::NaiveDate;
use std::sync::Arc;
use sync_core::SyncError;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::classify::ClassificationPolicy;
use crate::config::EngineConfig;
use crate::models::Company;
use crate::sat::{AuthorityClient, CredentialContext, SatClient, SatClientConfig};
use crate::services::{Anomaly, Database};
use crate::store::DocumentStore;
use crate::sync::{
    DirectionFilter, RebuildReport, Rebuilder, RefreshReport, SyncOptions, SyncOrchestrator,
    SyncSummary,
};

pub struct Engine {
    config: EngineConfig,
    database: Database,
    store: DocumentStore,
    client: Arc<dyn AuthorityClient>,
}

impl Engine {
    /// Build the engine from configuration, running migrations.
    #[instrument(skip(config))]
    pub async fn build(config: EngineConfig) -> Result<Self, SyncError> {
        let database =
            Database::new(&config.database.url, config.database.max_connections).await?;
        database.run_migrations().await?;

        let store = DocumentStore::new(config.storage.document_path.clone()).await?;

        let client = Arc::new(SatClient::new(SatClientConfig {
            base_url: config.authority.base_url.clone(),
            request_timeout: config.request_timeout(),
        })?);

        info!("Engine assembled");
        Ok(Self {
            config,
            database,
            store,
            client,
        })
    }

    /// Assembly seam for tests: same wiring with a caller-supplied
    /// authority client.
    pub fn with_client(
        config: EngineConfig,
        database: Database,
        store: DocumentStore,
        client: Arc<dyn AuthorityClient>,
    ) -> Self {
        Self {
            config,
            database,
            store,
            client,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn policy(&self) -> ClassificationPolicy {
        ClassificationPolicy {
            include_payment_invoices: self.config.sync.include_payment_invoices,
            include_deferred: self.config.sync.include_deferred,
        }
    }

    fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            max_window_days: self.config.sync.max_window_days,
            worker_count: self.config.sync.worker_count,
            retry: self.config.retry(),
            policy: self.policy(),
        }
    }

    pub async fn register_company(&self, rfc: &str, name: &str) -> Result<Company, SyncError> {
        self.database.create_company(rfc, name).await
    }

    /// Look up a registered company, failing with `NotFound` when absent.
    pub async fn company(&self, rfc: &str) -> Result<Company, SyncError> {
        self.database
            .get_company_by_rfc(rfc)
            .await?
            .ok_or_else(|| SyncError::NotFound(anyhow::anyhow!("company {} not registered", rfc)))
    }

    /// Synchronize a company's invoices over a date range, limited to
    /// the selected directions.
    pub async fn sync(
        &self,
        company: &Company,
        credential: &CredentialContext,
        start: NaiveDate,
        end: NaiveDate,
        filter: DirectionFilter,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let orchestrator = SyncOrchestrator::new(
            Arc::clone(&self.client),
            self.database.clone(),
            self.store.clone(),
            self.sync_options(),
        );
        orchestrator
            .sync_range(company, credential, start, end, filter, cancel)
            .await
    }

    /// Rebuild the structured database for a company from its stored
    /// documents.
    pub async fn rebuild(&self, company: &Company) -> Result<RebuildReport, SyncError> {
        Rebuilder::new(self.database.clone(), self.store.clone(), self.policy())
            .rebuild_company(company)
            .await
    }

    /// Refresh non-identity invoice fields from fresh parses of the
    /// stored documents.
    pub async fn refresh(&self, company: &Company) -> Result<RefreshReport, SyncError> {
        Rebuilder::new(self.database.clone(), self.store.clone(), self.policy())
            .refresh_company(company)
            .await
    }

    /// Detect integrity anomalies for a company without mutating state.
    pub async fn verify(&self, company: &Company) -> Result<Vec<Anomaly>, SyncError> {
        self.database.verify_integrity(company, self.policy()).await
    }

    /// Create movements for invoices that lost theirs. Returns how many
    /// were created.
    pub async fn repair(&self, company: &Company) -> Result<u64, SyncError> {
        self.database
            .create_missing_movements(company, self.policy())
            .await
    }

    /// Default start of the next sync: the day of the company's latest
    /// known invoice, or `fallback_days` back when none exist.
    pub async fn default_sync_start(
        &self,
        company: &Company,
        fallback_days: i64,
    ) -> Result<NaiveDate, SyncError> {
        let today = chrono::Utc::now().date_naive();
        Ok(self
            .database
            .last_invoice_date(company)
            .await?
            .map(|dt| dt.date())
            .unwrap_or_else(|| today - chrono::Duration::days(fallback_days)))
    }
}

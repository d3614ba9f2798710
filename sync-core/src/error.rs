use thiserror::Error;

/// Error taxonomy for the synchronization engine.
///
/// Transient classes are retried locally by the orchestrator; everything
/// else propagates to the caller with enough context to investigate.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Credential invalid, revoked, or rejected by the authority. Fatal
    /// for the run.
    #[error("Authority rejected credentials: {0}")]
    AuthRejected(anyhow::Error),

    /// Cached session lapsed. Renewable: the orchestrator re-authenticates
    /// once before giving up.
    #[error("Authority session expired")]
    AuthExpired,

    /// Network or provider hiccup. Retried with exponential backoff.
    #[error("Authority temporarily unavailable: {0}")]
    TransientUnavailable(anyhow::Error),

    /// Provider rate limit. Aborts remaining work for the run, preserves
    /// completed work.
    #[error("Authority quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    /// Document content could not be parsed. Skipped and counted, never
    /// fatal to a batch.
    #[error("Malformed document: {0}")]
    MalformedDocument(anyhow::Error),

    /// Identity mismatch on re-ingestion or divergent re-download.
    /// Surfaced, never auto-corrected.
    #[error("Data integrity violation: {0}")]
    DataIntegrity(anyhow::Error),

    /// Storage layer failure. Fatal to the current operation; safe to
    /// retry the whole call since ingestion is idempotent.
    #[error("Persistence error: {0}")]
    Persistence(anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientUnavailable(_))
    }

    /// Errors that must terminate a run early. Only credential and
    /// storage-layer failures do.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthRejected(_) | SyncError::Persistence(_) | SyncError::Config(_)
        )
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        SyncError::MalformedDocument(anyhow::anyhow!(msg.into()))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Persistence(anyhow::Error::new(err))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Persistence(anyhow::Error::new(err))
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(anyhow::Error::new(err))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            SyncError::TransientUnavailable(anyhow::Error::new(err))
        } else {
            SyncError::Internal(anyhow::Error::new(err))
        }
    }
}

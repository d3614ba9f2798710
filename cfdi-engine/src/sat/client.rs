//! Authority download client.
//!
//! Speaks the authority's bulk-download protocol: authenticate with the
//! company credential, request a manifest of available invoice
//! identifiers for a window, download individual documents. The session
//! token is cached for the credential's validity window and renewed
//! transparently on expiry.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use sync_core::SyncError;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{CredentialContext, DateWindow};
use crate::models::Direction;

/// Abstract authority protocol: a manifest of identifiers per window,
/// raw bytes per identifier. The concrete wire format stays behind this
/// seam so the orchestrator and tests never depend on it.
#[async_trait]
pub trait AuthorityClient: Send + Sync {
    async fn fetch_manifest(
        &self,
        credential: &CredentialContext,
        window: DateWindow,
        direction: Direction,
    ) -> Result<Vec<Uuid>, SyncError>;

    async fn fetch_document(
        &self,
        credential: &CredentialContext,
        cfdi_uuid: Uuid,
    ) -> Result<Vec<u8>, SyncError>;

    /// Drop any cached session so the next call re-authenticates.
    async fn invalidate_session(&self);
}

#[derive(Debug, Clone)]
pub struct SatClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

#[derive(Clone)]
struct Session {
    token: String,
    expires_utc: DateTime<Utc>,
}

/// HTTP implementation of the authority protocol.
pub struct SatClient {
    config: SatClientConfig,
    http: reqwest::Client,
    session: RwLock<Option<Session>>,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
    expires_in_secs: i64,
}

#[derive(Deserialize)]
struct ManifestResponse {
    identifiers: Vec<Uuid>,
}

impl SatClient {
    pub fn new(config: SatClientConfig) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(anyhow::anyhow!("HTTP client: {}", e)))?;
        Ok(Self {
            config,
            http,
            session: RwLock::new(None),
        })
    }

    /// Return a valid session token, authenticating if none is cached or
    /// the cached one lapsed. A rejected renewal is `AuthRejected`.
    async fn ensure_session(&self, credential: &CredentialContext) -> Result<String, SyncError> {
        let now = Utc::now();

        if let Some(session) = self.session.read().await.as_ref() {
            if session.expires_utc > now {
                return Ok(session.token.clone());
            }
        }

        credential.validate_at(now)?;

        // Proof of key possession: the authority verifies the digest
        // against the registered certificate.
        let mut hasher = Sha256::new();
        hasher.update(&credential.private_key);
        hasher.update(credential.passphrase.expose_secret().as_bytes());
        let evidence = hex_encode(&hasher.finalize());

        let response = self
            .http
            .post(format!("{}/autenticacion", self.config.base_url))
            .json(&serde_json::json!({
                "rfc": credential.rfc,
                "certificate": BASE64.encode(&credential.certificate),
                "evidence": evidence,
            }))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let auth: AuthResponse = response.json().await.map_err(|e| {
                    SyncError::Internal(anyhow::anyhow!("bad auth response: {}", e))
                })?;
                let session = Session {
                    token: auth.token,
                    expires_utc: now + chrono::Duration::seconds(auth.expires_in_secs),
                };
                let token = session.token.clone();
                *self.session.write().await = Some(session);
                info!(rfc = %credential.rfc, "Authenticated with authority");
                Ok(token)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::AuthRejected(
                anyhow::anyhow!("authority rejected credentials for {}", credential.rfc),
            )),
            status if status.is_server_error() => Err(SyncError::TransientUnavailable(
                anyhow::anyhow!("authentication endpoint returned {}", status),
            )),
            status => Err(SyncError::Internal(anyhow::anyhow!(
                "unexpected authentication status {}",
                status
            ))),
        }
    }
}

#[async_trait]
impl AuthorityClient for SatClient {
    #[instrument(skip(self, credential), fields(rfc = %credential.rfc, window = %window))]
    async fn fetch_manifest(
        &self,
        credential: &CredentialContext,
        window: DateWindow,
        direction: Direction,
    ) -> Result<Vec<Uuid>, SyncError> {
        let token = self.ensure_session(credential).await?;

        let response = self
            .http
            .get(format!("{}/solicitudes", self.config.base_url))
            .bearer_auth(token)
            .query(&[
                ("rfc", credential.rfc.as_str()),
                ("desde", &window.start.to_string()),
                ("hasta", &window.end.to_string()),
                ("direccion", direction.as_str()),
            ])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let manifest: ManifestResponse = response.json().await.map_err(|e| {
                    SyncError::Internal(anyhow::anyhow!("bad manifest response: {}", e))
                })?;
                debug!(count = manifest.identifiers.len(), "Manifest received");
                Ok(manifest.identifiers)
            }
            StatusCode::UNAUTHORIZED => Err(SyncError::AuthExpired),
            StatusCode::TOO_MANY_REQUESTS => Err(SyncError::QuotaExceeded(format!(
                "manifest quota exhausted for {}",
                credential.rfc
            ))),
            status if status.is_server_error() => Err(SyncError::TransientUnavailable(
                anyhow::anyhow!("manifest endpoint returned {}", status),
            )),
            status => Err(SyncError::Internal(anyhow::anyhow!(
                "unexpected manifest status {}",
                status
            ))),
        }
    }

    #[instrument(skip(self, credential), fields(rfc = %credential.rfc, cfdi_uuid = %cfdi_uuid))]
    async fn fetch_document(
        &self,
        credential: &CredentialContext,
        cfdi_uuid: Uuid,
    ) -> Result<Vec<u8>, SyncError> {
        let token = self.ensure_session(credential).await?;

        let response = self
            .http
            .get(format!(
                "{}/comprobantes/{}",
                self.config.base_url, cfdi_uuid
            ))
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(SyncError::NotFound(anyhow::anyhow!(
                "document {} not available",
                cfdi_uuid
            ))),
            StatusCode::UNAUTHORIZED => Err(SyncError::AuthExpired),
            StatusCode::TOO_MANY_REQUESTS => Err(SyncError::QuotaExceeded(format!(
                "download quota exhausted for {}",
                credential.rfc
            ))),
            status if status.is_server_error() => Err(SyncError::TransientUnavailable(
                anyhow::anyhow!("document endpoint returned {}", status),
            )),
            status => Err(SyncError::Internal(anyhow::anyhow!(
                "unexpected document status {}",
                status
            ))),
        }
    }

    async fn invalidate_session(&self) {
        *self.session.write().await = None;
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

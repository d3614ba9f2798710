//! Shared test harness: file-backed database, scripted authority client,
//! and CFDI document fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use secrecy::SecretString;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use sync_core::SyncError;
use tempfile::TempDir;
use uuid::Uuid;

use cfdi_engine::models::Direction;
use cfdi_engine::sat::{AuthorityClient, CredentialContext, DateWindow};
use cfdi_engine::services::Database;
use cfdi_engine::store::DocumentStore;

pub const COMPANY_RFC: &str = "AAA010101AAA";
pub const OTHER_RFC: &str = "BBB020202BBB";

static TRACING: Once = Once::new();

pub fn init_test_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_test_writer()
            .init();
    });
}

pub async fn test_database(dir: &TempDir) -> Database {
    init_test_tracing();
    let url = format!("sqlite://{}", dir.path().join("engine.db").display());
    let database = Database::new(&url, 1).await.unwrap();
    database.run_migrations().await.unwrap();
    database
}

pub async fn test_store(dir: &TempDir) -> DocumentStore {
    DocumentStore::new(dir.path().join("documents")).await.unwrap()
}

pub fn test_credential(rfc: &str) -> CredentialContext {
    let now = Utc::now();
    CredentialContext {
        rfc: rfc.to_string(),
        certificate: b"test-certificate".to_vec(),
        private_key: b"test-key".to_vec(),
        passphrase: SecretString::new("test".to_string()),
        not_before: now - Duration::days(1),
        not_after: now + Duration::days(1),
    }
}

/// Render a minimal CFDI 4.0 document with the given identity and
/// amounts.
pub fn cfdi_xml(
    cfdi_uuid: Uuid,
    tipo: &str,
    issuer_rfc: &str,
    receiver_rfc: &str,
    date: NaiveDate,
    total: &str,
    metodo_pago: Option<&str>,
) -> Vec<u8> {
    let metodo = metodo_pago
        .map(|m| format!(r#" MetodoPago="{}""#, m))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4" Version="4.0"
    Fecha="{date}T12:00:00" TipoDeComprobante="{tipo}" SubTotal="{total}"
    Total="{total}" Moneda="MXN"{metodo}>
  <cfdi:Emisor Rfc="{issuer}" Nombre="Emisor {issuer}"/>
  <cfdi:Receptor Rfc="{receiver}" Nombre="Receptor {receiver}"/>
  <cfdi:Conceptos>
    <cfdi:Concepto Descripcion="Servicios profesionales"/>
  </cfdi:Conceptos>
  <cfdi:Complemento>
    <tfd:TimbreFiscalDigital xmlns:tfd="http://www.sat.gob.mx/TimbreFiscalDigital"
        Version="1.1" UUID="{uuid}"/>
  </cfdi:Complemento>
</cfdi:Comprobante>"#,
        date = date,
        tipo = tipo,
        total = total,
        metodo = metodo,
        issuer = issuer_rfc,
        receiver = receiver_rfc,
        uuid = cfdi_uuid,
    )
    .into_bytes()
}

struct MockDoc {
    direction: Direction,
    date: NaiveDate,
    bytes: Vec<u8>,
}

/// Scripted in-memory authority. Manifests are computed from the
/// registered documents' dates and directions; failures are injected per
/// call or per window.
#[derive(Default)]
pub struct MockAuthority {
    documents: Mutex<HashMap<Uuid, MockDoc>>,
    /// Errors returned by the next manifest calls, in order, before any
    /// real work.
    manifest_errors: Mutex<VecDeque<SyncError>>,
    /// Windows whose manifest fails persistently.
    failing_window_starts: Mutex<Vec<(Direction, NaiveDate)>>,
    /// Windows whose manifest reports an exhausted quota.
    quota_window_starts: Mutex<Vec<(Direction, NaiveDate)>>,
    document_errors: Mutex<HashMap<Uuid, VecDeque<SyncError>>>,
    /// When set, every call returns `AuthExpired` until the session is
    /// invalidated.
    expired: AtomicBool,
    /// When set, invalidating the session does not help: renewal keeps
    /// producing expired sessions.
    renewal_fails: AtomicBool,
    pub manifest_calls: AtomicUsize,
    pub document_calls: AtomicUsize,
    pub session_invalidations: AtomicUsize,
}

impl MockAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&self, cfdi_uuid: Uuid, direction: Direction, date: NaiveDate, bytes: Vec<u8>) {
        self.documents.lock().unwrap().insert(
            cfdi_uuid,
            MockDoc {
                direction,
                date,
                bytes,
            },
        );
    }

    pub fn push_manifest_error(&self, error: SyncError) {
        self.manifest_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_window(&self, direction: Direction, start: NaiveDate) {
        self.failing_window_starts
            .lock()
            .unwrap()
            .push((direction, start));
    }

    pub fn exhaust_quota_at(&self, direction: Direction, start: NaiveDate) {
        self.quota_window_starts
            .lock()
            .unwrap()
            .push((direction, start));
    }

    pub fn push_document_error(&self, cfdi_uuid: Uuid, error: SyncError) {
        self.document_errors
            .lock()
            .unwrap()
            .entry(cfdi_uuid)
            .or_default()
            .push_back(error);
    }

    pub fn expire_session(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    pub fn break_renewal(&self) {
        self.renewal_fails.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuthorityClient for MockAuthority {
    async fn fetch_manifest(
        &self,
        _credential: &CredentialContext,
        window: DateWindow,
        direction: Direction,
    ) -> Result<Vec<Uuid>, SyncError> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);

        if self.expired.load(Ordering::SeqCst) {
            return Err(SyncError::AuthExpired);
        }
        if let Some(err) = self.manifest_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self
            .failing_window_starts
            .lock()
            .unwrap()
            .iter()
            .any(|(d, s)| *d == direction && *s == window.start)
        {
            return Err(SyncError::TransientUnavailable(anyhow::anyhow!(
                "scripted outage for window {}",
                window
            )));
        }
        if self
            .quota_window_starts
            .lock()
            .unwrap()
            .iter()
            .any(|(d, s)| *d == direction && *s == window.start)
        {
            return Err(SyncError::QuotaExceeded(format!(
                "scripted quota exhaustion at window {}",
                window
            )));
        }

        let docs = self.documents.lock().unwrap();
        Ok(docs
            .iter()
            .filter(|(_, doc)| {
                doc.direction == direction && doc.date >= window.start && doc.date <= window.end
            })
            .map(|(id, _)| *id)
            .collect())
    }

    async fn fetch_document(
        &self,
        _credential: &CredentialContext,
        cfdi_uuid: Uuid,
    ) -> Result<Vec<u8>, SyncError> {
        self.document_calls.fetch_add(1, Ordering::SeqCst);

        if self.expired.load(Ordering::SeqCst) {
            return Err(SyncError::AuthExpired);
        }
        if let Some(queue) = self.document_errors.lock().unwrap().get_mut(&cfdi_uuid) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }

        self.documents
            .lock()
            .unwrap()
            .get(&cfdi_uuid)
            .map(|doc| doc.bytes.clone())
            .ok_or_else(|| SyncError::NotFound(anyhow::anyhow!("no document {}", cfdi_uuid)))
    }

    async fn invalidate_session(&self) {
        self.session_invalidations.fetch_add(1, Ordering::SeqCst);
        if !self.renewal_fails.load(Ordering::SeqCst) {
            // Renewal succeeds: the next call is authenticated again.
            self.expired.store(false, Ordering::SeqCst);
        }
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

//! Document store: durable, append-only storage of raw CFDI documents.
//!
//! One file per (company RFC, fiscal folio) under the store root. The
//! store is the ground truth: the structured database can always be
//! rebuilt from it. Writes go through a temp file and an atomic rename so
//! a partially written document is never observable.

use std::path::{Path, PathBuf};
use sync_core::SyncError;
use tokio::fs;
use uuid::Uuid;

/// Outcome of a `put`: `AlreadyPresent` is not an error, it tells the
/// orchestrator that fetching was unnecessary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    AlreadyPresent,
}

#[derive(Clone)]
pub struct DocumentStore {
    base_path: PathBuf,
}

impl DocumentStore {
    pub async fn new(base_path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let base_path = base_path.into();
        if !base_path.exists() {
            fs::create_dir_all(&base_path).await?;
        }
        Ok(Self { base_path })
    }

    /// Store key for one document, also persisted as the invoice's
    /// `document_ref`.
    pub fn key(company_rfc: &str, cfdi_uuid: Uuid) -> String {
        format!("{}/{}.xml", sanitize(company_rfc), cfdi_uuid)
    }

    fn path_for(&self, company_rfc: &str, cfdi_uuid: Uuid) -> PathBuf {
        self.base_path.join(Self::key(company_rfc, cfdi_uuid))
    }

    pub async fn contains(&self, company_rfc: &str, cfdi_uuid: Uuid) -> bool {
        fs::try_exists(self.path_for(company_rfc, cfdi_uuid))
            .await
            .unwrap_or(false)
    }

    /// Write-once put. A second write with identical bytes is a no-op;
    /// divergent bytes for an existing key are an integrity violation,
    /// never a silent overwrite.
    pub async fn put(
        &self,
        company_rfc: &str,
        cfdi_uuid: Uuid,
        bytes: &[u8],
    ) -> Result<PutOutcome, SyncError> {
        let path = self.path_for(company_rfc, cfdi_uuid);

        if fs::try_exists(&path).await? {
            let existing = fs::read(&path).await?;
            if existing == bytes {
                return Ok(PutOutcome::AlreadyPresent);
            }
            return Err(SyncError::DataIntegrity(anyhow::anyhow!(
                "divergent re-download for document {} of {}",
                cfdi_uuid,
                company_rfc
            )));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Temp file in the same directory so the rename stays on one
        // filesystem and is atomic.
        let tmp = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        fs::write(&tmp, bytes).await?;
        match fs::rename(&tmp, &path).await {
            Ok(()) => Ok(PutOutcome::Stored),
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }

    pub async fn get(&self, company_rfc: &str, cfdi_uuid: Uuid) -> Result<Vec<u8>, SyncError> {
        let path = self.path_for(company_rfc, cfdi_uuid);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SyncError::NotFound(
                anyhow::anyhow!("document {} of {}", cfdi_uuid, company_rfc),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate every stored identifier for a company. Finite and
    /// restartable; contents are fetched per-identifier via `get` so a
    /// replay never holds the whole store in memory.
    pub async fn list(&self, company_rfc: &str) -> Result<Vec<Uuid>, SyncError> {
        let dir = self.base_path.join(sanitize(company_rfc));
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut identifiers = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                match Uuid::parse_str(stem) {
                    Ok(id) => identifiers.push(id),
                    Err(_) => {
                        tracing::warn!(path = %path.display(), "Skipping non-identifier file in store");
                    }
                }
            }
        }
        Ok(identifiers)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// Company RFCs are uppercase alphanumerics, but defend the filesystem
/// against anything else that slips through.
fn sanitize(rfc: &str) -> String {
    rfc.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let (_dir, store) = temp_store().await;
        let id = Uuid::new_v4();
        let outcome = store.put("AAA010101AAA", id, b"<xml/>").await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        assert_eq!(store.get("AAA010101AAA", id).await.unwrap(), b"<xml/>");
    }

    #[tokio::test]
    async fn second_identical_put_is_noop() {
        let (_dir, store) = temp_store().await;
        let id = Uuid::new_v4();
        store.put("AAA010101AAA", id, b"<xml/>").await.unwrap();
        let outcome = store.put("AAA010101AAA", id, b"<xml/>").await.unwrap();
        assert_eq!(outcome, PutOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn divergent_put_is_detected() {
        let (_dir, store) = temp_store().await;
        let id = Uuid::new_v4();
        store.put("AAA010101AAA", id, b"<xml/>").await.unwrap();
        let err = store.put("AAA010101AAA", id, b"<other/>").await.unwrap_err();
        assert!(matches!(err, SyncError::DataIntegrity(_)));
        // Original bytes untouched.
        assert_eq!(store.get("AAA010101AAA", id).await.unwrap(), b"<xml/>");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (_dir, store) = temp_store().await;
        let err = store.get("AAA010101AAA", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_enumerates_company_documents() {
        let (_dir, store) = temp_store().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.put("AAA010101AAA", a, b"<a/>").await.unwrap();
        store.put("AAA010101AAA", b, b"<b/>").await.unwrap();
        store.put("XXX999999XXX", Uuid::new_v4(), b"<x/>").await.unwrap();

        let mut listed = store.list("AAA010101AAA").await.unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
        assert!(store.list("ZZZ000000ZZZ").await.unwrap().is_empty());
    }
}

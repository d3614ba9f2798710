//! Credential context: the company-scoped authentication capability.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use sync_core::SyncError;

/// Certificate, private key, and passphrase authenticating one company to
/// the authority, plus the certificate's validity window.
///
/// Passed explicitly into every client and orchestrator call; there is no
/// process-wide authenticated session.
#[derive(Clone)]
pub struct CredentialContext {
    pub rfc: String,
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
    pub passphrase: SecretString,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CredentialContext {
    /// Check the validity window. A lapsed or not-yet-valid certificate
    /// can never authenticate, so this is `AuthRejected` rather than
    /// `AuthExpired`.
    pub fn validate_at(&self, now: DateTime<Utc>) -> Result<(), SyncError> {
        if now < self.not_before || now > self.not_after {
            return Err(SyncError::AuthRejected(anyhow::anyhow!(
                "certificate for {} valid {} to {}, now {}",
                self.rfc,
                self.not_before,
                self.not_after,
                now
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material or the passphrase.
        f.debug_struct("CredentialContext")
            .field("rfc", &self.rfc)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credential(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> CredentialContext {
        CredentialContext {
            rfc: "AAA010101AAA".to_string(),
            certificate: b"cert".to_vec(),
            private_key: b"key".to_vec(),
            passphrase: SecretString::new("secret".to_string()),
            not_before,
            not_after,
        }
    }

    #[test]
    fn valid_inside_window() {
        let now = Utc::now();
        let cred = credential(now - Duration::days(1), now + Duration::days(1));
        assert!(cred.validate_at(now).is_ok());
    }

    #[test]
    fn rejected_outside_window() {
        let now = Utc::now();
        let cred = credential(now - Duration::days(30), now - Duration::days(1));
        let err = cred.validate_at(now).unwrap_err();
        assert!(matches!(err, SyncError::AuthRejected(_)));
    }

    #[test]
    fn debug_hides_secrets() {
        let now = Utc::now();
        let cred = credential(now, now);
        let dbg = format!("{:?}", cred);
        assert!(!dbg.contains("secret"));
        assert!(!dbg.contains("key"));
    }
}

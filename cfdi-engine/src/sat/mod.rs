//! Authority-facing layer: credential context and download client.

mod client;
mod credential;

pub use client::{AuthorityClient, SatClient, SatClientConfig};
pub use credential::CredentialContext;

use chrono::NaiveDate;

/// One inclusive manifest-query window. The authority bounds the span of
/// a single query, so a requested range is split into these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

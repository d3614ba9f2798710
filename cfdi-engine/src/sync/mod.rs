//! Synchronization: windowed download orchestration and full rebuild
//! from stored documents.

mod orchestrator;
mod rebuild;

pub use orchestrator::{split_range, SyncOptions, SyncOrchestrator};
pub use rebuild::{RebuildReport, Rebuilder, RefreshReport};

use crate::models::Direction;
use crate::sat::DateWindow;

/// Which invoice directions a synchronization run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectionFilter {
    Issued,
    Received,
    #[default]
    Both,
}

impl DirectionFilter {
    pub fn directions(self) -> &'static [Direction] {
        match self {
            DirectionFilter::Issued => &[Direction::Issued],
            DirectionFilter::Received => &[Direction::Received],
            DirectionFilter::Both => &[Direction::Issued, Direction::Received],
        }
    }
}

/// Aggregate result of one synchronization run. A run that lost windows
/// to transient trouble or hit the provider quota is still a partial
/// success; completed work is never rolled back.
#[derive(Debug, Default, Clone)]
pub struct SyncSummary {
    pub windows_total: u32,
    pub windows_completed: u32,
    pub windows_failed: u32,
    /// Identifiers listed by the authority across all manifests.
    pub discovered: u64,
    /// Documents fetched over the wire this run.
    pub downloaded: u64,
    /// Documents already in the local store; no fetch was made.
    pub reused_local: u64,
    pub ingested: u64,
    pub already_ingested: u64,
    pub malformed: u64,
    pub failed_documents: u64,
    /// Remaining work was abandoned because the provider rate limit hit.
    pub quota_exhausted: bool,
    pub cancelled: bool,
    pub window_failures: Vec<WindowFailure>,
}

/// One manifest window the run could not complete.
#[derive(Debug, Clone)]
pub struct WindowFailure {
    pub window: DateWindow,
    pub direction: Direction,
    pub reason: String,
}

//! sync-core: Shared infrastructure for the CFDI synchronization engine.
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;

pub use error::SyncError;
pub use retry::{retry_call, RetryConfig};

//! CFDI invoice synchronization and reconciliation engine.
//!
//! Retrieves tax-authority invoices for registered companies, persists the
//! raw documents as ground truth, derives income/expense movements from
//! them, and can rebuild the structured database from the stored documents
//! alone. Re-running any synchronization never produces duplicate records.

pub mod classify;
pub mod config;
pub mod models;
pub mod parser;
pub mod sat;
pub mod services;
pub mod startup;
pub mod store;
pub mod sync;

pub use startup::Engine;

mod database;

pub use database::{Anomaly, Database, IngestOutcome};

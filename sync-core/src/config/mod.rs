use crate::error::SyncError;
use config::{Config as Cfg, File};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Configuration shared by every entry point. Embedded (flattened) into
/// each binary's typed config.
#[derive(Debug, Deserialize, Clone)]
pub struct Common {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load a typed configuration: `.env`, an optional `configuration` file,
/// then `APP__`-prefixed environment overrides.
pub fn load<T: DeserializeOwned>() -> Result<T, SyncError> {
    dotenvy::dotenv().ok();

    let config = Cfg::builder()
        .add_source(File::with_name("configuration").required(false))
        .add_source(config::Environment::with_prefix("APP").separator("__"))
        .build()?;

    Ok(config.try_deserialize()?)
}

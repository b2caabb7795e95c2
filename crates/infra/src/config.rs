//! Configuration loading and process bootstrap.
//!
//! Layered, later sources win:
//! 1. Defaults in code
//! 2. `config/<environment>.toml` (optional)
//! 3. `STOCKLEDGER__*` environment variables, `__` separating nesting levels
//!    (`STOCKLEDGER__DATABASE__URL`, `STOCKLEDGER__LOG__FORMAT`, ...)

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use config::{ConfigError, Environment, File};
use serde::Deserialize;

use stockledger_observability::LogSettings;

use crate::store::PostgresLedgerStore;

const ENV_PREFIX: &str = "STOCKLEDGER";

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// `development`, `production`, ...; selects the optional config file.
    pub environment: String,
    #[serde(default)]
    pub log: LogSettings,
    pub storage: StorageSettings,
    pub database: DatabaseSettings,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL. Only read when the backend is `postgres`.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl DatabaseSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl LedgerConfig {
    /// Load from files and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(None)
    }

    /// Load with `env` standing in for the process environment (keys as they would
    /// appear there, e.g. `STOCKLEDGER__STORAGE__BACKEND`).
    pub fn load_with(env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let environment = env
            .as_ref()
            .and_then(|vars| vars.get("STOCKLEDGER__ENVIRONMENT").cloned())
            .or_else(|| std::env::var("STOCKLEDGER__ENVIRONMENT").ok())
            .unwrap_or_else(|| "development".into());

        config::Config::builder()
            .set_default("environment", environment.clone())?
            .set_default("log.format", "json")?
            .set_default("log.filter", "info")?
            .set_default("storage.backend", "memory")?
            .set_default("database.url", "postgres://localhost/stockledger")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Read `.env`, load configuration and install the tracing subscriber.
pub fn init_from_env() -> anyhow::Result<LedgerConfig> {
    dotenvy::dotenv().ok();
    let config = LedgerConfig::load().context("failed to load ledger configuration")?;
    stockledger_observability::tracing::init(&config.log);

    tracing::info!(
        environment = %config.environment,
        backend = ?config.storage.backend,
        "configuration loaded"
    );
    Ok(config)
}

/// Connect to Postgres and bring the schema up to date.
pub async fn connect_postgres(settings: &DatabaseSettings) -> anyhow::Result<PostgresLedgerStore> {
    tracing::info!(
        max_connections = settings.max_connections,
        "connecting to database"
    );
    let store = PostgresLedgerStore::connect(settings)
        .await
        .context("failed to connect to database")?;
    store.migrate().await.context("failed to apply schema")?;
    tracing::info!("database connection established");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_observability::LogFormat;

    fn vars(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults_select_the_memory_backend() {
        let config = LedgerConfig::load_with(vars(&[])).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.acquire_timeout(), Duration::from_secs(30));
        assert!(!config.is_production());
    }

    #[test]
    fn environment_variables_override_nested_keys() {
        let config = LedgerConfig::load_with(vars(&[
            ("STOCKLEDGER__ENVIRONMENT", "production"),
            ("STOCKLEDGER__STORAGE__BACKEND", "postgres"),
            ("STOCKLEDGER__DATABASE__URL", "postgres://db/ledger"),
            ("STOCKLEDGER__DATABASE__MAX_CONNECTIONS", "32"),
            ("STOCKLEDGER__LOG__FORMAT", "pretty"),
        ]))
        .unwrap();

        assert!(config.is_production());
        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert_eq!(config.database.url, "postgres://db/ledger");
        assert_eq!(config.database.max_connections, 32);
        assert_eq!(config.log.format, LogFormat::Pretty);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = LedgerConfig::load_with(vars(&[("STOCKLEDGER__STORAGE__BACKEND", "redis")]));
        assert!(err.is_err());
    }
}

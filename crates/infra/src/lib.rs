//! Infrastructure layer: ledger stores, the ledger service and configuration.

pub mod config;
pub mod ledger;
pub mod store;


pub use config::{DatabaseSettings, LedgerConfig, StorageBackend, StorageSettings};
pub use ledger::Ledger;
pub use store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore, StoreError};

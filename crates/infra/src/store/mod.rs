//! Ledger storage: the `LedgerStore` contract and its backends.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::{PostgresLedgerStore, SCHEMA};
pub use r#trait::{Committed, LedgerStore, RuleTotal, StoreError, StoreResult};

//! Simple Bank - ledger core
//!
//! Accounts, balance entries and money transfers on PostgreSQL.
//!
//! # Modules
//!
//! - [`ledger`] - Store contract, transactional executor and transfer engine
//! - [`currency`] - Supported currency codes
//! - [`db`] - Connection pool and schema bootstrap
//! - [`config`] - YAML application config
//! - [`logging`] - tracing subscriber setup
//! - [`random`] - Random fixtures for tests

pub mod config;
pub mod currency;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod random;

// Convenient re-exports at crate root
pub use currency::Currency;
pub use ledger::{
    Account, Entry, LedgerError, MemoryStore, PgStore, Store, Transfer, TransferEngine,
    TransferTxParams, TransferTxResult, User,
};

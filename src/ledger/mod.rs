//! Ledger core
//!
//! Accounts, entries and transfers kept in a transactional store, plus the
//! engine that moves money between accounts.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ TransferEngine ──▶ Store::exec_tx ──▶ LedgerTx queries
//!                                   │
//!                         PgStore (PostgreSQL) | MemoryStore (in-process)
//! ```
//!
//! # Invariants
//!
//! 1. **All or nothing**: a transfer writes one transfer row, two entries and
//!    two balance updates in one transaction
//! 2. **Ordered locking**: balance rows are locked in ascending account id
//! 3. **No overdraft**: a transfer never leaves the source balance negative
//! 4. **Conservation**: the sum of the two balances is unchanged by a transfer

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;
pub mod transfer;


// Re-exports for convenience
pub use error::{ErrorKind, LedgerError};
pub use memory::MemoryStore;
pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, TransferTxParams, TransferTxResult, UpdateAccountParams, User,
};
pub use postgres::PgStore;
pub use store::{LedgerTx, Store};
pub use transfer::TransferEngine;

//! Ledger store contract
//!
//! [`LedgerTx`] is the set of queries available inside one database
//! transaction. [`Store::exec_tx`] is the transactional executor: it opens a
//! transaction, hands the unit of work a `&mut dyn LedgerTx`, then commits
//! on `Ok` or rolls back on `Err`.
//!
//! # Unit of work
//!
//! ```ignore
//! let account = store
//!     .exec_tx(move |q| {
//!         async move { q.add_account_balance(AddAccountBalanceParams { id, amount }).await }
//!             .boxed()
//!     })
//!     .await?;
//! ```
//!
//! # Guarantees
//!
//! - No write of a unit is visible outside the transaction before commit.
//! - A failed unit is rolled back; if the rollback itself fails both errors
//!   are returned together as [`LedgerError::RollbackFailed`].
//! - A panicking unit is rolled back and reported as
//!   [`LedgerError::TransactionFailure`].
//! - Dropping the `exec_tx` future (caller timeout / cancellation) rolls the
//!   open transaction back.
//! - Row locks taken by [`LedgerTx::add_account_balance`] and
//!   [`LedgerTx::get_account_for_update`] are held until commit/rollback.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use super::error::LedgerError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, UpdateAccountParams, User,
};

/// Queries bound to one open transaction
#[async_trait]
pub trait LedgerTx: Send {
    // === Users ===
    async fn create_user(&mut self, params: CreateUserParams) -> Result<User, LedgerError>;

    async fn get_user(&mut self, username: &str) -> Result<User, LedgerError>;

    // === Accounts ===
    async fn create_account(&mut self, params: CreateAccountParams)
    -> Result<Account, LedgerError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, LedgerError>;

    /// Read an account and lock its row until the transaction ends
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, LedgerError>;

    async fn list_accounts(
        &mut self,
        params: ListAccountsParams,
    ) -> Result<Vec<Account>, LedgerError>;

    async fn update_account(&mut self, params: UpdateAccountParams)
    -> Result<Account, LedgerError>;

    /// Atomic `balance = balance + amount` under a row lock
    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, LedgerError>;

    async fn delete_account(&mut self, id: i64) -> Result<(), LedgerError>;

    // === Entries ===
    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, LedgerError>;

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError>;

    async fn list_entries(&mut self, params: ListEntriesParams)
    -> Result<Vec<Entry>, LedgerError>;

    // === Transfers ===
    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, LedgerError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError>;

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, LedgerError>;
}

/// A ledger backend able to run units of work atomically
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Run `unit` inside a single transaction
    async fn exec_tx<T, F>(&self, unit: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn LedgerTx) -> BoxFuture<'t, Result<T, LedgerError>> + Send;

    async fn create_user(&self, params: CreateUserParams) -> Result<User, LedgerError> {
        self.exec_tx(move |q| async move { q.create_user(params).await }.boxed())
            .await
    }

    async fn create_account(&self, params: CreateAccountParams) -> Result<Account, LedgerError> {
        self.exec_tx(move |q| async move { q.create_account(params).await }.boxed())
            .await
    }

    async fn get_account(&self, id: i64) -> Result<Account, LedgerError> {
        self.exec_tx(move |q| async move { q.get_account(id).await }.boxed())
            .await
    }
}

/// Convert a caught panic payload from a unit of work
pub(crate) fn panic_to_error(panic: Box<dyn std::any::Any + Send>) -> LedgerError {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    LedgerError::TransactionFailure(format!("unit of work panicked: {}", detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_is_reported() {
        let err = panic_to_error(Box::new("boom"));
        assert_eq!(
            err,
            LedgerError::TransactionFailure("unit of work panicked: boom".into())
        );

        let err = panic_to_error(Box::new(String::from("owned boom")));
        assert!(err.to_string().contains("owned boom"));

        let err = panic_to_error(Box::new(17_u32));
        assert!(err.to_string().contains("unknown panic"));
    }
}

//! Transfer Engine
//!
//! Moves money between two accounts as one atomic unit of work:
//!
//! ```text
//! exec_tx {
//!     create_transfer(from, to, amount)
//!     create_entry(from, -amount)
//!     create_entry(to,   +amount)
//!     add_account_balance(lower id)    ── row lock #1
//!     add_account_balance(higher id)   ── row lock #2
//! } → commit | rollback
//! ```
//!
//! # Lock ordering
//!
//! Balance rows are always updated in ascending account-id order, whatever
//! the direction of the transfer. Two concurrent transfers A→B and B→A
//! therefore queue on the same first row instead of each holding one row and
//! waiting for the other. The engine holds no locks of its own; all mutual
//! exclusion is the store's row locking.
//!
//! # Failure
//!
//! Any failing step aborts the unit, the executor rolls back, and the caller
//! gets one error naming the step. There is no retry here.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{info, warn};

use super::error::LedgerError;
use super::models::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, TransferTxParams,
    TransferTxResult,
};
use super::store::{LedgerTx, Store};

/// Runs money transfers against a [`Store`]
pub struct TransferEngine<S> {
    store: Arc<S>,
}

impl<S> Clone for TransferEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store> TransferEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Execute one transfer atomically
    ///
    /// Callers are expected to have checked ownership of the source account
    /// and that both accounts share a currency. Same-account and non-positive
    /// amounts are rejected here as well, before any transaction is opened.
    pub async fn transfer(&self, params: TransferTxParams) -> Result<TransferTxResult, LedgerError> {
        if params.amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if params.from_account_id == params.to_account_id {
            return Err(LedgerError::SameAccount);
        }

        let result = self
            .store
            .exec_tx(move |q| transfer_tx(q, params).boxed())
            .await;

        match &result {
            Ok(r) => info!(
                store = self.store.name(),
                transfer_id = r.transfer.id,
                from = params.from_account_id,
                to = params.to_account_id,
                amount = params.amount,
                "Transfer committed"
            ),
            Err(e) => warn!(
                store = self.store.name(),
                from = params.from_account_id,
                to = params.to_account_id,
                amount = params.amount,
                code = e.code(),
                error = %e,
                "Transfer failed"
            ),
        }

        result
    }
}

/// The unit of work of one transfer
async fn transfer_tx(
    q: &mut dyn LedgerTx,
    params: TransferTxParams,
) -> Result<TransferTxResult, LedgerError> {
    let TransferTxParams {
        from_account_id,
        to_account_id,
        amount,
    } = params;

    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id,
            to_account_id,
            amount,
        })
        .await
        .map_err(|e| e.at("create transfer"))?;

    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: from_account_id,
            amount: -amount,
        })
        .await
        .map_err(|e| e.at("create debit entry"))?;

    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: to_account_id,
            amount,
        })
        .await
        .map_err(|e| e.at("create credit entry"))?;

    let (from_account, to_account) = if from_account_id < to_account_id {
        add_money(q, from_account_id, -amount, to_account_id, amount).await?
    } else {
        let (to_account, from_account) =
            add_money(q, to_account_id, amount, from_account_id, -amount).await?;
        (from_account, to_account)
    };

    if from_account.balance < 0 {
        return Err(LedgerError::InsufficientBalance {
            account_id: from_account.id,
            balance: from_account.balance,
        });
    }

    Ok(TransferTxResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

/// Apply two balance deltas; `first_id` must be the lower account id
async fn add_money(
    q: &mut dyn LedgerTx,
    first_id: i64,
    first_amount: i64,
    second_id: i64,
    second_amount: i64,
) -> Result<(Account, Account), LedgerError> {
    debug_assert!(first_id < second_id);

    let first = q
        .add_account_balance(AddAccountBalanceParams {
            id: first_id,
            amount: first_amount,
        })
        .await
        .map_err(|e| e.at("update first account balance"))?;

    let second = q
        .add_account_balance(AddAccountBalanceParams {
            id: second_id,
            amount: second_amount,
        })
        .await
        .map_err(|e| e.at("update second account balance"))?;

    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::MemoryStore;

    #[tokio::test]
    async fn test_rejects_same_account() {
        let engine = TransferEngine::new(Arc::new(MemoryStore::new()));
        let err = engine
            .transfer(TransferTxParams {
                from_account_id: 1,
                to_account_id: 1,
                amount: 10,
            })
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::SameAccount);
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amount() {
        let engine = TransferEngine::new(Arc::new(MemoryStore::new()));
        for amount in [0, -5] {
            let err = engine
                .transfer(TransferTxParams {
                    from_account_id: 1,
                    to_account_id: 2,
                    amount,
                })
                .await
                .unwrap_err();
            assert_eq!(err, LedgerError::InvalidAmount);
        }
    }

    #[tokio::test]
    async fn test_missing_account_fails_at_first_step() {
        let store = Arc::new(MemoryStore::new());
        let engine = TransferEngine::new(store.clone());

        let err = engine
            .transfer(TransferTxParams {
                from_account_id: 10,
                to_account_id: 20,
                amount: 5,
            })
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("create transfer"));
        assert_eq!(store.transfer_count(), 0);
    }
}

//! In-process ledger store
//!
//! Behaves like the PostgreSQL store as far as the transfer engine can tell:
//!
//! - writes stay private to the transaction until commit (read committed)
//! - every account row has its own `tokio::sync::Mutex`; updating or
//!   locking a row takes the mutex and keeps it until commit/rollback, so
//!   two transactions locking the same rows in opposite order really do
//!   deadlock
//! - foreign keys, `(owner, currency)` uniqueness and `amount > 0` on
//!   transfers are enforced and reported as constraint violations
//!
//! Unit tests can inject faults per store to drive the failure paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error};

use super::error::LedgerError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, UpdateAccountParams, User,
};
use super::store::{LedgerTx, Store, panic_to_error};

/// Stored password_changed_at for users who never changed their password
const NEVER_CHANGED_SECS: i64 = -62_135_596_800; // 0001-01-01T00:00:00Z

struct AccountRow {
    account: Account,
    lock: Arc<tokio::sync::Mutex<()>>,
}

#[cfg(test)]
#[derive(Default)]
struct Faults {
    fail_balance_update: Option<i64>,
    fail_commit: bool,
    fail_rollback: bool,
}

#[derive(Default)]
struct MemoryState {
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    users: DashMap<String, User>,
    accounts: DashMap<i64, AccountRow>,
    entries: DashMap<i64, Entry>,
    transfers: DashMap<i64, Transfer>,
    /// Serializes publication of committed writes
    commit_lock: Mutex<()>,
    #[cfg(test)]
    faults: Mutex<Faults>,
}

#[cfg(test)]
impl MemoryState {
    fn fails_balance_update(&self, account_id: i64) -> bool {
        self.faults.lock().unwrap().fail_balance_update == Some(account_id)
    }

    fn fails_commit(&self) -> bool {
        self.faults.lock().unwrap().fail_commit
    }

    fn fails_rollback(&self) -> bool {
        self.faults.lock().unwrap().fail_rollback
    }
}

#[cfg(not(test))]
impl MemoryState {
    fn fails_balance_update(&self, _account_id: i64) -> bool {
        false
    }

    fn fails_commit(&self) -> bool {
        false
    }

    fn fails_rollback(&self) -> bool {
        false
    }
}

/// Ledger store held entirely in memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed transfer rows
    pub fn transfer_count(&self) -> usize {
        self.state.transfers.len()
    }

    /// Committed entry rows
    pub fn entry_count(&self) -> usize {
        self.state.entries.len()
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Make `add_account_balance` on `account_id` fail as if the store went away
    pub fn set_fail_balance_update(&self, account_id: Option<i64>) {
        self.state.faults.lock().unwrap().fail_balance_update = account_id;
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.state.faults.lock().unwrap().fail_commit = fail;
    }

    pub fn set_fail_rollback(&self, fail: bool) {
        self.state.faults.lock().unwrap().fail_rollback = fail;
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn exec_tx<T, F>(&self, unit: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn LedgerTx) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
    {
        let mut tx = MemoryTx::new(&self.state);

        let outcome = {
            let handle: &mut dyn LedgerTx = &mut tx;
            AssertUnwindSafe(unit(handle)).catch_unwind().await
        };

        let err = match outcome {
            Ok(Ok(value)) => {
                tx.commit()?;
                return Ok(value);
            }
            Ok(Err(e)) => e,
            Err(panic) => panic_to_error(panic),
        };

        if let Err(rb) = tx.rollback() {
            error!(error = %err, rollback_error = %rb, "Failed to rollback transaction");
            return Err(LedgerError::RollbackFailed {
                source: Box::new(err),
                rollback: rb.to_string(),
            });
        }

        debug!(error = %err, "Transaction rolled back");
        Err(err)
    }
}

/// One open in-memory transaction
///
/// Dropping it without commit discards every pending write and releases
/// the row locks, which is exactly a rollback.
struct MemoryTx<'s> {
    state: &'s MemoryState,
    row_locks: HashMap<i64, OwnedMutexGuard<()>>,
    /// Latest in-transaction value of locked, pre-existing accounts
    dirty: HashMap<i64, Account>,
    deleted: HashSet<i64>,
    new_users: Vec<User>,
    new_accounts: BTreeMap<i64, Account>,
    new_entries: Vec<Entry>,
    new_transfers: Vec<Transfer>,
}

impl<'s> MemoryTx<'s> {
    fn new(state: &'s MemoryState) -> Self {
        Self {
            state,
            row_locks: HashMap::new(),
            dirty: HashMap::new(),
            deleted: HashSet::new(),
            new_users: Vec::new(),
            new_accounts: BTreeMap::new(),
            new_entries: Vec::new(),
            new_transfers: Vec::new(),
        }
    }

    fn committed_account(&self, id: i64) -> Option<Account> {
        self.state.accounts.get(&id).map(|row| row.account.clone())
    }

    /// Account as seen from inside this transaction
    fn visible_account(&self, id: i64) -> Option<Account> {
        if self.deleted.contains(&id) {
            return None;
        }
        if let Some(account) = self.new_accounts.get(&id) {
            return Some(account.clone());
        }
        if let Some(account) = self.dirty.get(&id) {
            return Some(account.clone());
        }
        self.committed_account(id)
    }

    fn user_exists(&self, username: &str) -> bool {
        self.state.users.contains_key(username)
            || self.new_users.iter().any(|u| u.username == username)
    }

    /// Take the row lock of a committed account, waiting for its holder
    async fn lock_row(&mut self, id: i64) -> Result<(), LedgerError> {
        if self.row_locks.contains_key(&id) {
            return Ok(());
        }

        let lock = match self.state.accounts.get(&id) {
            Some(row) => row.lock.clone(),
            None => return Err(LedgerError::AccountNotFound(id)),
        };

        let guard = lock.lock_owned().await;

        // The previous holder may have deleted the row
        if !self.state.accounts.contains_key(&id) {
            return Err(LedgerError::AccountNotFound(id));
        }

        self.row_locks.insert(id, guard);
        Ok(())
    }

    /// Lock `id` and return its current in-transaction value
    async fn lock_account(&mut self, id: i64) -> Result<Account, LedgerError> {
        if self.deleted.contains(&id) {
            return Err(LedgerError::AccountNotFound(id));
        }
        if let Some(account) = self.new_accounts.get(&id) {
            return Ok(account.clone());
        }

        self.lock_row(id).await?;

        match self.dirty.get(&id) {
            Some(account) => Ok(account.clone()),
            None => self
                .committed_account(id)
                .ok_or(LedgerError::AccountNotFound(id)),
        }
    }

    fn write_account(&mut self, account: Account) {
        match self.new_accounts.get_mut(&account.id) {
            Some(slot) => *slot = account,
            None => {
                self.dirty.insert(account.id, account);
            }
        }
    }

    fn is_referenced(&self, account_id: i64) -> bool {
        let refs_entry = |e: &Entry| e.account_id == account_id;
        let refs_transfer =
            |t: &Transfer| t.from_account_id == account_id || t.to_account_id == account_id;

        self.new_entries.iter().any(refs_entry)
            || self.new_transfers.iter().any(refs_transfer)
            || self.state.entries.iter().any(|e| refs_entry(e.value()))
            || self.state.transfers.iter().any(|t| refs_transfer(t.value()))
    }

    fn commit(self) -> Result<(), LedgerError> {
        if self.state.fails_commit() {
            return Err(LedgerError::TransactionFailure(
                "commit: connection lost".to_string(),
            ));
        }

        let _publish = self.state.commit_lock.lock().unwrap();

        // Concurrent transactions may have committed the same keys meanwhile
        for user in &self.new_users {
            if self.state.users.contains_key(&user.username) {
                return Err(constraint("users_pkey", "duplicate username"));
            }
            if self.state.users.iter().any(|u| u.email == user.email) {
                return Err(constraint("users_email_key", "duplicate email"));
            }
        }

        // ...or deleted rows this transaction points at
        let gone = |id: i64| {
            !self.new_accounts.contains_key(&id) && !self.state.accounts.contains_key(&id)
        };
        for entry in &self.new_entries {
            if gone(entry.account_id) {
                return Err(constraint("entries_account_id_fkey", "account does not exist"));
            }
        }
        for transfer in &self.new_transfers {
            if gone(transfer.from_account_id) {
                return Err(constraint(
                    "transfers_from_account_id_fkey",
                    "source account does not exist",
                ));
            }
            if gone(transfer.to_account_id) {
                return Err(constraint(
                    "transfers_to_account_id_fkey",
                    "destination account does not exist",
                ));
            }
        }
        // ...or referenced rows this transaction deletes
        for id in &self.deleted {
            if self.is_referenced(*id) {
                return Err(constraint(
                    "entries_account_id_fkey",
                    "account is still referenced",
                ));
            }
        }
        for account in self.new_accounts.values() {
            let taken = self.state.accounts.iter().any(|row| {
                !self.deleted.contains(row.key())
                    && row.account.owner == account.owner
                    && row.account.currency == account.currency
            });
            if taken {
                return Err(constraint("owner_currency_key", "duplicate owner and currency"));
            }
        }

        for user in self.new_users {
            self.state.users.insert(user.username.clone(), user);
        }
        for (id, account) in self.new_accounts {
            self.state.accounts.insert(
                id,
                AccountRow {
                    account,
                    lock: Arc::new(tokio::sync::Mutex::new(())),
                },
            );
        }
        for (id, account) in self.dirty {
            if let Some(mut row) = self.state.accounts.get_mut(&id) {
                row.account = account;
            }
        }
        for id in &self.deleted {
            self.state.accounts.remove(id);
        }
        for entry in self.new_entries {
            self.state.entries.insert(entry.id, entry);
        }
        for transfer in self.new_transfers {
            self.state.transfers.insert(transfer.id, transfer);
        }

        // row locks are released when `self.row_locks` drops here
        Ok(())
    }

    fn rollback(self) -> Result<(), LedgerError> {
        if self.state.fails_rollback() {
            return Err(LedgerError::StoreUnavailable(
                "rollback: connection lost".to_string(),
            ));
        }
        Ok(())
    }
}

fn constraint(name: &str, message: &str) -> LedgerError {
    LedgerError::ConstraintViolation {
        constraint: name.to_string(),
        message: message.to_string(),
    }
}

fn page<T>(mut rows: Vec<T>, limit: i64, offset: i64) -> Result<Vec<T>, LedgerError> {
    if limit < 0 || offset < 0 {
        return Err(LedgerError::Database(
            "LIMIT/OFFSET must not be negative".to_string(),
        ));
    }
    let offset = (offset as usize).min(rows.len());
    rows.drain(..offset);
    rows.truncate(limit as usize);
    Ok(rows)
}

#[async_trait]
impl<'s> LedgerTx for MemoryTx<'s> {
    async fn create_user(&mut self, params: CreateUserParams) -> Result<User, LedgerError> {
        if self.user_exists(&params.username) {
            return Err(constraint("users_pkey", "duplicate username"));
        }
        let email_taken = self.state.users.iter().any(|u| u.email == params.email)
            || self.new_users.iter().any(|u| u.email == params.email);
        if email_taken {
            return Err(constraint("users_email_key", "duplicate email"));
        }

        let user = User {
            username: params.username,
            hashed_password: params.hashed_password,
            full_name: params.full_name,
            email: params.email,
            password_changed_at: DateTime::from_timestamp(NEVER_CHANGED_SECS, 0)
                .unwrap_or_default(),
            created_at: Utc::now(),
        };
        self.new_users.push(user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, LedgerError> {
        if let Some(user) = self.new_users.iter().find(|u| u.username == username) {
            return Ok(user.clone());
        }
        self.state
            .users
            .get(username)
            .map(|u| u.value().clone())
            .ok_or_else(|| LedgerError::UserNotFound(username.to_string()))
    }

    async fn create_account(
        &mut self,
        params: CreateAccountParams,
    ) -> Result<Account, LedgerError> {
        if !self.user_exists(&params.owner) {
            return Err(constraint("accounts_owner_fkey", "owner does not exist"));
        }

        let currency = params.currency.as_str();
        let committed_taken = self.state.accounts.iter().any(|row| {
            !self.deleted.contains(row.key())
                && row.account.owner == params.owner
                && row.account.currency == currency
        });
        let pending_taken = self
            .new_accounts
            .values()
            .any(|a| a.owner == params.owner && a.currency == currency);
        if committed_taken || pending_taken {
            return Err(constraint("owner_currency_key", "duplicate owner and currency"));
        }

        let account = Account {
            id: self.state.account_seq.fetch_add(1, Ordering::SeqCst) + 1,
            owner: params.owner,
            balance: params.balance,
            currency: currency.to_string(),
            created_at: Utc::now(),
        };
        self.new_accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, LedgerError> {
        self.visible_account(id)
            .ok_or(LedgerError::AccountNotFound(id))
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, LedgerError> {
        self.lock_account(id).await
    }

    async fn list_accounts(
        &mut self,
        params: ListAccountsParams,
    ) -> Result<Vec<Account>, LedgerError> {
        let mut ids: Vec<i64> = self
            .state
            .accounts
            .iter()
            .map(|row| *row.key())
            .chain(self.new_accounts.keys().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let rows = ids
            .into_iter()
            .filter_map(|id| self.visible_account(id))
            .filter(|a| a.owner == params.owner)
            .collect();
        page(rows, params.limit, params.offset)
    }

    async fn update_account(
        &mut self,
        params: UpdateAccountParams,
    ) -> Result<Account, LedgerError> {
        let mut account = self.lock_account(params.id).await?;
        account.balance = params.balance;
        self.write_account(account.clone());
        Ok(account)
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, LedgerError> {
        if self.state.fails_balance_update(params.id) {
            return Err(LedgerError::StoreUnavailable(format!(
                "connection lost while updating account {}",
                params.id
            )));
        }

        let mut account = self.lock_account(params.id).await?;
        account.balance = account
            .balance
            .checked_add(params.amount)
            .ok_or_else(|| LedgerError::Database("bigint out of range".to_string()))?;
        self.write_account(account.clone());
        Ok(account)
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), LedgerError> {
        // Lock before looking for references so in-flight writers finish first
        self.lock_account(id).await?;
        if self.is_referenced(id) {
            return Err(constraint(
                "entries_account_id_fkey",
                "account is still referenced",
            ));
        }

        if self.new_accounts.remove(&id).is_none() {
            self.dirty.remove(&id);
            self.deleted.insert(id);
        }
        Ok(())
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, LedgerError> {
        if self.visible_account(params.account_id).is_none() {
            return Err(constraint("entries_account_id_fkey", "account does not exist"));
        }

        let entry = Entry {
            id: self.state.entry_seq.fetch_add(1, Ordering::SeqCst) + 1,
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.new_entries.push(entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError> {
        if let Some(entry) = self.new_entries.iter().find(|e| e.id == id) {
            return Ok(entry.clone());
        }
        self.state
            .entries
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(LedgerError::EntryNotFound(id))
    }

    async fn list_entries(
        &mut self,
        params: ListEntriesParams,
    ) -> Result<Vec<Entry>, LedgerError> {
        let mut rows: Vec<Entry> = self
            .state
            .entries
            .iter()
            .map(|e| e.value().clone())
            .chain(self.new_entries.iter().cloned())
            .filter(|e| e.account_id == params.account_id)
            .collect();
        rows.sort_by_key(|e| e.id);
        page(rows, params.limit, params.offset)
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, LedgerError> {
        if params.amount <= 0 {
            return Err(constraint("transfers_amount_check", "amount must be positive"));
        }
        if self.visible_account(params.from_account_id).is_none() {
            return Err(constraint(
                "transfers_from_account_id_fkey",
                "source account does not exist",
            ));
        }
        if self.visible_account(params.to_account_id).is_none() {
            return Err(constraint(
                "transfers_to_account_id_fkey",
                "destination account does not exist",
            ));
        }

        let transfer = Transfer {
            id: self.state.transfer_seq.fetch_add(1, Ordering::SeqCst) + 1,
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.new_transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError> {
        if let Some(transfer) = self.new_transfers.iter().find(|t| t.id == id) {
            return Ok(transfer.clone());
        }
        self.state
            .transfers
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or(LedgerError::TransferNotFound(id))
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, LedgerError> {
        let mut rows: Vec<Transfer> = self
            .state
            .transfers
            .iter()
            .map(|t| t.value().clone())
            .chain(self.new_transfers.iter().cloned())
            .filter(|t| {
                t.from_account_id == params.from_account_id
                    || t.to_account_id == params.to_account_id
            })
            .collect();
        rows.sort_by_key(|t| t.id);
        page(rows, params.limit, params.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;
    use std::time::Duration;

    async fn seed(store: &MemoryStore, owner: &str, balance: i64) -> Account {
        let _ = store
            .create_user(CreateUserParams {
                username: owner.to_string(),
                hashed_password: "secret-hash".to_string(),
                full_name: owner.to_uppercase(),
                email: format!("{}@example.com", owner),
            })
            .await;
        store
            .create_account(CreateAccountParams {
                owner: owner.to_string(),
                balance,
                currency: Currency::Usd,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_private() {
        let store = MemoryStore::new();
        let account = seed(&store, "alice", 100).await;

        let (tx_started, started) = tokio::sync::oneshot::channel::<()>();
        let (release, tx_release) = tokio::sync::oneshot::channel::<()>();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .exec_tx(move |q| {
                        async move {
                            q.add_account_balance(AddAccountBalanceParams {
                                id: account.id,
                                amount: 50,
                            })
                            .await?;
                            let _ = tx_started.send(());
                            let _ = tx_release.await;
                            Ok::<_, LedgerError>(())
                        }
                        .boxed()
                    })
                    .await
            })
        };

        started.await.unwrap();
        // Not yet committed: readers see the old balance without blocking
        assert_eq!(store.get_account(account.id).await.unwrap().balance, 100);

        release.send(()).unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(store.get_account(account.id).await.unwrap().balance, 150);
    }

    #[tokio::test]
    async fn test_row_lock_blocks_second_writer() {
        let store = MemoryStore::new();
        let account = seed(&store, "bob", 0).await;

        let (tx_locked, locked) = tokio::sync::oneshot::channel::<()>();
        let (release, tx_release) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .exec_tx(move |q| {
                        async move {
                            q.get_account_for_update(account.id).await?;
                            let _ = tx_locked.send(());
                            let _ = tx_release.await;
                            q.add_account_balance(AddAccountBalanceParams {
                                id: account.id,
                                amount: 1,
                            })
                            .await
                        }
                        .boxed()
                    })
                    .await
            })
        };
        locked.await.unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .exec_tx(move |q| {
                        async move {
                            q.add_account_balance(AddAccountBalanceParams {
                                id: account.id,
                                amount: 10,
                            })
                            .await
                        }
                        .boxed()
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "second writer must wait for the row lock");

        release.send(()).unwrap();
        assert_eq!(holder.await.unwrap().unwrap().balance, 1);
        assert_eq!(waiter.await.unwrap().unwrap().balance, 11);
    }

    #[tokio::test]
    async fn test_foreign_keys_and_uniqueness() {
        let store = MemoryStore::new();
        let account = seed(&store, "carol", 10).await;

        let err = store
            .create_account(CreateAccountParams {
                owner: "carol".to_string(),
                balance: 0,
                currency: Currency::Usd,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation { ref constraint, .. } if constraint == "owner_currency_key"));

        let err = store
            .create_account(CreateAccountParams {
                owner: "nobody".to_string(),
                balance: 0,
                currency: Currency::Eur,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation { .. }));

        let err = store
            .exec_tx(move |q| {
                async move {
                    q.create_entry(CreateEntryParams {
                        account_id: account.id + 1000,
                        amount: 5,
                    })
                    .await
                }
                .boxed()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn test_delete_referenced_account_is_rejected() {
        let store = MemoryStore::new();
        let account = seed(&store, "dave", 10).await;

        store
            .exec_tx(move |q| {
                async move {
                    q.create_entry(CreateEntryParams {
                        account_id: account.id,
                        amount: 10,
                    })
                    .await
                }
                .boxed()
            })
            .await
            .unwrap();

        let err = store
            .exec_tx(move |q| async move { q.delete_account(account.id).await }.boxed())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation { .. }));
        assert!(store.get_account(account.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_entry_on_concurrently_deleted_account_fails_commit() {
        let store = MemoryStore::new();
        let account = seed(&store, "gina", 0).await;

        let (tx_inserted, inserted) = tokio::sync::oneshot::channel::<()>();
        let (release, tx_release) = tokio::sync::oneshot::channel::<()>();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .exec_tx(move |q| {
                        async move {
                            let entry = q
                                .create_entry(CreateEntryParams {
                                    account_id: account.id,
                                    amount: 10,
                                })
                                .await?;
                            let _ = tx_inserted.send(());
                            let _ = tx_release.await;
                            Ok::<_, LedgerError>(entry)
                        }
                        .boxed()
                    })
                    .await
            })
        };

        inserted.await.unwrap();
        store
            .exec_tx(move |q| async move { q.delete_account(account.id).await }.boxed())
            .await
            .unwrap();

        release.send(()).unwrap();
        let err = writer.await.unwrap().unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation { ref constraint, .. } if constraint == "entries_account_id_fkey"));
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_fails_commit_when_entry_lands_first() {
        let store = MemoryStore::new();
        let account = seed(&store, "hank", 0).await;

        let (tx_deleted, deleted) = tokio::sync::oneshot::channel::<()>();
        let (release, tx_release) = tokio::sync::oneshot::channel::<()>();

        let deleter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .exec_tx(move |q| {
                        async move {
                            q.delete_account(account.id).await?;
                            let _ = tx_deleted.send(());
                            let _ = tx_release.await;
                            Ok::<_, LedgerError>(())
                        }
                        .boxed()
                    })
                    .await
            })
        };

        deleted.await.unwrap();
        // The delete is not committed yet, so the account is still visible
        store
            .exec_tx(move |q| {
                async move {
                    q.create_entry(CreateEntryParams {
                        account_id: account.id,
                        amount: 10,
                    })
                    .await
                }
                .boxed()
            })
            .await
            .unwrap();

        release.send(()).unwrap();
        let err = deleter.await.unwrap().unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation { .. }));
        assert!(store.get_account(account.id).await.is_ok());
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_waits_for_in_flight_transfer() {
        let store = MemoryStore::new();
        let from = seed(&store, "ivy", 50).await;
        let to = seed(&store, "jack", 0).await;
        let (from_id, to_id) = (from.id, to.id);

        let (tx_locked, locked) = tokio::sync::oneshot::channel::<()>();
        let (release, tx_release) = tokio::sync::oneshot::channel::<()>();

        let transfer = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .exec_tx(move |q| {
                        async move {
                            q.create_transfer(CreateTransferParams {
                                from_account_id: from_id,
                                to_account_id: to_id,
                                amount: 20,
                            })
                            .await?;
                            q.add_account_balance(AddAccountBalanceParams {
                                id: to_id,
                                amount: 20,
                            })
                            .await?;
                            let _ = tx_locked.send(());
                            let _ = tx_release.await;
                            Ok::<_, LedgerError>(())
                        }
                        .boxed()
                    })
                    .await
            })
        };

        locked.await.unwrap();
        let deleter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .exec_tx(move |q| async move { q.delete_account(to_id).await }.boxed())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!deleter.is_finished(), "delete must wait for the row lock");

        release.send(()).unwrap();
        transfer.await.unwrap().unwrap();
        let err = deleter.await.unwrap().unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation { .. }));
        assert_eq!(store.get_account(to_id).await.unwrap().balance, 20);
    }

    #[tokio::test]
    async fn test_concurrent_users_with_same_email() {
        let store = MemoryStore::new();

        let (tx_created, created) = tokio::sync::oneshot::channel::<()>();
        let (release, tx_release) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .exec_tx(move |q| {
                        async move {
                            let user = q
                                .create_user(CreateUserParams {
                                    username: "kate".to_string(),
                                    hashed_password: "secret-hash".to_string(),
                                    full_name: "Kate".to_string(),
                                    email: "shared@example.com".to_string(),
                                })
                                .await?;
                            let _ = tx_created.send(());
                            let _ = tx_release.await;
                            Ok::<_, LedgerError>(user)
                        }
                        .boxed()
                    })
                    .await
            })
        };

        created.await.unwrap();
        store
            .create_user(CreateUserParams {
                username: "liam".to_string(),
                hashed_password: "secret-hash".to_string(),
                full_name: "Liam".to_string(),
                email: "shared@example.com".to_string(),
            })
            .await
            .unwrap();

        release.send(()).unwrap();
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation { ref constraint, .. } if constraint == "users_email_key"));

        let err = store
            .exec_tx(|q| async move { q.get_user("kate").await }.boxed())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::UserNotFound("kate".to_string()));
    }

    #[tokio::test]
    async fn test_lookups_and_update() {
        let store = MemoryStore::new();
        let from = seed(&store, "erin", 40).await;
        let to = seed(&store, "frank", 0).await;
        let (from_id, to_id) = (from.id, to.id);

        let (transfer, entry, user) = store
            .exec_tx(move |q| {
                async move {
                    let transfer = q
                        .create_transfer(CreateTransferParams {
                            from_account_id: from_id,
                            to_account_id: to_id,
                            amount: 15,
                        })
                        .await?;
                    let entry = q
                        .create_entry(CreateEntryParams {
                            account_id: from_id,
                            amount: -15,
                        })
                        .await?;
                    // own writes are visible inside the tx
                    assert_eq!(q.get_transfer(transfer.id).await?, transfer);
                    let user = q.get_user("erin").await?;
                    Ok::<_, LedgerError>((transfer, entry, user))
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(user.email, "erin@example.com");

        let (t, e) = store
            .exec_tx(move |q| {
                async move {
                    let t = q.get_transfer(transfer.id).await?;
                    let e = q.get_entry(entry.id).await?;
                    Ok::<_, LedgerError>((t, e))
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(t.amount, 15);
        assert_eq!(e.account_id, from_id);

        let updated = store
            .exec_tx(move |q| {
                async move {
                    let locked = q.get_account_for_update(to_id).await?;
                    q.update_account(UpdateAccountParams {
                        id: locked.id,
                        balance: locked.balance + 99,
                    })
                    .await
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(updated.balance, 99);
        assert_eq!(store.get_account(to_id).await.unwrap().balance, 99);

        let err = store
            .exec_tx(|q| async move { q.get_user("nobody").await }.boxed())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::UserNotFound("nobody".to_string()));
        let err = store
            .exec_tx(|q| async move { q.get_entry(12345).await }.boxed())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::EntryNotFound(12345));
    }

    #[tokio::test]
    async fn test_rollback_failure_reports_both_errors() {
        let store = MemoryStore::new();
        store.set_fail_rollback(true);

        let err = store
            .exec_tx(|q| async move { q.get_account(999).await }.boxed())
            .await
            .unwrap_err();

        match err {
            LedgerError::RollbackFailed { source, rollback } => {
                assert_eq!(*source, LedgerError::AccountNotFound(999));
                assert!(rollback.contains("rollback"));
            }
            other => panic!("expected RollbackFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_page_bounds() {
        let rows: Vec<i32> = (1..=10).collect();
        assert_eq!(page(rows.clone(), 3, 0).unwrap(), vec![1, 2, 3]);
        assert_eq!(page(rows.clone(), 5, 8).unwrap(), vec![9, 10]);
        assert!(page(rows.clone(), 5, 20).unwrap().is_empty());
        assert!(page(rows, -1, 0).is_err());
    }
}

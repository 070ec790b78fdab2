//! PostgreSQL ledger store
//!
//! Row locks come from PostgreSQL itself: `UPDATE ... RETURNING` locks the
//! updated row and `SELECT ... FOR NO KEY UPDATE` locks without blocking
//! foreign-key checks from concurrent entry/transfer inserts. Both are held
//! until the surrounding transaction ends.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, error, warn};

use super::error::LedgerError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, UpdateAccountParams, User,
};
use super::store::{LedgerTx, Store, panic_to_error};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str =
    "username, hashed_password, full_name, email, password_changed_at, created_at";

/// Ledger store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn exec_tx<T, F>(&self, unit: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn LedgerTx) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let outcome = {
            let mut queries = PgQueries { conn: &mut *tx };
            let handle: &mut dyn LedgerTx = &mut queries;
            AssertUnwindSafe(unit(handle)).catch_unwind().await
        };

        let err = match outcome {
            Ok(Ok(value)) => {
                if let Err(e) = tx.commit().await {
                    error!(error = %e, "Failed to commit transaction");
                    return Err(LedgerError::TransactionFailure(format!("commit: {}", e)));
                }
                return Ok(value);
            }
            Ok(Err(e)) => e,
            Err(panic) => panic_to_error(panic),
        };

        if let Err(rb) = tx.rollback().await {
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

/// Queries running on the connection of one open transaction
pub struct PgQueries<'c> {
    conn: &'c mut PgConnection,
}

#[async_trait]
impl<'c> LedgerTx for PgQueries<'c> {
    async fn create_user(&mut self, params: CreateUserParams) -> Result<User, LedgerError> {
        let sql = format!(
            "INSERT INTO users (username, hashed_password, full_name, email) \
             VALUES ($1, $2, $3, $4) RETURNING {}",
            USER_COLUMNS
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(&params.username)
            .bind(&params.hashed_password)
            .bind(&params.full_name)
            .bind(&params.email)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, LedgerError> {
        let sql = format!("SELECT {} FROM users WHERE username = $1", USER_COLUMNS);
        sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(username.to_string()))
    }

    async fn create_account(
        &mut self,
        params: CreateAccountParams,
    ) -> Result<Account, LedgerError> {
        let sql = format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(&params.owner)
            .bind(params.balance)
            .bind(params.currency.as_str())
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, LedgerError> {
        let sql = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
        sqlx::query_as::<_, Account>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, LedgerError> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE id = $1 FOR NO KEY UPDATE",
            ACCOUNT_COLUMNS
        );
        sqlx::query_as::<_, Account>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    async fn list_accounts(
        &mut self,
        params: ListAccountsParams,
    ) -> Result<Vec<Account>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE owner = $1 ORDER BY id LIMIT $2 OFFSET $3",
            ACCOUNT_COLUMNS
        );
        let accounts = sqlx::query_as::<_, Account>(&sql)
            .bind(&params.owner)
            .bind(params.limit)
            .bind(params.offset)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(accounts)
    }

    async fn update_account(
        &mut self,
        params: UpdateAccountParams,
    ) -> Result<Account, LedgerError> {
        let sql = format!(
            "UPDATE accounts SET balance = $2 WHERE id = $1 RETURNING {}",
            ACCOUNT_COLUMNS
        );
        sqlx::query_as::<_, Account>(&sql)
            .bind(params.id)
            .bind(params.balance)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(LedgerError::AccountNotFound(params.id))
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, LedgerError> {
        let sql = format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {}",
            ACCOUNT_COLUMNS
        );
        sqlx::query_as::<_, Account>(&sql)
            .bind(params.amount)
            .bind(params.id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(LedgerError::AccountNotFound(params.id))
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), LedgerError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        if result.rows_affected() == 0 {
            warn!(account_id = id, "Delete of missing account");
            return Err(LedgerError::AccountNotFound(id));
        }
        Ok(())
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, LedgerError> {
        let sql = format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {}",
            ENTRY_COLUMNS
        );
        let entry = sqlx::query_as::<_, Entry>(&sql)
            .bind(params.account_id)
            .bind(params.amount)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError> {
        let sql = format!("SELECT {} FROM entries WHERE id = $1", ENTRY_COLUMNS);
        sqlx::query_as::<_, Entry>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(LedgerError::EntryNotFound(id))
    }

    async fn list_entries(
        &mut self,
        params: ListEntriesParams,
    ) -> Result<Vec<Entry>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3",
            ENTRY_COLUMNS
        );
        let entries = sqlx::query_as::<_, Entry>(&sql)
            .bind(params.account_id)
            .bind(params.limit)
            .bind(params.offset)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(entries)
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, LedgerError> {
        let sql = format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) \
             VALUES ($1, $2, $3) RETURNING {}",
            TRANSFER_COLUMNS
        );
        let transfer = sqlx::query_as::<_, Transfer>(&sql)
            .bind(params.from_account_id)
            .bind(params.to_account_id)
            .bind(params.amount)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError> {
        let sql = format!("SELECT {} FROM transfers WHERE id = $1", TRANSFER_COLUMNS);
        sqlx::query_as::<_, Transfer>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(LedgerError::TransferNotFound(id))
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $2 \
             ORDER BY id LIMIT $3 OFFSET $4",
            TRANSFER_COLUMNS
        );
        let transfers = sqlx::query_as::<_, Transfer>(&sql)
            .bind(params.from_account_id)
            .bind(params.to_account_id)
            .bind(params.limit)
            .bind(params.offset)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(transfers)
    }
}

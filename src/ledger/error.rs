//! Ledger error types
//!
//! Every store and engine operation returns [`LedgerError`]. Upstream
//! handlers translate it with [`LedgerError::code`] and
//! [`LedgerError::http_status`]; the ledger itself never retries.

use thiserror::Error;

/// Coarse classification used by callers to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    ConstraintViolation,
    TransactionFailure,
    StoreUnavailable,
    /// Request rejected by the engine before or during the transfer
    Rejected,
    Internal,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // === Not Found ===
    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(i64),

    #[error("Transfer not found: {0}")]
    TransferNotFound(i64),

    // === Engine Rejections ===
    #[error("Source and destination account cannot be the same")]
    SameAccount,

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Insufficient balance on account {account_id}: balance would become {balance}")]
    InsufficientBalance { account_id: i64, balance: i64 },

    // === Store Errors ===
    #[error("Constraint violation ({constraint}): {message}")]
    ConstraintViolation { constraint: String, message: String },

    #[error("Transaction failure: {0}")]
    TransactionFailure(String),

    #[error("tx err: {source}, rb err: {rollback}")]
    RollbackFailed {
        #[source]
        source: Box<LedgerError>,
        rollback: String,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Context added by the transfer engine: which step failed
    #[error("{step}: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<LedgerError>,
    },
}

impl LedgerError {
    /// Wrap with the name of the step that failed
    pub fn at(self, step: &'static str) -> Self {
        LedgerError::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The error with step context stripped
    pub fn root(&self) -> &LedgerError {
        match self {
            LedgerError::Step { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::AccountNotFound(_)
            | LedgerError::UserNotFound(_)
            | LedgerError::EntryNotFound(_)
            | LedgerError::TransferNotFound(_) => ErrorKind::NotFound,
            LedgerError::SameAccount
            | LedgerError::InvalidAmount
            | LedgerError::InsufficientBalance { .. } => ErrorKind::Rejected,
            LedgerError::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            LedgerError::TransactionFailure(_) | LedgerError::RollbackFailed { .. } => {
                ErrorKind::TransactionFailure
            }
            LedgerError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            LedgerError::Database(_) => ErrorKind::Internal,
            LedgerError::Step { source, .. } => source.kind(),
        }
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::UserNotFound(_) => "USER_NOT_FOUND",
            LedgerError::EntryNotFound(_) => "ENTRY_NOT_FOUND",
            LedgerError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            LedgerError::SameAccount => "SAME_ACCOUNT",
            LedgerError::InvalidAmount => "INVALID_AMOUNT",
            LedgerError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            LedgerError::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            LedgerError::TransactionFailure(_) | LedgerError::RollbackFailed { .. } => {
                "TRANSACTION_FAILURE"
            }
            LedgerError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            LedgerError::Database(_) => "DATABASE_ERROR",
            LedgerError::Step { source, .. } => source.code(),
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            // foreign key / unique violations are reported as Forbidden
            ErrorKind::ConstraintViolation => 403,
            ErrorKind::Rejected => match self.root() {
                LedgerError::InsufficientBalance { .. } => 422,
                _ => 400,
            },
            ErrorKind::StoreUnavailable => 503,
            ErrorKind::TransactionFailure | ErrorKind::Internal => 500,
        }
    }
}

/// Map a PostgreSQL SQLSTATE to a ledger error
pub fn classify_sqlstate(code: &str, constraint: Option<&str>, message: &str) -> LedgerError {
    match code {
        // class 23: integrity constraint violation
        c if c.starts_with("23") => LedgerError::ConstraintViolation {
            constraint: constraint.unwrap_or("unknown").to_string(),
            message: message.to_string(),
        },
        // serialization_failure, deadlock_detected
        "40001" | "40P01" => LedgerError::TransactionFailure(message.to_string()),
        // class 08: connection exception; 57P01..03: admin shutdown, crash, cannot connect now
        c if c.starts_with("08") || c.starts_with("57P") => {
            LedgerError::StoreUnavailable(message.to_string())
        }
        _ => LedgerError::Database(format!("{}: {}", code, message)),
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                classify_sqlstate(&code, db.constraint(), db.message())
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => LedgerError::StoreUnavailable(e.to_string()),
            _ => LedgerError::Database(e.to_string()),
        }
    }
}

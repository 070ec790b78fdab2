//! Ledger schema bootstrap
//!
//! Idempotent `CREATE ... IF NOT EXISTS` statements for an empty database.
//! Existing tables are left as they are.

use anyhow::{Context, Result};
use sqlx::PgPool;

const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    username            VARCHAR PRIMARY KEY,
    hashed_password     VARCHAR NOT NULL,
    full_name           VARCHAR NOT NULL,
    email               VARCHAR UNIQUE NOT NULL,
    password_changed_at TIMESTAMPTZ NOT NULL DEFAULT '0001-01-01 00:00:00Z',
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id         BIGSERIAL PRIMARY KEY,
    owner      VARCHAR NOT NULL REFERENCES users (username),
    balance    BIGINT NOT NULL,
    currency   VARCHAR NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT owner_currency_key UNIQUE (owner, currency)
)"#;

const CREATE_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id         BIGSERIAL PRIMARY KEY,
    account_id BIGINT NOT NULL REFERENCES accounts (id),
    amount     BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

const CREATE_TRANSFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id              BIGSERIAL PRIMARY KEY,
    from_account_id BIGINT NOT NULL REFERENCES accounts (id),
    to_account_id   BIGINT NOT NULL REFERENCES accounts (id),
    amount          BIGINT NOT NULL CONSTRAINT transfers_amount_check CHECK (amount > 0),
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

const CREATE_INDEXES: [&str; 5] = [
    "CREATE INDEX IF NOT EXISTS accounts_owner_idx ON accounts (owner)",
    "CREATE INDEX IF NOT EXISTS entries_account_id_idx ON entries (account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_from_account_id_idx ON transfers (from_account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_to_account_id_idx ON transfers (to_account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_from_to_idx ON transfers (from_account_id, to_account_id)",
];

/// Create the ledger tables and indexes if they are missing
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing ledger schema...");

    let tables = [
        ("users", CREATE_USERS_TABLE),
        ("accounts", CREATE_ACCOUNTS_TABLE),
        ("entries", CREATE_ENTRIES_TABLE),
        ("transfers", CREATE_TRANSFERS_TABLE),
    ];

    for (name, ddl) in tables {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create {} table", name))?;
    }

    for ddl in CREATE_INDEXES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create index: {}", ddl))?;
    }

    tracing::info!("Ledger schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_created_in_dependency_order() {
        let users = CREATE_USERS_TABLE;
        let accounts = CREATE_ACCOUNTS_TABLE;
        assert!(accounts.contains("REFERENCES users"));
        assert!(CREATE_ENTRIES_TABLE.contains("REFERENCES accounts"));
        assert!(CREATE_TRANSFERS_TABLE.contains("REFERENCES accounts"));
        assert!(users.contains("IF NOT EXISTS"));
    }

    #[test]
    fn test_constraint_names_match_store_errors() {
        assert!(CREATE_ACCOUNTS_TABLE.contains("owner_currency_key"));
        assert!(CREATE_TRANSFERS_TABLE.contains("transfers_amount_check"));
    }
}

//! Simple Bank - ledger command line
//!
//! ```text
//! simple_bank [--env dev] [--init-schema] [--transfer <from> <to> <amount>]
//! ```
//!
//! Connects to the configured PostgreSQL database, optionally creates the
//! ledger schema, and optionally runs one transfer, printing the result as
//! JSON.

use std::sync::Arc;

use anyhow::{Context, Result, bail};

use simple_bank::config::AppConfig;
use simple_bank::db::{Database, schema};
use simple_bank::ledger::{PgStore, TransferEngine, TransferTxParams};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn use_init_schema() -> bool {
    std::env::args().any(|a| a == "--init-schema")
}

/// `--transfer <from> <to> <amount>`
fn get_transfer_args() -> Result<Option<TransferTxParams>> {
    let args: Vec<String> = std::env::args().collect();
    let Some(pos) = args.iter().position(|a| a == "--transfer") else {
        return Ok(None);
    };
    if pos + 3 >= args.len() {
        bail!("--transfer expects <from> <to> <amount>");
    }

    let parse = |i: usize, name: &str| -> Result<i64> {
        args[i]
            .parse::<i64>()
            .with_context(|| format!("invalid {}: {}", name, args[i]))
    };

    Ok(Some(TransferTxParams {
        from_account_id: parse(pos + 1, "from account id")?,
        to_account_id: parse(pos + 2, "to account id")?,
        amount: parse(pos + 3, "amount")?,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = simple_bank::logging::init_logging(&app_config);

    tracing::info!("Starting simple_bank in {} mode", env);

    let transfer = get_transfer_args()?;

    let db = Database::connect(&app_config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.health_check()
        .await
        .context("PostgreSQL health check failed")?;

    if use_init_schema() {
        schema::init_schema(db.pool()).await?;
    }

    let engine = TransferEngine::new(Arc::new(PgStore::new(db.pool().clone())));

    if let Some(params) = transfer {
        let result = engine.transfer(params).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    Ok(())
}

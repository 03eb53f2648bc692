//! Offline ledger audit: checks every content row against its commitments and
//! exits non-zero when the ledger is inconsistent.

use std::process::ExitCode;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use packledger_infra::LedgerConfig;
use packledger_infra::packages::audit;
use packledger_infra::store::{PackageStore, PostgresPackageStore};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let config = LedgerConfig::load().context("failed to load configuration")?;
    packledger_observability::init_with(&config.logging);

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("failed to connect to the database")?;
    let store = PostgresPackageStore::new(pool);
    store.ensure_schema().await.context("failed to prepare the schema")?;

    let mut uow = store.begin().await?;
    let violations = audit(uow.as_mut()).await?;
    uow.rollback().await?;

    if violations.is_empty() {
        tracing::info!("ledger is consistent");
        return Ok(ExitCode::SUCCESS);
    }
    for violation in &violations {
        println!("{}", serde_json::to_string(violation)?);
    }
    tracing::error!(count = violations.len(), "ledger audit found violations");
    Ok(ExitCode::FAILURE)
}

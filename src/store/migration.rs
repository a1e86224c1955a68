//! Schema migrations for the archive tables.
//!
//! The archive schema is applied once at startup, before any worker opens a
//! connection, so every pooled connection sees the latest tables.

use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations. Already applied migrations are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrateError> {
    log::info!("checking database migration state");

    MIGRATOR.run(pool).await?;

    log::info!("database migrations up to date");
    Ok(())
}

use crate::config::ConfigError;
use crate::provider::ProviderError;
use crate::store::StoreError;
use thiserror::Error;

/// A fixed-size pool or table was asked to hold nothing.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} capacity must be at least 1")]
pub struct ZeroCapacity(pub &'static str);

/// Failures that abort process startup.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Capacity(#[from] ZeroCapacity),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

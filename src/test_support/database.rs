use crate::store::migration::MIGRATOR;
use log::LevelFilter;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool};
use testcontainers::ImageExt;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::{
    ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
};
use thiserror::Error;
use tokio::runtime::Handle;
use uuid::Uuid;

const POSTGRES_TAG: &str = "16-alpine";

#[derive(Debug, Error)]
pub enum TestDatabaseError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("container error: {0}")]
    Container(#[from] TestcontainersError),
}

/// Ephemeral, fully migrated database.
///
/// Created inside a disposable Postgres container, or next to the server
/// named by `TEST_DATABASE_URL` when that is set.
pub struct TestDatabase {
    pool: Option<PgPool>,
    admin_options: PgConnectOptions,
    options: PgConnectOptions,
    database_name: String,
    container: Option<ContainerAsync<Postgres>>,
}

impl TestDatabase {
    pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
        match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => Self::new(&url).await,
            Err(_) => Self::with_container().await,
        }
    }

    /// Launch a disposable Postgres container and provision the database in it.
    pub async fn with_container() -> Result<Self, TestDatabaseError> {
        let container = Postgres::default().with_tag(POSTGRES_TAG).start().await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;
        let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

        let mut database = Self::new(&admin_url).await?;
        database.container = Some(container);
        Ok(database)
    }

    pub async fn new(admin_url: &str) -> Result<Self, TestDatabaseError> {
        let base_options: PgConnectOptions = admin_url.parse()?;
        let base_options = base_options.log_statements(LevelFilter::Off);

        let base_name = base_options
            .get_database()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "postgres".to_string());

        let admin_options = base_options.clone().database("postgres");
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(admin_options.clone())
            .await?;

        let database_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
        let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", database_name);
        sqlx::query(&create_sql).execute(&admin_pool).await?;
        admin_pool.close().await;

        let options = base_options.database(&database_name);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(options.clone())
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self {
            pool: Some(pool),
            admin_options,
            options,
            database_name,
            container: None,
        })
    }

    pub fn pool(&self) -> &PgPool {
        self.pool.as_ref().expect("test database pool is available")
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool().clone()
    }

    /// Options for opening extra connections to this database.
    pub fn connect_options(&self) -> PgConnectOptions {
        self.options.clone()
    }

    /// Close pool connections and drop the ephemeral database.
    pub async fn close(mut self) -> Result<(), TestDatabaseError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }

        drop_database(self.admin_options.clone(), &self.database_name).await?;

        if let Some(container) = self.container.take() {
            drop(container);
        }
        Ok(())
    }
}

async fn drop_database(admin_options: PgConnectOptions, database_name: &str) -> Result<(), sqlx::Error> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(admin_options)
        .await?;

    let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
    match sqlx::query(&drop_force).execute(&admin_pool).await {
        Ok(_) => Ok(()),
        Err(err) if force_drop_unsupported(&err) => {
            let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
            sqlx::query(&drop_sql).execute(&admin_pool).await?;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn force_drop_unsupported(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err
                .code()
                .map(|code| code == "42601" || code == "0A000")
                .unwrap_or(false)
    )
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let admin_options = self.admin_options.clone();
            let database_name = self.database_name.clone();
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(async move {
                    pool.close().await;
                    let _ = drop_database(admin_options, &database_name).await;
                });
            }
        }
    }
}

use crate::config::DatabaseConfig;
use sqlx::migrate::Migrator;
use sqlx::{postgres::PgPoolOptions, PgPool};
use thiserror::Error;
use tracing::{debug, info};

/// Migrations compiled into the binary
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Tables the repositories read and write
pub const REQUIRED_TABLES: &[&str] = &[
    "group_purchases",
    "basket_lines",
    "participants",
    "status_transitions",
    "settlement_records",
    "wallet_balances",
    "wallet_transactions",
    "bank_card_payouts",
];

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to create database pool: {0}")]
    PoolCreation(sqlx::Error),

    #[error("Database query error: {0}")]
    QueryError(sqlx::Error),

    #[error("Database connection timeout")]
    ConnectionTimeout,

    #[error("Database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Schema is missing table {0}")]
    MissingTable(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => DatabaseError::ConnectionTimeout,
            other => DatabaseError::QueryError(other),
        }
    }
}

/// Open the pool and make sure Postgres answers before handing it out.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
    if config.url.is_empty() {
        return Err(DatabaseError::Config("database url is empty".to_string()));
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .idle_timeout(config.idle_timeout())
        .max_lifetime(config.max_lifetime())
        .test_before_acquire(config.test_before_acquire)
        .connect(&config.url)
        .await
        .map_err(DatabaseError::PoolCreation)?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(DatabaseError::PoolCreation)?;

    debug!(max_connections = config.max_connections, "Postgres pool open");
    Ok(pool)
}

/// Apply migrations. With no path the embedded set is used; a path loads
/// them from disk instead (useful when iterating on the schema).
pub async fn run_migrations(pool: &PgPool, migrations_path: Option<&str>) -> Result<(), DatabaseError> {
    match migrations_path {
        Some(path) => {
            let migrator = Migrator::new(std::path::Path::new(path)).await?;
            migrator.run(pool).await?;
        }
        None => MIGRATOR.run(pool).await?,
    }

    verify_schema(pool).await?;
    info!(tables = REQUIRED_TABLES.len(), "Schema up to date");
    Ok(())
}

/// Fail fast when a table the repositories depend on is absent.
pub async fn verify_schema(pool: &PgPool) -> Result<(), DatabaseError> {
    for table in REQUIRED_TABLES {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_name = $1)",
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            return Err(DatabaseError::MissingTable(table.to_string()));
        }
    }
    Ok(())
}

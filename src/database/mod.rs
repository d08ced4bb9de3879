//! Postgres connection pool and migrations

mod pool;

pub use pool::{create_pool, run_migrations, verify_schema, DatabaseError, REQUIRED_TABLES};

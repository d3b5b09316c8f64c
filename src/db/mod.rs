//! SQLite storage for the auth core.
//!
//! The whole store lives in a single database file. Opening it runs schema
//! setup/migrations and any caller-supplied startup SQL; every pooled
//! connection enforces foreign keys so the cascade edges in the schema
//! actually fire.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

pub mod migrations;
pub mod schema;

use crate::auth::{AuthError, AuthResult};

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (and create or migrate, if needed) the database at the given
    /// path, then run the caller-supplied startup queries.
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidDatabasePath` - Parent directory missing
    /// * `AuthError::UnexpectedSchemaVersion` - Database is from a newer build
    pub async fn open(filename: &Path, startup_queries: &str) -> AuthResult<Self> {
        // Check the parent directory up front for a friendly error message
        if let Some(parent) = filename.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(AuthError::InvalidDatabasePath(parent.display().to_string()));
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(filename)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        migrations::setup(&pool).await?;
        if !startup_queries.trim().is_empty() {
            debug!("Running startup queries");
            sqlx::raw_sql(startup_queries).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check if the database connection is healthy
    pub async fn health_check(&self) -> AuthResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

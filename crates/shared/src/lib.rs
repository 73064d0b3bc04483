//! Teamzones Shared
//!
//! Database plumbing shared by the API server and the background worker.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Create the connection pool used for regular queries
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Apply the embedded migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

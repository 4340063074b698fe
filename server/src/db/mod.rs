//! Database initialization and migration runner.
//!
//! SYSTEM CONTEXT
//! ==============
//! Startup creates the shared SQLx pool here and applies the chat schema
//! before the websocket endpoint accepts traffic. Without `DATABASE_URL`
//! the server runs on the in-memory store and never touches this module.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

//! SQLite audit store.
//!
//! The database is for audit purposes only and is never read by business
//! logic. Concurrent inserts from many workers are serialized by SQLite
//! itself; a "database is locked" answer is retried with exponential
//! backoff.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use eyre::{Result, WrapErr};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

pub mod models;

pub use models::*;

/// Create the audit database connection pool, creating the file on first
/// run.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .wrap_err("Invalid DATABASE_URL")?
        .create_if_missing(true);
    // an in-memory database exists per connection, so it must not be pooled
    let max_connections = if database_url.contains(":memory:") { 1 } else { 10 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .wrap_err("Failed to connect to audit database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

fn is_locked(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("database is locked"))
}

/// Retry an insert until SQLite stops reporting a lock. Backoff grows
/// exponentially and caps near eight hundred seconds.
async fn with_locked_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut pause: i32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_locked(&err) => {
                tracing::warn!(error = %err, pause, "audit database locked, retrying");
                tokio::time::sleep(Duration::from_secs_f64(0.1 * 2f64.powi(pause))).await;
                if pause < 13 {
                    pause += 1;
                }
            }
            Err(err) => return Err(err).wrap_err("audit insert failed"),
        }
    }
}

/// Insert a deposit audit row.
pub async fn insert_deposit(pool: &SqlitePool, row: &NewDeposit) -> Result<i64> {
    with_locked_retry(|| async {
        let done = sqlx::query(
            r#"
            INSERT INTO deposits (msg, unix, event_unix, date, year, month, network,
                session_unix, session_date, req_params, nonce, event_id, uia,
                client_id, amount, account_idx, required_memo, deposit_address)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.msg)
        .bind(row.unix)
        .bind(row.event_unix)
        .bind(&row.date)
        .bind(row.year)
        .bind(row.month)
        .bind(&row.network)
        .bind(row.session_unix)
        .bind(&row.session_date)
        .bind(&row.req_params)
        .bind(row.nonce)
        .bind(&row.event_id)
        .bind(&row.uia)
        .bind(&row.client_id)
        .bind(row.amount)
        .bind(row.account_idx)
        .bind(&row.required_memo)
        .bind(&row.deposit_address)
        .execute(pool)
        .await?;
        Ok(done.last_insert_rowid())
    })
    .await
}

/// Insert a withdrawal audit row.
pub async fn insert_withdrawal(pool: &SqlitePool, row: &NewWithdrawal) -> Result<i64> {
    with_locked_retry(|| async {
        let done = sqlx::query(
            r#"
            INSERT INTO withdrawals (msg, unix, event_unix, date, year, month, network,
                session_unix, session_date, op, nonce, uia_id, event_id,
                withdrawal_amount, gateway_address, client_address, client_id,
                account_idx, tx_id, order_public, order_to, order_quantity, memo)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.msg)
        .bind(row.unix)
        .bind(row.event_unix)
        .bind(&row.date)
        .bind(row.year)
        .bind(row.month)
        .bind(&row.network)
        .bind(row.session_unix)
        .bind(&row.session_date)
        .bind(&row.op)
        .bind(row.nonce)
        .bind(&row.uia_id)
        .bind(&row.event_id)
        .bind(row.withdrawal_amount)
        .bind(&row.gateway_address)
        .bind(&row.client_address)
        .bind(&row.client_id)
        .bind(row.account_idx)
        .bind(&row.tx_id)
        .bind(&row.order_public)
        .bind(&row.order_to)
        .bind(row.order_quantity)
        .bind(&row.memo)
        .execute(pool)
        .await?;
        Ok(done.last_insert_rowid())
    })
    .await
}

/// Insert an ingot audit row.
pub async fn insert_ingot(pool: &SqlitePool, row: &NewIngot) -> Result<i64> {
    with_locked_retry(|| async {
        let done = sqlx::query(
            r#"
            INSERT INTO ingots (msg, unix, event_unix, date, year, month, network,
                tx_id, order_public, order_to, order_quantity)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.msg)
        .bind(row.unix)
        .bind(row.event_unix)
        .bind(&row.date)
        .bind(row.year)
        .bind(row.month)
        .bind(&row.network)
        .bind(&row.tx_id)
        .bind(&row.order_public)
        .bind(&row.order_to)
        .bind(row.order_quantity)
        .execute(pool)
        .await?;
        Ok(done.last_insert_rowid())
    })
    .await
}

/// Count rows in one audit table (status endpoint).
pub async fn count_rows(pool: &SqlitePool, table: &str) -> Result<i64> {
    // table names come from a fixed internal set, never from input
    let query = format!("SELECT COUNT(*) FROM {table}");
    let row: (i64,) = sqlx::query_as(&query)
        .fetch_one(pool)
        .await
        .wrap_err_with(|| format!("Failed to count rows in {table}"))?;
    Ok(row.0)
}

/// Count audit rows whose msg matches a LIKE pattern.
pub async fn count_rows_like(pool: &SqlitePool, table: &str, pattern: &str) -> Result<i64> {
    let query = format!("SELECT COUNT(*) FROM {table} WHERE msg LIKE ?");
    let row: (i64,) = sqlx::query_as(&query)
        .bind(pattern)
        .fetch_one(pool)
        .await
        .wrap_err_with(|| format!("Failed to count rows in {table}"))?;
    Ok(row.0)
}

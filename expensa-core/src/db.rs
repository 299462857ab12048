use crate::config::DatabaseConfig;
use crate::retry::doubling_delays;
use crate::store::StoreError;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tokio_retry::Retry;

/// Open the bounded connection pool.
///
/// Connections are pinged before being handed out and recycled after
/// `max_lifetime_seconds`. The initial connect is attempted `connect_retries`
/// times with doubling delays in between.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, StoreError> {
    let url = config
        .url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .ok_or(StoreError::MissingDatabaseUrl)?;

    let options = connect_options(url)?;
    let pool_options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .max_lifetime(Duration::from_secs(config.max_lifetime_seconds))
        .test_before_acquire(true);

    let delays = doubling_delays(
        Duration::from_millis(config.connect_retry_delay_ms),
        config.connect_retries.saturating_sub(1),
    );

    let pool = Retry::spawn(delays, || {
        let options = options.clone();
        let pool_options = pool_options.clone();
        async move {
            let result = pool_options.connect_with(options).await;
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Database connection attempt failed");
            }
            result
        }
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Failed to establish database connection after all retries");
        StoreError::Database(e)
    })?;

    tracing::info!("Database connection established successfully");
    Ok(pool)
}

/// Parse the connection string, forcing TLS for network URLs unless the URL
/// already names an `sslmode`.
pub fn connect_options(url: &str) -> Result<PgConnectOptions, StoreError> {
    let options = PgConnectOptions::from_str(url)?;
    if requires_tls(url) {
        Ok(options.ssl_mode(PgSslMode::Require))
    } else {
        Ok(options)
    }
}

pub fn requires_tls(url: &str) -> bool {
    let is_network = url.starts_with("postgres://") || url.starts_with("postgresql://");
    is_network && !url.contains("sslmode=")
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

//! Bounded connection pools for the configuration and metric stores.

use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use bb8_postgres::PostgresConnectionManager;
use postgres_native_tls::MakeTlsConnector;
use tracing::{debug, info, warn};

use crate::bootstrap;
use crate::error::StoreError;

/// A bounded pool of TLS-capable connections to one PostgreSQL store.
pub type Pool = bb8::Pool<PostgresConnectionManager<MakeTlsConnector>>;

/// Applied when the connection string does not set its own connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pooled connections idle longer than this are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Pooled connections are recycled after this long regardless of use.
const MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);

const POOL_MAX_SIZE: u32 = 8;

/// Set on all opened connections for informative purposes.
const APPLICATION_NAME: &str = "pgfleet";

/// Bootstrap retry policy: three attempts, one second apart.
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Build a pool for `connstr` without testing connectivity. An unparsable
/// connection string is fatal to the caller.
pub fn open_pool(connstr: &str) -> Result<Pool, StoreError> {
    let mut config = connstr
        .parse::<tokio_postgres::Config>()
        .map_err(StoreError::BadConnstr)?;
    if config.get_connect_timeout().is_none() {
        config.connect_timeout(CONNECT_TIMEOUT);
    }
    if config.get_application_name().is_none() {
        config.application_name(APPLICATION_NAME);
    }
    debug!(hosts = ?config.get_hosts(), dbname = ?config.get_dbname(), "opening store pool");

    // Never returns an error with an empty builder
    let connector = native_tls::TlsConnector::builder().build().unwrap();
    let manager = PostgresConnectionManager::new(config, MakeTlsConnector::new(connector));
    Ok(bb8::Pool::builder()
        .max_size(POOL_MAX_SIZE)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .max_lifetime(Some(MAX_LIFETIME))
        .connection_timeout(CONNECT_TIMEOUT)
        .build_unchecked(manager))
}

/// Connect to the metric store, retrying per the bootstrap policy, and make
/// sure the `admin` schema is rolled out.
pub async fn connect_metric_store(connstr: &str) -> Result<Pool, StoreError> {
    let pool = connect_with_retry(connstr).await?;
    bootstrap::ensure_metric_schema(&pool).await?;
    Ok(pool)
}

/// Connect to the configuration store, retrying per the bootstrap policy,
/// and make sure the `pgwatch3` schema is rolled out.
pub async fn connect_config_store(connstr: &str) -> Result<Pool, StoreError> {
    let pool = connect_with_retry(connstr).await?;
    bootstrap::ensure_config_schema(&pool).await?;
    Ok(pool)
}

async fn connect_with_retry(connstr: &str) -> Result<Pool, StoreError> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(CONNECT_RETRY_INTERVAL)
        .with_multiplier(1.0)
        .with_randomization_factor(0.0)
        .with_max_interval(CONNECT_RETRY_INTERVAL)
        .with_max_elapsed_time(Some(CONNECT_RETRY_INTERVAL * CONNECT_ATTEMPTS))
        .build();

    backoff::future::retry(policy, || async {
        let pool = open_pool(connstr).map_err(backoff::Error::permanent)?;
        match ping(&pool).await {
            Ok(()) => Ok(pool),
            Err(e) => {
                warn!(%e, "store connection failed, sleeping before reconnecting");
                Err(backoff::Error::transient(e))
            }
        }
    })
    .await
    .map(|pool| {
        info!("store connection established");
        pool
    })
}

async fn ping(pool: &Pool) -> Result<(), StoreError> {
    let conn = pool.get().await?;
    conn.query_one("SELECT 1", &[]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_connstr_is_fatal() {
        assert!(matches!(
            open_pool("this is not a connstr"),
            Err(StoreError::BadConnstr(_))
        ));
    }

    #[tokio::test]
    async fn parsable_connstr_builds_a_pool() {
        open_pool("host=localhost user=pgfleet dbname=measurements").unwrap();
    }
}

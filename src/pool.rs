//! Connection pool
//!
//! A fixed set of persistent `may_postgres` connections handed out through a bounded
//! channel. A checked-out [`PooledConnection`] is exclusive to its holder, which is what
//! makes it safe to open a transaction on it; dropping it returns the slot.

use crate::config::DatabaseConfig;
use crate::connection::{connect, ConnectionError};
use crate::executor::{DbError, PgExecutor};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::ops::Deref;
use std::time::Duration;

pub struct ConnectionPool {
    idle_tx: Sender<PgExecutor>,
    idle_rx: Receiver<PgExecutor>,
    url: String,
    size: usize,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    /// Open `max_connections` connections up front.
    ///
    /// # Errors
    ///
    /// Returns the first `ConnectionError` encountered.
    pub fn open(config: &DatabaseConfig) -> Result<Self, ConnectionError> {
        let size = usize::try_from(config.max_connections.max(1)).unwrap_or(1);
        let (idle_tx, idle_rx) = bounded(size);

        for _ in 0..size {
            let client = connect(&config.url)?;
            idle_tx
                .send(PgExecutor::new(client))
                .map_err(|e| ConnectionError::Other(format!("pool slot rejected: {e}")))?;
        }

        log::info!("connection pool ready with {size} connection(s)");
        Ok(Self {
            idle_tx,
            idle_rx,
            url: config.url.clone(),
            size,
            acquire_timeout: Duration::from_secs(config.pool_timeout_seconds),
        })
    }

    /// Check out a connection, waiting up to the configured timeout.
    ///
    /// A connection that fails its health probe is replaced before being handed out.
    ///
    /// # Errors
    ///
    /// Returns `DbError::PoolExhausted` on timeout, or the reconnect failure.
    pub fn acquire(&self) -> Result<PooledConnection<'_>, DbError> {
        #[cfg(feature = "tracing")]
        let _span = crate::metrics::tracing_helpers::acquire_connection_span().entered();

        let executor = match self.idle_rx.recv_timeout(self.acquire_timeout) {
            Ok(executor) => executor,
            Err(RecvTimeoutError::Timeout) => {
                return Err(DbError::PoolExhausted(format!(
                    "no connection available after {:?} (pool size {})",
                    self.acquire_timeout, self.size
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(DbError::Other("connection pool closed".to_string()))
            }
        };

        let executor = match executor.check_health() {
            Ok(true) => executor,
            _ => {
                log::warn!("replacing unhealthy pooled connection");
                match connect(&self.url) {
                    Ok(client) => PgExecutor::new(client),
                    Err(e) => {
                        // Keep the slot count stable; the stale client is retried next time.
                        let _ = self.idle_tx.send(executor);
                        return Err(DbError::Other(format!("reconnect failed: {e}")));
                    }
                }
            }
        };

        Ok(PooledConnection {
            executor: Some(executor),
            pool: self,
        })
    }

    /// Number of connections currently checked in.
    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// A connection checked out of a [`ConnectionPool`].
pub struct PooledConnection<'a> {
    executor: Option<PgExecutor>,
    pool: &'a ConnectionPool,
}

impl Deref for PooledConnection<'_> {
    type Target = PgExecutor;

    fn deref(&self) -> &PgExecutor {
        // Only taken in Drop.
        self.executor.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(executor) = self.executor.take() {
            let _ = self.pool.idle_tx.send(executor);
        }
    }
}

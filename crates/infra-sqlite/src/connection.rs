//! Identity-keyed connection pool
//!
//! Every loop gets its own private connection, keyed by the identity it
//! passes in. Connections are never handed to two identities.

use crate::error::map_sqlx_error;
use crate::session::SqliteQueueSession;
use async_trait::async_trait;
use crashmon_core::error::{AppError, Result};
use crashmon_core::port::{QueueDatabase, QueueSession};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) type SharedConnection = Arc<tokio::sync::Mutex<SqliteConnection>>;

/// WAL journaling plus a busy timeout, since the processors write to the
/// same database file
pub fn connect_options(database_url: &str) -> Result<SqliteConnectOptions> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| AppError::Config(format!("invalid database url {}: {}", database_url, e)))?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);
    Ok(options)
}

/// Plain sqlx pool, used for migrations and by tests to seed data
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(connect_options(database_url)?)
        .await
        .map_err(|e| AppError::Connection(e.to_string()))
}

pub struct ConnectionPool {
    options: SqliteConnectOptions,
    connections: Mutex<HashMap<String, SharedConnection>>,
    /// Number of upcoming pings that fail regardless of the connection
    #[cfg(test)]
    failing_pings: std::sync::atomic::AtomicUsize,
}

impl ConnectionPool {
    pub fn new(database_url: &str) -> Result<Self> {
        Ok(Self {
            options: connect_options(database_url)?,
            connections: Mutex::new(HashMap::new()),
            #[cfg(test)]
            failing_pings: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    #[cfg(test)]
    fn forced_ping_failure(&self) -> bool {
        use std::sync::atomic::Ordering;
        self.failing_pings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(not(test))]
    fn forced_ping_failure(&self) -> bool {
        false
    }

    async fn ping(&self, conn: &SharedConnection) -> Result<()> {
        if self.forced_ping_failure() {
            return Err(AppError::Database("ping failed".to_string()));
        }
        ping(conn).await
    }

    fn stored(&self, identity: &str) -> Result<Option<SharedConnection>> {
        let connections = self
            .connections
            .lock()
            .map_err(|e| AppError::Internal(format!("connection map poisoned: {}", e)))?;
        Ok(connections.get(identity).cloned())
    }

    fn discard(&self, identity: &str) -> Result<()> {
        self.connections
            .lock()
            .map_err(|e| AppError::Internal(format!("connection map poisoned: {}", e)))?
            .remove(identity);
        Ok(())
    }

    /// Connection bound to `identity`, opened if there is none yet
    pub async fn acquire(&self, identity: &str) -> Result<SharedConnection> {
        if let Some(conn) = self.stored(identity)? {
            return Ok(conn);
        }

        debug!(identity = identity, "Opening database connection");
        let conn = self
            .options
            .connect()
            .await
            .map_err(|e| AppError::Connection(format!("{}: {}", identity, e)))?;
        let conn = Arc::new(tokio::sync::Mutex::new(conn));

        let mut connections = self
            .connections
            .lock()
            .map_err(|e| AppError::Internal(format!("connection map poisoned: {}", e)))?;
        Ok(Arc::clone(
            connections.entry(identity.to_string()).or_insert(conn),
        ))
    }

    /// Connection that has just answered `SELECT 1`
    ///
    /// A failing connection is discarded and replaced once; if the
    /// replacement fails too the error is `AppError::Connection`.
    pub async fn verify(&self, identity: &str) -> Result<SharedConnection> {
        let conn = self.acquire(identity).await?;
        match self.ping(&conn).await {
            Ok(()) => return Ok(conn),
            Err(e) => {
                warn!(identity = identity, error = %e, "Stored connection is unusable, reconnecting");
            }
        }

        self.discard(identity)?;
        let conn = self.acquire(identity).await?;
        self.ping(&conn).await.map_err(|e| {
            AppError::Connection(format!("{}: replacement connection failed: {}", identity, e))
        })?;
        Ok(conn)
    }

    /// Close every pooled connection
    pub async fn teardown(&self) {
        let drained: Vec<(String, SharedConnection)> = match self.connections.lock() {
            Ok(mut connections) => connections.drain().collect(),
            Err(e) => {
                warn!(error = %e, "Connection map poisoned, nothing to close");
                return;
            }
        };

        for (identity, conn) in drained {
            match Arc::try_unwrap(conn) {
                Ok(conn) => match conn.into_inner().close().await {
                    Ok(()) => info!(identity = identity, "Connection closed"),
                    Err(e) => warn!(identity = identity, error = %e, "Connection was already closed"),
                },
                Err(_) => warn!(identity = identity, "Connection still in use, dropping it"),
            }
        }
    }

    pub fn identities(&self) -> Vec<String> {
        self.connections
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }
}

async fn ping(conn: &SharedConnection) -> Result<()> {
    let mut conn = conn.lock().await;
    sqlx::query("SELECT 1")
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(())
}

#[async_trait]
impl QueueDatabase for ConnectionPool {
    async fn session(&self, identity: &str) -> Result<Box<dyn QueueSession>> {
        let conn = self.verify(identity).await?;
        Ok(Box::new(SqliteQueueSession::new(identity, conn)))
    }

    async fn teardown(&self) {
        ConnectionPool::teardown(self).await
    }
}

//! Connection pool creation and configuration.

use std::time::Duration;

use postgres::{Client, NoTls};
use r2d2::{ManageConnection, Pool, PooledConnection};
use thiserror::Error;

use crate::error::DbError;
use crate::options::DbOptions;

/// Runtime tunables for the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Maximum number of pooled PostgreSQL connections.
    pub pool_max_size: u32,

    /// How long a checkout waits for a free connection, in milliseconds.
    pub connection_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            pool_max_size: 8,
            connection_timeout_ms: 30_000,
        }
    }
}

/// A type alias for the PostgreSQL connection pool.
pub type DbPool = Pool<PgConnectionManager>;

/// A connection checked out of a [`DbPool`].
pub type PooledSession = PooledConnection<PgConnectionManager>;

/// Errors that can occur when creating the database pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to build the connection pool.
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Returns a used connection to a clean session. This is `DISCARD ALL`
/// without `DEALLOCATE ALL`, which would invalidate statements the client
/// caches for type lookups.
const RESET_SESSION: &str = "CLOSE ALL;
SET SESSION AUTHORIZATION DEFAULT;
RESET ALL;
DISCARD PLANS;
DISCARD TEMP;
DISCARD SEQUENCES;
UNLISTEN *;
SELECT pg_advisory_unlock_all();";

/// A pooled PostgreSQL client plus the bookkeeping that decides whether it
/// may go back into the pool.
pub struct PgSession {
    // `None` only while being dropped.
    client: Option<Client>,
    used: bool,
    in_transaction: bool,
    discard: bool,
}

impl PgSession {
    fn new(client: Client) -> Self {
        Self {
            client: Some(client),
            used: false,
            in_transaction: false,
            discard: false,
        }
    }

    /// Clears session state left by the previous borrower, so temp tables,
    /// settings and session locks never leak between checkouts.
    pub(crate) fn prepare_for_use(&mut self) -> Result<(), DbError> {
        if self.used {
            if let Err(e) = self.client()?.batch_execute(RESET_SESSION) {
                self.discard();
                return Err(e.into());
            }
        }
        self.used = true;
        Ok(())
    }

    pub(crate) fn client(&mut self) -> Result<&mut Client, DbError> {
        self.client
            .as_mut()
            .ok_or_else(|| DbError::illegal_state("connection is already closed"))
    }

    fn is_closed(&self) -> bool {
        self.client.as_ref().map_or(true, Client::is_closed)
    }

    pub(crate) fn mark_in_transaction(&mut self, open: bool) {
        self.in_transaction = open;
    }

    /// Drops the connection instead of returning it to the pool.
    pub(crate) fn discard(&mut self) {
        self.discard = true;
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            off_runtime(move || drop(client));
        }
    }
}

/// Runs `f` on the current thread, or on a short-lived thread of its own
/// when called from inside a tokio runtime. The blocking client drives its
/// own runtime for every call, including the terminate message sent on
/// drop, and that panics on a thread already driving async tasks.
pub(crate) fn off_runtime<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    if tokio::runtime::Handle::try_current().is_err() {
        f();
        return;
    }
    if let Err(e) = std::thread::Builder::new()
        .name("tessera-db-close".to_string())
        .spawn(f)
    {
        tracing::warn!(error = %e, "failed to spawn connection close thread");
    }
}

/// `r2d2` manager that opens plain-TCP PostgreSQL connections.
#[derive(Debug, Clone)]
pub struct PgConnectionManager {
    config: postgres::Config,
}

impl PgConnectionManager {
    pub fn new(config: postgres::Config) -> Self {
        Self { config }
    }
}

impl ManageConnection for PgConnectionManager {
    type Connection = PgSession;
    type Error = DbError;

    fn connect(&self) -> Result<PgSession, DbError> {
        Ok(PgSession::new(self.config.connect(NoTls)?))
    }

    fn is_valid(&self, session: &mut PgSession) -> Result<(), DbError> {
        session.client()?.simple_query("")?;
        Ok(())
    }

    /// A session still inside a transaction, or one interrupted mid-call,
    /// never goes back into the pool.
    fn has_broken(&self, session: &mut PgSession) -> bool {
        session.discard || session.in_transaction || session.is_closed()
    }
}

/// Creates a connection pool for the target database in `options`.
///
/// The target database must already exist; see
/// [`MigrationRunner::ensure_database`](crate::MigrationRunner::ensure_database).
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if the pool cannot open its initial
/// connections.
pub fn create_pool(options: &DbOptions, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = PgConnectionManager::new(options.pg_config().clone());

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .connection_timeout(Duration::from_millis(settings.connection_timeout_ms))
        .build(manager)?;

    tracing::debug!(
        max_size = settings.pool_max_size,
        database = options.database_name().unwrap_or("<default>"),
        "created connection pool"
    );
    Ok(pool)
}

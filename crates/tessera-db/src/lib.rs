//! PostgreSQL access layer for Tessera services.
//!
//! Provides pooled connections (via `r2d2`), a [`TransactionalContext`] that
//! is either free (one connection per call) or bound to a single transaction,
//! named-advisory-lock mutual exclusion across processes, and a startup
//! [`MigrationRunner`] that applies ordered SQL scripts exactly once.
//!
//! # Design decisions
//!
//! - **Blocking driver underneath**: all database work runs on the synchronous
//!   `postgres` client. Async entry points move that work onto tokio's
//!   blocking pool, so the same code path serves both.
//! - **Explicit transaction ownership**: a bound context owns its connection
//!   until commit, rollback, or close. Dropping it rolls back anything still
//!   open and discards the connection instead of pooling it.
//! - **Migrations ship beside the binary**: scripts named
//!   `migration_<N>_<description>.sql` are discovered at startup and applied
//!   in ascending `N`, each under its own advisory lock.

mod cancel;
mod catalog;
mod context;
mod error;
mod isolation;
mod lock;
mod manager;
mod migrations;
mod options;
mod params;
mod pool;
mod row;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use catalog::{MigrationCatalog, MigrationScript};
pub use context::{ContextMode, TransactionalContext};
pub use error::DbError;
pub use isolation::IsolationLevel;
pub use lock::{AdvisoryLockKey, DistributedLock, DistributedLockGuard};
pub use manager::ContextManager;
pub use migrations::{
    MigrationError, MigrationReport, MigrationRunner, MigrationSettings, BOOKKEEPING_TABLE,
};
pub use options::{DbOptions, ADMIN_DATABASE};
pub use params::Params;
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PgConnectionManager, PgSession, PoolError, PooledSession};
pub use row::FromRow;

//! Startup migration runner.
//!
//! Migrations run sequentially in catalog order and are tracked in the
//! `applied_migrations` table. Each one is processed under its own advisory
//! lock, so several processes starting against the same database apply every
//! migration exactly once between them: whoever gets the lock first applies
//! it, the others find it recorded and skip it.

use std::path::PathBuf;
use std::time::Duration;

use postgres::error::SqlState;
use postgres::NoTls;
use thiserror::Error;

use crate::catalog::MigrationScript;
use crate::context::TransactionalContext;
use crate::error::DbError;
use crate::isolation::IsolationLevel;
use crate::lock::DistributedLock;
use crate::manager::ContextManager;
use crate::options::DbOptions;
use crate::pool::{create_pool, DbRuntimeSettings, PoolError};

/// Name of the bookkeeping table.
pub const BOOKKEEPING_TABLE: &str = "applied_migrations";

const CREATE_BOOKKEEPING_TABLE: &str = "CREATE TABLE IF NOT EXISTS applied_migrations (
    id SERIAL PRIMARY KEY,
    name VARCHAR(200) UNIQUE NOT NULL
);";

const FIND_MIGRATION: &str = "SELECT TRUE FROM applied_migrations WHERE name = @name";

const RECORD_MIGRATION: &str = "INSERT INTO applied_migrations (name) VALUES (@name)";

/// Tunables for the migration runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationSettings {
    /// How long to wait for another process holding a migration's lock.
    /// `None` waits indefinitely.
    pub lock_timeout: Option<Duration>,

    /// Run each script and its bookkeeping insert in one transaction. When
    /// off, the two are separate statements and scripts must be idempotent.
    pub transactional: bool,

    /// Pool used by [`MigrationRunner::run`].
    pub pool: DbRuntimeSettings,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Some(Duration::from_secs(300)),
            transactional: true,
            pool: DbRuntimeSettings {
                pool_max_size: 2,
                ..DbRuntimeSettings::default()
            },
        }
    }
}

/// Outcome of one runner pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Migrations this process applied, in order.
    pub applied: Vec<String>,
    /// Migrations found already recorded.
    pub skipped: Vec<String>,
}

impl MigrationReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The target database or the bookkeeping table could not be ensured.
    #[error("failed to ensure database '{database}' exists: {source}")]
    DatabaseSetup {
        /// The target database name.
        database: String,
        source: DbError,
    },

    /// The options cannot drive a migration run.
    #[error("invalid migration configuration: {0}")]
    Configuration(DbError),

    /// The migration's advisory lock could not be acquired.
    #[error("failed to lock migration '{name}': {source}")]
    Lock { name: String, source: DbError },

    /// Failed to query migration state.
    #[error("failed to check state of migration '{name}': {source}")]
    StateQuery { name: String, source: DbError },

    /// The script file could not be read.
    #[error("failed to read migration '{name}' from {}: {source}", .path.display())]
    ScriptRead {
        name: String,
        path: PathBuf,
        source: std::io::Error,
    },

    /// A SQL statement within a migration failed.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        /// The name of the migration that failed.
        name: String,
        source: DbError,
    },

    /// The runner's own pool could not be created.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The blocking runner task panicked.
    #[error("migration task failed: {0}")]
    Task(String),
}

/// Brings the target database's schema up to date.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    options: DbOptions,
    settings: MigrationSettings,
}

impl MigrationRunner {
    pub fn new(options: DbOptions, settings: MigrationSettings) -> Self {
        Self { options, settings }
    }

    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    /// Ensures the target database exists, then applies every pending
    /// migration through a small pool of its own.
    ///
    /// # Errors
    ///
    /// Stops at the first failing migration; later ones are not attempted.
    pub fn run(&self) -> Result<MigrationReport, MigrationError> {
        self.ensure_database()?;
        let pool = create_pool(&self.options, self.settings.pool)?;
        self.apply(&ContextManager::new(pool))
    }

    /// [`run`](Self::run) on tokio's blocking pool.
    pub async fn run_async(&self) -> Result<MigrationReport, MigrationError> {
        let runner = self.clone();
        tokio::task::spawn_blocking(move || runner.run())
            .await
            .map_err(|e| MigrationError::Task(e.to_string()))?
    }

    /// Creates the target database through the administrative database if
    /// it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Configuration` if the connection string names
    /// no database and `MigrationError::DatabaseSetup` for any failure while
    /// checking or creating it.
    pub fn ensure_database(&self) -> Result<(), MigrationError> {
        let database = self.target_database()?;
        create_database_if_missing(&self.options, &database)
            .map_err(|source| MigrationError::DatabaseSetup { database, source })
    }

    /// Ensures the bookkeeping table, then applies pending migrations using
    /// `manager`'s pool. The target database must already exist.
    pub fn apply(&self, manager: &ContextManager) -> Result<MigrationReport, MigrationError> {
        self.ensure_bookkeeping_table(manager)?;

        let mut report = MigrationReport::default();
        for script in self.options.migrations() {
            if self.process(manager, script)? {
                report.applied.push(script.name.clone());
            } else {
                report.skipped.push(script.name.clone());
            }
        }

        tracing::info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "database migrations complete"
        );
        Ok(report)
    }

    fn target_database(&self) -> Result<String, MigrationError> {
        self.options
            .database_name()
            .map(str::to_string)
            .ok_or_else(|| {
                MigrationError::Configuration(DbError::Configuration(
                    "connection string does not name a database".to_string(),
                ))
            })
    }

    fn lock(&self, name: &str) -> DistributedLock {
        DistributedLock::new(name, self.options.pg_config()).with_timeout(self.settings.lock_timeout)
    }

    // Concurrent CREATE TABLE IF NOT EXISTS can still collide in the
    // catalog, so table creation is serialised like a migration.
    fn ensure_bookkeeping_table(&self, manager: &ContextManager) -> Result<(), MigrationError> {
        let database = self.target_database()?;
        let setup = || -> Result<(), DbError> {
            let _guard = self.lock(BOOKKEEPING_TABLE).acquire()?;
            manager.context().execute_batch(CREATE_BOOKKEEPING_TABLE)
        };
        setup().map_err(|source| MigrationError::DatabaseSetup { database, source })
    }

    /// Applies one migration under its lock. Returns `false` if it was
    /// already recorded.
    fn process(
        &self,
        manager: &ContextManager,
        script: &MigrationScript,
    ) -> Result<bool, MigrationError> {
        let name = script.name.as_str();
        let _guard = self
            .lock(name)
            .acquire()
            .map_err(|source| MigrationError::Lock {
                name: name.to_string(),
                source,
            })?;

        let context = manager.context();
        let already_applied = context
            .query_single_or_default::<bool>(FIND_MIGRATION, &crate::params!(name = name.to_string()))
            .map_err(|source| MigrationError::StateQuery {
                name: name.to_string(),
                source,
            })?
            .unwrap_or(false);

        if already_applied {
            tracing::debug!(migration = name, "migration already applied, skipping");
            return Ok(false);
        }

        let sql = std::fs::read_to_string(&script.path).map_err(|source| {
            MigrationError::ScriptRead {
                name: name.to_string(),
                path: script.path.clone(),
                source,
            }
        })?;

        tracing::info!(migration = name, "applying migration");
        self.execute_script(manager, &context, name, &sql)
            .map_err(|source| MigrationError::ExecutionFailed {
                name: name.to_string(),
                source,
            })?;
        Ok(true)
    }

    fn execute_script(
        &self,
        manager: &ContextManager,
        context: &TransactionalContext,
        name: &str,
        sql: &str,
    ) -> Result<(), DbError> {
        let record = crate::params!(name = name.to_string());
        if self.settings.transactional {
            let mut tx = manager.begin_transaction(IsolationLevel::ReadCommitted)?;
            tx.execute_batch(sql)?;
            tx.execute(RECORD_MIGRATION, &record)?;
            tx.commit()
        } else {
            context.execute_batch(sql)?;
            context.execute(RECORD_MIGRATION, &record).map(|_| ())
        }
    }
}

fn create_database_if_missing(options: &DbOptions, database: &str) -> Result<(), DbError> {
    let mut admin = options.admin_config().connect(NoTls)?;

    let exists = admin
        .query_opt("SELECT TRUE FROM pg_database WHERE datname = $1", &[&database])?
        .is_some();
    if exists {
        tracing::debug!(database, "target database exists");
        return Ok(());
    }

    match admin.batch_execute(&format!("CREATE DATABASE {}", quote_identifier(database))) {
        Ok(()) => {
            tracing::info!(database, "created database");
            Ok(())
        }
        // Another process created it between the check and the CREATE.
        Err(e)
            if e.code() == Some(&SqlState::DUPLICATE_DATABASE)
                || e.code() == Some(&SqlState::UNIQUE_VIOLATION) =>
        {
            tracing::debug!(database, "database was created concurrently");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Quotes `ident` as a PostgreSQL identifier.
pub(crate) fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_identifier("orders"), "\"orders\"");
        assert_eq!(quote_identifier("Mixed Case"), "\"Mixed Case\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn default_settings_bound_the_lock_wait_and_use_transactions() {
        let settings = MigrationSettings::default();
        assert_eq!(settings.lock_timeout, Some(Duration::from_secs(300)));
        assert!(settings.transactional);
        assert_eq!(settings.pool.pool_max_size, 2);
    }

    #[test]
    fn missing_database_name_is_a_configuration_error() {
        let options = DbOptions::from_paths("host=localhost user=app", Vec::<PathBuf>::new())
            .expect("options should build");
        let runner = MigrationRunner::new(options, MigrationSettings::default());

        let err = runner.ensure_database().expect_err("no database name should fail");
        assert!(
            matches!(err, MigrationError::Configuration(DbError::Configuration(_))),
            "got {err:?}"
        );
    }

    #[test]
    fn unreachable_server_is_wrapped_with_the_database_name() {
        let options = DbOptions::from_paths(
            "host=127.0.0.1 port=1 user=nobody dbname=inventory connect_timeout=1",
            Vec::<PathBuf>::new(),
        )
        .expect("options should build");
        let runner = MigrationRunner::new(options, MigrationSettings::default());

        let err = runner.ensure_database().expect_err("unreachable server should fail");
        match &err {
            MigrationError::DatabaseSetup { database, source } => {
                assert_eq!(database, "inventory");
                assert!(matches!(source, DbError::Backend(_)), "got {source:?}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("'inventory'"));
    }

    #[test]
    fn execution_failure_names_the_migration() {
        let err = MigrationError::ExecutionFailed {
            name: "migration_4_add_index".to_string(),
            source: DbError::NotFound,
        };
        assert_eq!(
            err.to_string(),
            "migration 'migration_4_add_index' failed: query returned no rows"
        );
    }

    #[test]
    fn report_counts_applied_migrations() {
        let report = MigrationReport {
            applied: vec!["migration_1_a".into(), "migration_2_b".into()],
            skipped: vec!["migration_0_base".into()],
        };
        assert_eq!(report.applied_count(), 2);
    }
}

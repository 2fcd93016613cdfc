//! Tests against a live PostgreSQL server.
//!
//! Set `TESSERA_TEST_DATABASE_URL` to a connection string for a role that may
//! create databases (URL or `key=value` form; any database name in it is
//! replaced). Each test works in its own freshly created database. Without
//! the variable every test returns early.

use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tessera_db::{
    cancel_pair, create_pool, params, CancelSignal, ContextManager, ContextMode, DbError,
    DbOptions, DbRuntimeSettings, DistributedLock, IsolationLevel, MigrationError,
    MigrationRunner, MigrationSettings, Params,
};
use uuid::Uuid;

const DATABASE_URL_ENV: &str = "TESSERA_TEST_DATABASE_URL";

struct TestDatabase {
    name: String,
    connection_string: String,
}

impl TestDatabase {
    fn new() -> Option<Self> {
        let base = std::env::var(DATABASE_URL_ENV).ok()?;
        let base = base.trim();
        if base.is_empty() {
            return None;
        }
        let name = format!("tessera_test_{}", Uuid::new_v4().simple());
        Some(Self {
            connection_string: with_database(base, &name),
            name,
        })
    }

    fn options(&self, root: &Path) -> DbOptions {
        DbOptions::discover(&self.connection_string, root).expect("options should build")
    }

    /// Options with no migrations.
    fn bare_options(&self) -> DbOptions {
        DbOptions::from_paths(&self.connection_string, Vec::<std::path::PathBuf>::new())
            .expect("options should build")
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        // Best effort; runs on its own thread so async tests can drop it too.
        let config: postgres::Config = match self.connection_string.parse() {
            Ok(config) => config,
            Err(_) => return,
        };
        let name = self.name.clone();
        let _ = std::thread::spawn(move || {
            let mut admin = config.clone();
            admin.dbname(tessera_db::ADMIN_DATABASE);
            if let Ok(mut client) = admin.connect(postgres::NoTls) {
                let quoted = format!("\"{name}\"");
                if client
                    .batch_execute(&format!("DROP DATABASE IF EXISTS {quoted} WITH (FORCE)"))
                    .is_err()
                {
                    let _ = client.batch_execute(&format!("DROP DATABASE IF EXISTS {quoted}"));
                }
            }
        })
        .join();
    }
}

macro_rules! require_database {
    () => {
        match TestDatabase::new() {
            Some(db) => db,
            None => {
                eprintln!("skipping: {DATABASE_URL_ENV} is not set");
                return;
            }
        }
    };
}

fn with_database(base: &str, database: &str) -> String {
    match base.split_once("://") {
        Some((scheme, rest)) => {
            let (rest, query) = match rest.split_once('?') {
                Some((rest, query)) => (rest, Some(query)),
                None => (rest, None),
            };
            let authority = rest.split('/').next().unwrap_or(rest);
            let mut url = format!("{scheme}://{authority}/{database}");
            if let Some(query) = query {
                url.push('?');
                url.push_str(query);
            }
            url
        }
        None => format!("{base} dbname={database}"),
    }
}

fn write_script(dir: &Path, file_name: &str, sql: &str) {
    std::fs::write(dir.join(file_name), sql).expect("failed to write migration script");
}

/// Creates the database and a pool over it. Blocking.
fn open_manager(options: &DbOptions, pool_max_size: u32) -> ContextManager {
    MigrationRunner::new(options.clone(), MigrationSettings::default())
        .ensure_database()
        .expect("failed to create test database");
    let settings = DbRuntimeSettings {
        pool_max_size,
        ..DbRuntimeSettings::default()
    };
    ContextManager::new(create_pool(options, settings).expect("failed to create pool"))
}

fn count(manager: &ContextManager, sql: &str) -> i64 {
    manager
        .context()
        .query_single::<i64>(sql, &Params::new())
        .expect("count query should succeed")
}

fn table_exists(manager: &ContextManager, table: &str) -> bool {
    manager
        .context()
        .query_single::<bool>(
            "SELECT to_regclass(@table) IS NOT NULL",
            &params!(table = table.to_string()),
        )
        .expect("to_regclass should succeed")
}

// ── migration runner ────────────────────────────────────────────────

#[test]
fn runner_creates_database_and_applies_migrations_once() {
    let db = require_database!();
    let dir = TempDir::new().expect("tempdir");
    write_script(
        dir.path(),
        "migration_1_create_widgets.sql",
        "CREATE TABLE widgets (id SERIAL PRIMARY KEY, label TEXT NOT NULL);",
    );
    write_script(
        dir.path(),
        "migration_2_seed_widgets.sql",
        "INSERT INTO widgets (label) VALUES ('a'); INSERT INTO widgets (label) VALUES ('b');",
    );
    write_script(dir.path(), "notes.sql", "THIS IS NOT SQL;");

    let runner = MigrationRunner::new(db.options(dir.path()), MigrationSettings::default());

    let first = runner.run().expect("first run should succeed");
    assert_eq!(
        first.applied,
        vec!["migration_1_create_widgets", "migration_2_seed_widgets"]
    );
    assert!(first.skipped.is_empty());

    let second = runner.run().expect("second run should succeed");
    assert!(second.applied.is_empty());
    assert_eq!(second.skipped.len(), 2);

    let manager = open_manager(&db.bare_options(), 1);
    assert_eq!(count(&manager, "SELECT count(*) FROM widgets"), 2);
    assert_eq!(count(&manager, "SELECT count(*) FROM applied_migrations"), 2);
}

#[test]
fn concurrent_runners_apply_each_migration_once() {
    let db = require_database!();
    let dir = TempDir::new().expect("tempdir");
    write_script(
        dir.path(),
        "migration_1_create_ledger.sql",
        "CREATE TABLE migration_ledger (id SERIAL PRIMARY KEY);",
    );
    write_script(
        dir.path(),
        "migration_2_touch_ledger.sql",
        "INSERT INTO migration_ledger DEFAULT VALUES;",
    );

    let runner = MigrationRunner::new(db.options(dir.path()), MigrationSettings::default());
    let start = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let runner = runner.clone();
            let start = Arc::clone(&start);
            std::thread::spawn(move || {
                start.wait();
                runner.run()
            })
        })
        .collect();

    let mut applied = 0;
    for handle in handles {
        let report = handle
            .join()
            .expect("runner thread panicked")
            .expect("every runner should succeed");
        applied += report.applied_count();
    }
    assert_eq!(applied, 2, "each migration is applied by exactly one runner");

    let manager = open_manager(&db.bare_options(), 1);
    assert_eq!(count(&manager, "SELECT count(*) FROM migration_ledger"), 1);
    assert_eq!(count(&manager, "SELECT count(*) FROM applied_migrations"), 2);
}

#[test]
fn failing_migration_stops_the_run_and_leaves_no_trace() {
    let db = require_database!();
    let dir = TempDir::new().expect("tempdir");
    write_script(
        dir.path(),
        "migration_1_create_orders.sql",
        "CREATE TABLE orders (id SERIAL PRIMARY KEY);",
    );
    write_script(
        dir.path(),
        "migration_2_broken.sql",
        "CREATE TABLE half_done (id INT); SELECT no_such_function();",
    );
    write_script(
        dir.path(),
        "migration_3_create_invoices.sql",
        "CREATE TABLE invoices (id SERIAL PRIMARY KEY);",
    );

    let runner = MigrationRunner::new(db.options(dir.path()), MigrationSettings::default());
    let err = runner.run().expect_err("broken migration should fail the run");
    match &err {
        MigrationError::ExecutionFailed { name, .. } => assert_eq!(name, "migration_2_broken"),
        other => panic!("unexpected error: {other:?}"),
    }

    let manager = open_manager(&db.bare_options(), 1);
    assert!(table_exists(&manager, "orders"));
    assert!(!table_exists(&manager, "half_done"), "failed script is rolled back");
    assert!(!table_exists(&manager, "invoices"), "later migrations are not attempted");
    assert_eq!(count(&manager, "SELECT count(*) FROM applied_migrations"), 1);
}

#[test]
fn non_transactional_runner_records_each_migration() {
    let db = require_database!();
    let dir = TempDir::new().expect("tempdir");
    write_script(
        dir.path(),
        "migration_1_create_tags.sql",
        "CREATE TABLE IF NOT EXISTS tags (name TEXT PRIMARY KEY);",
    );

    let settings = MigrationSettings {
        transactional: false,
        ..MigrationSettings::default()
    };
    let report = MigrationRunner::new(db.options(dir.path()), settings)
        .run()
        .expect("run should succeed");
    assert_eq!(report.applied, vec!["migration_1_create_tags"]);

    let manager = open_manager(&db.bare_options(), 1);
    assert!(table_exists(&manager, "tags"));
}

#[tokio::test(flavor = "multi_thread")]
async fn run_async_applies_migrations() {
    let db = require_database!();
    let dir = TempDir::new().expect("tempdir");
    write_script(
        dir.path(),
        "migration_1_create_events.sql",
        "CREATE TABLE events (id BIGSERIAL PRIMARY KEY);",
    );

    let runner = MigrationRunner::new(db.options(dir.path()), MigrationSettings::default());
    let report = runner.run_async().await.expect("async run should succeed");
    assert_eq!(report.applied, vec!["migration_1_create_events"]);
}

// ── contexts ────────────────────────────────────────────────────────

#[test]
fn nested_transaction_is_rejected_until_close() {
    let db = require_database!();
    let manager = open_manager(&db.bare_options(), 2);

    let mut ctx = manager
        .begin_transaction(IsolationLevel::ReadCommitted)
        .expect("begin should succeed");
    assert_eq!(ctx.mode(), ContextMode::Bound(IsolationLevel::ReadCommitted));

    let err = manager
        .enlist(&mut ctx, IsolationLevel::Serializable)
        .expect_err("second begin should fail");
    assert!(matches!(err, DbError::IllegalState(_)), "got {err:?}");
    assert_eq!(
        ctx.mode(),
        ContextMode::Bound(IsolationLevel::ReadCommitted),
        "failed begin leaves the original transaction in place"
    );

    ctx.close();
    assert_eq!(ctx.mode(), ContextMode::Free);
    ctx.close();

    manager
        .enlist(&mut ctx, IsolationLevel::Serializable)
        .expect("begin after close should succeed");
    let level: String = ctx
        .query_single("SHOW transaction_isolation", &Params::new())
        .expect("SHOW should succeed");
    assert_eq!(level, "serializable");
}

#[test]
fn free_calls_do_not_share_session_state() {
    let db = require_database!();
    // One connection, so both calls reuse it.
    let manager = open_manager(&db.bare_options(), 1);
    let ctx = manager.context();

    ctx.execute_batch("CREATE TEMP TABLE scratch_rows (id INT); SET application_name = 'leaky';")
        .expect("temp table should be created");

    let visible = ctx
        .query_single::<i64>(
            "SELECT count(*) FROM pg_catalog.pg_class WHERE relname = 'scratch_rows'",
            &Params::new(),
        )
        .expect("catalog query should succeed");
    assert_eq!(visible, 0);

    let app_name: String = ctx
        .query_single("SHOW application_name", &Params::new())
        .expect("SHOW should succeed");
    assert_ne!(app_name, "leaky");
}

#[test]
fn query_shapes_follow_row_counts() {
    let db = require_database!();
    let manager = open_manager(&db.bare_options(), 2);
    let ctx = manager.context();
    let series = "SELECT g FROM generate_series(1, @n) AS g ORDER BY g";

    let err = ctx
        .query_single::<i32>(series, &params!(n = 0))
        .expect_err("no rows should fail");
    assert!(matches!(err, DbError::NotFound), "got {err:?}");

    let none = ctx
        .query_single_or_default::<i32>(series, &params!(n = 0))
        .expect("no rows is fine");
    assert_eq!(none, None);

    let err = ctx
        .query_single::<i32>(series, &params!(n = 3))
        .expect_err("three rows should fail");
    assert!(matches!(err, DbError::MultipleRows(3)), "got {err:?}");

    let err = ctx
        .query_single_or_default::<i32>(series, &params!(n = 2))
        .expect_err("two rows should fail");
    assert!(matches!(err, DbError::MultipleRows(2)), "got {err:?}");

    assert_eq!(ctx.query_first::<i32>(series, &params!(n = 3)).expect("first"), 1);
    assert!(matches!(
        ctx.query_first::<i32>(series, &params!(n = 0)),
        Err(DbError::NotFound)
    ));
    assert_eq!(
        ctx.query_first_or_default::<i32>(series, &params!(n = 0))
            .expect("no rows is fine"),
        None
    );
    assert_eq!(
        ctx.query_many::<i32>(series, &params!(n = 4)).expect("many"),
        vec![1, 2, 3, 4]
    );

    let pair: (i32, String) = ctx
        .query_single(
            "SELECT @id::int, @label::text",
            &params!(id = 7, label = "seven"),
        )
        .expect("tuple row");
    assert_eq!(pair, (7, "seven".to_string()));

    ctx.execute_batch("CREATE TABLE counters (name TEXT PRIMARY KEY, hits INT NOT NULL)")
        .expect("create table");
    let inserted = ctx
        .execute(
            "INSERT INTO counters (name, hits) VALUES (@a, 0), (@b, 0)",
            &params!(a = "x", b = "y"),
        )
        .expect("insert");
    assert_eq!(inserted, 2);
}

#[test]
fn commit_persists_and_rollback_discards() {
    let db = require_database!();
    let manager = open_manager(&db.bare_options(), 2);
    manager
        .context()
        .execute_batch("CREATE TABLE ledger (amount INT NOT NULL)")
        .expect("create table");

    let mut tx = manager
        .begin_transaction(IsolationLevel::ReadCommitted)
        .expect("begin");
    tx.execute("INSERT INTO ledger VALUES (@amount)", &params!(amount = 10))
        .expect("insert");
    tx.commit().expect("commit");

    let err = tx
        .execute("INSERT INTO ledger VALUES (@amount)", &params!(amount = 99))
        .expect_err("committed transaction rejects statements");
    assert!(matches!(err, DbError::IllegalState(_)), "got {err:?}");
    let err = tx.commit().expect_err("double commit should fail");
    assert!(matches!(err, DbError::IllegalState(_)), "got {err:?}");
    tx.close();

    manager
        .enlist(&mut tx, IsolationLevel::RepeatableRead)
        .expect("begin again");
    tx.execute("INSERT INTO ledger VALUES (@amount)", &params!(amount = 20))
        .expect("insert");
    tx.rollback().expect("rollback");
    tx.close();

    let mut abandoned = manager
        .begin_transaction(IsolationLevel::ReadCommitted)
        .expect("begin");
    abandoned
        .execute("INSERT INTO ledger VALUES (@amount)", &params!(amount = 30))
        .expect("insert");
    drop(abandoned);

    let total = manager
        .context()
        .query_single::<i64>("SELECT COALESCE(SUM(amount), 0)::bigint FROM ledger", &Params::new())
        .expect("sum");
    assert_eq!(total, 10);
}

#[test]
fn commit_without_transaction_is_illegal() {
    let db = require_database!();
    let manager = open_manager(&db.bare_options(), 1);
    let mut ctx = manager.context();

    assert!(matches!(ctx.commit(), Err(DbError::IllegalState(_))));
    assert!(matches!(ctx.rollback(), Err(DbError::IllegalState(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn async_queries_run_in_transactions() {
    let db = require_database!();
    let options = db.bare_options();
    let manager = tokio::task::spawn_blocking(move || open_manager(&options, 2))
        .await
        .expect("setup task");
    let never = CancelSignal::never();

    let ctx = manager.context();
    ctx.execute_batch_async("CREATE TABLE notes (body TEXT NOT NULL)", &never)
        .await
        .expect("create table");

    let mut tx = manager
        .begin_transaction_async(IsolationLevel::ReadCommitted)
        .await
        .expect("begin");
    tx.execute_async(
        "INSERT INTO notes VALUES (@body)",
        params!(body = "hello"),
        &never,
    )
    .await
    .expect("insert");
    let inside: i64 = tx
        .query_single_async("SELECT count(*) FROM notes", Params::new(), &never)
        .await
        .expect("count inside");
    assert_eq!(inside, 1);
    tx.commit_async().await.expect("commit");
    tx.close_async().await;

    let bodies: Vec<String> = ctx
        .query_many_async("SELECT body FROM notes", Params::new(), &never)
        .await
        .expect("select");
    assert_eq!(bodies, vec!["hello".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_an_async_query_interrupts_it() {
    let db = require_database!();
    let options = db.bare_options();
    let manager = tokio::task::spawn_blocking(move || open_manager(&options, 1))
        .await
        .expect("setup task");
    let ctx = manager.context();

    let (handle, signal) = cancel_pair();
    let started = Instant::now();
    let query = ctx.query_single_async::<i32>("SELECT 1 FROM pg_sleep(30)", Params::new(), &signal);
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.cancel();
    };
    let (result, ()) = tokio::join!(query, canceller);

    assert!(matches!(result, Err(DbError::Cancelled)), "got {result:?}");
    assert!(started.elapsed() < Duration::from_secs(25));

    // The interrupted connection was discarded; the pool still serves calls.
    let one: i32 = ctx
        .query_single_async("SELECT 1", Params::new(), &CancelSignal::never())
        .await
        .expect("pool should recover");
    assert_eq!(one, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_bound_call_aborts_the_transaction() {
    let db = require_database!();
    let options = db.bare_options();
    let manager = tokio::task::spawn_blocking(move || open_manager(&options, 1))
        .await
        .expect("setup task");

    let mut tx = manager
        .begin_transaction_async(IsolationLevel::ReadCommitted)
        .await
        .expect("begin");
    let (handle, signal) = cancel_pair();
    handle.cancel();
    let result = tx
        .query_single_async::<i32>("SELECT 1", Params::new(), &signal)
        .await;
    assert!(matches!(result, Err(DbError::Cancelled)), "got {result:?}");

    let (handle, signal) = cancel_pair();
    let query = tx.query_single_async::<i32>("SELECT 1 FROM pg_sleep(30)", Params::new(), &signal);
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.cancel();
    };
    let (result, ()) = tokio::join!(query, canceller);
    assert!(matches!(result, Err(DbError::Cancelled)), "got {result:?}");

    let err = tx
        .query_single_async::<i32>("SELECT 1", Params::new(), &CancelSignal::never())
        .await
        .expect_err("aborted transaction rejects statements");
    assert!(matches!(err, DbError::IllegalState(_)), "got {err:?}");

    tx.close_async().await;
    assert_eq!(tx.mode(), ContextMode::Free);
}

// ── distributed lock ────────────────────────────────────────────────

#[test]
fn held_lock_times_out_other_acquirers() {
    let db = require_database!();
    let options = db.bare_options();
    open_manager(&options, 1);
    let config = options.pg_config();

    let held = DistributedLock::new("migration_7_reindex", config)
        .acquire()
        .expect("first acquire");

    let started = Instant::now();
    let err = DistributedLock::new("migration_7_reindex", config)
        .with_timeout(Some(Duration::from_millis(200)))
        .acquire()
        .expect_err("held lock should time out");
    assert!(matches!(err, DbError::LockTimeout { .. }), "got {err:?}");
    assert!(started.elapsed() >= Duration::from_millis(200));

    let err = DistributedLock::new("migration_7_reindex", config)
        .with_timeout(Some(Duration::ZERO))
        .acquire()
        .expect_err("try-lock should fail while held");
    assert!(matches!(err, DbError::LockTimeout { .. }), "got {err:?}");

    let other = DistributedLock::new("migration_8_vacuum", config)
        .with_timeout(Some(Duration::ZERO))
        .acquire()
        .expect("a different name is independent");
    other.release().expect("release other");

    held.release().expect("release");
    DistributedLock::new("migration_7_reindex", config)
        .with_timeout(Some(Duration::from_secs(5)))
        .acquire()
        .expect("acquire after release");
}

#[test]
fn dropping_the_guard_releases_the_lock() {
    let db = require_database!();
    let options = db.bare_options();
    open_manager(&options, 1);
    let config = options.pg_config();

    {
        let _guard = DistributedLock::new("applied_migrations", config)
            .acquire()
            .expect("acquire");
    }

    DistributedLock::new("applied_migrations", config)
        .with_timeout(Some(Duration::ZERO))
        .acquire()
        .expect("lock should be free after drop");
}

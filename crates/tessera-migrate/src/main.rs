//! Tessera migration binary: brings a PostgreSQL database up to date at
//! deploy time.
//!
//! Loads configuration, initialises structured logging, ensures the target
//! database exists and applies every pending `migration_<N>_*.sql` script
//! found under the migration root. Several instances may run at once; each
//! migration is applied by exactly one of them.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tessera_db::{DbError, DbOptions, MigrationError, MigrationReport, MigrationRunner};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LoggingConfig};

/// Errors that abort startup.
#[derive(Debug, Error)]
enum StartupError {
    /// The default migration root could not be derived.
    #[error("cannot locate the executable's directory: {0}")]
    MigrationRoot(#[source] std::io::Error),

    /// Connection string or migration catalog is invalid.
    #[error(transparent)]
    Options(#[from] DbError),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("TESSERA_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

/// The configured migration root, or the directory holding the executable.
fn migration_root(configured: Option<&str>) -> Result<PathBuf, StartupError> {
    if let Some(root) = configured {
        return Ok(PathBuf::from(root));
    }
    let exe = std::env::current_exe().map_err(StartupError::MigrationRoot)?;
    Ok(exe.parent().map(Path::to_path_buf).unwrap_or_default())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn migrate(config: &Config) -> Result<MigrationReport, StartupError> {
    let root = migration_root(config.migrations.root.as_deref())?;
    let options = DbOptions::discover(&config.database.url, &root)?;

    tracing::info!(
        root = %root.display(),
        database = options.database_name().unwrap_or("<none>"),
        migrations = options.migrations().len(),
        "discovered migrations"
    );

    let runner = MigrationRunner::new(options, config.migration_settings());
    Ok(runner.run_async().await?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("tessera.toml"));

    let config = match config::load_config(selected_config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging);

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    match migrate(&config).await {
        Ok(report) => {
            tracing::info!(
                applied = report.applied.len(),
                skipped = report.skipped.len(),
                "database is up to date"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "database migration failed");
            ExitCode::FAILURE
        }
    }
}

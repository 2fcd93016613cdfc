//! Per-process database options.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::catalog::{self, MigrationCatalog, MigrationScript};
use crate::error::DbError;

/// Database every PostgreSQL server has; used for administrative work such
/// as creating the target database.
pub const ADMIN_DATABASE: &str = "postgres";

/// Connection target and ordered migration scripts, fixed at startup.
#[derive(Debug, Clone)]
pub struct DbOptions {
    connection_string: String,
    config: postgres::Config,
    migrations: Vec<MigrationScript>,
}

impl DbOptions {
    /// Parses `connection_string` and discovers migrations under `root`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Configuration` if the connection string is invalid
    /// or the migration root cannot be scanned.
    pub fn discover(
        connection_string: impl Into<String>,
        root: impl AsRef<Path>,
    ) -> Result<Self, DbError> {
        let migrations = MigrationCatalog::new(root.as_ref()).discover()?;
        Self::with_scripts(connection_string.into(), migrations)
    }

    /// Builds options from explicit migration paths, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Configuration` if a path does not follow the
    /// migration naming pattern or the paths are not in ascending order.
    pub fn from_paths<I, P>(connection_string: impl Into<String>, paths: I) -> Result<Self, DbError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut migrations = Vec::new();
        for path in paths {
            let path = path.into();
            let script = MigrationScript::from_path(&path)?.ok_or_else(|| {
                DbError::Configuration(format!(
                    "'{}' is not named migration_<N>_<description>.sql",
                    path.display()
                ))
            })?;
            if let Some(previous) = migrations.last().map(|s: &MigrationScript| s.sequence) {
                if script.sequence < previous {
                    return Err(DbError::Configuration(format!(
                        "migration '{}' is listed after sequence number {}",
                        script.name, previous
                    )));
                }
            }
            migrations.push(script);
        }
        catalog::ensure_unique(&migrations)?;
        Self::with_scripts(connection_string.into(), migrations)
    }

    fn with_scripts(
        connection_string: String,
        migrations: Vec<MigrationScript>,
    ) -> Result<Self, DbError> {
        let config = postgres::Config::from_str(&connection_string)
            .map_err(|e| DbError::Configuration(format!("invalid connection string: {e}")))?;
        Ok(Self {
            connection_string,
            config,
            migrations,
        })
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// The parsed connection target.
    pub fn pg_config(&self) -> &postgres::Config {
        &self.config
    }

    /// Migration scripts in apply order.
    pub fn migrations(&self) -> &[MigrationScript] {
        &self.migrations
    }

    /// Migration file paths in apply order.
    pub fn migration_file_paths(&self) -> impl Iterator<Item = &Path> {
        self.migrations.iter().map(|s| s.path.as_path())
    }

    /// The target database named by the connection string, if any.
    pub fn database_name(&self) -> Option<&str> {
        self.config.get_dbname().filter(|name| !name.is_empty())
    }

    /// The same target, pointed at [`ADMIN_DATABASE`].
    pub fn admin_config(&self) -> postgres::Config {
        let mut admin = self.config.clone();
        admin.dbname(ADMIN_DATABASE);
        admin
    }
}

//! Migration script discovery.
//!
//! Migrations are plain SQL files named `migration_<N>_<description>.sql`
//! anywhere under a root directory. `N` decides apply order; other `.sql`
//! files are not migrations and are ignored.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use walkdir::WalkDir;

use crate::error::DbError;

static MIGRATION_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^migration_(\d+)_.*\.sql$").expect("migration file pattern is valid")
});

/// A discovered migration script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    /// Absolute path of the script.
    pub path: PathBuf,
    /// File name without extension; the bookkeeping key.
    pub name: String,
    /// Numeric segment of the file name; the apply order.
    pub sequence: u64,
}

impl MigrationScript {
    /// Parses `path` as a migration script, returning `Ok(None)` when the
    /// file name does not follow the naming pattern.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Configuration` if the name matches but its sequence
    /// number does not fit in a `u64`.
    pub fn from_path(path: &Path) -> Result<Option<Self>, DbError> {
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            return Ok(None);
        };
        let Some(captures) = MIGRATION_FILE.captures(file_name) else {
            return Ok(None);
        };
        let sequence = captures[1].parse().map_err(|e| {
            DbError::Configuration(format!(
                "migration '{}' has an unusable sequence number: {e}",
                path.display()
            ))
        })?;
        let name = file_name[..file_name.len() - ".sql".len()].to_string();
        Ok(Some(Self {
            path: path.to_path_buf(),
            name,
            sequence,
        }))
    }
}

/// Finds and orders the migration scripts under one root directory.
#[derive(Debug, Clone)]
pub struct MigrationCatalog {
    root: PathBuf,
}

impl MigrationCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Recursively discovers migration scripts, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Configuration` if the root directory does not
    /// exist, or if two scripts share a sequence number or a name.
    pub fn discover(&self) -> Result<Vec<MigrationScript>, DbError> {
        if !self.root.is_dir() {
            return Err(DbError::Configuration(format!(
                "migration root '{}' does not exist",
                self.root.display()
            )));
        }
        let root = std::fs::canonicalize(&self.root)?;

        let mut scripts = Vec::new();
        for entry in WalkDir::new(&root).follow_links(true) {
            // A skipped directory could hide a migration numbered below
            // ones that would still run.
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map_or_else(|| root.display().to_string(), |p| p.display().to_string());
                DbError::Configuration(format!("cannot read migration root entry '{path}': {e}"))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            match MigrationScript::from_path(entry.path())? {
                Some(script) => scripts.push(script),
                None => {
                    if entry
                        .path()
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
                    {
                        tracing::trace!(path = %entry.path().display(), "ignoring non-migration sql file");
                    }
                }
            }
        }

        scripts.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.path.cmp(&b.path)));
        ensure_unique(&scripts)?;

        tracing::debug!(
            root = %root.display(),
            count = scripts.len(),
            "discovered migration scripts"
        );
        Ok(scripts)
    }
}

/// Rejects ordered scripts that share a sequence number or a name.
pub(crate) fn ensure_unique(scripts: &[MigrationScript]) -> Result<(), DbError> {
    for pair in scripts.windows(2) {
        if pair[0].sequence == pair[1].sequence {
            return Err(DbError::Configuration(format!(
                "duplicate migration sequence number {}: '{}' and '{}'",
                pair[0].sequence,
                pair[0].path.display(),
                pair[1].path.display()
            )));
        }
    }

    let mut names = HashSet::new();
    for script in scripts {
        if !names.insert(script.name.as_str()) {
            return Err(DbError::Configuration(format!(
                "duplicate migration name '{}'",
                script.name
            )));
        }
    }
    Ok(())
}

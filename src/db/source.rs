//! Migration scripts bundled with the binary.
//!
//! Each script is a plain SQL file whose file name is both its identity and
//! its ordering key. Names should sort in the order the scripts are meant to
//! run, e.g. with a zero-padded sequence (`0001_init.sql`) or a timestamp prefix.

use super::error::DbError;
use std::collections::HashSet;
use std::path::Path;

/// Scripts compiled into the binary. New migrations are appended here.
const EMBEDDED: &[(&str, &str)] = &[("0001_init.sql", include_str!("sql/0001_init.sql"))];

/// A single named SQL migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub name: String,
    pub body: String,
}

impl MigrationScript {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        MigrationScript {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// An immutable set of migration scripts, sorted by name.
#[derive(Debug, Clone, Default)]
pub struct MigrationSource {
    scripts: Vec<MigrationScript>,
}

impl MigrationSource {
    /// Build a source from arbitrary scripts.
    ///
    /// # Errors
    /// Returns `DbError::DuplicateMigration` if two scripts share a name.
    pub fn new(mut scripts: Vec<MigrationScript>) -> Result<Self, DbError> {
        let mut seen = HashSet::with_capacity(scripts.len());
        for script in &scripts {
            if !seen.insert(script.name.as_str()) {
                return Err(DbError::DuplicateMigration(script.name.clone()));
            }
        }
        scripts.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        Ok(MigrationSource { scripts })
    }

    /// The scripts bundled at build time.
    pub fn embedded() -> Self {
        let mut scripts: Vec<MigrationScript> = EMBEDDED
            .iter()
            .map(|(name, body)| MigrationScript::new(*name, *body))
            .collect();
        scripts.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        MigrationSource { scripts }
    }

    /// Load every `*.sql` file in `dir`, keyed by file name.
    ///
    /// # Errors
    /// Returns `DbError::MigrationRead` if the directory or any script cannot be read.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, DbError> {
        let dir = dir.as_ref();
        let read_err =
            |name: String| move |source: std::io::Error| DbError::MigrationRead { name, source };
        let dir_name = dir.display().to_string();

        let entries = std::fs::read_dir(dir).map_err(read_err(dir_name.clone()))?;
        let mut scripts = Vec::new();
        for entry in entries {
            let path = entry.map_err(read_err(dir_name.clone()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") || !path.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let body = std::fs::read_to_string(&path).map_err(read_err(name.clone()))?;
            scripts.push(MigrationScript::new(name, body));
        }

        Self::new(scripts)
    }

    pub fn scripts(&self) -> &[MigrationScript] {
        &self.scripts
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scripts.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

//! Error types for the database lifecycle.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while opening, migrating, using or closing the database.
#[derive(Debug, Error)]
pub enum DbError {
    /// Pool bounds are inconsistent (e.g. more idle than open connections).
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The directory holding the database file could not be created.
    #[error("create database directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The database file could not be opened.
    #[error("open database: {0}")]
    Open(#[source] sqlx::Error),

    /// A connection pragma could not be applied.
    #[error("{setting} pragma: {source}")]
    Pragma {
        setting: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// A bundled migration script could not be read.
    #[error("read migration {name:?}: {source}")]
    MigrationRead {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Two migration scripts share a name.
    #[error("duplicate migration name {0:?}")]
    DuplicateMigration(String),

    /// The `migrations` bookkeeping table could not be created.
    #[error("cannot create migrations table: {0}")]
    Bookkeeping(#[source] sqlx::Error),

    /// A migration script failed; its transaction was rolled back.
    #[error("migration error: name={name:?} err={source}")]
    MigrationApply {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Background work bound to the handle did not shut down cleanly.
    #[error("close database: {0}")]
    Close(#[source] tokio::task::JoinError),

    /// The handle has been closed.
    #[error("database is closed")]
    Closed,

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
}

impl DbError {
    /// Name of the migration script this error is attributed to, if any.
    pub fn migration_name(&self) -> Option<&str> {
        match self {
            DbError::MigrationRead { name, .. } | DbError::MigrationApply { name, .. } => {
                Some(name)
            }
            DbError::DuplicateMigration(name) => Some(name),
            _ => None,
        }
    }
}

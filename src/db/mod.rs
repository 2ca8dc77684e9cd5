//! Database module for SQLite operations.
//!
//! This module provides:
//! - Connection pool setup and SQLite pragma configuration
//! - The bundled migration source and the migration engine
//! - `Database`, the handle that owns the pool for the process lifetime

pub mod error;
pub mod migrations;
pub mod pool;
pub mod source;

pub use error::DbError;
pub use migrations::{MigrationOutcome, MigrationReport};
pub use pool::PoolConfig;
pub use source::{MigrationScript, MigrationSource};

use sqlx::sqlite::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Open the database at `dsn` and apply every script in `source`.
///
/// If migrations fail the pool is closed before the error is returned, so no
/// half-initialised handle is ever handed out.
///
/// # Errors
/// Returns any error from [`Database::open`] or [`Database::migrate`].
pub async fn init_db(
    dsn: &str,
    config: &PoolConfig,
    source: &MigrationSource,
) -> Result<Database, DbError> {
    let db = Database::open(dsn, config).await?;

    if let Err(e) = db.migrate(source).await {
        if let Err(close_err) = db.close().await {
            warn!("failed to close database after migration error: {}", close_err);
        }
        return Err(e);
    }

    info!("Database initialized successfully at {}", dsn);
    Ok(db)
}

/// Owns the connection pool and any background work bound to it.
///
/// Callers must not issue queries until [`Database::migrate`] has returned
/// successfully, and must drain in-flight work before calling
/// [`Database::close`]; close does not interrupt running queries.
#[derive(Debug)]
pub struct Database {
    pool: SqlitePool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    trimmer: Mutex<Option<JoinHandle<()>>>,
}

impl Database {
    /// Open the file at `dsn`, creating it if absent, and configure the pool.
    ///
    /// # Errors
    /// Returns `DbError::InvalidConfig`, `DbError::CreateDir`, `DbError::Open`
    /// or `DbError::Pragma`. Nothing is left open on failure.
    pub async fn open(dsn: &str, config: &PoolConfig) -> Result<Self, DbError> {
        let pool = pool::open_pool(dsn, config).await?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let trimmer = (config.max_idle < config.max_open)
            .then(|| pool::spawn_idle_trimmer(pool.clone(), config, shutdown_rx));

        Ok(Database {
            pool,
            closed: AtomicBool::new(false),
            shutdown,
            trimmer: Mutex::new(trimmer),
        })
    }

    /// Apply outstanding migrations from `source`.
    ///
    /// # Errors
    /// Returns `DbError::Closed` after [`Database::close`], otherwise see
    /// [`migrations::migrate`].
    pub async fn migrate(&self, source: &MigrationSource) -> Result<MigrationReport, DbError> {
        self.ensure_open()?;
        migrations::migrate(&self.pool, source.scripts()).await
    }

    /// The underlying pool, for running sqlx queries directly.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A receiver that flips to `true` when the handle is closed.
    ///
    /// Background tasks that must not outlive the database select on this.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Execute one or more statements, returning the rows affected.
    pub async fn execute(&self, sql: &str) -> Result<u64, DbError> {
        use sqlx::Executor;

        self.ensure_open()?;
        let result = self.pool.execute(sql).await?;
        Ok(result.rows_affected())
    }

    /// Round-trip a trivial query to check a connection can be acquired.
    pub async fn ping(&self) -> Result<(), DbError> {
        self.ensure_open()?;
        let (one,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        debug_assert_eq!(one, 1);
        Ok(())
    }

    /// Names recorded in the `migrations` table, sorted.
    pub async fn applied_migrations(&self) -> Result<Vec<String>, DbError> {
        self.ensure_open()?;
        Ok(migrations::applied_names(&self.pool).await?)
    }

    /// Stop background work and close every pooled connection.
    ///
    /// Safe to call more than once; later calls return `Ok(())`. The pool is
    /// closed even when stopping background work fails.
    ///
    /// # Errors
    /// Returns `DbError::Close` if a background task panicked.
    pub async fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.send_replace(true);

        let trimmer = match self.trimmer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let joined = match trimmer {
            Some(handle) => handle.await,
            None => Ok(()),
        };

        self.pool.close().await;
        info!("Database closed");

        joined.map_err(DbError::Close)
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        Ok(())
    }
}

//! Connection pool setup and SQLite pragma configuration.

use super::error::DbError;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Connection, Row};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lower bound on how long a caller waits for a pooled connection.
pub const MIN_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// Pool bounds and durability settings, fixed for the lifetime of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of open connections.
    pub max_open: u32,
    /// Idle connections kept beyond this count are closed by the idle trimmer.
    pub max_idle: u32,
    /// Idle connections older than this are evicted.
    pub conn_max_idle_time: Duration,
    /// Connections are recycled after this long, regardless of use.
    pub conn_max_lifetime: Duration,
    /// How long a blocked writer waits on a lock before failing.
    pub busy_timeout_ms: u32,
    /// An external replication agent owns WAL checkpointing.
    pub replication_active: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 25,
            max_idle: 25,
            conn_max_idle_time: Duration::from_secs(5 * 60),
            conn_max_lifetime: Duration::from_secs(2 * 60 * 60),
            busy_timeout_ms: 5000,
            replication_active: false,
        }
    }
}

impl PoolConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.busy_timeout_ms))
    }

    /// How long a caller waits for a pooled connection: the busy timeout, but
    /// never less than [`MIN_ACQUIRE_TIMEOUT`] so a zero busy timeout still
    /// leaves room to open a connection.
    pub fn acquire_timeout(&self) -> Duration {
        self.busy_timeout().max(MIN_ACQUIRE_TIMEOUT)
    }

    /// Check the bounds are consistent.
    ///
    /// # Errors
    /// Returns `DbError::InvalidConfig` describing the first violated bound.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.max_open == 0 {
            return Err(DbError::InvalidConfig(
                "max_open must be at least 1".to_string(),
            ));
        }
        if self.max_idle > self.max_open {
            return Err(DbError::InvalidConfig(format!(
                "max_idle ({}) must not exceed max_open ({})",
                self.max_idle, self.max_open
            )));
        }
        Ok(())
    }
}

/// A single `PRAGMA <setting> = <value>` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pragma {
    pub setting: &'static str,
    pub value: String,
}

impl Pragma {
    fn new(setting: &'static str, value: impl ToString) -> Self {
        Pragma {
            setting,
            value: value.to_string(),
        }
    }

    fn statement(&self) -> String {
        format!("PRAGMA {} = {}", self.setting, self.value)
    }
}

/// The pragmas applied to every new connection, in order.
pub(crate) fn pragmas(config: &PoolConfig) -> Vec<Pragma> {
    let mut pragmas = vec![
        // Concurrent readers alongside a single writer.
        Pragma::new("journal_mode", "WAL"),
        // Safe under WAL: fsync only happens on checkpoint.
        Pragma::new("synchronous", "NORMAL"),
        Pragma::new("foreign_keys", "ON"),
        Pragma::new("busy_timeout", config.busy_timeout_ms),
    ];
    if config.replication_active {
        // The replication agent decides when the WAL is merged into the main file.
        pragmas.push(Pragma::new("wal_autocheckpoint", 0));
    }
    pragmas
}

/// A pragma that could not be applied to a connection.
#[derive(Debug, Error)]
#[error("{setting} pragma: {source}")]
pub(crate) struct PragmaFailure {
    setting: &'static str,
    #[source]
    source: sqlx::Error,
}

impl From<PragmaFailure> for DbError {
    fn from(failure: PragmaFailure) -> Self {
        DbError::Pragma {
            setting: failure.setting,
            source: failure.source,
        }
    }
}

async fn apply_pragmas(
    conn: &mut SqliteConnection,
    config: &PoolConfig,
) -> Result<(), PragmaFailure> {
    for pragma in pragmas(config) {
        let sql = pragma.statement();
        let result = if pragma.setting == "journal_mode" {
            // journal_mode returns the mode actually in effect.
            sqlx::query(&sql)
                .fetch_one(&mut *conn)
                .await
                .map(|row| {
                    let mode: String = row.get(0);
                    if !mode.eq_ignore_ascii_case("wal") {
                        warn!(journal_mode = %mode, "SQLite did not switch to WAL");
                    }
                })
        } else {
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map(|_| ())
        };

        result.map_err(|source| PragmaFailure {
            setting: pragma.setting,
            source,
        })?;
    }
    debug!("SQLite pragmas configured");
    Ok(())
}

/// The on-disk file named by a DSN, or `None` for in-memory databases.
pub(crate) fn database_file(dsn: &str) -> Option<PathBuf> {
    let rest = dsn
        .strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))
        .unwrap_or(dsn);
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" || dsn.contains("mode=memory") {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Open the database at `dsn` and build a configured pool.
///
/// The file and its parent directories are created if missing. A first
/// connection is opened directly and configured with the pragmas, so an open
/// or pragma failure is reported here rather than retried by the pool. The
/// pool itself connects lazily and runs the same pragmas on every connection.
///
/// # Errors
/// Returns `DbError::Pragma` naming the setting that failed, or
/// `DbError::Open` if the file itself cannot be opened.
pub async fn open_pool(dsn: &str, config: &PoolConfig) -> Result<SqlitePool, DbError> {
    config.validate()?;

    if let Some(file) = database_file(dsn) {
        if let Some(parent) = file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| DbError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(dsn)
        .map_err(DbError::Open)?
        .create_if_missing(true)
        .busy_timeout(config.busy_timeout());

    let mut conn = options.connect().await.map_err(DbError::Open)?;
    let configured = apply_pragmas(&mut conn, config).await;
    if let Err(e) = conn.close().await {
        debug!("failed to close setup connection: {}", e);
    }
    configured?;

    let hook_config = *config;
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_open)
        .min_connections(0)
        .acquire_timeout(config.acquire_timeout())
        .idle_timeout(config.conn_max_idle_time)
        .max_lifetime(config.conn_max_lifetime)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                apply_pragmas(conn, &hook_config)
                    .await
                    .map_err(|failure| sqlx::Error::Configuration(Box::new(failure)))
            })
        })
        .connect_lazy_with(options);

    info!(
        max_open = config.max_open,
        max_idle = config.max_idle,
        replication_active = config.replication_active,
        "SQLite pool opened"
    );
    Ok(pool)
}

/// Close idle connections until at most `max_idle` remain.
///
/// Returns the number of connections closed.
pub(crate) async fn trim_idle(pool: &SqlitePool, max_idle: u32) -> usize {
    let mut closed = 0;
    while pool.num_idle() > max_idle as usize {
        let Some(conn) = pool.try_acquire() else {
            break;
        };
        if let Err(e) = conn.detach().close().await {
            warn!("failed to close idle connection: {}", e);
        }
        closed += 1;
    }
    closed
}

/// Periodically trims idle connections until `shutdown` flips to `true`.
pub(crate) fn spawn_idle_trimmer(
    pool: SqlitePool,
    config: &PoolConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let max_idle = config.max_idle;
    let period =
        (config.conn_max_idle_time / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));

    tokio::spawn(async move {
        debug!(max_idle, period_ms = period.as_millis() as u64, "idle trimmer started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            let closed = trim_idle(&pool, max_idle).await;
            if closed > 0 {
                debug!(closed, "trimmed idle connections");
            }
        }
        debug!("idle trimmer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn db_path(temp_dir: &TempDir) -> String {
        temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string()
    }

    #[test]
    fn test_default_config_matches_documented_values() {
        let config = PoolConfig::default();
        assert_eq!(config.max_open, 25);
        assert_eq!(config.max_idle, 25);
        assert_eq!(config.conn_max_idle_time, Duration::from_secs(300));
        assert_eq!(config.conn_max_lifetime, Duration::from_secs(7200));
        assert_eq!(config.busy_timeout(), Duration::from_millis(5000));
        assert!(!config.replication_active);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let zero = PoolConfig {
            max_open: 0,
            max_idle: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(DbError::InvalidConfig(_))));

        let too_idle = PoolConfig {
            max_open: 2,
            max_idle: 3,
            ..Default::default()
        };
        assert!(matches!(too_idle.validate(), Err(DbError::InvalidConfig(_))));
    }

    #[test]
    fn test_pragma_order() {
        let settings: Vec<&str> = pragmas(&PoolConfig::default())
            .iter()
            .map(|p| p.setting)
            .collect();
        assert_eq!(
            settings,
            vec!["journal_mode", "synchronous", "foreign_keys", "busy_timeout"]
        );
    }

    #[test]
    fn test_replication_disables_autocheckpoint() {
        let config = PoolConfig {
            replication_active: true,
            ..Default::default()
        };
        let pragmas = pragmas(&config);
        let last = pragmas.last().unwrap();
        assert_eq!(last.statement(), "PRAGMA wal_autocheckpoint = 0");
    }

    #[test]
    fn test_acquire_timeout_has_floor() {
        let zero = PoolConfig {
            busy_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(zero.acquire_timeout(), MIN_ACQUIRE_TIMEOUT);
        assert_eq!(PoolConfig::default().acquire_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_pragma_failure_names_setting() {
        let failure = PragmaFailure {
            setting: "busy_timeout",
            source: sqlx::Error::Protocol("boom".to_string()),
        };
        match DbError::from(failure) {
            DbError::Pragma { setting, .. } => assert_eq!(setting, "busy_timeout"),
            other => panic!("Expected Pragma error, got {:?}", other),
        }
    }

    #[test]
    fn test_database_file() {
        assert_eq!(database_file("data/app.db"), Some(PathBuf::from("data/app.db")));
        assert_eq!(
            database_file("sqlite://data/app.db?mode=rwc"),
            Some(PathBuf::from("data/app.db"))
        );
        assert_eq!(database_file("sqlite::memory:"), None);
        assert_eq!(database_file(":memory:"), None);
    }

    #[tokio::test]
    async fn test_open_pool_creates_file_and_parents() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("app.db");
        let dsn = path.to_string_lossy().to_string();

        let pool = open_pool(&dsn, &PoolConfig::default()).await.unwrap();
        assert!(path.exists());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_pragmas_configured() {
        let temp_dir = TempDir::new().unwrap();
        let config = PoolConfig {
            busy_timeout_ms: 1234,
            ..Default::default()
        };
        let pool = open_pool(&db_path(&temp_dir), &config).await.unwrap();

        let result: (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        assert_eq!(result.0, 1);

        let result: (i64,) = sqlx::query_as("PRAGMA busy_timeout")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        assert_eq!(result.0, 1234);

        // NORMAL = 1
        let result: (i64,) = sqlx::query_as("PRAGMA synchronous")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        assert_eq!(result.0, 1);

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        // `journal_mode=WAL` is best-effort; SQLite can fall back depending on environment.
        assert!(
            matches!(result.0.as_str(), "wal" | "delete"),
            "unexpected journal_mode: {}",
            result.0
        );
        pool.close().await;
    }

    #[tokio::test]
    async fn test_replication_mode_sets_autocheckpoint() {
        let temp_dir = TempDir::new().unwrap();
        let config = PoolConfig {
            replication_active: true,
            ..Default::default()
        };
        let pool = open_pool(&db_path(&temp_dir), &config).await.unwrap();

        let result: (i64,) = sqlx::query_as("PRAGMA wal_autocheckpoint")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        assert_eq!(result.0, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_open_pool_fails_on_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dsn = temp_dir.path().to_string_lossy().to_string();
        let result = open_pool(&dsn, &PoolConfig::default()).await;
        // SQLite may defer the failure to the first statement on the connection.
        assert!(
            matches!(result, Err(DbError::Open(_) | DbError::Pragma { .. })),
            "got {:?}",
            result.err()
        );
    }

    #[tokio::test]
    async fn test_trim_idle_closes_excess_connections() {
        let temp_dir = TempDir::new().unwrap();
        let pool = open_pool(&db_path(&temp_dir), &PoolConfig::default())
            .await
            .unwrap();

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire().await.unwrap());
        }
        drop(held);
        // Released connections return to the idle queue asynchronously.
        for _ in 0..50 {
            if pool.num_idle() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pool.num_idle() >= 4);

        let closed = trim_idle(&pool, 1).await;
        assert!(closed >= 3);
        assert!(pool.num_idle() <= 1);
        pool.close().await;
    }
}

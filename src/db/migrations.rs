//! Versioned schema migrations.
//!
//! Scripts run in byte-wise lexicographic order of their names. Each script
//! runs in its own immediate (write-locking) transaction together with the
//! insert of its row into the `migrations` table, so a script is either fully applied and recorded or not
//! applied at all. A restart resumes from the first unrecorded script.
//!
//! Ordering is strictly lexicographic: a script added later with a name that
//! sorts before already-recorded ones is still applied, after them in time.
//! The engine logs a warning when that happens rather than refusing it.

use super::error::DbError;
use super::source::MigrationScript;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnection, SqlitePool};
use sqlx::{Connection, Executor};
use tracing::{debug, info, warn};

/// Creates the bookkeeping table. Runs outside any migration transaction.
const CREATE_MIGRATIONS_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS migrations (name TEXT PRIMARY KEY)";

/// Result of a single script in a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// A record already existed; nothing was executed.
    AlreadyApplied,
    /// The script ran and its record was committed.
    Applied,
}

/// Names touched by a successful migration run, in the order they were processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

impl MigrationReport {
    pub fn total(&self) -> usize {
        self.applied.len() + self.skipped.len()
    }
}

/// Bring the database up to date with `scripts`.
///
/// # Errors
/// Returns `DbError::Bookkeeping` if the `migrations` table cannot be created,
/// or `DbError::MigrationApply` naming the first script that failed. Scripts
/// after a failing one are not attempted.
pub async fn migrate(
    pool: &SqlitePool,
    scripts: &[MigrationScript],
) -> Result<MigrationReport, DbError> {
    pool.execute(CREATE_MIGRATIONS_TABLE)
        .await
        .map_err(DbError::Bookkeeping)?;

    let mut ordered: Vec<&MigrationScript> = scripts.iter().collect();
    ordered.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

    let mut report = MigrationReport::default();
    for script in ordered {
        let outcome = migrate_script(pool, script)
            .await
            .map_err(|source| DbError::MigrationApply {
                name: script.name.clone(),
                source,
            })?;

        match outcome {
            MigrationOutcome::Applied => report.applied.push(script.name.clone()),
            MigrationOutcome::AlreadyApplied => report.skipped.push(script.name.clone()),
        }
    }

    info!(
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        "Migrations completed successfully"
    );
    Ok(report)
}

/// Run one script inside its own transaction.
///
/// The transaction is opened with `BEGIN IMMEDIATE`, taking the write lock
/// before the existence check. A second process migrating the same file waits
/// on the busy handler and then sees the record, instead of failing when its
/// read transaction tries to upgrade to a write.
async fn migrate_script(
    pool: &SqlitePool,
    script: &MigrationScript,
) -> Result<MigrationOutcome, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    (&mut *conn).execute("BEGIN IMMEDIATE").await?;

    match check_and_apply(&mut conn, script).await {
        Ok(MigrationOutcome::Applied) => {
            if let Err(e) = (&mut *conn).execute("COMMIT").await {
                rollback(conn, script).await;
                return Err(e);
            }
            info!(migration = %script.name, "migration success");
            Ok(MigrationOutcome::Applied)
        }
        Ok(MigrationOutcome::AlreadyApplied) => {
            (&mut *conn).execute("ROLLBACK").await?;
            debug!(migration = %script.name, "migration already applied, skipping");
            Ok(MigrationOutcome::AlreadyApplied)
        }
        Err(e) => {
            rollback(conn, script).await;
            Err(e)
        }
    }
}

/// Roll back an open transaction. A connection that cannot roll back is
/// closed rather than returned to the pool mid-transaction.
async fn rollback(mut conn: PoolConnection<Sqlite>, script: &MigrationScript) {
    if let Err(rollback_err) = (&mut *conn).execute("ROLLBACK").await {
        warn!(migration = %script.name, "rollback failed: {}", rollback_err);
        if let Err(e) = conn.detach().close().await {
            debug!("failed to close connection after rollback error: {}", e);
        }
    }
}

async fn check_and_apply(
    conn: &mut SqliteConnection,
    script: &MigrationScript,
) -> Result<MigrationOutcome, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM migrations WHERE name = ?")
        .bind(script.name.as_str())
        .fetch_one(&mut *conn)
        .await?;
    if count != 0 {
        return Ok(MigrationOutcome::AlreadyApplied);
    }

    let (later,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM migrations WHERE name > ?")
        .bind(script.name.as_str())
        .fetch_one(&mut *conn)
        .await?;
    if later != 0 {
        warn!(
            migration = %script.name,
            later_applied = later,
            "applying migration that sorts before already-applied migrations"
        );
    }

    (&mut *conn).execute(script.body.as_str()).await?;

    // Record in the same transaction so the record exists only if the script committed.
    sqlx::query("INSERT INTO migrations (name) VALUES (?)")
        .bind(script.name.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(MigrationOutcome::Applied)
}

/// Names recorded in the `migrations` table, sorted.
pub async fn applied_names(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT name FROM migrations ORDER BY name")
        .fetch_all(pool)
        .await
}

use crate::db::{DbError, PoolConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub env: Environment,
    pub database_dsn: String,
    pub migrations_dir: Option<PathBuf>,
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Testing,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Testing => "testing",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Invalid DB_MAX_OPEN_CONNS / DB_MAX_IDLE_CONNS: {0}")]
    InvalidPool(#[source] DbError),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let addr = env_map
            .get("ADDR")
            .cloned()
            .unwrap_or_else(|| "localhost:4444".to_string());

        let env = match env_map
            .get("APP_ENV")
            .map(|s| s.as_str())
            .unwrap_or("development")
        {
            "development" => Environment::Development,
            "testing" => Environment::Testing,
            "staging" => Environment::Staging,
            "production" => Environment::Production,
            other => {
                return Err(ConfigError::InvalidValue(
                    "APP_ENV".to_string(),
                    format!(
                        "must be development, testing, staging or production, got {}",
                        other
                    ),
                ))
            }
        };

        let database_dsn = env_map
            .get("DATABASE_DSN")
            .cloned()
            .unwrap_or_else(|| "data/example.db".to_string());

        let migrations_dir = env_map
            .get("MIGRATIONS_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            max_open: parse_or(&env_map, "DB_MAX_OPEN_CONNS", defaults.max_open)?,
            max_idle: parse_or(&env_map, "DB_MAX_IDLE_CONNS", defaults.max_idle)?,
            conn_max_idle_time: Duration::from_secs(parse_or(
                &env_map,
                "DB_CONN_MAX_IDLE_TIME_SECS",
                defaults.conn_max_idle_time.as_secs(),
            )?),
            conn_max_lifetime: Duration::from_secs(parse_or(
                &env_map,
                "DB_CONN_MAX_LIFETIME_SECS",
                defaults.conn_max_lifetime.as_secs(),
            )?),
            busy_timeout_ms: parse_or(&env_map, "DB_BUSY_TIMEOUT_MS", defaults.busy_timeout_ms)?,
            // Litestream takes over WAL checkpointing when it is configured.
            replication_active: env_map
                .get("LITESTREAM_ACCESS_KEY")
                .is_some_and(|key| !key.is_empty()),
        };

        pool.validate().map_err(ConfigError::InvalidPool)?;

        Ok(Config {
            addr,
            env,
            database_dsn,
            migrations_dir,
            pool,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            ConfigError::InvalidValue(key.to_string(), "must be a non-negative integer".to_string())
        }),
        None => Ok(default),
    }
}

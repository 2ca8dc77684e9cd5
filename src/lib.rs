pub mod api;
pub mod config;
pub mod db;
pub mod error;

pub use config::Config;
pub use db::{init_db, Database, DbError, MigrationScript, MigrationSource, PoolConfig};
pub use error::AppError;

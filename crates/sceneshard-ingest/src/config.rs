//! Configuration management

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{IngestError, IngestResult};

// ============================================================================
// Ingestion Configuration Constants
// ============================================================================

/// Default tokens per pipeline batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default rows per multi-row INSERT.
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 500;

/// Default root directory for progress ledgers.
pub const DEFAULT_WORK_DIR: &str = "./progress";

/// Default name of the unified view.
pub const DEFAULT_VIEW_NAME: &str = "scenes_all";

/// Default warehouse table holding one metadata row per token.
pub const DEFAULT_METADATA_TABLE: &str = "scene_metadata";

/// Default table holding the raw points aggregated into scene extents.
pub const DEFAULT_POINTS_TABLE: &str = "scene_points";

/// Minimum point count for a scene geometry to pass the quality check.
pub const DEFAULT_MIN_POINTS: i64 = 10;

/// Default number of buffered ledger entries before a flush.
pub const DEFAULT_PROGRESS_BUFFER: usize = 1000;

/// Upper bound on parallel workers when no explicit count is given.
pub const DEFAULT_MAX_WORKERS: usize = 16;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/sceneshard";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 20;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl DbConfig {
    /// Same pool settings against another database
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }
}

pub async fn create_pool(config: &DbConfig) -> IngestResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Shard database
    pub database: DbConfig,
    /// Metadata warehouse; same database as the shards unless overridden
    pub warehouse_url: String,
    /// Spatial aggregate source; same database as the shards unless overridden
    pub spatial_url: String,
    pub batch_size: usize,
    pub insert_batch_size: usize,
    pub work_dir: PathBuf,
    pub view_name: String,
    pub metadata_table: String,
    pub points_table: String,
    pub min_points: i64,
    pub progress_buffer: usize,
    pub max_workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DbConfig::default(),
            warehouse_url: DEFAULT_DATABASE_URL.to_string(),
            spatial_url: DEFAULT_DATABASE_URL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            view_name: DEFAULT_VIEW_NAME.to_string(),
            metadata_table: DEFAULT_METADATA_TABLE.to_string(),
            points_table: DEFAULT_POINTS_TABLE.to_string(),
            min_points: DEFAULT_MIN_POINTS,
            progress_buffer: DEFAULT_PROGRESS_BUFFER,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn from_env() -> IngestResult<Self> {
        dotenvy::dotenv().ok();

        let url = std::env::var("DATABASE_URL")
            .map_err(|_| IngestError::config("DATABASE_URL not set"))?;

        let config = IngestConfig {
            warehouse_url: std::env::var("WAREHOUSE_DATABASE_URL").unwrap_or_else(|_| url.clone()),
            spatial_url: std::env::var("SPATIAL_DATABASE_URL").unwrap_or_else(|_| url.clone()),
            database: DbConfig {
                url,
                max_connections: env_or("DB_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DB_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DB_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            batch_size: env_or("SCENESHARD_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            insert_batch_size: env_or("SCENESHARD_INSERT_BATCH_SIZE", DEFAULT_INSERT_BATCH_SIZE),
            work_dir: std::env::var("SCENESHARD_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_WORK_DIR)),
            view_name: std::env::var("SCENESHARD_VIEW_NAME")
                .unwrap_or_else(|_| DEFAULT_VIEW_NAME.to_string()),
            metadata_table: std::env::var("SCENESHARD_METADATA_TABLE")
                .unwrap_or_else(|_| DEFAULT_METADATA_TABLE.to_string()),
            points_table: std::env::var("SCENESHARD_POINTS_TABLE")
                .unwrap_or_else(|_| DEFAULT_POINTS_TABLE.to_string()),
            min_points: env_or("SCENESHARD_MIN_POINTS", DEFAULT_MIN_POINTS),
            progress_buffer: env_or("SCENESHARD_PROGRESS_BUFFER", DEFAULT_PROGRESS_BUFFER),
            max_workers: env_or("SCENESHARD_MAX_WORKERS", DEFAULT_MAX_WORKERS),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> IngestResult<()> {
        if self.database.url.is_empty() {
            return Err(IngestError::config("Database URL cannot be empty"));
        }
        if self.warehouse_url.is_empty() || self.spatial_url.is_empty() {
            return Err(IngestError::config("Source database URLs cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(IngestError::config("Database max_connections must be greater than 0"));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(IngestError::config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        if self.batch_size == 0 {
            return Err(IngestError::config("Batch size must be greater than 0"));
        }
        if self.insert_batch_size == 0 {
            return Err(IngestError::config("Insert batch size must be greater than 0"));
        }
        if self.progress_buffer == 0 {
            return Err(IngestError::config("Progress buffer size must be greater than 0"));
        }
        if self.max_workers == 0 {
            return Err(IngestError::config("Max workers must be greater than 0"));
        }

        for (label, identifier) in [
            ("view name", self.view_name.as_str()),
            ("metadata table", self.metadata_table.as_str()),
            ("points table", self.points_table.as_str()),
        ] {
            validate_identifier(label, identifier)?;
        }

        Ok(())
    }
}

/// Accepts `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`, at
/// most 63 bytes.
pub fn validate_identifier(label: &str, identifier: &str) -> IngestResult<()> {
    let valid_part = |part: &str| {
        !part.is_empty()
            && part.len() <= sceneshard_common::naming::MAX_IDENTIFIER_LEN
            && part
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    let parts: Vec<&str> = identifier.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(IngestError::config(format!(
            "{} '{}' is not a safe SQL identifier",
            label, identifier
        )));
    }
    Ok(())
}

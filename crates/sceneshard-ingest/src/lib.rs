//! Sceneshard Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Partitioned, resumable ingestion of geospatial scene records into one
//! PostGIS shard table per source dataset, plus a unified view across all
//! shards.
//!
//! # Components
//!
//! - [`manifest`]: token manifests (JSON, JSON lines, CSV/TSV, text)
//! - [`sources`]: metadata warehouse and spatial extent lookups
//! - [`store`]: shard table creation and bulk insert
//! - [`progress`]: per-dataset success/failure ledgers for resumption
//! - [`orchestrator`]: the batch pipeline, sequential or parallel
//! - [`view`]: the unified view and its stable-id/materialized variants
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sceneshard_ingest::config::{create_pool, IngestConfig};
//! use sceneshard_ingest::manifest::load_manifest;
//! use sceneshard_ingest::orchestrator::{BatchOrchestrator, OrchestratorConfig};
//! use sceneshard_ingest::sources::{PgGeometrySource, PgMetadataSource};
//! use sceneshard_ingest::store::PgShardStore;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let pool = create_pool(&config.database).await?;
//!
//!     let orchestrator = BatchOrchestrator::new(
//!         OrchestratorConfig::from_ingest_config(&config),
//!         Arc::new(PgMetadataSource::new(pool.clone(), config.metadata_table.clone())),
//!         Arc::new(PgGeometrySource::new(pool.clone(), config.points_table.clone(), config.min_points)),
//!         Arc::new(PgShardStore::new(pool)),
//!         CancellationToken::new(),
//!     );
//!
//!     let manifest = load_manifest("manifest.csv".as_ref())?;
//!     let summary = orchestrator.run(manifest).await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod manifest;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod sources;
mod sql;
pub mod store;
pub mod view;

pub use error::{IngestError, IngestResult};
pub use models::{SceneRecord, SourceDataset, Stage};
pub use orchestrator::{BatchOrchestrator, OrchestratorConfig, RunMode, RunSummary};
pub use progress::{ProgressStatistics, ProgressTracker};
pub use store::{InsertOutcome, PgShardStore, ShardStore};
pub use view::{UnifiedViewBuilder, ViewConfig, ViewVariant};

//! Shared fixtures for orchestrator tests
//!
//! In-memory stand-ins for the metadata warehouse, the spatial source and the
//! shard store, so pipeline behavior can be exercised without a database.

#![allow(dead_code)]

use async_trait::async_trait;
use sceneshard_common::ShardSchema;
use sceneshard_ingest::error::{IngestError, IngestResult};
use sceneshard_ingest::manifest::{Manifest, ManifestGroup};
use sceneshard_ingest::models::{BoundingBox, Geometry, SceneGeometry, SceneMetadata, SceneRecord, SourceDataset};
use sceneshard_ingest::sources::{GeometrySource, MetadataSource};
use sceneshard_ingest::store::{InsertOutcome, ShardStore};
use sceneshard_ingest::view::ViewPlan;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// PostGIS Test Container
// ============================================================================

/// PostGIS image with the extension preinstalled
const POSTGIS_IMAGE: &str = "postgis/postgis";
const POSTGIS_TAG: &str = "16-3.4";

/// PostGIS container plus a connected pool. The container stops on drop.
pub struct TestPostgis {
    _container: testcontainers::ContainerAsync<testcontainers_modules::postgres::Postgres>,
    pool: sqlx::PgPool,
    connection_string: String,
}

impl TestPostgis {
    pub async fn start() -> anyhow::Result<Self> {
        use anyhow::Context;
        use testcontainers::core::IntoContainerPort;
        use testcontainers::runners::AsyncRunner;
        use testcontainers::ImageExt;

        tracing::info!("Starting PostGIS test container...");

        let container = testcontainers_modules::postgres::Postgres::default()
            .with_name(POSTGIS_IMAGE)
            .with_tag(POSTGIS_TAG)
            .start()
            .await
            .context("Failed to start PostGIS container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostGIS")?;

        sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
            .execute(&pool)
            .await
            .context("Failed to enable PostGIS")?;

        Ok(Self {
            _container: container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sceneshard_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn tokens(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}-{:03}", prefix, i)).collect()
}

pub fn manifest(groups: Vec<(&str, Vec<String>)>) -> Manifest {
    Manifest {
        groups: groups
            .into_iter()
            .map(|(name, tokens)| ManifestGroup {
                name: name.to_string(),
                tokens,
                metadata: HashMap::new(),
            })
            .collect(),
    }
}

/// Business name used for a token unless a test overrides it
pub fn scene_name(token: &str) -> String {
    format!("scene-{}", token)
}

pub fn metadata_for(token: &str) -> SceneMetadata {
    SceneMetadata {
        token: token.to_string(),
        business_name: scene_name(token),
        event_id: Some(format!("event-{}", token)),
        source_id: Some("lidar".to_string()),
        timestamp: None,
        attributes: BTreeMap::new(),
    }
}

pub fn geometry_for(data_name: &str) -> SceneGeometry {
    SceneGeometry {
        data_name: data_name.to_string(),
        geometry: Geometry::Polygon(BoundingBox {
            min_x: 11.0,
            min_y: 48.0,
            max_x: 11.5,
            max_y: 48.5,
        }),
        point_count: 42,
        quality_flag: true,
    }
}

// ============================================================================
// Metadata source
// ============================================================================

#[derive(Default)]
pub struct FakeMetadataSource {
    rows: HashMap<String, SceneMetadata>,
    /// 1-based call numbers that fail as a whole
    failing_calls: HashSet<usize>,
    calls: AtomicUsize,
}

impl FakeMetadataSource {
    pub fn with_tokens<'a>(tokens: impl IntoIterator<Item = &'a String>) -> Self {
        let rows = tokens
            .into_iter()
            .map(|t| (t.clone(), metadata_for(t)))
            .collect();
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn insert(&mut self, metadata: SceneMetadata) {
        self.rows.insert(metadata.token.clone(), metadata);
    }

    pub fn fail_call(mut self, call: usize) -> Self {
        self.failing_calls.insert(call);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSource for FakeMetadataSource {
    async fn fetch_metadata(&self, tokens: &[String]) -> IngestResult<HashMap<String, SceneMetadata>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_calls.contains(&call) {
            return Err(IngestError::Fetch("warehouse timed out".to_string()));
        }
        Ok(tokens
            .iter()
            .filter_map(|t| self.rows.get(t).map(|m| (t.clone(), m.clone())))
            .collect())
    }
}

// ============================================================================
// Geometry source
// ============================================================================

#[derive(Default)]
pub struct FakeGeometrySource {
    rows: HashMap<String, SceneGeometry>,
    calls: AtomicUsize,
}

impl FakeGeometrySource {
    /// Geometry for the default business name of every token
    pub fn with_tokens<'a>(tokens: impl IntoIterator<Item = &'a String>) -> Self {
        let rows = tokens
            .into_iter()
            .map(|t| {
                let name = scene_name(t);
                (name.clone(), geometry_for(&name))
            })
            .collect();
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeometrySource for FakeGeometrySource {
    async fn fetch_geometry(&self, data_names: &[String]) -> IngestResult<HashMap<String, SceneGeometry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(data_names
            .iter()
            .filter_map(|n| self.rows.get(n).map(|g| (n.clone(), g.clone())))
            .collect())
    }
}

// ============================================================================
// Shard store
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub schema: ShardSchema,
    pub rows: Vec<SceneRecord>,
}

impl MemoryTable {
    pub fn tokens(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.token.clone()).collect()
    }
}

#[derive(Default)]
pub struct MemoryShardStore {
    pub tables: Mutex<BTreeMap<String, MemoryTable>>,
    pub view_plans: Mutex<Vec<ViewPlan>>,
    insert_calls: AtomicUsize,
    /// Cancel this token during the given (1-based) insert call
    cancel_on_insert: Option<(usize, CancellationToken)>,
    fail_ensure_table: bool,
    /// Tokens whose rows the store rejects
    rejected_tokens: HashSet<String>,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_on_insert(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_on_insert = Some((call, token));
        self
    }

    pub fn failing_ensure_table(mut self) -> Self {
        self.fail_ensure_table = true;
        self
    }

    pub fn rejecting(mut self, token: &str) -> Self {
        self.rejected_tokens.insert(token.to_string());
        self
    }

    pub fn with_table(self, name: &str) -> Self {
        self.tables
            .lock()
            .unwrap()
            .insert(name.to_string(), MemoryTable::default());
        self
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.tables.lock().unwrap().get(name).cloned()
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.table(name).map(|t| t.rows.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ShardStore for MemoryShardStore {
    async fn table_exists(&self, table: &str) -> IngestResult<bool> {
        Ok(self.tables.lock().unwrap().contains_key(table))
    }

    async fn ensure_table(&self, dataset: &SourceDataset, schema: &ShardSchema) -> IngestResult<String> {
        if self.fail_ensure_table {
            return Err(IngestError::shard_creation(
                &dataset.shard_table_name,
                "permission denied for schema public",
            ));
        }
        self.tables
            .lock()
            .unwrap()
            .entry(dataset.shard_table_name.clone())
            .or_insert_with(|| MemoryTable {
                schema: schema.clone(),
                rows: Vec::new(),
            });
        Ok(dataset.shard_table_name.clone())
    }

    async fn ensure_columns(&self, table: &str, schema: &ShardSchema) -> IngestResult<ShardSchema> {
        let mut tables = self.tables.lock().unwrap();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| IngestError::shard_creation(table, "missing"))?;
        entry.schema.extend_with(schema);
        Ok(entry.schema.clone())
    }

    async fn insert_batch(
        &self,
        table: &str,
        _schema: &ShardSchema,
        rows: &[SceneRecord],
    ) -> IngestResult<InsertOutcome> {
        let call = self.insert_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let mut outcome = InsertOutcome::default();
        {
            let mut tables = self.tables.lock().unwrap();
            let entry = tables
                .get_mut(table)
                .ok_or_else(|| IngestError::Fetch(format!("relation \"{}\" does not exist", table)))?;

            for row in rows {
                if self.rejected_tokens.contains(&row.token) {
                    outcome
                        .failed
                        .push((row.token.clone(), "invalid input syntax for type bigint".to_string()));
                } else if entry.rows.iter().any(|r| r.data_name == row.data_name) {
                    outcome.already_present.push(row.token.clone());
                } else {
                    entry.rows.push(row.clone());
                    outcome.inserted.push(row.token.clone());
                }
            }
        }

        if let Some((at, token)) = &self.cancel_on_insert {
            if *at == call {
                token.cancel();
            }
        }
        Ok(outcome)
    }

    async fn list_shards(&self, prefix: &str) -> IngestResult<Vec<String>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn apply_view_plan(&self, plan: &ViewPlan) -> IngestResult<()> {
        self.view_plans.lock().unwrap().push(plan.clone());
        Ok(())
    }
}

//! Batch orchestration
//!
//! Drives every source dataset of a manifest through
//! fetch metadata → fetch geometry → merge → insert, one fixed-size batch at
//! a time, and records each token's outcome in the dataset's progress ledger.
//!
//! Datasets are the unit of parallelism: one worker owns one dataset, its
//! shard table and its ledger directory. Within a dataset, batches run in
//! manifest order so a resumed run only has to skip recorded tokens.
//!
//! Cancellation is polled before each batch and after each fetch. A batch
//! interrupted between fetch and insert is dropped without recording
//! anything; a batch that reached the insert is recorded before the worker
//! stops.

use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{
    IngestConfig, DEFAULT_BATCH_SIZE, DEFAULT_INSERT_BATCH_SIZE, DEFAULT_MAX_WORKERS,
    DEFAULT_PROGRESS_BUFFER, DEFAULT_WORK_DIR,
};
use crate::error::{IngestError, IngestResult};
use crate::manifest::Manifest;
use crate::models::{ItemState, SceneGeometry, SceneMetadata, SceneRecord, SourceDataset, Stage};
use crate::progress::{aggregate_statistics, LedgerPaths, ProgressStatistics, ProgressTracker};
use crate::sources::{GeometrySource, MetadataSource};
use crate::store::{InsertOutcome, ShardStore};
use crate::view::{UnifiedViewBuilder, ViewConfig, ViewReport};
use sceneshard_common::naming::{NameCollision, NameRegistry};
use sceneshard_common::schema::resolve_schema;
use sceneshard_common::{DatasetKind, NameNormalizer, ShardSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// One dataset after another
    #[default]
    Sequential,
    /// Datasets spread over a bounded worker pool
    Parallel,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Sequential => f.write_str("sequential"),
            RunMode::Parallel => f.write_str("parallel"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub batch_size: usize,
    /// Rows per store insert call
    pub insert_batch_size: usize,
    pub work_dir: PathBuf,
    pub mode: RunMode,
    /// Explicit worker count; derived from the CPU count when `None`
    pub workers: Option<usize>,
    pub max_workers: usize,
    pub create_if_absent: bool,
    /// Only reprocess tokens whose latest recorded outcome is a failure
    pub retry_failed_only: bool,
    pub progress_buffer: usize,
    /// Rebuild the unified view after the run when set
    pub view: Option<ViewConfig>,
    pub show_progress: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            mode: RunMode::Sequential,
            workers: None,
            max_workers: DEFAULT_MAX_WORKERS,
            create_if_absent: true,
            retry_failed_only: false,
            progress_buffer: DEFAULT_PROGRESS_BUFFER,
            view: Some(ViewConfig::default()),
            show_progress: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_ingest_config(config: &IngestConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            insert_batch_size: config.insert_batch_size,
            work_dir: config.work_dir.clone(),
            max_workers: config.max_workers,
            progress_buffer: config.progress_buffer,
            view: Some(ViewConfig::new(config.view_name.clone())),
            ..Self::default()
        }
    }

    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(n) => n.max(1),
            None => default_worker_count(self.max_workers),
        }
    }
}

/// `ceil(1.5 × available parallelism)`, capped at `max_workers`
pub fn default_worker_count(max_workers: usize) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (available * 3).div_ceil(2).clamp(1, max_workers.max(1))
}

/// Outcome of one dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupReport {
    pub dataset: String,
    pub table: String,
    /// Tokens selected for this run, before skipping recorded successes
    pub candidates: usize,
    /// Candidates already recorded as successful by an earlier run
    pub already_done: usize,
    /// Tokens of batches that ran to completion
    pub processed: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub failures_by_stage: BTreeMap<Stage, usize>,
    pub batches_completed: u64,
    pub table_created: bool,
    /// Why the dataset stopped early, if it did
    pub aborted: Option<String>,
    pub interrupted: bool,
    /// Cancellation tripped before the dataset started
    pub not_started: bool,
    pub ledger: Option<LedgerPaths>,
}

impl GroupReport {
    fn new(dataset: &SourceDataset) -> Self {
        Self {
            dataset: dataset.raw_name.clone(),
            table: dataset.shard_table_name.clone(),
            ..Self::default()
        }
    }

    fn not_started(dataset: &SourceDataset) -> Self {
        Self {
            not_started: true,
            interrupted: true,
            ..Self::new(dataset)
        }
    }

    pub fn failed(&self) -> usize {
        self.failures_by_stage.values().sum()
    }
}

/// Aggregate outcome of a run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub groups: Vec<GroupReport>,
    pub interrupted: bool,
    pub collisions: Vec<NameCollision>,
    pub view: Option<ViewReport>,
    pub view_error: Option<String>,
}

impl RunSummary {
    pub fn processed(&self) -> usize {
        self.groups.iter().map(|g| g.processed).sum()
    }

    pub fn inserted(&self) -> usize {
        self.groups.iter().map(|g| g.inserted).sum()
    }

    pub fn already_present(&self) -> usize {
        self.groups.iter().map(|g| g.already_present).sum()
    }

    pub fn failed(&self) -> usize {
        self.groups.iter().map(GroupReport::failed).sum()
    }

    pub fn failures_by_stage(&self) -> BTreeMap<Stage, usize> {
        let mut totals = BTreeMap::new();
        for group in &self.groups {
            for (stage, count) in &group.failures_by_stage {
                *totals.entry(*stage).or_default() += count;
            }
        }
        totals
    }

    pub fn groups_aborted(&self) -> usize {
        self.groups.iter().filter(|g| g.aborted.is_some()).count()
    }

    pub fn tables_created(&self) -> usize {
        self.groups.iter().filter(|g| g.table_created).count()
    }

    /// Failure ledgers that hold at least one entry
    pub fn failure_ledgers(&self) -> Vec<&Path> {
        self.groups
            .iter()
            .filter(|g| g.failed() > 0)
            .filter_map(|g| g.ledger.as_ref())
            .map(|l| l.failed.as_path())
            .collect()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.interrupted { "INTERRUPTED" } else { "COMPLETED" };
        writeln!(f, "Run {} ({}): {}", self.run_id, self.mode, status)?;
        writeln!(f, "  processed:       {}", self.processed())?;
        writeln!(f, "  inserted:        {}", self.inserted())?;
        writeln!(f, "  already present: {}", self.already_present())?;
        writeln!(f, "  failed:          {}", self.failed())?;
        for (stage, count) in self.failures_by_stage() {
            writeln!(f, "    {:<16} {}", stage.as_str(), count)?;
        }

        let not_started = self.groups.iter().filter(|g| g.not_started).count();
        writeln!(
            f,
            "  datasets:        {} ({} aborted, {} not started, {} tables created)",
            self.groups.len(),
            self.groups_aborted(),
            not_started,
            self.tables_created()
        )?;
        for group in self.groups.iter().filter(|g| g.aborted.is_some()) {
            writeln!(
                f,
                "    {} aborted: {}",
                group.table,
                group.aborted.as_deref().unwrap_or_default()
            )?;
        }

        if !self.collisions.is_empty() {
            writeln!(f, "  name collisions:")?;
            for collision in &self.collisions {
                writeln!(f, "    {} <- {}", collision.table_name, collision.raw_names.join(", "))?;
            }
        }

        match (&self.view, &self.view_error) {
            (Some(view), _) if view.created.is_empty() => {
                writeln!(f, "  view:            dropped (no shards)")?
            },
            (Some(view), _) => writeln!(
                f,
                "  view:            {} over {} shards",
                view.created.join(", "),
                view.shard_count
            )?,
            (None, Some(err)) => writeln!(f, "  view:            rebuild failed: {}", err)?,
            (None, None) => {},
        }

        let ledgers = self.failure_ledgers();
        if !ledgers.is_empty() {
            writeln!(f, "  failure ledgers:")?;
            for path in ledgers {
                writeln!(f, "    {}", path.display())?;
            }
        }
        Ok(())
    }
}

/// Ledger statistics per dataset table plus their total
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatisticsReport {
    pub groups: Vec<(String, ProgressStatistics)>,
    pub total: ProgressStatistics,
}

impl fmt::Display for StatisticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (table, stats) in &self.groups {
            writeln!(f, "{}: {}", table, stats)?;
        }
        writeln!(f, "total: {}", self.total)
    }
}

/// Report recorded progress without touching any database. With a manifest,
/// only its datasets are listed; otherwise every ledger under `work_dir`.
pub fn show_statistics(
    work_dir: &Path,
    manifest: Option<Manifest>,
    names: &NameNormalizer,
) -> IngestResult<StatisticsReport> {
    let groups = match manifest {
        None => aggregate_statistics(work_dir)?,
        Some(manifest) => {
            let mut tables: Vec<String> = manifest
                .into_datasets(names)
                .into_iter()
                .map(|d| d.shard_table_name)
                .collect();
            tables.sort();
            tables.dedup();

            let mut groups = Vec::new();
            for table in tables {
                if !work_dir.join(&table).is_dir() {
                    continue;
                }
                let tracker = ProgressTracker::open(work_dir, &table, DEFAULT_PROGRESS_BUFFER)?;
                groups.push((table, tracker.statistics()));
            }
            groups
        },
    };

    let mut total = ProgressStatistics::default();
    for (_, stats) in &groups {
        total.merge(stats);
    }
    Ok(StatisticsReport { groups, total })
}

/// Combine the metadata and geometry of one token into a shard row
pub fn merge_record(
    kind: DatasetKind,
    names: &NameNormalizer,
    metadata: SceneMetadata,
    geometry: SceneGeometry,
) -> Result<SceneRecord, String> {
    if metadata.business_name.trim().is_empty() {
        return Err("metadata row has an empty business name".to_string());
    }
    if geometry.data_name != metadata.business_name {
        return Err(format!(
            "geometry for '{}' returned for business name '{}'",
            geometry.data_name, metadata.business_name
        ));
    }
    if !geometry.geometry.is_valid() {
        return Err("geometry has non-finite or inverted coordinates".to_string());
    }

    let attributes = match kind {
        DatasetKind::Standard => BTreeMap::new(),
        DatasetKind::Defect => metadata
            .attributes
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (names.column_name(&key), value))
            .collect(),
    };

    Ok(SceneRecord {
        token: metadata.token,
        data_name: metadata.business_name,
        event_id: metadata.event_id,
        source_id: metadata.source_id,
        timestamp: metadata.timestamp,
        quality_flag: geometry.quality_flag,
        geometry: geometry.geometry,
        attributes,
    })
}

/// Source datasets that normalize to the same table are processed as one,
/// keeping one worker per shard table.
fn merge_colliding(datasets: Vec<SourceDataset>) -> Vec<SourceDataset> {
    let mut merged: Vec<SourceDataset> = Vec::with_capacity(datasets.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for dataset in datasets {
        match index.get(&dataset.shard_table_name) {
            Some(&idx) => {
                let target = &mut merged[idx];
                let mut seen: HashSet<String> = target.tokens.iter().cloned().collect();
                for token in dataset.tokens {
                    if seen.insert(token.clone()) {
                        target.tokens.push(token);
                    }
                }
                for (key, value) in dataset.metadata {
                    target.metadata.entry(key).or_insert(value);
                }
                if dataset.kind == DatasetKind::Defect {
                    target.kind = DatasetKind::Defect;
                }
            },
            None => {
                index.insert(dataset.shard_table_name.clone(), merged.len());
                merged.push(dataset);
            },
        }
    }
    merged
}

enum BatchStep {
    Completed,
    /// Cancelled mid-batch; nothing recorded
    Abandoned,
    /// The shard could not be prepared; stop this dataset
    Aborted(String),
}

/// Shard table state of one dataset during a run
struct ShardState {
    table: String,
    /// Stored dynamic columns, `None` until the table is known to exist
    schema: Option<ShardSchema>,
}

fn advance(states: &mut [(String, ItemState)], mut step: impl FnMut(&str, ItemState) -> ItemState) {
    for (token, state) in states.iter_mut() {
        let current = std::mem::replace(state, ItemState::Pending);
        *state = step(token, current);
    }
}

/// Runs manifests against the upstream sources and the shard store
#[derive(Clone)]
pub struct BatchOrchestrator {
    config: Arc<OrchestratorConfig>,
    names: Arc<NameNormalizer>,
    metadata: Arc<dyn MetadataSource>,
    geometry: Arc<dyn GeometrySource>,
    store: Arc<dyn ShardStore>,
    cancel: CancellationToken,
    pool_size: Option<u32>,
}

impl BatchOrchestrator {
    /// Connections one worker holds at a time: fetches and inserts of a
    /// dataset run one after another.
    const CONNECTIONS_PER_WORKER: u32 = 1;

    pub fn new(
        config: OrchestratorConfig,
        metadata: Arc<dyn MetadataSource>,
        geometry: Arc<dyn GeometrySource>,
        store: Arc<dyn ShardStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config: Arc::new(config),
            names: Arc::new(NameNormalizer::default()),
            metadata,
            geometry,
            store,
            cancel,
            pool_size: None,
        }
    }

    pub fn with_names(mut self, names: NameNormalizer) -> Self {
        self.names = Arc::new(names);
        self
    }

    /// Shard pool size, used to warn when workers would starve for connections
    pub fn with_pool_size(mut self, max_connections: u32) -> Self {
        self.pool_size = Some(max_connections);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn validate_pool_size(&self, workers: usize) -> Option<String> {
        let pool_size = self.pool_size?;
        let required = (workers as u32).saturating_mul(Self::CONNECTIONS_PER_WORKER);
        if pool_size < required {
            Some(format!(
                "Database pool size ({}) is smaller than the worker count ({}); \
                 workers will wait on each other for connections",
                pool_size, workers
            ))
        } else {
            None
        }
    }

    /// Process every dataset of `manifest`.
    ///
    /// Fails only when the run cannot start (work directory not creatable).
    /// Everything narrower ends up in the ledgers and the summary.
    pub async fn run(&self, manifest: Manifest) -> IngestResult<RunSummary> {
        std::fs::create_dir_all(&self.config.work_dir)?;

        let run_id = Uuid::new_v4();
        let datasets = manifest.into_datasets(&self.names);

        let mut registry = NameRegistry::new();
        for dataset in &datasets {
            registry.register(&dataset.raw_name, &dataset.shard_table_name);
        }
        let collisions = registry.collisions();
        let datasets = merge_colliding(datasets);

        info!(
            run_id = %run_id,
            mode = %self.config.mode,
            datasets = datasets.len(),
            retry_failed_only = self.config.retry_failed_only,
            "Starting ingestion run"
        );

        let groups = match self.config.mode {
            RunMode::Sequential => self.run_sequential(datasets).await,
            RunMode::Parallel => self.run_parallel(datasets).await,
        };

        let interrupted = self.cancel.is_cancelled() || groups.iter().any(|g| g.interrupted);
        let mut summary = RunSummary {
            run_id,
            mode: self.config.mode,
            groups,
            interrupted,
            collisions,
            view: None,
            view_error: None,
        };

        self.refresh_view(&mut summary).await;

        info!(
            run_id = %run_id,
            processed = summary.processed(),
            inserted = summary.inserted(),
            failed = summary.failed(),
            interrupted = summary.interrupted,
            "Ingestion run finished"
        );

        Ok(summary)
    }

    async fn refresh_view(&self, summary: &mut RunSummary) {
        let Some(view) = self.config.view.clone() else {
            return;
        };
        // Batches commit independently, so an interrupted or no-op run can still
        // leave shards the current view does not cover
        if summary.interrupted {
            info!("Run interrupted; rebuilding unified view over committed shards");
        }

        let builder = UnifiedViewBuilder::new(view, (*self.names).clone());
        match builder.rebuild(self.store.as_ref()).await {
            Ok(report) => summary.view = Some(report),
            Err(e) => {
                error!(error = %e, "Failed to rebuild unified view");
                summary.view_error = Some(e.to_string());
            },
        }
    }

    async fn run_sequential(&self, datasets: Vec<SourceDataset>) -> Vec<GroupReport> {
        let mut reports = Vec::with_capacity(datasets.len());
        for dataset in datasets {
            if self.cancel.is_cancelled() {
                reports.push(GroupReport::not_started(&dataset));
                continue;
            }
            let bar = self.progress_bar(&dataset);
            reports.push(self.process_group(dataset, bar).await);
        }
        reports
    }

    async fn run_parallel(&self, datasets: Vec<SourceDataset>) -> Vec<GroupReport> {
        let workers = self.config.worker_count();
        if let Some(warning) = self.validate_pool_size(workers) {
            warn!("{}", warning);
        }
        info!(workers = workers, datasets = datasets.len(), "Processing datasets in parallel");

        stream::iter(datasets)
            .map(|dataset| {
                let this = self.clone();
                async move {
                    if this.cancel.is_cancelled() {
                        return GroupReport::not_started(&dataset);
                    }

                    let fallback = GroupReport::new(&dataset);
                    let handle =
                        tokio::spawn(async move { this.process_group(dataset, ProgressBar::hidden()).await });

                    match handle.await {
                        Ok(report) => report,
                        Err(e) => {
                            let err = IngestError::Worker {
                                dataset: fallback.dataset.clone(),
                                reason: e.to_string(),
                            };
                            error!(error = %err, "Dataset worker failed");
                            GroupReport {
                                aborted: Some(err.to_string()),
                                ..fallback
                            }
                        },
                    }
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await
    }

    fn progress_bar(&self, dataset: &SourceDataset) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{prefix:>24} [{bar:40.cyan/blue}] {human_pos}/{human_len} tokens [{elapsed_precise}]",
        )
        .map(|s| s.progress_chars("━━─"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_prefix(dataset.shard_table_name.clone());
        bar
    }

    async fn process_group(&self, dataset: SourceDataset, bar: ProgressBar) -> GroupReport {
        let span = info_span!("dataset", table = %dataset.shard_table_name);
        self.process_group_inner(dataset, bar).instrument(span).await
    }

    async fn process_group_inner(&self, dataset: SourceDataset, bar: ProgressBar) -> GroupReport {
        let mut report = GroupReport::new(&dataset);

        let mut tracker = match ProgressTracker::open(
            &self.config.work_dir,
            &dataset.shard_table_name,
            self.config.progress_buffer,
        ) {
            Ok(tracker) => tracker,
            Err(e) => {
                error!(error = %e, "Cannot open progress ledger");
                report.aborted = Some(format!("cannot open progress ledger: {}", e));
                return report;
            },
        };
        report.ledger = Some(tracker.ledger_paths().clone());

        let candidates = self.candidates(&dataset, &tracker);
        let remaining = tracker.remaining(&candidates);
        report.candidates = candidates.len();
        report.already_done = candidates.len() - remaining.len();
        bar.set_length(remaining.len() as u64);

        info!(
            dataset = %dataset.raw_name,
            candidates = report.candidates,
            remaining = remaining.len(),
            "Processing dataset"
        );

        let mut shard = ShardState {
            table: dataset.shard_table_name.clone(),
            schema: None,
        };

        for (idx, batch) in remaining.chunks(self.config.batch_size.max(1)).enumerate() {
            if self.cancel.is_cancelled() {
                info!(batch = idx + 1, "Cancellation requested; not starting batch");
                report.interrupted = true;
                break;
            }

            let batch_number = idx as u64 + 1;
            match self
                .process_batch(&dataset, &mut tracker, &mut shard, batch, batch_number, &mut report)
                .await
            {
                Ok(BatchStep::Completed) => bar.inc(batch.len() as u64),
                Ok(BatchStep::Abandoned) => {
                    info!(batch = batch_number, "Cancellation requested; batch dropped before insert");
                    report.interrupted = true;
                    break;
                },
                Ok(BatchStep::Aborted(reason)) => {
                    error!(batch = batch_number, reason = %reason, "Dataset aborted");
                    report.aborted = Some(reason);
                    break;
                },
                Err(e) => {
                    error!(batch = batch_number, error = %e, "Dataset aborted");
                    report.aborted = Some(e.to_string());
                    break;
                },
            }
        }

        if let Err(e) = tracker.finalize() {
            error!(error = %e, "Failed to flush progress ledger");
            report
                .aborted
                .get_or_insert_with(|| format!("failed to flush progress ledger: {}", e));
        }
        bar.finish_and_clear();

        info!(
            processed = report.processed,
            inserted = report.inserted,
            already_present = report.already_present,
            failed = report.failed(),
            "Dataset finished"
        );
        report
    }

    /// Tokens this run should look at, in manifest order
    fn candidates(&self, dataset: &SourceDataset, tracker: &ProgressTracker) -> Vec<String> {
        if !self.config.retry_failed_only {
            return dataset.tokens.clone();
        }
        let failing: HashSet<String> = tracker.still_failing().into_iter().collect();
        dataset
            .tokens
            .iter()
            .filter(|t| failing.contains(*t))
            .cloned()
            .collect()
    }

    async fn process_batch(
        &self,
        dataset: &SourceDataset,
        tracker: &mut ProgressTracker,
        shard: &mut ShardState,
        batch: &[String],
        batch_number: u64,
        report: &mut GroupReport,
    ) -> IngestResult<BatchStep> {
        let mut states: Vec<(String, ItemState)> =
            batch.iter().map(|t| (t.clone(), ItemState::Pending)).collect();

        match self.metadata.fetch_metadata(batch).await {
            Ok(mut found) => advance(&mut states, |token, _| match found.remove(token) {
                Some(metadata) => ItemState::MetadataFetched(metadata),
                None => ItemState::fail(Stage::FetchMetadata, "no metadata row for token"),
            }),
            Err(e) => {
                warn!(batch = batch_number, error = %e, "Metadata fetch failed");
                let reason = e.to_string();
                advance(&mut states, |_, _| ItemState::fail(Stage::FetchMetadata, reason.as_str()));
            },
        }

        if self.cancel.is_cancelled() {
            return Ok(BatchStep::Abandoned);
        }

        let data_names: Vec<String> = {
            let mut seen = HashSet::new();
            states
                .iter()
                .filter_map(|(_, state)| match state {
                    ItemState::MetadataFetched(metadata) => Some(metadata.business_name.clone()),
                    _ => None,
                })
                .filter(|name| seen.insert(name.clone()))
                .collect()
        };

        if !data_names.is_empty() {
            match self.geometry.fetch_geometry(&data_names).await {
                Ok(found) => advance(&mut states, |_, state| match state {
                    ItemState::MetadataFetched(metadata) => match found.get(&metadata.business_name) {
                        Some(geometry) => ItemState::GeometryFetched(metadata, geometry.clone()),
                        None => ItemState::fail(Stage::FetchBbox, "no valid geometry for business name"),
                    },
                    other => other,
                }),
                Err(e) => {
                    warn!(batch = batch_number, error = %e, "Geometry fetch failed");
                    let reason = e.to_string();
                    advance(&mut states, |_, state| match state {
                        ItemState::MetadataFetched(_) => ItemState::fail(Stage::FetchBbox, reason.as_str()),
                        other => other,
                    });
                },
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(BatchStep::Abandoned);
        }

        let names = Arc::clone(&self.names);
        advance(&mut states, |_, state| match state {
            ItemState::GeometryFetched(metadata, geometry) => {
                match merge_record(dataset.kind, &names, metadata, geometry) {
                    Ok(record) => ItemState::Merged(record),
                    Err(reason) => ItemState::fail(Stage::Merge, reason),
                }
            },
            other => other,
        });

        let records: Vec<SceneRecord> = states
            .iter()
            .filter_map(|(_, state)| match state {
                ItemState::Merged(record) => Some(record.clone()),
                _ => None,
            })
            .collect();

        let mut aborted = None;
        if !records.is_empty() {
            match self.prepare_shard(dataset, shard, &records, report).await {
                Ok(schema) => {
                    let outcome = self.insert_records(&shard.table, &schema, &records).await;
                    apply_insert_outcome(&mut states, &outcome);
                    report.inserted += outcome.inserted.len();
                    report.already_present += outcome.already_present.len();
                },
                Err((reason, fatal)) => {
                    advance(&mut states, |_, state| match state {
                        ItemState::Merged(_) => ItemState::fail(Stage::CreateTable, reason.as_str()),
                        other => other,
                    });
                    if fatal {
                        aborted = Some(reason);
                    }
                },
            }
        }

        self.record_batch(tracker, &states, batch_number, report)?;
        report.processed += batch.len();
        report.batches_completed += 1;

        debug!(
            batch = batch_number,
            tokens = batch.len(),
            merged = records.len(),
            "Batch finished"
        );

        Ok(match aborted {
            Some(reason) => BatchStep::Aborted(reason),
            None => BatchStep::Completed,
        })
    }

    /// Make sure the shard exists with the batch's dynamic columns. The error
    /// flag is true when the dataset cannot continue at all.
    async fn prepare_shard(
        &self,
        dataset: &SourceDataset,
        shard: &mut ShardState,
        records: &[SceneRecord],
        report: &mut GroupReport,
    ) -> Result<ShardSchema, (String, bool)> {
        let wanted = resolve_schema(records.iter().map(|r| &r.attributes), dataset.kind, &self.names);

        let stored = match shard.schema.take() {
            Some(stored) => stored,
            None => {
                let exists = self
                    .store
                    .table_exists(&shard.table)
                    .await
                    .map_err(|e| (IngestError::shard_creation(&shard.table, e).to_string(), true))?;

                if !exists && !self.config.create_if_absent {
                    let err = IngestError::shard_creation(
                        &shard.table,
                        "table does not exist and table creation is disabled",
                    );
                    return Err((err.to_string(), true));
                }

                let table = self
                    .store
                    .ensure_table(dataset, &wanted)
                    .await
                    .map_err(|e| (e.to_string(), true))?;
                if !exists {
                    info!(table = %table, "Shard table created");
                    report.table_created = true;
                }

                self.store
                    .ensure_columns(&shard.table, &ShardSchema::new())
                    .await
                    .map_err(|e| (e.to_string(), true))?
            },
        };

        let missing = wanted.columns().any(|(name, _)| stored.get(name).is_none());
        let schema = if missing {
            match self.store.ensure_columns(&shard.table, &wanted).await {
                Ok(schema) => schema,
                Err(e) => {
                    shard.schema = Some(stored);
                    return Err((e.to_string(), false));
                },
            }
        } else {
            stored
        };

        shard.schema = Some(schema.clone());
        Ok(schema)
    }

    async fn insert_records(&self, table: &str, schema: &ShardSchema, records: &[SceneRecord]) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        for chunk in records.chunks(self.config.insert_batch_size.max(1)) {
            match self.store.insert_batch(table, schema, chunk).await {
                Ok(chunk_outcome) => outcome.merge(chunk_outcome),
                Err(e) => {
                    warn!(table = %table, rows = chunk.len(), error = %e, "Insert failed");
                    let reason = e.to_string();
                    outcome
                        .failed
                        .extend(chunk.iter().map(|r| (r.token.clone(), reason.clone())));
                },
            }
        }
        outcome
    }

    fn record_batch(
        &self,
        tracker: &mut ProgressTracker,
        states: &[(String, ItemState)],
        batch_number: u64,
        report: &mut GroupReport,
    ) -> IngestResult<()> {
        let succeeded = states
            .iter()
            .filter(|(_, state)| matches!(state, ItemState::Inserted))
            .map(|(token, _)| token.clone());
        tracker.mark_success(succeeded, batch_number)?;

        for (token, state) in states {
            match state {
                ItemState::Inserted => {},
                ItemState::Failed { stage, reason } => {
                    tracker.mark_failure(token, reason, batch_number, *stage)?;
                    *report.failures_by_stage.entry(*stage).or_default() += 1;
                },
                other => {
                    warn!(token = %token, state = ?other, "Token left the pipeline unfinished");
                    tracker.mark_failure(token, "pipeline ended early", batch_number, Stage::Merge)?;
                    *report.failures_by_stage.entry(Stage::Merge).or_default() += 1;
                },
            }
        }
        Ok(())
    }
}

fn apply_insert_outcome(states: &mut [(String, ItemState)], outcome: &InsertOutcome) {
    let persisted: HashSet<&str> = outcome.persisted().map(String::as_str).collect();
    let failed: HashMap<&str, &str> = outcome
        .failed
        .iter()
        .map(|(token, reason)| (token.as_str(), reason.as_str()))
        .collect();

    advance(states, |token, state| match state {
        ItemState::Merged(_) if persisted.contains(token) => ItemState::Inserted,
        ItemState::Merged(_) => ItemState::fail(
            Stage::DatabaseInsert,
            failed.get(token).copied().unwrap_or("row not reported by store"),
        ),
        other => other,
    });
}

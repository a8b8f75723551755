//! Pipeline tests for the batch orchestrator
//!
//! Run against in-memory sources and an in-memory shard store, so no database
//! is required. Run with: cargo test --test orchestrator_test -- --nocapture

mod common;

use anyhow::Result;
use common::*;
use sceneshard_ingest::manifest::{Manifest, ManifestGroup};
use sceneshard_ingest::models::Stage;
use sceneshard_ingest::orchestrator::{show_statistics, BatchOrchestrator, OrchestratorConfig, RunMode};
use sceneshard_ingest::progress::ProgressTracker;
use sceneshard_ingest::view::ViewConfig;
use sceneshard_common::NameNormalizer;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn config(work_dir: &Path, batch_size: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        batch_size,
        insert_batch_size: 4,
        work_dir: work_dir.to_path_buf(),
        ..OrchestratorConfig::default()
    }
}

fn orchestrator(
    config: OrchestratorConfig,
    metadata: FakeMetadataSource,
    geometry: FakeGeometrySource,
    store: Arc<MemoryShardStore>,
    cancel: CancellationToken,
) -> BatchOrchestrator {
    BatchOrchestrator::new(config, Arc::new(metadata), Arc::new(geometry), store, cancel)
}

#[tokio::test]
async fn test_missing_geometry_is_recorded_per_token() -> Result<()> {
    init_tracing();
    let work = TempDir::new()?;

    let empty = tokens("empty", 5);
    let good = tokens("good", 5);
    let all: Vec<String> = empty.iter().chain(good.iter()).cloned().collect();

    let store = Arc::new(MemoryShardStore::new());
    let summary = orchestrator(
        config(work.path(), 3),
        FakeMetadataSource::with_tokens(&all),
        FakeGeometrySource::with_tokens(&good),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_empty", empty.clone()), ("PFX_good", good.clone())]))
    .await?;

    assert!(!summary.interrupted);
    assert_eq!(summary.processed(), 10);
    assert_eq!(summary.inserted(), 5);
    assert_eq!(summary.failed(), 5);
    assert_eq!(summary.failures_by_stage().get(&Stage::FetchBbox), Some(&5));

    let empty_report = &summary.groups[0];
    assert_eq!(empty_report.table, "scenes_empty");
    assert_eq!(empty_report.inserted, 0);
    assert!(!empty_report.table_created, "no table without a merged record");
    assert!(store.table("scenes_empty").is_none());
    assert_eq!(store.row_count("scenes_good"), 5);

    let tracker = ProgressTracker::with_default_buffer(work.path(), "scenes_empty")?;
    let stats = tracker.statistics();
    assert_eq!(stats.success_count, 0);
    assert_eq!(stats.failure_count, 5);
    assert_eq!(stats.failures_by_stage.get(&Stage::FetchBbox), Some(&5));

    let text = summary.to_string();
    assert!(text.contains("COMPLETED"));
    assert!(text.contains("failure ledgers:"));
    Ok(())
}

#[tokio::test]
async fn test_cancellation_keeps_completed_batches_only() -> Result<()> {
    init_tracing();
    let work = TempDir::new()?;
    let scene_tokens = tokens("road", 50);

    let cancel = CancellationToken::new();
    let store = Arc::new(MemoryShardStore::new().cancel_on_insert(2, cancel.clone()));

    // Insert chunk size above the batch size: one insert call per batch
    let cfg = OrchestratorConfig {
        insert_batch_size: 100,
        ..config(work.path(), 10)
    };
    let summary = orchestrator(
        cfg,
        FakeMetadataSource::with_tokens(&scene_tokens),
        FakeGeometrySource::with_tokens(&scene_tokens),
        Arc::clone(&store),
        cancel,
    )
    .run(manifest(vec![("PFX_road", scene_tokens.clone())]))
    .await?;

    assert!(summary.interrupted);
    assert!(summary.to_string().contains("INTERRUPTED"));
    assert_eq!(summary.groups[0].batches_completed, 2);
    assert_eq!(summary.inserted(), 20);
    assert_eq!(store.insert_calls(), 2);
    // Committed batches are visible through the view right away
    assert_eq!(summary.view.as_ref().unwrap().shard_count, 1);
    assert_eq!(store.view_plans.lock().unwrap()[0].shards, vec!["scenes_road".to_string()]);

    let tracker = ProgressTracker::with_default_buffer(work.path(), "scenes_road")?;
    assert_eq!(tracker.statistics().success_count, 20);
    assert_eq!(tracker.remaining(&scene_tokens), scene_tokens[20..].to_vec());

    // The next run picks up exactly where the ledger left off
    let summary = orchestrator(
        config(work.path(), 10),
        FakeMetadataSource::with_tokens(&scene_tokens),
        FakeGeometrySource::with_tokens(&scene_tokens),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_road", scene_tokens.clone())]))
    .await?;

    assert!(!summary.interrupted);
    assert_eq!(summary.groups[0].already_done, 20);
    assert_eq!(summary.processed(), 30);
    assert_eq!(summary.inserted(), 30);
    assert_eq!(summary.already_present(), 0);
    assert_eq!(store.row_count("scenes_road"), 50);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_before_start_processes_nothing() -> Result<()> {
    let work = TempDir::new()?;
    let scene_tokens = tokens("lane", 4);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let metadata = FakeMetadataSource::with_tokens(&scene_tokens);
    let store = Arc::new(MemoryShardStore::new());
    let orch = BatchOrchestrator::new(
        config(work.path(), 2),
        Arc::new(metadata),
        Arc::new(FakeGeometrySource::with_tokens(&scene_tokens)),
        store.clone(),
        cancel,
    );
    let summary = orch
        .run(manifest(vec![("PFX_lane", scene_tokens.clone()), ("PFX_kerb", tokens("kerb", 2))]))
        .await?;

    assert!(summary.interrupted);
    assert!(summary.groups.iter().all(|g| g.not_started));
    assert_eq!(summary.processed(), 0);
    assert_eq!(store.insert_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_completed_run_is_not_repeated() -> Result<()> {
    let work = TempDir::new()?;
    let scene_tokens = tokens("sign", 7);
    let store = Arc::new(MemoryShardStore::new());

    for _ in 0..2 {
        orchestrator(
            config(work.path(), 3),
            FakeMetadataSource::with_tokens(&scene_tokens),
            FakeGeometrySource::with_tokens(&scene_tokens),
            Arc::clone(&store),
            CancellationToken::new(),
        )
        .run(manifest(vec![("PFX_sign", scene_tokens.clone())]))
        .await?;
    }

    let metadata = Arc::new(FakeMetadataSource::with_tokens(&scene_tokens));
    let summary = BatchOrchestrator::new(
        config(work.path(), 3),
        metadata.clone(),
        Arc::new(FakeGeometrySource::with_tokens(&scene_tokens)),
        store.clone(),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_sign", scene_tokens.clone())]))
    .await?;

    assert_eq!(summary.groups[0].already_done, 7);
    assert_eq!(summary.processed(), 0);
    assert_eq!(metadata.calls(), 0);
    assert_eq!(store.row_count("scenes_sign"), 7);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_business_name_is_stored_once() -> Result<()> {
    let work = TempDir::new()?;
    let scene_tokens = tokens("pole", 3);

    // Two tokens resolve to the same business name
    let mut metadata = FakeMetadataSource::with_tokens(&scene_tokens);
    let mut twin = metadata_for(&scene_tokens[1]);
    twin.token = scene_tokens[2].clone();
    metadata.insert(twin);

    let store = Arc::new(MemoryShardStore::new());
    let summary = orchestrator(
        config(work.path(), 10),
        metadata,
        FakeGeometrySource::with_tokens(&scene_tokens),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_pole", scene_tokens.clone())]))
    .await?;

    assert_eq!(summary.inserted(), 2);
    assert_eq!(summary.already_present(), 1);
    assert_eq!(summary.failed(), 0);
    assert_eq!(store.row_count("scenes_pole"), 2);

    let tracker = ProgressTracker::with_default_buffer(work.path(), "scenes_pole")?;
    assert!(scene_tokens.iter().all(|t| tracker.is_successful(t)));
    Ok(())
}

#[tokio::test]
async fn test_retry_failed_only_reprocesses_failures() -> Result<()> {
    let work = TempDir::new()?;
    let scene_tokens = tokens("curb", 6);
    let with_geometry = scene_tokens[..4].to_vec();
    let store = Arc::new(MemoryShardStore::new());

    let first = orchestrator(
        config(work.path(), 4),
        FakeMetadataSource::with_tokens(&scene_tokens),
        FakeGeometrySource::with_tokens(&with_geometry),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_curb", scene_tokens.clone())]))
    .await?;
    assert_eq!(first.failed(), 2);

    let retry = OrchestratorConfig {
        retry_failed_only: true,
        ..config(work.path(), 4)
    };
    let second = orchestrator(
        retry,
        FakeMetadataSource::with_tokens(&scene_tokens),
        FakeGeometrySource::with_tokens(&scene_tokens),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_curb", scene_tokens.clone())]))
    .await?;

    assert_eq!(second.groups[0].candidates, 2);
    assert_eq!(second.processed(), 2);
    assert_eq!(second.inserted(), 2);
    assert_eq!(store.row_count("scenes_curb"), 6);

    let tracker = ProgressTracker::with_default_buffer(work.path(), "scenes_curb")?;
    assert!(tracker.still_failing().is_empty());
    // Old failure rows remain on disk but no longer count
    assert_eq!(tracker.statistics().failure_count, 0);
    assert_eq!(tracker.statistics().success_count, 6);
    Ok(())
}

#[tokio::test]
async fn test_metadata_fetch_error_fails_only_that_batch() -> Result<()> {
    let work = TempDir::new()?;
    let scene_tokens = tokens("mark", 6);
    let store = Arc::new(MemoryShardStore::new());

    let summary = orchestrator(
        config(work.path(), 3),
        FakeMetadataSource::with_tokens(&scene_tokens).fail_call(1),
        FakeGeometrySource::with_tokens(&scene_tokens),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_mark", scene_tokens.clone())]))
    .await?;

    assert_eq!(summary.failures_by_stage().get(&Stage::FetchMetadata), Some(&3));
    assert_eq!(summary.inserted(), 3);
    assert_eq!(summary.groups[0].batches_completed, 2);
    assert_eq!(store.table("scenes_mark").unwrap().tokens(), scene_tokens[3..].to_vec());
    Ok(())
}

#[tokio::test]
async fn test_rejected_row_fails_alone() -> Result<()> {
    let work = TempDir::new()?;
    let scene_tokens = tokens("rail", 4);
    let store = Arc::new(MemoryShardStore::new().rejecting(&scene_tokens[1]));

    let summary = orchestrator(
        config(work.path(), 4),
        FakeMetadataSource::with_tokens(&scene_tokens),
        FakeGeometrySource::with_tokens(&scene_tokens),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_rail", scene_tokens.clone())]))
    .await?;

    assert_eq!(summary.inserted(), 3);
    assert_eq!(summary.failures_by_stage().get(&Stage::DatabaseInsert), Some(&1));

    let tracker = ProgressTracker::with_default_buffer(work.path(), "scenes_rail")?;
    assert_eq!(tracker.still_failing(), vec![scene_tokens[1].clone()]);
    Ok(())
}

#[tokio::test]
async fn test_missing_table_aborts_when_creation_disabled() -> Result<()> {
    let work = TempDir::new()?;
    let missing = tokens("gate", 4);
    let present = tokens("road", 2);
    let all: Vec<String> = missing.iter().chain(present.iter()).cloned().collect();

    let store = Arc::new(MemoryShardStore::new().with_table("scenes_road"));
    let cfg = OrchestratorConfig {
        create_if_absent: false,
        ..config(work.path(), 2)
    };
    let summary = orchestrator(
        cfg,
        FakeMetadataSource::with_tokens(&all),
        FakeGeometrySource::with_tokens(&all),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_gate", missing.clone()), ("PFX_road", present.clone())]))
    .await?;

    let gate = &summary.groups[0];
    assert!(gate.aborted.as_deref().unwrap().contains("scenes_gate"));
    assert_eq!(gate.batches_completed, 1, "the first batch is recorded, then the dataset stops");
    assert_eq!(gate.failures_by_stage.get(&Stage::CreateTable), Some(&2));
    assert!(store.table("scenes_gate").is_none());

    let road = &summary.groups[1];
    assert!(road.aborted.is_none());
    assert!(!road.table_created);
    assert_eq!(road.inserted, 2);
    assert!(summary.to_string().contains("scenes_gate aborted"));
    Ok(())
}

#[tokio::test]
async fn test_shard_creation_failure_is_fatal_for_dataset() -> Result<()> {
    let work = TempDir::new()?;
    let scene_tokens = tokens("wall", 6);
    let store = Arc::new(MemoryShardStore::new().failing_ensure_table());

    let summary = orchestrator(
        config(work.path(), 3),
        FakeMetadataSource::with_tokens(&scene_tokens),
        FakeGeometrySource::with_tokens(&scene_tokens),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_wall", scene_tokens.clone())]))
    .await?;

    assert_eq!(summary.groups_aborted(), 1);
    assert_eq!(summary.processed(), 3);
    assert_eq!(summary.failures_by_stage().get(&Stage::CreateTable), Some(&3));
    assert_eq!(store.insert_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_defect_dataset_gets_attribute_columns() -> Result<()> {
    let work = TempDir::new()?;
    let scene_tokens = tokens("crack", 2);

    let mut metadata = FakeMetadataSource::with_tokens(&scene_tokens);
    let mut first = metadata_for(&scene_tokens[0]);
    first.attributes.insert("Severity Level".to_string(), json!(3));
    first.attributes.insert("Reviewed".to_string(), json!("yes"));
    metadata.insert(first);
    let mut second = metadata_for(&scene_tokens[1]);
    second.attributes.insert("Severity Level".to_string(), json!(1.5));
    metadata.insert(second);

    let manifest = Manifest {
        groups: vec![ManifestGroup {
            name: "PFX_crack".to_string(),
            tokens: scene_tokens.clone(),
            metadata: HashMap::from([("kind".to_string(), "defect".to_string())]),
        }],
    };

    let store = Arc::new(MemoryShardStore::new());
    let summary = orchestrator(
        config(work.path(), 10),
        metadata,
        FakeGeometrySource::with_tokens(&scene_tokens),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest)
    .await?;

    assert_eq!(summary.inserted(), 2);
    let table = store.table("scenes_crack").unwrap();
    assert!(table.schema.get("severity_level").is_some());
    assert!(table.schema.get("reviewed").is_some());
    assert_eq!(table.rows[0].attributes.get("severity_level"), Some(&json!(3)));
    Ok(())
}

#[tokio::test]
async fn test_parallel_run_fills_every_shard() -> Result<()> {
    init_tracing();
    let work = TempDir::new()?;

    let names = ["PFX_road", "PFX_lane", "PFX_sign", "PFX_pole"];
    let groups: Vec<(&str, Vec<String>)> = names
        .iter()
        .map(|name| (*name, tokens(&name.to_lowercase(), 9)))
        .collect();
    let all: Vec<String> = groups.iter().flat_map(|(_, t)| t.clone()).collect();

    let cfg = OrchestratorConfig {
        mode: RunMode::Parallel,
        workers: Some(2),
        ..config(work.path(), 4)
    };
    let store = Arc::new(MemoryShardStore::new());
    let summary = BatchOrchestrator::new(
        cfg,
        Arc::new(FakeMetadataSource::with_tokens(&all)),
        Arc::new(FakeGeometrySource::with_tokens(&all)),
        store.clone(),
        CancellationToken::new(),
    )
    .with_pool_size(1)
    .run(manifest(groups))
    .await?;

    assert_eq!(summary.mode, RunMode::Parallel);
    assert_eq!(summary.groups.len(), 4);
    assert_eq!(summary.inserted(), 36);
    assert_eq!(summary.tables_created(), 4);
    for table in ["scenes_road", "scenes_lane", "scenes_sign", "scenes_pole"] {
        assert_eq!(store.row_count(table), 9, "{}", table);
    }

    let view = summary.view.as_ref().unwrap();
    assert_eq!(view.shard_count, 4);
    assert_eq!(view.created, vec!["scenes_all".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_view_excludes_itself_and_follows_shards() -> Result<()> {
    let work = TempDir::new()?;
    let scene_tokens = tokens("road", 2);

    // A stale view relation sharing the shard prefix
    let store = Arc::new(MemoryShardStore::new().with_table("scenes_all"));
    let summary = orchestrator(
        OrchestratorConfig {
            view: Some(ViewConfig::new("scenes_all")),
            ..config(work.path(), 10)
        },
        FakeMetadataSource::with_tokens(&scene_tokens),
        FakeGeometrySource::with_tokens(&scene_tokens),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_road", scene_tokens.clone())]))
    .await?;

    let plans = store.view_plans.lock().unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].shards, vec!["scenes_road".to_string()]);
    assert!(plans[0]
        .statements
        .iter()
        .any(|s| s.starts_with("CREATE VIEW") && s.contains("scenes_road")));
    assert_eq!(summary.view.as_ref().unwrap().shard_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_view_covers_shard_after_interrupt_and_noop_rerun() -> Result<()> {
    let work = TempDir::new()?;
    let scene_tokens = tokens("lane", 4);

    let cancel = CancellationToken::new();
    let store = Arc::new(MemoryShardStore::new().cancel_on_insert(1, cancel.clone()));
    let summary = orchestrator(
        config(work.path(), 10),
        FakeMetadataSource::with_tokens(&scene_tokens),
        FakeGeometrySource::with_tokens(&scene_tokens),
        Arc::clone(&store),
        cancel,
    )
    .run(manifest(vec![("PFX_lane_test", scene_tokens.clone())]))
    .await?;

    assert!(summary.interrupted);
    assert_eq!(summary.inserted(), 4);
    assert_eq!(summary.groups[0].table, "scenes_lane_test_ds");
    assert_eq!(summary.view.as_ref().unwrap().shard_count, 1);

    // Nothing left to do, but the view is still brought up to date
    let summary = orchestrator(
        config(work.path(), 10),
        FakeMetadataSource::with_tokens(&scene_tokens),
        FakeGeometrySource::with_tokens(&scene_tokens),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_lane_test", scene_tokens.clone())]))
    .await?;

    assert!(!summary.interrupted);
    assert_eq!(summary.inserted(), 0);
    assert_eq!(summary.tables_created(), 0);

    let plans = store.view_plans.lock().unwrap();
    assert_eq!(plans.len(), 2);
    assert_eq!(plans[1].shards, vec!["scenes_lane_test_ds".to_string()]);
    assert_eq!(summary.view.as_ref().unwrap().shard_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_name_collision_is_reported_and_merged() -> Result<()> {
    let work = TempDir::new()?;
    let first = tokens("a", 2);
    let second = tokens("b", 2);
    let all: Vec<String> = first.iter().chain(second.iter()).cloned().collect();

    let store = Arc::new(MemoryShardStore::new());
    let summary = orchestrator(
        config(work.path(), 10),
        FakeMetadataSource::with_tokens(&all),
        FakeGeometrySource::with_tokens(&all),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run(manifest(vec![
        ("PFX_road", first.clone()),
        ("road_2024_01_02_03_04_05", second.clone()),
    ]))
    .await?;

    assert_eq!(summary.collisions.len(), 1);
    assert_eq!(summary.collisions[0].table_name, "scenes_road");
    assert_eq!(summary.groups.len(), 1);
    assert_eq!(store.row_count("scenes_road"), 4);
    assert!(summary.to_string().contains("name collisions:"));
    Ok(())
}

#[tokio::test]
async fn test_statistics_without_database() -> Result<()> {
    let work = TempDir::new()?;
    let good = tokens("good", 3);
    let bad = tokens("bad", 2);
    let all: Vec<String> = good.iter().chain(bad.iter()).cloned().collect();

    orchestrator(
        config(work.path(), 10),
        FakeMetadataSource::with_tokens(&good),
        FakeGeometrySource::with_tokens(&good),
        Arc::new(MemoryShardStore::new()),
        CancellationToken::new(),
    )
    .run(manifest(vec![("PFX_good", good.clone()), ("PFX_bad", bad.clone())]))
    .await?;

    let report = show_statistics(work.path(), None, &NameNormalizer::default())?;
    assert_eq!(report.groups.len(), 2);
    assert_eq!(report.total.success_count, 3);
    assert_eq!(report.total.failure_count, 2);
    assert_eq!(report.total.failures_by_stage.get(&Stage::FetchMetadata), Some(&2));

    let only_good = show_statistics(
        work.path(),
        Some(manifest(vec![("PFX_good", all)])),
        &NameNormalizer::default(),
    )?;
    assert_eq!(only_good.groups.len(), 1);
    assert_eq!(only_good.groups[0].0, "scenes_good");
    Ok(())
}

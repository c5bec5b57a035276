//! End-to-end behavior of compaction, clustering and archival, and what
//! readers observe while they run.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use driftwood_core::concurrency::TransactionManager;
use driftwood_core::config::TableServiceMode;
use driftwood_core::file_system_view::{FileGroupId, FileSlice, FileSystemView};
use driftwood_core::table_services::{clustering, compaction};
use driftwood_core::timeline::archive::load_archived_timeline;
use driftwood_core::timeline::{ActiveTimeline, TimelineStore};
use driftwood_core::{
    Action, Record, RecordBatch, TableLocation, TableProperties, TableType, WriteClient,
    WriteConfig, WriteOperationType,
};
use serde_json::json;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

// =============================================================================
// Test Helpers
// =============================================================================

async fn create_table(table_type: TableType, config: WriteConfig) -> (TempDir, WriteClient) {
    let tmp = TempDir::new().expect("create temp dir");
    let client = WriteClient::init_table(
        TableLocation::local(tmp.path()),
        TableProperties::new("metrics", table_type),
        config,
    )
    .await
    .expect("init table");
    (tmp, client)
}

/// Timeline and transaction manager for driving services by hand.
async fn service_handles(tmp: &TempDir) -> (ActiveTimeline, TransactionManager) {
    let location = TableLocation::local(tmp.path());
    let active = ActiveTimeline::load(TimelineStore::new(location.clone()))
        .await
        .expect("load timeline");
    let txn = TransactionManager::from_config(&location, &WriteConfig::default());
    (active, txn)
}

fn records(prefix: &str, count: usize) -> RecordBatch {
    (0..count)
        .map(|i| Record::new(format!("{prefix}-{i:04}"), "P", json!({ "i": i })))
        .collect()
}

fn groups(slices: &[FileSlice]) -> BTreeSet<FileGroupId> {
    slices.iter().map(|s| s.group.clone()).collect()
}

async fn insert(client: &mut WriteClient, prefix: &str, count: usize) {
    client
        .write_batch(records(prefix, count), WriteOperationType::Insert, BTreeMap::new())
        .await
        .expect("insert batch");
}

// =============================================================================
// Compaction
// =============================================================================

#[tokio::test]
async fn inline_compaction_after_one_delta_commit() -> TestResult {
    let config = WriteConfig::default().with_compaction(TableServiceMode::Inline, 1);
    let (_tmp, mut client) = create_table(TableType::MergeOnRead, config).await;

    client
        .write_streaming_batch(records("r", 100), "id1", "0")
        .await?
        .expect("batch written");

    let completed = client.reload().await?.completed();
    let actions: Vec<Action> = completed.iter().map(|i| i.action()).collect();
    assert_eq!(actions, vec![Action::DeltaCommit, Action::Compaction]);
    assert_eq!(client.latest_checkpoint("id1").await?.as_deref(), Some("0"));

    let slices = client.get_latest_file_slices("P").await?;
    assert_eq!(slices.len(), 1);
    assert!(slices[0].base_file.is_some());
    assert!(!slices[0].has_log_files());
    assert_eq!(client.read_partition("P").await?.len(), 100);
    Ok(())
}

#[tokio::test]
async fn writes_to_a_group_under_pending_compaction_conflict() -> TestResult {
    let (tmp, mut client) = create_table(TableType::MergeOnRead, WriteConfig::default()).await;
    insert(&mut client, "r", 5).await;

    let (mut active, txn) = service_handles(&tmp).await;
    let planned = compaction::schedule_compaction(&mut active, &txn, 1)
        .await?
        .expect("compaction due");

    let err = client
        .write_batch(records("r", 1), WriteOperationType::Upsert, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(err.is_write_conflict());
    // The failed write was rolled back.
    assert_eq!(client.reload().await?.pending().len(), 1);

    let resumed = client.resume_pending_table_services().await?;
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].timestamp(), planned.timestamp());

    client
        .write_batch(records("r", 1), WriteOperationType::Upsert, BTreeMap::new())
        .await?;
    assert_eq!(client.read_partition("P").await?.len(), 5);
    Ok(())
}

#[tokio::test]
async fn failed_compaction_is_finished_by_the_next_run() -> TestResult {
    let (tmp, mut client) = create_table(TableType::MergeOnRead, WriteConfig::default()).await;
    insert(&mut client, "r", 5).await;

    let location = TableLocation::local(tmp.path());
    let mut active = ActiveTimeline::load(TimelineStore::new(location.clone())).await?;
    let impatient = TransactionManager::from_config(
        &location,
        &WriteConfig::default().with_lock_acquire_timeout(Duration::from_millis(50)),
    );
    let planned = compaction::schedule_compaction(&mut active, &impatient, 1)
        .await?
        .expect("compaction due");

    // Another committer holds the lock for longer than the executor waits.
    let token = impatient.acquire().await?;
    let err = compaction::execute_compaction(&mut active, &impatient, &planned)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    impatient.release(token).await?;
    assert_eq!(client.reload().await?.pending().len(), 1);

    let completed = client.compact(1).await?.expect("pending compaction finished");
    assert_eq!(completed.timestamp(), planned.timestamp());
    assert!(completed.is_completed());
    assert!(client.reload().await?.pending().is_empty());

    client
        .write_batch(records("r", 1), WriteOperationType::Upsert, BTreeMap::new())
        .await?;
    assert_eq!(client.read_partition("P").await?.len(), 5);
    Ok(())
}

#[tokio::test]
async fn inline_compaction_finishes_an_earlier_failed_run() -> TestResult {
    let (tmp, mut client) = create_table(TableType::MergeOnRead, WriteConfig::default()).await;
    insert(&mut client, "r", 5).await;

    let (mut active, txn) = service_handles(&tmp).await;
    let planned = compaction::schedule_compaction(&mut active, &txn, 1)
        .await?
        .expect("compaction due");
    // Left INFLIGHT as if its executor died.
    active.transition_to_inflight(&planned).await?;
    drop(client);

    let config = WriteConfig::default().with_compaction(TableServiceMode::Inline, 1);
    let mut client = WriteClient::open(TableLocation::local(tmp.path()), config).await?;
    client
        .write_batch(records("other", 3), WriteOperationType::Insert, BTreeMap::new())
        .await?;

    let timeline = client.reload().await?;
    assert!(timeline.pending().is_empty());
    assert!(
        timeline
            .completed()
            .filter_actions(&[Action::Compaction])
            .iter()
            .any(|i| i.timestamp() == planned.timestamp())
    );
    assert_eq!(client.read_partition("P").await?.len(), 8);
    Ok(())
}

#[tokio::test]
async fn abandoned_compaction_can_be_aborted() -> TestResult {
    let (tmp, mut client) = create_table(TableType::MergeOnRead, WriteConfig::default()).await;
    insert(&mut client, "r", 5).await;

    let (mut active, txn) = service_handles(&tmp).await;
    let planned = compaction::schedule_compaction(&mut active, &txn, 1)
        .await?
        .expect("compaction due");
    client.abort(&planned).await?;

    assert!(client.reload().await?.pending().is_empty());
    client
        .write_batch(records("r", 2), WriteOperationType::Upsert, BTreeMap::new())
        .await?;
    let slices = client.get_latest_file_slices("P").await?;
    assert_eq!(slices.len(), 1);
    assert_eq!(slices[0].log_files.len(), 2);
    Ok(())
}

#[tokio::test]
async fn compaction_is_a_no_op_on_copy_on_write() -> TestResult {
    let (_tmp, mut client) = create_table(TableType::CopyOnWrite, WriteConfig::default()).await;
    insert(&mut client, "r", 5).await;
    assert!(client.compact(1).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn async_compaction_runs_in_background() -> TestResult {
    let mut config = WriteConfig::default().with_compaction(TableServiceMode::Async, 1);
    config.compaction.poll_interval_ms = 10;
    let (_tmp, mut client) = create_table(TableType::MergeOnRead, config).await;

    let handle = client.spawn_async_table_services();
    assert_eq!(handle.services(), vec!["compaction"]);

    insert(&mut client, "r", 10).await;
    let mut compacted = false;
    for _ in 0..400 {
        let timeline = client.reload().await?;
        if !timeline.completed().filter_actions(&[Action::Compaction]).is_empty() {
            compacted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    assert!(compacted, "background compaction did not complete");
    assert_eq!(client.read_partition("P").await?.len(), 10);
    Ok(())
}

#[tokio::test]
async fn async_compaction_finishes_a_stuck_plan() -> TestResult {
    let mut config = WriteConfig::default().with_compaction(TableServiceMode::Async, 1);
    config.compaction.poll_interval_ms = 10;
    let (tmp, mut client) = create_table(TableType::MergeOnRead, config).await;
    insert(&mut client, "r", 5).await;

    let (mut active, txn) = service_handles(&tmp).await;
    let planned = compaction::schedule_compaction(&mut active, &txn, 1)
        .await?
        .expect("compaction due");
    active.transition_to_inflight(&planned).await?;

    let handle = client.spawn_async_table_services();
    let mut finished = false;
    for _ in 0..400 {
        if client.reload().await?.pending().is_empty() {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    assert!(finished, "stuck compaction was not finished in the background");
    assert_eq!(client.read_partition("P").await?.len(), 5);
    Ok(())
}

// =============================================================================
// Clustering
// =============================================================================

#[tokio::test]
async fn inline_clustering_after_two_commits() -> TestResult {
    let config = WriteConfig::default()
        .with_clustering(TableServiceMode::Inline, 2)
        .with_max_records_per_group(1_000);
    let (_tmp, mut client) = create_table(TableType::CopyOnWrite, config).await;

    insert(&mut client, "first", 100).await;
    assert!(client.timeline().completed_replace_timeline().is_empty());
    insert(&mut client, "second", 100).await;

    let timeline = client.reload().await?.clone();
    assert_eq!(timeline.completed_replace_timeline().len(), 1);
    assert_eq!(client.get_latest_file_slices("P").await?.len(), 1);
    assert_eq!(client.read_partition("P").await?.len(), 200);
    Ok(())
}

#[tokio::test]
async fn replace_is_invisible_until_completed() -> TestResult {
    let (tmp, mut client) = create_table(TableType::CopyOnWrite, WriteConfig::default()).await;
    insert(&mut client, "a", 3).await;
    insert(&mut client, "b", 3).await;
    let inputs = groups(&client.get_latest_file_slices("P").await?);
    assert_eq!(inputs.len(), 2);

    let (mut active, txn) = service_handles(&tmp).await;
    let requested = clustering::schedule_clustering(&mut active, &txn, 2, 100)
        .await?
        .expect("clustering due");
    assert_eq!(groups(&client.get_latest_file_slices("P").await?), inputs);

    let inflight = active.transition_to_inflight(&requested).await?;
    let before_completion = active.timeline().clone();
    assert_eq!(groups(&client.get_latest_file_slices("P").await?), inputs);

    clustering::execute_clustering(&mut active, &txn, &inflight).await?;
    let outputs = groups(&client.get_latest_file_slices("P").await?);
    assert_eq!(outputs.len(), 1);
    assert!(outputs.is_disjoint(&inputs));
    assert_eq!(client.read_partition("P").await?.len(), 6);

    // A snapshot taken before completion keeps showing the inputs.
    let old_view = FileSystemView::load(active.store(), &before_completion).await?;
    assert_eq!(groups(&old_view.get_latest_file_slices("P")), inputs);
    Ok(())
}

#[tokio::test]
async fn explicit_clustering_splits_by_record_limit() -> TestResult {
    let (_tmp, mut client) = create_table(TableType::MergeOnRead, WriteConfig::default()).await;
    insert(&mut client, "a", 25).await;
    insert(&mut client, "b", 25).await;

    let replace = client.cluster(2, 20).await?.expect("clustering due");
    assert_eq!(replace.action(), Action::Replace);
    let slices = client.get_latest_file_slices("P").await?;
    assert_eq!(slices.len(), 3);
    assert!(slices.iter().all(|s| s.base_file.is_some() && !s.has_log_files()));
    assert_eq!(client.read_partition("P").await?.len(), 50);

    // Nothing new to do until more commits land.
    assert!(client.cluster(2, 20).await?.is_none());
    Ok(())
}

// =============================================================================
// Archival and incremental reads
// =============================================================================

#[tokio::test]
async fn archival_keeps_data_visible() -> TestResult {
    let config = WriteConfig::default().with_archival(2, 3);
    let (tmp, mut client) = create_table(TableType::CopyOnWrite, config).await;
    for batch in 0..5 {
        insert(&mut client, &format!("b{batch}"), 2).await;
    }

    let timeline = client.reload().await?.clone();
    assert_eq!(timeline.completed().len(), 3);
    let store = TimelineStore::new(TableLocation::local(tmp.path()));
    assert_eq!(load_archived_timeline(&store).await?.len(), 2);
    assert_eq!(client.read_partition("P").await?.len(), 10);
    Ok(())
}

#[tokio::test]
async fn instants_in_range_exclude_begin_and_include_end() -> TestResult {
    let (_tmp, mut client) = create_table(TableType::CopyOnWrite, WriteConfig::default()).await;
    let mut done = Vec::new();
    for batch in 0..4 {
        done.push(
            client
                .write_batch(
                    records(&format!("b{batch}"), 1),
                    WriteOperationType::Insert,
                    BTreeMap::new(),
                )
                .await?,
        );
    }

    let range = client
        .get_instants_in_range(Some(done[0].timestamp()), done[2].timestamp())
        .await?;
    let got: Vec<_> = range.iter().map(|i| i.timestamp().clone()).collect();
    assert_eq!(got, vec![done[1].timestamp().clone(), done[2].timestamp().clone()]);

    let from_start = client.get_instants_in_range(None, done[3].timestamp()).await?;
    assert_eq!(from_start.len(), 4);
    Ok(())
}

//! Streaming checkpoint behavior across writers.
//!
//! Each writer identifier tracks its own progress through the commit
//! metadata of the commits it produced:
//! - one writer always reads back its latest batch,
//! - commits of other identifiers never move it,
//! - already committed batches are skipped on replay.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;

use driftwood_core::checkpoint::STREAMING_CHECKPOINT_KEY;
use driftwood_core::timeline::TimelineStore;
use driftwood_core::{
    Record, RecordBatch, TableLocation, TableProperties, TableType, WriteClient, WriteConfig,
    WriteOperationType,
};
use serde_json::json;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

// =============================================================================
// Test Helpers
// =============================================================================

async fn create_table(table_type: TableType) -> (TempDir, WriteClient) {
    let tmp = TempDir::new().expect("create temp dir");
    let client = WriteClient::init_table(
        TableLocation::local(tmp.path()),
        TableProperties::new("events", table_type),
        WriteConfig::default(),
    )
    .await
    .expect("init table");
    (tmp, client)
}

async fn open_writer(tmp: &TempDir) -> WriteClient {
    WriteClient::open(TableLocation::local(tmp.path()), WriteConfig::default())
        .await
        .expect("open table")
}

/// `count` records of partition `P`, keys prefixed by `prefix`.
fn records(prefix: &str, count: usize) -> RecordBatch {
    (0..count)
        .map(|i| Record::new(format!("{prefix}-{i:04}"), "P", json!({ "n": i })))
        .collect()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn single_writer_reads_back_its_latest_batch() -> TestResult {
    let (_tmp, mut client) = create_table(TableType::MergeOnRead).await;
    assert_eq!(client.latest_checkpoint("w").await?, None);

    for batch in 0..6 {
        let batch_id = batch.to_string();
        client
            .write_streaming_batch(records(&format!("b{batch}"), 10), "w", &batch_id)
            .await?
            .expect("new batch is written");
        assert_eq!(client.latest_checkpoint("w").await?, Some(batch_id));
    }
    Ok(())
}

#[tokio::test]
async fn interleaved_writers_do_not_see_each_other() -> TestResult {
    let (tmp, mut a) = create_table(TableType::CopyOnWrite).await;
    let mut b = open_writer(&tmp).await;

    a.write_streaming_batch(records("a0", 5), "A", "0").await?;
    for batch in 0..4 {
        b.write_streaming_batch(records(&format!("b{batch}"), 5), "B", &batch.to_string())
            .await?;
        assert_eq!(a.latest_checkpoint("A").await?.as_deref(), Some("0"));
    }
    a.write_streaming_batch(records("a1", 5), "A", "1").await?;

    assert_eq!(a.latest_checkpoint("A").await?.as_deref(), Some("1"));
    assert_eq!(a.latest_checkpoint("B").await?.as_deref(), Some("3"));
    assert_eq!(b.latest_checkpoint("A").await?.as_deref(), Some("1"));
    Ok(())
}

#[tokio::test]
async fn two_streaming_writers_scenario() -> TestResult {
    let (tmp, mut id1) = create_table(TableType::CopyOnWrite).await;
    let mut id2 = open_writer(&tmp).await;

    id1.write_streaming_batch(records("id1-b0", 100), "id1", "0")
        .await?;
    assert_eq!(id1.latest_checkpoint("id1").await?.as_deref(), Some("0"));

    id2.write_streaming_batch(records("id2-b0", 100), "id2", "0")
        .await?;
    assert_eq!(id1.latest_checkpoint("id1").await?.as_deref(), Some("0"));

    id1.write_streaming_batch(records("id1-b1", 100), "id1", "1")
        .await?;
    assert_eq!(id1.latest_checkpoint("id1").await?.as_deref(), Some("1"));
    assert_eq!(id2.latest_checkpoint("id2").await?.as_deref(), Some("0"));

    assert_eq!(id1.read_partition("P").await?.len(), 300);
    Ok(())
}

#[tokio::test]
async fn replayed_batch_is_skipped() -> TestResult {
    let (_tmp, mut client) = create_table(TableType::MergeOnRead).await;
    client.write_streaming_batch(records("x", 3), "w", "7").await?;

    assert!(client.should_skip_batch("w", "7").await?);
    assert!(client.should_skip_batch("w", "6").await?);
    assert!(!client.should_skip_batch("w", "8").await?);
    assert!(!client.should_skip_batch("other", "7").await?);

    assert!(client.write_streaming_batch(records("x", 3), "w", "7").await?.is_none());
    assert_eq!(client.timeline().commits_timeline().len(), 1);
    Ok(())
}

#[tokio::test]
async fn checkpoint_is_stored_under_the_well_known_key() -> TestResult {
    let (tmp, mut client) = create_table(TableType::CopyOnWrite).await;
    let instant = client.start_commit().await?;
    client
        .stage_batch(&instant, records("k", 2), WriteOperationType::Insert)
        .await?;
    let completed = client.commit_with_checkpoint(&instant, "w", "42").await?;

    let store = TimelineStore::new(TableLocation::local(tmp.path()));
    let metadata = store.read_commit_metadata(&completed).await?;
    let value = metadata.get_extra(STREAMING_CHECKPOINT_KEY).expect("checkpoint entry");
    let decoded: BTreeMap<String, String> = serde_json::from_str(value)?;
    assert_eq!(decoded, BTreeMap::from([("w".to_string(), "42".to_string())]));
    Ok(())
}

#[tokio::test]
async fn checkpoint_survives_archival() -> TestResult {
    let tmp = TempDir::new()?;
    let config = WriteConfig::default().with_archival(1, 2);
    let mut client = WriteClient::init_table(
        TableLocation::local(tmp.path()),
        TableProperties::new("events", TableType::CopyOnWrite),
        config,
    )
    .await?;

    client.write_streaming_batch(records("a", 2), "old", "9").await?;
    for batch in 0..3 {
        client
            .write_batch(
                records(&format!("n{batch}"), 2),
                WriteOperationType::Insert,
                BTreeMap::new(),
            )
            .await?;
    }

    let store = TimelineStore::new(TableLocation::local(tmp.path()));
    let archived = driftwood_core::timeline::archive::load_archived_timeline(&store).await?;
    assert!(!archived.is_empty());
    assert_eq!(client.latest_checkpoint("old").await?.as_deref(), Some("9"));
    Ok(())
}

//! Clustering: rewriting the file groups of a partition into a new set.
//!
//! All eligible latest slices of a partition are read, merged by key, sorted
//! and written out as `ceil(records / max_records_per_group)` new file groups
//! of base files. The replace instant that completes the rewrite lists the
//! input groups as replaced, so a snapshot either shows every input group
//! (replace not completed) or every output group (replace completed).
//!
//! A partition is eligible when, after leaving out reserved groups, it has at
//! least two file groups or any slice still carrying log files.
//!
//! Trigger: at least `max_commits` completed ingestion commits since the last
//! completed replace, and no replace already pending.
use std::collections::BTreeSet;

use futures::future::try_join_all;
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::concurrency::TransactionManager;
use crate::file_system_view::{FileGroupId, FileSlice, FileSystemView};
use crate::records::{self, Record, RecordError, delete_files_written_by};
use crate::storage::{TableLocation, layout};
use crate::table_services::{
    InvalidPlanSnafu, NotAServiceInstantSnafu, ServiceConcurrencySnafu, ServiceRecordsSnafu,
    ServiceTimelineSnafu, TableServiceError, reserved_file_groups, settle,
};
use crate::timeline::store::to_payload;
use crate::timeline::{
    Action, ActiveTimeline, ClusteringGroup, ClusteringPlan, CommitMetadata, Instant, InstantTime,
    State, Timeline, WriteOperationType, WriteStat,
};

/// Whether `timeline` calls for a new clustering.
pub fn needs_clustering(timeline: &Timeline, max_commits: usize) -> bool {
    if !timeline
        .pending()
        .filter_actions(&[Action::Replace])
        .is_empty()
    {
        return false;
    }
    let last = timeline
        .completed_replace_timeline()
        .last_instant()
        .map(|i| i.timestamp().clone());
    timeline.count_completed_since(&[Action::Commit, Action::DeltaCommit], last.as_ref())
        >= max_commits
}

fn eligible_slices(
    view: &FileSystemView,
    partition: &str,
    reserved: &BTreeSet<FileGroupId>,
) -> Vec<FileSlice> {
    let slices: Vec<FileSlice> = view
        .get_latest_file_slices(partition)
        .into_iter()
        .filter(|s| !reserved.contains(&s.group))
        .collect();
    if slices.len() >= 2 || slices.iter().any(FileSlice::has_log_files) {
        slices
    } else {
        Vec::new()
    }
}

/// Number of output groups for `records` records.
fn output_group_count(records: usize, max_records_per_group: usize) -> usize {
    records.div_ceil(max_records_per_group.max(1))
}

/// Build a clustering plan from the latest slices of `view`. Reads the
/// slices to size the output.
pub async fn build_clustering_plan(
    location: &TableLocation,
    view: &FileSystemView,
    reserved: &BTreeSet<FileGroupId>,
    max_records_per_group: usize,
) -> Result<ClusteringPlan, RecordError> {
    let mut input_groups = Vec::new();
    for partition in view.partitions() {
        let slices = eligible_slices(view, &partition, reserved);
        if slices.is_empty() {
            continue;
        }
        let mut records = 0usize;
        for slice in &slices {
            records += records::read_file_slice(location, slice).await?.len();
        }
        input_groups.push(ClusteringGroup {
            partition: partition.clone(),
            file_ids: slices.iter().map(|s| s.file_id().to_string()).collect(),
            num_output_groups: output_group_count(records, max_records_per_group),
        });
    }
    Ok(ClusteringPlan {
        input_groups,
        max_records_per_group,
    })
}

/// Publish a clustering plan when the trigger fires. Runs under the table
/// lock.
pub async fn schedule_clustering(
    active: &mut ActiveTimeline,
    txn: &TransactionManager,
    max_commits: usize,
    max_records_per_group: usize,
) -> Result<Option<Instant>, TableServiceError> {
    let token = txn.acquire().await.context(ServiceConcurrencySnafu)?;
    let result = schedule_locked(active, max_commits, max_records_per_group).await;
    let released = txn.release(token).await;
    settle(result, released)
}

async fn schedule_locked(
    active: &mut ActiveTimeline,
    max_commits: usize,
    max_records_per_group: usize,
) -> Result<Option<Instant>, TableServiceError> {
    active.reload().await.context(ServiceTimelineSnafu)?;
    if !needs_clustering(active.timeline(), max_commits) {
        debug!("clustering not due (max_commits={max_commits})");
        return Ok(None);
    }

    let view = FileSystemView::load(active.store(), active.timeline())
        .await
        .context(ServiceTimelineSnafu)?;
    let reserved = reserved_file_groups(active.store(), active.timeline())
        .await
        .context(ServiceTimelineSnafu)?;
    let plan = build_clustering_plan(
        active.store().location(),
        &view,
        &reserved,
        max_records_per_group,
    )
    .await
    .context(ServiceRecordsSnafu)?;
    if plan.input_groups.is_empty() {
        debug!("no partition eligible for clustering");
        return Ok(None);
    }

    let payload = to_payload(&plan).context(ServiceTimelineSnafu)?;
    let instant = active
        .begin_instant_with_payload(Action::Replace, Some(&payload))
        .await
        .context(ServiceTimelineSnafu)?;
    info!(
        "clustering scheduled (instant={instant}, partitions={}, file_groups={})",
        plan.input_groups.len(),
        plan.file_groups().len(),
    );
    Ok(Some(instant))
}

/// Execute a pending replace instant and complete it.
///
/// Same contract as [`super::compaction::execute_compaction`]: REQUESTED or
/// INFLIGHT input, earlier partial output discarded, one executor at a time.
pub async fn execute_clustering(
    active: &mut ActiveTimeline,
    txn: &TransactionManager,
    instant: &Instant,
) -> Result<Instant, TableServiceError> {
    ensure!(
        instant.action() == Action::Replace && instant.is_pending(),
        NotAServiceInstantSnafu {
            instant: instant.to_string(),
            expected: Action::Replace,
        }
    );
    let plan = active
        .store()
        .read_clustering_plan(instant.timestamp())
        .await
        .context(ServiceTimelineSnafu)?;

    let inflight = if instant.state() == State::Requested {
        active
            .transition_to_inflight(instant)
            .await
            .context(ServiceTimelineSnafu)?
    } else {
        instant.clone()
    };
    let base = active.timeline().clone();
    let location = active.store().location().clone();
    let view = FileSystemView::load(active.store(), &base)
        .await
        .context(ServiceTimelineSnafu)?;

    let leftovers = delete_files_written_by(&location, instant.timestamp())
        .await
        .context(ServiceRecordsSnafu)?;
    if !leftovers.is_empty() {
        warn!(
            "discarded output of an interrupted clustering (instant={instant}, files={})",
            leftovers.len(),
        );
    }

    let mut metadata = CommitMetadata::new(WriteOperationType::Cluster);
    for group in &plan.input_groups {
        let records = read_input_group(&location, &view, instant, group).await?;
        let stats = write_output_groups(
            &location,
            instant.timestamp(),
            &group.partition,
            records,
            group.num_output_groups,
        )
        .await
        .context(ServiceRecordsSnafu)?;
        for stat in stats {
            metadata.add_write_stat(&group.partition, stat);
        }
        metadata.add_replaced_file_ids(&group.partition, group.file_ids.iter().cloned());
    }

    let reserved: Vec<FileGroupId> = plan.file_groups().into_iter().collect();
    let completed = txn
        .commit(active, &base, &inflight, &metadata, &reserved)
        .await
        .context(ServiceConcurrencySnafu)?;
    info!(
        "clustering completed (instant={completed}, replaced={}, written={})",
        reserved.len(),
        metadata.written_file_groups().len(),
    );
    Ok(completed)
}

async fn read_input_group(
    location: &TableLocation,
    view: &FileSystemView,
    instant: &Instant,
    group: &ClusteringGroup,
) -> Result<Vec<Record>, TableServiceError> {
    let mut all = Vec::new();
    for file_id in &group.file_ids {
        let id = FileGroupId::new(group.partition.clone(), file_id.clone());
        let Some(slice) = view.get_latest_file_slice(&id) else {
            return InvalidPlanSnafu {
                instant: instant.to_string(),
                msg: format!("file group {id} is not visible"),
            }
            .fail();
        };
        all.extend(
            records::read_file_slice(location, slice)
                .await
                .context(ServiceRecordsSnafu)?,
        );
    }
    Ok(records::merge_records(all))
}

/// Split key-sorted `records` into at most `groups` new file groups of
/// near-equal size.
async fn write_output_groups(
    location: &TableLocation,
    instant: &InstantTime,
    partition: &str,
    records: Vec<Record>,
    groups: usize,
) -> Result<Vec<WriteStat>, RecordError> {
    if records.is_empty() || groups == 0 {
        return Ok(Vec::new());
    }
    let chunk = records.len().div_ceil(groups);
    let writes = records.chunks(chunk).map(|chunk| async move {
        let id = FileGroupId::generate(partition);
        let path = layout::data_file_rel_path(
            partition,
            &layout::base_file_name(&id.file_id, instant.as_str()),
        );
        let size = records::write_data_file(location, &path, chunk).await?;
        debug!(
            "wrote clustered file group (instant={instant}, path={path}, records={})",
            chunk.len(),
        );
        Ok::<_, RecordError>(WriteStat {
            file_id: id.file_id,
            path,
            prev_base_instant: None,
            num_writes: chunk.len() as u64,
            num_inserts: chunk.len() as u64,
            num_updates: 0,
            file_size_bytes: size,
        })
    });
    try_join_all(writes).await
}

/// Finish clustering left pending by an earlier failed run, then schedule and
/// execute a new one if the trigger fires. Returns the newest replace instant
/// completed by this call.
pub async fn run_clustering(
    active: &mut ActiveTimeline,
    txn: &TransactionManager,
    max_commits: usize,
    max_records_per_group: usize,
) -> Result<Option<Instant>, TableServiceError> {
    let resumed = resume_pending_clustering(active, txn).await?;
    match schedule_clustering(active, txn, max_commits, max_records_per_group).await? {
        Some(requested) => Ok(Some(execute_clustering(active, txn, &requested).await?)),
        None => Ok(resumed.into_iter().last()),
    }
}

/// Execute every replace instant left pending on the timeline, oldest first.
pub async fn resume_pending_clustering(
    active: &mut ActiveTimeline,
    txn: &TransactionManager,
) -> Result<Vec<Instant>, TableServiceError> {
    active.reload().await.context(ServiceTimelineSnafu)?;
    let pending = active.timeline().pending().filter_actions(&[Action::Replace]);

    let mut completed = Vec::with_capacity(pending.len());
    for instant in &pending {
        info!("resuming pending clustering (instant={instant})");
        completed.push(execute_clustering(active, txn, instant).await?);
    }
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteConfig;
    use crate::records::write_data_file;
    use crate::timeline::TimelineStore;
    use serde_json::json;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    async fn setup()
    -> Result<(TempDir, ActiveTimeline, TransactionManager), Box<dyn std::error::Error>> {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let store = TimelineStore::new(location.clone());
        store.create_layout().await?;
        let active = ActiveTimeline::load(store).await?;
        let txn = TransactionManager::from_config(&location, &WriteConfig::default());
        Ok((tmp, active, txn))
    }

    /// Complete a commit writing `records` as the base file of a new group.
    async fn insert_commit(
        active: &mut ActiveTimeline,
        file_id: &str,
        records: &[Record],
    ) -> Result<Instant, Box<dyn std::error::Error>> {
        let requested = active.begin_instant(Action::Commit).await?;
        let inflight = active.transition_to_inflight(&requested).await?;
        let path = layout::data_file_rel_path(
            "p",
            &layout::base_file_name(file_id, inflight.timestamp().as_str()),
        );
        let size = write_data_file(active.store().location(), &path, records).await?;
        let mut meta = CommitMetadata::new(WriteOperationType::Insert);
        meta.add_write_stat(
            "p",
            WriteStat {
                file_id: file_id.to_string(),
                path,
                prev_base_instant: None,
                num_writes: records.len() as u64,
                num_inserts: records.len() as u64,
                num_updates: 0,
                file_size_bytes: size,
            },
        );
        Ok(active.complete(&inflight, &meta).await?)
    }

    fn recs(keys: &[&str]) -> Vec<Record> {
        keys.iter().map(|k| Record::new(*k, "p", json!(k))).collect()
    }

    #[test]
    fn output_group_count_rounds_up() {
        assert_eq!(output_group_count(0, 10), 0);
        assert_eq!(output_group_count(10, 10), 1);
        assert_eq!(output_group_count(11, 10), 2);
        assert_eq!(output_group_count(3, 0), 3);
    }

    #[tokio::test]
    async fn trigger_counts_commits_since_last_replace() -> TestResult {
        let (_tmp, mut active, txn) = setup().await?;
        insert_commit(&mut active, "a", &recs(&["k1"])).await?;
        assert!(!needs_clustering(active.timeline(), 2));
        insert_commit(&mut active, "b", &recs(&["k2"])).await?;
        assert!(needs_clustering(active.timeline(), 2));

        run_clustering(&mut active, &txn, 2, 100).await?.expect("due");
        assert!(!needs_clustering(active.timeline(), 2));
        Ok(())
    }

    #[tokio::test]
    async fn replace_is_invisible_until_completed() -> TestResult {
        let (_tmp, mut active, txn) = setup().await?;
        insert_commit(&mut active, "a", &recs(&["k3", "k1"])).await?;
        insert_commit(&mut active, "b", &recs(&["k2"])).await?;

        let requested = schedule_clustering(&mut active, &txn, 2, 100).await?.expect("due");
        let before = FileSystemView::load(active.store(), active.timeline()).await?;
        let ids: Vec<String> = before
            .get_latest_file_slices("p")
            .iter()
            .map(|s| s.file_id().to_string())
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        let completed = execute_clustering(&mut active, &txn, &requested).await?;
        let after = FileSystemView::load(active.store(), active.timeline()).await?;
        let slices = after.get_latest_file_slices("p");
        assert_eq!(slices.len(), 1);
        assert_eq!(&slices[0].base_instant, completed.timestamp());
        assert!(after.is_replaced(&FileGroupId::new("p", "a")));
        assert!(after.is_replaced(&FileGroupId::new("p", "b")));
        assert_eq!(
            records::read_file_slice(active.store().location(), &slices[0]).await?,
            recs(&["k1", "k2", "k3"])
        );
        Ok(())
    }

    #[tokio::test]
    async fn next_run_finishes_a_failed_clustering_first() -> TestResult {
        let (_tmp, mut active, txn) = setup().await?;
        insert_commit(&mut active, "a", &recs(&["k1"])).await?;
        insert_commit(&mut active, "b", &recs(&["k2"])).await?;

        let requested = schedule_clustering(&mut active, &txn, 2, 100).await?.expect("due");
        let inflight = active.transition_to_inflight(&requested).await?;
        assert!(schedule_clustering(&mut active, &txn, 1, 100).await?.is_none());

        let completed = run_clustering(&mut active, &txn, 2, 100).await?.expect("resumed");
        assert!(completed.same_event(&inflight));
        assert!(active.timeline().pending().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn output_is_split_by_max_records_per_group() -> TestResult {
        let (_tmp, mut active, txn) = setup().await?;
        insert_commit(&mut active, "a", &recs(&["k1", "k2"])).await?;
        insert_commit(&mut active, "b", &recs(&["k3"])).await?;

        run_clustering(&mut active, &txn, 1, 2).await?.expect("due");
        let view = FileSystemView::load(active.store(), active.timeline()).await?;
        let slices = view.get_latest_file_slices("p");
        assert_eq!(slices.len(), 2);

        let mut sizes = Vec::new();
        for slice in &slices {
            sizes.push(records::read_file_slice(active.store().location(), slice).await?.len());
        }
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn single_base_only_group_is_not_eligible() -> TestResult {
        let (_tmp, mut active, txn) = setup().await?;
        insert_commit(&mut active, "a", &recs(&["k1"])).await?;
        assert!(run_clustering(&mut active, &txn, 1, 100).await?.is_none());
        Ok(())
    }
}

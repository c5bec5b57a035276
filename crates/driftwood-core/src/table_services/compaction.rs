//! Merge-on-read compaction.
//!
//! A compaction folds the log files of a file slice into a new base file
//! written at the compaction instant, which opens a new slice in the same
//! file group. Readers of older snapshots keep seeing the old slice; readers
//! of snapshots that include the completed compaction see the new one.
//!
//! Trigger: at least `max_delta_commits` completed delta commits since the
//! last completed compaction, and no compaction already pending.
use std::collections::BTreeSet;

use futures::future::try_join_all;
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::concurrency::TransactionManager;
use crate::file_system_view::{FileGroupId, FileSystemView};
use crate::records::{self, delete_files_written_by};
use crate::storage::{TableLocation, layout};
use crate::table_services::{
    NotAServiceInstantSnafu, ServiceConcurrencySnafu, ServiceRecordsSnafu, ServiceTimelineSnafu,
    TableServiceError, reserved_file_groups, settle,
};
use crate::timeline::store::to_payload;
use crate::timeline::{
    Action, ActiveTimeline, CommitMetadata, CompactionOperation, CompactionPlan, Instant,
    InstantTime, State, Timeline, WriteOperationType, WriteStat,
};

/// Whether `timeline` calls for a new compaction.
pub fn needs_compaction(timeline: &Timeline, max_delta_commits: usize) -> bool {
    if !timeline
        .pending()
        .filter_actions(&[Action::Compaction])
        .is_empty()
    {
        return false;
    }
    let last = timeline
        .completed()
        .filter_actions(&[Action::Compaction])
        .last_instant()
        .map(|i| i.timestamp().clone());
    timeline.count_completed_since(&[Action::DeltaCommit], last.as_ref()) >= max_delta_commits
}

/// Plan covering every latest slice that carries log files and is not
/// reserved by another pending plan.
pub fn build_compaction_plan(
    view: &FileSystemView,
    reserved: &BTreeSet<FileGroupId>,
) -> CompactionPlan {
    let operations = view
        .get_all_latest_file_slices()
        .into_iter()
        .filter(|slice| slice.has_log_files() && !reserved.contains(&slice.group))
        .map(|slice| CompactionOperation {
            partition: slice.group.partition.clone(),
            file_id: slice.group.file_id.clone(),
            base_instant: slice.base_instant.clone(),
            base_file: slice.base_file.as_ref().map(|b| b.path.clone()),
            log_files: slice.log_files.iter().map(|l| l.path.clone()).collect(),
        })
        .collect();
    CompactionPlan { operations }
}

/// Publish a compaction plan when the trigger fires. Runs under the table
/// lock. Returns the requested instant, or `None` when there is nothing to
/// do.
pub async fn schedule_compaction(
    active: &mut ActiveTimeline,
    txn: &TransactionManager,
    max_delta_commits: usize,
) -> Result<Option<Instant>, TableServiceError> {
    let token = txn.acquire().await.context(ServiceConcurrencySnafu)?;
    let result = schedule_locked(active, max_delta_commits).await;
    let released = txn.release(token).await;
    settle(result, released)
}

async fn schedule_locked(
    active: &mut ActiveTimeline,
    max_delta_commits: usize,
) -> Result<Option<Instant>, TableServiceError> {
    active.reload().await.context(ServiceTimelineSnafu)?;
    if !needs_compaction(active.timeline(), max_delta_commits) {
        debug!("compaction not due (max_delta_commits={max_delta_commits})");
        return Ok(None);
    }

    let view = FileSystemView::load(active.store(), active.timeline())
        .await
        .context(ServiceTimelineSnafu)?;
    let reserved = reserved_file_groups(active.store(), active.timeline())
        .await
        .context(ServiceTimelineSnafu)?;
    let plan = build_compaction_plan(&view, &reserved);
    if plan.operations.is_empty() {
        debug!("no file slice with log files to compact");
        return Ok(None);
    }

    let payload = to_payload(&plan).context(ServiceTimelineSnafu)?;
    let instant = active
        .begin_instant_with_payload(Action::Compaction, Some(&payload))
        .await
        .context(ServiceTimelineSnafu)?;
    info!("compaction scheduled (instant={instant}, operations={})", plan.operations.len());
    Ok(Some(instant))
}

/// Execute a pending compaction instant and complete it.
///
/// Accepts the instant in REQUESTED or INFLIGHT state. Output left by an
/// earlier attempt is discarded first. Running the same instant from two
/// processes at once is not supported.
pub async fn execute_compaction(
    active: &mut ActiveTimeline,
    txn: &TransactionManager,
    instant: &Instant,
) -> Result<Instant, TableServiceError> {
    ensure!(
        instant.action() == Action::Compaction && instant.is_pending(),
        NotAServiceInstantSnafu {
            instant: instant.to_string(),
            expected: Action::Compaction,
        }
    );
    let plan = active
        .store()
        .read_compaction_plan(instant.timestamp())
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

    let leftovers = delete_files_written_by(&location, instant.timestamp())
        .await
        .context(ServiceRecordsSnafu)?;
    if !leftovers.is_empty() {
        warn!(
            "discarded output of an interrupted compaction (instant={instant}, files={})",
            leftovers.len(),
        );
    }

    let stats = try_join_all(
        plan.operations
            .iter()
            .map(|op| compact_slice(&location, instant.timestamp(), op)),
    )
    .await
    .context(ServiceRecordsSnafu)?;

    let mut metadata = CommitMetadata::new(WriteOperationType::Compact);
    for (op, stat) in plan.operations.iter().zip(stats) {
        metadata.add_write_stat(&op.partition, stat);
    }

    let reserved: Vec<FileGroupId> = plan.file_groups().into_iter().collect();
    let completed = txn
        .commit(active, &base, &inflight, &metadata, &reserved)
        .await
        .context(ServiceConcurrencySnafu)?;
    info!(
        "compaction completed (instant={completed}, file_groups={}, records={})",
        plan.operations.len(),
        metadata.total_records_written(),
    );
    Ok(completed)
}

async fn compact_slice(
    location: &TableLocation,
    instant: &InstantTime,
    op: &CompactionOperation,
) -> Result<WriteStat, records::RecordError> {
    let mut merged = match &op.base_file {
        Some(path) => records::read_data_file(location, path).await?,
        None => Vec::new(),
    };
    let mut log_records = 0u64;
    for path in &op.log_files {
        let log = records::read_data_file(location, path).await?;
        log_records += log.len() as u64;
        merged.extend(log);
    }
    let merged = records::merge_records(merged);

    let path = layout::data_file_rel_path(
        &op.partition,
        &layout::base_file_name(&op.file_id, instant.as_str()),
    );
    let size = records::write_data_file(location, &path, &merged).await?;
    debug!("compacted file slice (instant={instant}, path={path}, records={})", merged.len());

    Ok(WriteStat {
        file_id: op.file_id.clone(),
        path,
        prev_base_instant: Some(op.base_instant.clone()),
        num_writes: merged.len() as u64,
        num_inserts: 0,
        num_updates: log_records,
        file_size_bytes: size,
    })
}

/// Finish compactions left pending by an earlier failed run, then schedule
/// and execute a new one if the trigger fires.
///
/// Returns the newest compaction completed by this call. A pending
/// compaction blocks scheduling, so without the first step one failed
/// execution would stop compaction for good.
pub async fn run_compaction(
    active: &mut ActiveTimeline,
    txn: &TransactionManager,
    max_delta_commits: usize,
) -> Result<Option<Instant>, TableServiceError> {
    let resumed = resume_pending_compactions(active, txn).await?;
    match schedule_compaction(active, txn, max_delta_commits).await? {
        Some(requested) => Ok(Some(execute_compaction(active, txn, &requested).await?)),
        None => Ok(resumed.into_iter().last()),
    }
}

/// Execute every compaction left pending on the timeline, oldest first.
pub async fn resume_pending_compactions(
    active: &mut ActiveTimeline,
    txn: &TransactionManager,
) -> Result<Vec<Instant>, TableServiceError> {
    active.reload().await.context(ServiceTimelineSnafu)?;
    let pending = active
        .timeline()
        .pending()
        .filter_actions(&[Action::Compaction]);

    let mut completed = Vec::with_capacity(pending.len());
    for instant in &pending {
        info!("resuming pending compaction (instant={instant})");
        completed.push(execute_compaction(active, txn, instant).await?);
    }
    Ok(completed)
}

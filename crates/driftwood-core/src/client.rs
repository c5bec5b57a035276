//! Writer-facing entry point of a table.
//!
//! A [`WriteClient`] drives the instant life cycle on behalf of one writer:
//!
//! 1. [`WriteClient::begin_instant`] creates a REQUESTED instant and records
//!    the timeline snapshot that later serves as the OCC base.
//! 2. [`WriteClient::stage_batch`] moves it to INFLIGHT and writes data files
//!    named after the instant. They stay invisible to readers.
//! 3. [`WriteClient::commit`] validates against concurrent instants under the
//!    table lock and completes the instant, then runs inline table services.
//! 4. [`WriteClient::abort`] rolls the instant back instead.
//!
//! Clients sharing a table coordinate only through the timeline and the lock
//! provider, so any number of them may run in one or several processes.
mod error;
mod staging;

pub use error::TableError;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::checkpoint;
use crate::concurrency::{ConcurrencyError, TransactionManager};
use crate::config::{TableProperties, TableServiceMode, TableType, WriteConfig};
use crate::file_system_view::{FileSlice, FileSystemView};
use crate::records::{self, Record, RecordBatch};
use crate::storage::TableLocation;
use crate::table_services::{
    self, TableServiceContext, TableServiceHandle, clustering, compaction,
};
use crate::timeline::archive::load_archived_timeline;
use crate::timeline::instant_time::parse_instant_time;
use crate::timeline::{
    ActiveTimeline, Action, Instant, InstantTime, State, Timeline, TimelineStore,
    WriteOperationType, WriteStat,
};
use error::{
    ActionMismatchSnafu, CheckpointSnafu, ConcurrencySnafu, ConfigSnafu, InlineTableServiceSnafu,
    RecordsSnafu, TableServiceSnafu, TimelineSnafu, UnknownInstantSnafu,
};
use staging::PendingWrite;

/// Handle for writing to one table.
#[derive(Debug)]
pub struct WriteClient {
    location: TableLocation,
    properties: TableProperties,
    config: WriteConfig,
    timeline: ActiveTimeline,
    txn: TransactionManager,
    pending: BTreeMap<InstantTime, PendingWrite>,
}

impl WriteClient {
    /// Create a new table at `location` and open it.
    ///
    /// Fails if `table.json` already exists. The timeline directory is
    /// created last, so a half-initialized table still reads as
    /// [`crate::timeline::TimelineError::TableNotFound`].
    pub async fn init_table(
        location: TableLocation,
        properties: TableProperties,
        config: WriteConfig,
    ) -> Result<Self, TableError> {
        config.validate().context(ConfigSnafu)?;
        properties.create(&location).await.context(ConfigSnafu)?;

        let store = TimelineStore::new(location.clone()).with_write_timeout(config.write_timeout());
        store.create_layout().await.context(TimelineSnafu)?;
        info!(
            "table initialized (table={}, table_type={:?}, location={location})",
            properties.name,
            properties.table_type,
        );
        Self::open(location, config).await
    }

    /// Open an existing table.
    pub async fn open(location: TableLocation, config: WriteConfig) -> Result<Self, TableError> {
        config.validate().context(ConfigSnafu)?;
        let store = TimelineStore::new(location.clone()).with_write_timeout(config.write_timeout());
        let timeline = ActiveTimeline::load(store).await.context(TimelineSnafu)?;
        let properties = TableProperties::load(&location).await.context(ConfigSnafu)?;
        let txn = TransactionManager::from_config(&location, &config);
        debug!(
            "table opened (location={location}, instants={}, lock={})",
            timeline.timeline().len(),
            txn.lock_provider().name(),
        );

        Ok(Self {
            location,
            properties,
            config,
            timeline,
            txn,
            pending: BTreeMap::new(),
        })
    }

    /// Table root.
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    /// Persisted table properties.
    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    /// Writer configuration.
    pub fn config(&self) -> &WriteConfig {
        &self.config
    }

    /// Timeline snapshot as of the last reload.
    pub fn timeline(&self) -> &Timeline {
        self.timeline.timeline()
    }

    /// Re-read the persisted timeline.
    pub async fn reload(&mut self) -> Result<&Timeline, TableError> {
        self.timeline.reload().await.context(TimelineSnafu)?;
        Ok(self.timeline.timeline())
    }

    /// The action ingestion instants use on this table.
    pub fn ingest_action(&self) -> Action {
        match self.properties.table_type {
            TableType::CopyOnWrite => Action::Commit,
            TableType::MergeOnRead => Action::DeltaCommit,
        }
    }

    /// Create a REQUESTED ingestion instant.
    ///
    /// `action` must be [`Action::Commit`] on copy-on-write tables and
    /// [`Action::DeltaCommit`] on merge-on-read tables.
    pub async fn begin_instant(&mut self, action: Action) -> Result<Instant, TableError> {
        let expected = self.ingest_action();
        ensure!(
            action == expected,
            ActionMismatchSnafu {
                action,
                expected,
                table_type: self.properties.table_type,
            }
        );

        // The timeline was reloaded while picking the instant time.
        let instant = self
            .timeline
            .begin_instant(action)
            .await
            .context(TimelineSnafu)?;
        let base = self.timeline.timeline().clone();
        self.pending.insert(
            instant.timestamp().clone(),
            PendingWrite::new(instant.clone(), base),
        );
        Ok(instant)
    }

    /// [`WriteClient::begin_instant`] with the table's ingestion action.
    pub async fn start_commit(&mut self) -> Result<Instant, TableError> {
        self.begin_instant(self.ingest_action()).await
    }

    /// Write `records` as part of `instant`.
    ///
    /// The first call moves the instant to INFLIGHT. May be called any number
    /// of times before [`WriteClient::commit`]; a key staged twice keeps its
    /// latest value. Operations other than [`WriteOperationType::Upsert`] are
    /// routed like inserts.
    pub async fn stage_batch(
        &mut self,
        instant: &Instant,
        records: RecordBatch,
        operation: WriteOperationType,
    ) -> Result<Vec<WriteStat>, TableError> {
        let table_type = self.properties.table_type;
        let write = self
            .pending
            .get_mut(instant.timestamp())
            .context(UnknownInstantSnafu {
                instant: instant.to_string(),
            })?;

        if write.instant.state() == State::Requested {
            write.instant = self
                .timeline
                .transition_to_inflight(&write.instant)
                .await
                .context(TimelineSnafu)?;
        }
        let stats = write
            .stage(self.timeline.store(), table_type, records, operation)
            .await?;
        debug!("batch staged (instant={}, files={})", write.instant, stats.len());
        Ok(stats)
    }

    /// Complete `instant` with everything staged so far plus
    /// `extra_metadata`.
    ///
    /// On [`ConcurrencyError::WriteConflict`] the instant stays pending; abort
    /// it and write again with a fresh instant. After a successful commit,
    /// inline table services run; their failure surfaces as
    /// [`TableError::InlineTableService`] and leaves the commit in place.
    pub async fn commit(
        &mut self,
        instant: &Instant,
        extra_metadata: BTreeMap<String, String>,
    ) -> Result<Instant, TableError> {
        let write = self
            .pending
            .get_mut(instant.timestamp())
            .context(UnknownInstantSnafu {
                instant: instant.to_string(),
            })?;

        if write.instant.state() == State::Requested {
            write.instant = self
                .timeline
                .transition_to_inflight(&write.instant)
                .await
                .context(TimelineSnafu)?;
        }
        let metadata = write.metadata(extra_metadata);
        let completed = self
            .txn
            .commit(&mut self.timeline, &write.base, &write.instant, &metadata, &[])
            .await
            .context(ConcurrencySnafu)?;
        self.pending.remove(instant.timestamp());
        info!(
            "write committed (instant={completed}, operation={:?}, records={})",
            metadata.operation,
            metadata.total_records_written(),
        );

        self.run_inline_table_services(&completed).await?;
        Ok(completed)
    }

    async fn run_inline_table_services(&mut self, committed: &Instant) -> Result<(), TableError> {
        let inline_failure = || InlineTableServiceSnafu {
            committed: committed.timestamp().to_string(),
        };

        let compaction_cfg = &self.config.compaction;
        if compaction_cfg.enabled
            && compaction_cfg.mode == TableServiceMode::Inline
            && self.properties.table_type == TableType::MergeOnRead
        {
            compaction::run_compaction(
                &mut self.timeline,
                &self.txn,
                compaction_cfg.max_delta_commits,
            )
            .await
            .with_context(|_| inline_failure())?;
        }

        let clustering_cfg = &self.config.clustering;
        if clustering_cfg.enabled && clustering_cfg.mode == TableServiceMode::Inline {
            clustering::run_clustering(
                &mut self.timeline,
                &self.txn,
                clustering_cfg.max_commits,
                clustering_cfg.max_records_per_group,
            )
            .await
            .with_context(|_| inline_failure())?;
        }

        table_services::archive_timeline(&mut self.timeline, &self.txn, &self.config.archival)
            .await
            .with_context(|_| inline_failure())?;
        Ok(())
    }

    /// Roll back a pending instant: delete the data files written at its
    /// instant time, then its instant files.
    ///
    /// Works for this client's writes and for any other pending instant,
    /// including an abandoned compaction or clustering. Runs under the table
    /// lock so the instant cannot complete halfway through. A completed
    /// instant fails with
    /// [`crate::timeline::TimelineError::InvalidStateTransition`].
    pub async fn abort(&mut self, instant: &Instant) -> Result<(), TableError> {
        let token = self.txn.acquire().await.context(ConcurrencySnafu)?;
        let result = self.abort_locked(instant).await;
        let released = self.txn.release(token).await;
        settle(result, released)
    }

    async fn abort_locked(&mut self, instant: &Instant) -> Result<(), TableError> {
        self.timeline.reload().await.context(TimelineSnafu)?;
        let ts = instant.timestamp();
        let current = self.timeline.timeline().find(ts, instant.action()).cloned();

        match &current {
            Some(found) if found.is_completed() => {
                return crate::timeline::InvalidStateTransitionSnafu {
                    instant: found.to_string(),
                    reason: "completed instants cannot be aborted",
                }
                .fail()
                .context(TimelineSnafu);
            }
            None if !self.pending.contains_key(ts) => {
                return UnknownInstantSnafu {
                    instant: instant.to_string(),
                }
                .fail();
            }
            _ => {}
        }

        self.rollback_locked(ts, current.as_ref()).await?;
        self.pending.remove(ts);
        Ok(())
    }

    async fn rollback_locked(
        &mut self,
        ts: &InstantTime,
        instant: Option<&Instant>,
    ) -> Result<(), TableError> {
        let removed = records::delete_files_written_by(&self.location, ts)
            .await
            .context(RecordsSnafu)?;
        if let Some(instant) = instant {
            self.timeline
                .delete_pending(instant)
                .await
                .context(TimelineSnafu)?;
        }
        info!("instant rolled back (instant={ts}, data_files={})", removed.len());
        Ok(())
    }

    /// Begin, stage and commit `records` as one instant.
    ///
    /// If staging or committing fails, the instant is aborted before the
    /// error is returned. A failed inline table service leaves the commit in
    /// place.
    pub async fn write_batch(
        &mut self,
        records: RecordBatch,
        operation: WriteOperationType,
        extra_metadata: BTreeMap<String, String>,
    ) -> Result<Instant, TableError> {
        let instant = self.start_commit().await?;
        let result = match self.stage_batch(&instant, records, operation).await {
            Ok(_) => self.commit(&instant, extra_metadata).await,
            Err(e) => Err(e),
        };
        self.abort_on_error(&instant, result).await
    }

    async fn abort_on_error(
        &mut self,
        instant: &Instant,
        result: Result<Instant, TableError>,
    ) -> Result<Instant, TableError> {
        match result {
            Err(e) if !matches!(e, TableError::InlineTableService { .. }) => {
                if let Err(abort_err) = self.abort(instant).await {
                    warn!("abort after failed write failed (instant={instant}, error={abort_err})");
                }
                Err(e)
            }
            other => other,
        }
    }

    /// [`WriteClient::commit`] carrying the checkpoint `batch_id` of
    /// `writer_id`.
    pub async fn commit_with_checkpoint(
        &mut self,
        instant: &Instant,
        writer_id: &str,
        batch_id: &str,
    ) -> Result<Instant, TableError> {
        let value = checkpoint::encode_checkpoint(writer_id, batch_id).context(CheckpointSnafu)?;
        let extra = BTreeMap::from([(self.config.checkpoint_key.clone(), value)]);
        self.commit(instant, extra).await
    }

    /// Latest committed batch id of `writer_id`, `None` if it never
    /// committed. Reloads the timeline first and falls back to archived
    /// commits.
    pub async fn latest_checkpoint(
        &mut self,
        writer_id: &str,
    ) -> Result<Option<String>, TableError> {
        self.timeline.reload().await.context(TimelineSnafu)?;
        let store = self.timeline.store();
        let key = &self.config.checkpoint_key;
        let active =
            checkpoint::get_valid_checkpoint(store, self.timeline.timeline(), key, writer_id)
                .await
                .context(CheckpointSnafu)?;
        if active.is_some() {
            return Ok(active);
        }

        // Every archived instant is older than the active ones.
        let archived = load_archived_timeline(store).await.context(TimelineSnafu)?;
        checkpoint::get_valid_checkpoint(store, &archived, key, writer_id)
            .await
            .context(CheckpointSnafu)
    }

    /// Whether `batch_id` of `writer_id` is already covered by its committed
    /// checkpoint.
    pub async fn should_skip_batch(
        &mut self,
        writer_id: &str,
        batch_id: &str,
    ) -> Result<bool, TableError> {
        let last = self.latest_checkpoint(writer_id).await?;
        Ok(checkpoint::should_skip_batch(last.as_deref(), batch_id))
    }

    /// Upsert one streaming micro-batch and record its checkpoint.
    ///
    /// Returns `None` without writing when the batch was already committed.
    pub async fn write_streaming_batch(
        &mut self,
        records: RecordBatch,
        writer_id: &str,
        batch_id: &str,
    ) -> Result<Option<Instant>, TableError> {
        if self.should_skip_batch(writer_id, batch_id).await? {
            info!("batch already committed, skipping (writer_id={writer_id}, batch_id={batch_id})");
            return Ok(None);
        }

        let instant = self.start_commit().await?;
        let result = match self
            .stage_batch(&instant, records, WriteOperationType::Upsert)
            .await
        {
            Ok(_) => self.commit_with_checkpoint(&instant, writer_id, batch_id).await,
            Err(e) => Err(e),
        };
        self.abort_on_error(&instant, result).await.map(Some)
    }

    /// Roll back pending ingestion instants older than `older_than` that this
    /// client did not start. Returns the instants rolled back.
    ///
    /// Meant for writer crash recovery. Pending compaction and clustering
    /// instants are left to [`WriteClient::resume_pending_table_services`].
    pub async fn rollback_failed_writes(
        &mut self,
        older_than: Duration,
    ) -> Result<Vec<Instant>, TableError> {
        let token = self.txn.acquire().await.context(ConcurrencySnafu)?;
        let result = self.rollback_failed_locked(older_than).await;
        let released = self.txn.release(token).await;
        settle(result, released)
    }

    async fn rollback_failed_locked(
        &mut self,
        older_than: Duration,
    ) -> Result<Vec<Instant>, TableError> {
        self.timeline.reload().await.context(TimelineSnafu)?;
        let now = Utc::now();
        let stale: Vec<Instant> = self
            .timeline
            .timeline()
            .pending()
            .filter_actions(&[Action::Commit, Action::DeltaCommit])
            .iter()
            .filter(|i| !self.pending.contains_key(i.timestamp()))
            .filter(|i| {
                // Instant times slightly ahead of the clock count as age zero.
                parse_instant_time(i.timestamp())
                    .map(|t| (now - t).to_std().unwrap_or(Duration::ZERO))
                    .is_some_and(|age| age >= older_than)
            })
            .cloned()
            .collect();

        for instant in &stale {
            warn!("rolling back abandoned write (instant={instant})");
            self.rollback_locked(instant.timestamp(), Some(instant)).await?;
        }
        Ok(stale)
    }

    /// File system view of the latest timeline.
    pub async fn file_system_view(&mut self) -> Result<FileSystemView, TableError> {
        self.timeline.reload().await.context(TimelineSnafu)?;
        FileSystemView::load(self.timeline.store(), self.timeline.timeline())
            .await
            .context(TimelineSnafu)
    }

    /// Latest visible file slice of every file group in `partition`.
    pub async fn get_latest_file_slices(
        &mut self,
        partition: &str,
    ) -> Result<Vec<FileSlice>, TableError> {
        Ok(self.file_system_view().await?.get_latest_file_slices(partition))
    }

    /// Current records of `partition`, ordered by key.
    pub async fn read_partition(&mut self, partition: &str) -> Result<Vec<Record>, TableError> {
        let slices = self.get_latest_file_slices(partition).await?;
        let mut out = Vec::new();
        for slice in &slices {
            out.extend(
                records::read_file_slice(&self.location, slice)
                    .await
                    .context(RecordsSnafu)?,
            );
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    /// Completed instants after `begin` (exclusive, `None` for the start of
    /// the timeline) up to `end` (inclusive).
    pub async fn get_instants_in_range(
        &mut self,
        begin: Option<&InstantTime>,
        end: &InstantTime,
    ) -> Result<Timeline, TableError> {
        self.timeline.reload().await.context(TimelineSnafu)?;
        Ok(self.timeline.timeline().get_instants_in_range(begin, end))
    }

    /// Finish pending compactions, then schedule and run a new one if at least
    /// `max_delta_commits` delta commits landed since the last one. Returns
    /// the newest compaction completed. Always `None` on copy-on-write tables.
    pub async fn compact(
        &mut self,
        max_delta_commits: usize,
    ) -> Result<Option<Instant>, TableError> {
        if self.properties.table_type == TableType::CopyOnWrite {
            debug!("copy-on-write table, nothing to compact");
            return Ok(None);
        }
        compaction::run_compaction(&mut self.timeline, &self.txn, max_delta_commits)
            .await
            .context(TableServiceSnafu)
    }

    /// Finish pending clustering, then schedule and run a new one if at least
    /// `max_commits` commits landed since the last one.
    pub async fn cluster(
        &mut self,
        max_commits: usize,
        max_records_per_group: usize,
    ) -> Result<Option<Instant>, TableError> {
        clustering::run_clustering(
            &mut self.timeline,
            &self.txn,
            max_commits,
            max_records_per_group,
        )
        .await
        .context(TableServiceSnafu)
    }

    /// Execute every compaction and clustering left pending by an earlier
    /// run. Must not race another executor of the same instants.
    pub async fn resume_pending_table_services(&mut self) -> Result<Vec<Instant>, TableError> {
        let mut done = compaction::resume_pending_compactions(&mut self.timeline, &self.txn)
            .await
            .context(TableServiceSnafu)?;
        done.extend(
            clustering::resume_pending_clustering(&mut self.timeline, &self.txn)
                .await
                .context(TableServiceSnafu)?,
        );
        Ok(done)
    }

    /// Archive old completed instants per the archival settings.
    pub async fn archive(&mut self) -> Result<Vec<Instant>, TableError> {
        table_services::archive_timeline(&mut self.timeline, &self.txn, &self.config.archival)
            .await
            .context(TableServiceSnafu)
    }

    /// Owned state for running table services elsewhere.
    pub fn service_context(&self) -> TableServiceContext {
        TableServiceContext {
            active: self.timeline.clone(),
            txn: self.txn.clone(),
            config: self.config.clone(),
            table_type: self.properties.table_type,
        }
    }

    /// Start the services configured with [`TableServiceMode::Async`] on
    /// background tasks. Requires a tokio runtime.
    pub fn spawn_async_table_services(&self) -> TableServiceHandle {
        table_services::spawn_async_table_services(self.service_context())
    }
}

fn settle<T>(
    result: Result<T, TableError>,
    released: Result<(), ConcurrencyError>,
) -> Result<T, TableError> {
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(source)) => Err(TableError::Concurrency { source }),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!("table lock release failed after error (error={release_err})");
            Err(e)
        }
    }
}

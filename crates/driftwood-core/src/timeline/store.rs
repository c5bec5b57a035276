//! Persistence of instant state files.
//!
//! This module owns every on-disk interaction with `.driftwood/timeline/` and
//! `.driftwood/archived/`:
//! - Listing instant files and folding them into [`Instant`] values, checking
//!   that an inflight file is backed by its requested file.
//! - Publishing each state transition as a new file with create-once
//!   semantics ([`storage::write_new_atomic`]), time-boxed by the configured
//!   write timeout.
//! - Reading typed payloads (commit metadata, compaction and clustering plans)
//!   and mapping parse failures to [`TimelineError::CorruptTimeline`].
//!
//! The store never edits a file it has published. Pending instants may be
//! deleted (rollback); completed ones are only ever moved to the archive.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use serde::{Serialize, de::DeserializeOwned};
use snafu::prelude::*;

use crate::file_system_view::FileGroupId;
use crate::storage::{self, TableLocation, layout};
use crate::timeline::instant::{Action, Instant, InstantTime, State};
use crate::timeline::metadata::{ClusteringPlan, CommitMetadata, CompactionPlan};
use crate::timeline::{
    CorruptTimelineSnafu, InvalidStateTransitionSnafu, StorageSnafu, TableNotFoundSnafu,
    TimelineError,
};

/// Payload of instant files that carry no data.
const EMPTY_PAYLOAD: &[u8] = b"{}";

/// Reads and writes instant files under a table root.
///
/// Clones share a cache of parsed commit metadata. Completed instants are
/// immutable, so a cached entry never goes stale.
#[derive(Debug, Clone)]
pub struct TimelineStore {
    location: TableLocation,
    write_timeout: Duration,
    metadata_cache: Arc<Mutex<HashMap<Instant, Arc<CommitMetadata>>>>,
}

impl TimelineStore {
    /// Default time box for a single instant-file write.
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a store rooted at a table directory.
    pub fn new(location: TableLocation) -> Self {
        Self {
            location,
            write_timeout: Self::DEFAULT_WRITE_TIMEOUT,
            metadata_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the time box applied to instant-file writes.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Table root.
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    fn instant_rel_path(instant: &Instant) -> PathBuf {
        layout::timeline_rel_dir().join(instant.file_name())
    }

    fn archived_rel_path(instant: &Instant) -> PathBuf {
        layout::archived_rel_dir().join(instant.file_name())
    }

    /// Create the metadata directories of a new table.
    pub async fn create_layout(&self) -> Result<(), TimelineError> {
        storage::create_dir_all(&self.location, &layout::timeline_rel_dir())
            .await
            .context(StorageSnafu)?;
        storage::create_dir_all(&self.location, &layout::archived_rel_dir())
            .await
            .context(StorageSnafu)?;
        Ok(())
    }

    /// Fail with [`TimelineError::TableNotFound`] unless the table root and its
    /// timeline directory exist.
    pub async fn ensure_table_exists(&self) -> Result<(), TimelineError> {
        let root_exists = storage::exists(&self.location, Path::new(""))
            .await
            .context(StorageSnafu)?;
        let timeline_exists = root_exists
            && storage::exists(&self.location, &layout::timeline_rel_dir())
                .await
                .context(StorageSnafu)?;
        ensure!(
            timeline_exists,
            TableNotFoundSnafu {
                location: self.location.to_string(),
            }
        );
        Ok(())
    }

    /// List the active timeline.
    pub async fn list_instants(&self) -> Result<Vec<Instant>, TimelineError> {
        self.list_dir_instants(&layout::timeline_rel_dir(), true).await
    }

    /// List archived instants. A table without an archive directory has none.
    pub async fn list_archived_instants(&self) -> Result<Vec<Instant>, TimelineError> {
        let dir = layout::archived_rel_dir();
        let exists = storage::exists(&self.location, &dir)
            .await
            .context(StorageSnafu)?;
        if !exists {
            return Ok(Vec::new());
        }
        self.list_dir_instants(&dir, false).await
    }

    async fn list_dir_instants(
        &self,
        dir: &Path,
        check_predecessors: bool,
    ) -> Result<Vec<Instant>, TimelineError> {
        let entries = match storage::list_dir(&self.location, dir).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => {
                return TableNotFoundSnafu {
                    location: self.location.to_string(),
                }
                .fail();
            }
            Err(source) => return Err(TimelineError::Storage { source }),
        };

        let names: Vec<String> = entries
            .into_iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.name)
            .collect();
        fold_instant_files(&names, check_predecessors)
    }

    async fn publish(&self, rel: &Path, payload: &[u8]) -> Result<(), TimelineError> {
        storage::with_write_timeout(
            rel,
            self.write_timeout,
            storage::write_new_atomic(&self.location, rel, payload),
        )
        .await
        .context(StorageSnafu)
    }

    /// Publish the requested file of a new instant.
    ///
    /// Fails with a storage `AlreadyExists` error when `(timestamp, action)` is
    /// taken; callers pick a new timestamp and retry.
    pub async fn create_requested(
        &self,
        instant: &Instant,
        payload: Option<&[u8]>,
    ) -> Result<(), TimelineError> {
        ensure!(
            instant.state() == State::Requested,
            InvalidStateTransitionSnafu {
                instant: instant.to_string(),
                reason: "new instants must start in REQUESTED",
            }
        );
        self.publish(
            &Self::instant_rel_path(instant),
            payload.unwrap_or(EMPTY_PAYLOAD),
        )
        .await
    }

    /// Publish the file of `target` (an existing instant moved one state on).
    ///
    /// The file of the current state must exist, and the target file must not:
    /// a second writer racing on the same transition loses with
    /// [`TimelineError::InvalidStateTransition`].
    pub async fn publish_transition(
        &self,
        current: &Instant,
        target: &Instant,
        payload: Option<&[u8]>,
    ) -> Result<(), TimelineError> {
        let current_exists = storage::exists(&self.location, &Self::instant_rel_path(current))
            .await
            .context(StorageSnafu)?;
        ensure!(
            current_exists,
            InvalidStateTransitionSnafu {
                instant: current.to_string(),
                reason: format!(
                    "no {} file on the timeline; the instant was aborted or never created",
                    current.state()
                ),
            }
        );

        match self
            .publish(&Self::instant_rel_path(target), payload.unwrap_or(EMPTY_PAYLOAD))
            .await
        {
            Ok(()) => Ok(()),
            Err(TimelineError::Storage { source }) if source.is_already_exists() => {
                InvalidStateTransitionSnafu {
                    instant: current.to_string(),
                    reason: format!("{} already reached {}", current, target.state()),
                }
                .fail()
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the requested and inflight files of a pending instant.
    pub async fn delete_pending(&self, instant: &Instant) -> Result<(), TimelineError> {
        let completed = instant.with_state(State::Completed);
        let completed_exists = storage::exists(&self.location, &Self::instant_rel_path(&completed))
            .await
            .context(StorageSnafu)?;
        ensure!(
            !completed_exists,
            InvalidStateTransitionSnafu {
                instant: instant.to_string(),
                reason: "completed instants are immutable and cannot be rolled back",
            }
        );

        // Newest state first, so a crash mid-way still leaves a well-formed prefix.
        for state in [State::Inflight, State::Requested] {
            let rel = Self::instant_rel_path(&instant.with_state(state));
            storage::remove_file_if_exists(&self.location, &rel)
                .await
                .context(StorageSnafu)?;
        }
        Ok(())
    }

    /// Move every state file of a completed instant into the archive.
    ///
    /// Files already moved are skipped, so re-running an interrupted archival
    /// finishes it.
    pub async fn archive(&self, instant: &Instant) -> Result<(), TimelineError> {
        ensure!(
            instant.is_completed(),
            InvalidStateTransitionSnafu {
                instant: instant.to_string(),
                reason: "only completed instants can be archived",
            }
        );
        // Completed file last: until it moves, the active timeline still lists
        // the instant as completed.
        for state in [State::Requested, State::Inflight, State::Completed] {
            let file = instant.with_state(state);
            match storage::rename(
                &self.location,
                &Self::instant_rel_path(&file),
                &Self::archived_rel_path(&file),
            )
            .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(source) => return Err(TimelineError::Storage { source }),
            }
        }
        Ok(())
    }

    /// Raw bytes of the file of `instant` in its current state, looking in the
    /// active timeline first and the archive second.
    pub async fn read_details(&self, instant: &Instant) -> Result<Vec<u8>, TimelineError> {
        match storage::read_all_bytes(&self.location, &Self::instant_rel_path(instant)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.is_not_found() => {
                match storage::read_all_bytes(&self.location, &Self::archived_rel_path(instant))
                    .await
                {
                    Ok(bytes) => Ok(bytes),
                    Err(e) if e.is_not_found() => CorruptTimelineSnafu {
                        msg: format!("instant file for {instant} is missing"),
                    }
                    .fail(),
                    Err(source) => Err(TimelineError::Storage { source }),
                }
            }
            Err(source) => Err(TimelineError::Storage { source }),
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, instant: &Instant) -> Result<T, TimelineError> {
        let bytes = self.read_details(instant).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            CorruptTimelineSnafu {
                msg: format!("failed to parse {}: {e}", instant.file_name()),
            }
            .build()
        })
    }

    /// Metadata of a completed instant.
    pub async fn read_commit_metadata(
        &self,
        instant: &Instant,
    ) -> Result<CommitMetadata, TimelineError> {
        Ok(self.read_commit_metadata_shared(instant).await?.as_ref().clone())
    }

    /// Metadata of a completed instant, served from the shared cache when it
    /// was read before.
    pub async fn read_commit_metadata_shared(
        &self,
        instant: &Instant,
    ) -> Result<Arc<CommitMetadata>, TimelineError> {
        ensure!(
            instant.is_completed(),
            InvalidStateTransitionSnafu {
                instant: instant.to_string(),
                reason: "commit metadata exists only once an instant is COMPLETED",
            }
        );
        if let Some(hit) = self.metadata_cache.lock().get(instant) {
            return Ok(Arc::clone(hit));
        }
        let metadata: Arc<CommitMetadata> = Arc::new(self.read_json(instant).await?);
        self.metadata_cache
            .lock()
            .insert(instant.clone(), Arc::clone(&metadata));
        Ok(metadata)
    }

    /// Plan stored in the requested file of a compaction instant.
    pub async fn read_compaction_plan(
        &self,
        timestamp: &InstantTime,
    ) -> Result<CompactionPlan, TimelineError> {
        let requested = Instant::new(timestamp.clone(), Action::Compaction, State::Requested);
        self.read_json(&requested).await
    }

    /// Plan stored in the requested file of a replace instant.
    pub async fn read_clustering_plan(
        &self,
        timestamp: &InstantTime,
    ) -> Result<ClusteringPlan, TimelineError> {
        let requested = Instant::new(timestamp.clone(), Action::Replace, State::Requested);
        self.read_json(&requested).await
    }

    /// File groups reserved by the plan of a compaction or replace instant.
    /// Ingestion instants have no plan and reserve nothing.
    pub async fn read_plan_file_groups(
        &self,
        instant: &Instant,
    ) -> Result<BTreeSet<FileGroupId>, TimelineError> {
        match instant.action() {
            Action::Compaction => {
                let plan = self.read_compaction_plan(instant.timestamp()).await?;
                Ok(plan.file_groups())
            }
            Action::Replace => {
                let plan = self.read_clustering_plan(instant.timestamp()).await?;
                Ok(plan.file_groups())
            }
            Action::Commit | Action::DeltaCommit => Ok(BTreeSet::new()),
        }
    }
}

/// Serialize a payload for an instant file.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, TimelineError> {
    serde_json::to_vec_pretty(value).map_err(|e| {
        CorruptTimelineSnafu {
            msg: format!("failed to serialize instant payload: {e}"),
        }
        .build()
    })
}

/// Fold a directory listing into instants, one per `(timestamp, action)` at its
/// highest persisted state.
///
/// - Temp files left behind by interrupted writes (`*.tmp`) are skipped.
/// - Any other unparseable name is [`TimelineError::CorruptTimeline`].
/// - With `check_predecessors`, an INFLIGHT file without its REQUESTED file
///   is [`TimelineError::CorruptTimeline`]. The archive is folded without the
///   check because an interrupted archival leaves partial sets behind.
fn fold_instant_files(
    names: &[String],
    check_predecessors: bool,
) -> Result<Vec<Instant>, TimelineError> {
    let mut states: BTreeMap<(InstantTime, Action), Vec<State>> = BTreeMap::new();
    for name in names {
        if name.ends_with(".tmp") {
            continue;
        }
        let instant = Instant::parse_file_name(name).context(CorruptTimelineSnafu {
            msg: format!("unrecognized file {name:?} in timeline directory"),
        })?;
        states
            .entry((instant.timestamp().clone(), instant.action()))
            .or_default()
            .push(instant.state());
    }

    let mut instants = Vec::with_capacity(states.len());
    for ((timestamp, action), mut present) in states {
        present.sort();
        let highest = present[present.len() - 1];
        // A completed file is the commit point and stands on its own, since
        // archival moves the earlier state files away first. A pending state
        // needs every earlier state file.
        let consistent = !check_predecessors
            || match highest {
                State::Requested | State::Completed => true,
                State::Inflight => present.contains(&State::Requested),
            };
        ensure!(
            consistent,
            CorruptTimelineSnafu {
                msg: format!(
                    "instant {timestamp} ({action}) has state files {present:?} \
                     without their predecessors"
                ),
            }
        );
        instants.push(Instant::new(timestamp, action, highest));
    }
    instants.sort();
    Ok(instants)
}

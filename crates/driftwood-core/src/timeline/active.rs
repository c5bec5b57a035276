//! The persisted active timeline.
//!
//! [`ActiveTimeline`] pairs a [`TimelineStore`] with the [`Timeline`] snapshot
//! last read from it. Creating an instant and moving it through its states
//! happens here and nowhere else:
//!
//! - [`ActiveTimeline::begin_instant`] allocates a fresh, strictly increasing
//!   instant time and publishes the REQUESTED file.
//! - [`ActiveTimeline::transition`] publishes the file of the next state and
//!   refuses anything but a single forward step.
//! - [`ActiveTimeline::reload`] re-reads the directory so changes made by other
//!   writers become visible.
//!
//! The snapshot is only replaced wholesale on reload, so readers holding a
//! clone of [`ActiveTimeline::timeline`] keep a stable view.
use log::{debug, info};
use snafu::prelude::*;

use crate::timeline::instant::{Action, Instant, InstantTime, State};
use crate::timeline::instant_time::next_instant_time;
use crate::timeline::metadata::CommitMetadata;
use crate::timeline::snapshot::Timeline;
use crate::timeline::store::{TimelineStore, to_payload};
use crate::timeline::{CorruptTimelineSnafu, InvalidStateTransitionSnafu, TimelineError};

/// Attempts at finding an unused instant time before giving up.
const MAX_BEGIN_ATTEMPTS: usize = 32;

/// The persisted timeline of one table and its current snapshot.
#[derive(Debug, Clone)]
pub struct ActiveTimeline {
    store: TimelineStore,
    timeline: Timeline,
}

impl ActiveTimeline {
    /// Load the timeline of an existing table.
    ///
    /// Fails with [`TimelineError::TableNotFound`] when the table was never
    /// initialized and [`TimelineError::CorruptTimeline`] when the instant files
    /// do not form a valid timeline.
    pub async fn load(store: TimelineStore) -> Result<Self, TimelineError> {
        store.ensure_table_exists().await?;
        let timeline = read_snapshot(&store).await?;
        Ok(Self { store, timeline })
    }

    /// Re-read the persisted timeline.
    pub async fn reload(&mut self) -> Result<(), TimelineError> {
        self.store.ensure_table_exists().await?;
        self.timeline = read_snapshot(&self.store).await?;
        Ok(())
    }

    /// Current snapshot.
    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Underlying store.
    pub fn store(&self) -> &TimelineStore {
        &self.store
    }

    /// Completed instants with an action in `actions`, timestamp ascending.
    /// The iterator is lazy and can be cloned to restart it.
    pub fn get_completed_instants<'a>(
        &'a self,
        actions: &'a [Action],
    ) -> impl Iterator<Item = &'a Instant> + Clone + 'a {
        self.timeline.completed_instants(actions)
    }

    /// Create a REQUESTED instant with a fresh instant time.
    pub async fn begin_instant(&mut self, action: Action) -> Result<Instant, TimelineError> {
        self.begin_instant_with_payload(action, None).await
    }

    /// Create a REQUESTED instant whose requested file carries `payload`
    /// (compaction and clustering plans).
    ///
    /// The timeline is reloaded first so the new instant time is strictly
    /// greater than every instant already persisted, including those written by
    /// other processes.
    pub async fn begin_instant_with_payload(
        &mut self,
        action: Action,
        payload: Option<&[u8]>,
    ) -> Result<Instant, TimelineError> {
        self.reload().await?;
        let mut floor: Option<InstantTime> = self.timeline.max_instant_time().cloned();

        for _ in 0..MAX_BEGIN_ATTEMPTS {
            let timestamp = next_instant_time(floor.as_ref());
            let instant = Instant::new(timestamp.clone(), action, State::Requested);
            match self.store.create_requested(&instant, payload).await {
                Ok(()) => {
                    debug!("instant requested (instant={instant})");
                    self.timeline.upsert(instant.clone());
                    return Ok(instant);
                }
                Err(TimelineError::Storage { source }) if source.is_already_exists() => {
                    debug!(
                        "instant time taken, advancing (timestamp={timestamp}, action={action})"
                    );
                    floor = Some(timestamp);
                }
                Err(e) => return Err(e),
            }
        }

        CorruptTimelineSnafu {
            msg: format!(
                "no free instant time for {action} after {MAX_BEGIN_ATTEMPTS} attempts"
            ),
        }
        .fail()
    }

    /// Move `instant` to `new_state`, publishing `payload` as the new state's
    /// file content.
    ///
    /// Only the single forward steps REQUESTED -> INFLIGHT and
    /// INFLIGHT -> COMPLETED are accepted; anything else, or a transition that
    /// another writer already made, fails with
    /// [`TimelineError::InvalidStateTransition`].
    pub async fn transition(
        &mut self,
        instant: &Instant,
        new_state: State,
        payload: Option<&[u8]>,
    ) -> Result<Instant, TimelineError> {
        ensure!(
            instant.state().next() == Some(new_state),
            InvalidStateTransitionSnafu {
                instant: instant.to_string(),
                reason: format!("{} -> {new_state} is not allowed", instant.state()),
            }
        );

        let target = instant.with_state(new_state);
        self.store
            .publish_transition(instant, &target, payload)
            .await?;

        if new_state == State::Completed {
            info!("instant completed (instant={target})");
        } else {
            debug!("instant transitioned (instant={target})");
        }
        self.timeline.upsert(target.clone());
        Ok(target)
    }

    /// REQUESTED -> INFLIGHT.
    pub async fn transition_to_inflight(
        &mut self,
        instant: &Instant,
    ) -> Result<Instant, TimelineError> {
        self.transition(instant, State::Inflight, None).await
    }

    /// INFLIGHT -> COMPLETED with `metadata` as the completed payload.
    pub async fn complete(
        &mut self,
        instant: &Instant,
        metadata: &CommitMetadata,
    ) -> Result<Instant, TimelineError> {
        let payload = to_payload(metadata)?;
        self.transition(instant, State::Completed, Some(&payload))
            .await
    }

    /// Remove a pending instant's files (rollback).
    pub async fn delete_pending(&mut self, instant: &Instant) -> Result<(), TimelineError> {
        self.store.delete_pending(instant).await?;
        self.timeline.remove(instant);
        info!("pending instant removed (instant={instant})");
        Ok(())
    }

    /// Metadata of a completed instant.
    pub async fn read_commit_metadata(
        &self,
        instant: &Instant,
    ) -> Result<CommitMetadata, TimelineError> {
        self.store.read_commit_metadata(instant).await
    }
}

async fn read_snapshot(store: &TimelineStore) -> Result<Timeline, TimelineError> {
    let active = store.list_instants().await?;
    let archived_up_to = store
        .list_archived_instants()
        .await?
        .into_iter()
        .map(|i| i.timestamp().clone())
        .max();
    Ok(Timeline::new(active, archived_up_to))
}

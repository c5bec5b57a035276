//! Conflict detection between a committing instant and concurrent work.
//!
//! The candidates a commit is checked against are:
//!
//! - instants that completed after the committing writer took its base
//!   snapshot (including ones archived since),
//! - pending compaction and clustering instants, through the file groups
//!   their plans cover. A plan reserves its file groups until it completes or
//!   is rolled back.
//!
//! Each candidate is reduced to a [`ConcurrentOperation`] and handed to a
//! [`ConflictResolutionStrategy`].
use std::collections::BTreeSet;
use std::fmt;

use crate::file_system_view::FileGroupId;
use crate::timeline::archive::load_archived_timeline;
use crate::timeline::{
    Action, CommitMetadata, Instant, State, Timeline, TimelineError, TimelineStore,
};

/// What one instant touched, as far as conflict detection cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrentOperation {
    /// The instant.
    pub instant: Instant,
    /// File groups written, replaced, or reserved by a plan.
    pub file_groups: BTreeSet<FileGroupId>,
}

impl ConcurrentOperation {
    /// Operation of a commit with `metadata`.
    pub fn from_metadata(instant: Instant, metadata: &CommitMetadata) -> Self {
        Self {
            instant,
            file_groups: metadata.touched_file_groups(),
        }
    }
}

/// Decides whether two operations may both commit.
pub trait ConflictResolutionStrategy: Send + Sync + fmt::Debug {
    /// Why `current` cannot commit alongside `other`, or `None`.
    fn conflict(&self, current: &ConcurrentOperation, other: &ConcurrentOperation)
    -> Option<String>;
}

/// Conflict when the operations share an instant time or a file group.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileGroupConflictStrategy;

impl ConflictResolutionStrategy for FileGroupConflictStrategy {
    fn conflict(
        &self,
        current: &ConcurrentOperation,
        other: &ConcurrentOperation,
    ) -> Option<String> {
        if current.instant.timestamp() == other.instant.timestamp() {
            return Some(format!(
                "both instants use instant time {}",
                current.instant.timestamp()
            ));
        }
        let overlap: Vec<String> = current
            .file_groups
            .intersection(&other.file_groups)
            .map(ToString::to_string)
            .collect();
        if overlap.is_empty() {
            None
        } else {
            Some(format!("overlapping file groups [{}]", overlap.join(", ")))
        }
    }
}

/// Operations `own` must be checked against.
///
/// `base` is the snapshot the writer started from and `current` the snapshot
/// reloaded under the table lock.
pub async fn concurrent_operations(
    store: &TimelineStore,
    base: &Timeline,
    current: &Timeline,
    own: &Instant,
) -> Result<Vec<ConcurrentOperation>, TimelineError> {
    let already_seen = |i: &Instant| {
        base.contains_in_state(i, State::Completed) || i.same_event(own)
    };

    let mut completed: Vec<Instant> = current
        .completed()
        .iter()
        .filter(|i| !already_seen(*i))
        .cloned()
        .collect();

    // Everything archived while the writer ran had been pending or unseen at
    // its start, so it lies after the archive boundary of `base`.
    if current.archived_up_to() != base.archived_up_to() {
        let archived = load_archived_timeline(store).await?;
        completed.extend(
            archived
                .iter()
                .filter(|i| base.archived_up_to().is_none_or(|b| i.timestamp() > b))
                .filter(|i| !already_seen(*i))
                .cloned(),
        );
    }

    let mut ops = Vec::with_capacity(completed.len());
    for instant in completed {
        let metadata = store.read_commit_metadata_shared(&instant).await?;
        ops.push(ConcurrentOperation::from_metadata(instant, &metadata));
    }

    let planned = current
        .pending()
        .filter_actions(&[Action::Compaction, Action::Replace]);
    for pending in planned.iter().filter(|i| !i.same_event(own)) {
        ops.push(ConcurrentOperation {
            instant: pending.clone(),
            file_groups: store.read_plan_file_groups(pending).await?,
        });
    }

    Ok(ops)
}

//! The commit timeline.
//!
//! The timeline is the ordered, append-only log of every state transition of a
//! table. It is stored as one file per `(timestamp, action, state)` triple in
//! `.driftwood/timeline/`:
//!
//! ```text
//! table_root/
//!   .driftwood/
//!     timeline/
//!       20250101093000123.commit.requested
//!       20250101093000123.commit.inflight
//!       20250101093000123.commit            # completed, holds CommitMetadata
//!       20250101093500456.compaction.requested   # holds a CompactionPlan
//!     archived/                                   # instants pruned from the active timeline
//! ```
//!
//! - [`instant`]: the `Instant` value type and its file-name codec.
//! - [`instant_time`]: strictly increasing instant time generation.
//! - [`metadata`]: payloads stored in instant files.
//! - [`store`]: persistence (listing, create-once publishing, typed reads).
//! - [`snapshot`]: [`Timeline`], an immutable, ordered view with filters.
//! - [`active`]: [`ActiveTimeline`], the persisted timeline plus its current
//!   snapshot; the only place instants are created and transitioned.
//! - [`archive`]: moving old completed instants out of the active timeline.
//!
//! Every mutation is the publication of a new file. Completed files are never
//! rewritten, and a crash mid-transition is recoverable by looking at which
//! state files exist.
pub mod active;
pub mod archive;
pub mod instant;
pub mod instant_time;
pub mod metadata;
pub mod snapshot;
pub mod store;

pub use active::ActiveTimeline;
pub use instant::{Action, Instant, InstantTime, State};
pub use metadata::{
    ClusteringGroup, ClusteringPlan, CommitMetadata, CompactionOperation, CompactionPlan,
    WriteOperationType, WriteStat,
};
pub use snapshot::Timeline;
pub use store::TimelineStore;

use snafu::{Backtrace, prelude::*};

use crate::storage::StorageError;

/// Errors raised while reading or mutating the timeline.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TimelineError {
    /// The table root, or its timeline directory, does not exist.
    ///
    /// Recoverable: callers commonly retry while the first writer initializes
    /// the table.
    #[snafu(display("Table not found at {location}"))]
    TableNotFound {
        /// Table root that was probed.
        location: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Instant files are missing or malformed. Requires manual repair.
    #[snafu(display("Corrupt timeline: {msg}"))]
    CorruptTimeline {
        /// A description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A transition that would move an instant backwards, skip a state, or
    /// touch an instant that is no longer pending.
    #[snafu(display("Invalid state transition for {instant}: {reason}"))]
    InvalidStateTransition {
        /// The instant being transitioned.
        instant: String,
        /// Why the transition was refused.
        reason: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Underlying storage error while accessing instant files.
    #[snafu(display("Storage error while accessing the timeline: {source}"))]
    Storage {
        /// Underlying storage error returned by the storage backend.
        #[snafu(backtrace)]
        source: StorageError,
    },
}

impl TimelineError {
    /// Whether retrying the operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TimelineError::TableNotFound { .. } => true,
            TimelineError::Storage { source } => matches!(source, StorageError::TimedOut { .. }),
            TimelineError::CorruptTimeline { .. }
            | TimelineError::InvalidStateTransition { .. } => false,
        }
    }
}

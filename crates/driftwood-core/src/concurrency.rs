//! Multi-writer coordination.
//!
//! Writers produce data without coordination and only serialize the final
//! step: validating the commit against work that completed concurrently and
//! publishing the completed instant file. That step runs under a table-scoped
//! lock ([`lock`]) and applies a conflict policy ([`conflict`]); [`transaction`]
//! ties the two together.
//!
//! A lost race surfaces as [`ConcurrencyError::WriteConflict`] and a congested
//! lock as [`ConcurrencyError::LockAcquisitionTimeout`]. Neither is retried
//! here; the writer decides whether to start over with a fresh instant.
pub mod conflict;
pub mod lock;
pub mod transaction;

pub use conflict::{ConcurrentOperation, ConflictResolutionStrategy, FileGroupConflictStrategy};
pub use lock::{FileSystemLockProvider, InProcessLockProvider, LockProvider, LockToken};
pub use transaction::TransactionManager;

use std::time::Duration;

use snafu::{Backtrace, prelude::*};

use crate::storage::StorageError;
use crate::timeline::TimelineError;

/// Errors raised by the concurrency controller.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConcurrencyError {
    /// The table lock could not be acquired in time.
    #[snafu(display("Could not acquire the {provider} table lock within {timeout:?}"))]
    LockAcquisitionTimeout {
        /// Lock provider name.
        provider: String,
        /// Configured wait.
        timeout: Duration,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A concurrently completed (or pending, planned) instant touched the same
    /// file groups, or used the same instant time.
    #[snafu(display("Write conflict: {instant} conflicts with {conflicting_instant}: {reason}"))]
    WriteConflict {
        /// The instant that lost.
        instant: String,
        /// The instant it conflicts with.
        conflicting_instant: String,
        /// What overlapped.
        reason: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Timeline error while validating or publishing.
    #[snafu(display("Timeline error during commit: {source}"))]
    CommitTimeline {
        /// Underlying timeline error.
        #[snafu(backtrace)]
        source: TimelineError,
    },

    /// Storage error in a lock provider.
    #[snafu(display("Lock storage error: {source}"))]
    LockStorage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The lock file body could not be encoded.
    #[snafu(display("Failed to encode the table lock file: {source}"))]
    LockFileEncode {
        /// Underlying serialization error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

impl ConcurrencyError {
    /// Whether the writer may retry the whole commit attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConcurrencyError::LockAcquisitionTimeout { .. }
            | ConcurrencyError::WriteConflict { .. } => true,
            ConcurrencyError::CommitTimeline { source } => source.is_retryable(),
            ConcurrencyError::LockStorage { source } => {
                matches!(source, StorageError::TimedOut { .. })
            }
            ConcurrencyError::LockFileEncode { .. } => false,
        }
    }
}

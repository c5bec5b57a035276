//! Error type of the write client.
//!
//! [`TableError`] wraps the error of whichever layer failed and adds the few
//! failures that only exist at the client surface. Callers should branch on
//! [`TableError::is_retryable`] rather than on individual variants:
//!
//! | Failure | Retryable | What to do |
//! |---|---|---|
//! | table not found | yes | wait for the table to be initialized |
//! | write conflict | yes | abort, then write again with a fresh instant |
//! | lock acquisition timeout | yes | back off, then commit again |
//! | corrupt timeline | no | stop; needs inspection |
//! | invalid state transition | no | stop; caller bug or concurrent rollback |
use snafu::{Backtrace, prelude::*};

use crate::checkpoint::CheckpointError;
use crate::concurrency::ConcurrencyError;
use crate::config::{ConfigError, TableType};
use crate::records::RecordError;
use crate::table_services::TableServiceError;
use crate::timeline::{Action, TimelineError};

/// Errors returned by [`crate::client::WriteClient`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// Timeline error (missing table, corrupt files, bad transitions).
    #[snafu(display("Timeline error: {source}"))]
    Timeline {
        /// Underlying timeline error.
        #[snafu(backtrace)]
        source: TimelineError,
    },

    /// Lock or OCC error while committing or aborting.
    #[snafu(display("Concurrency error: {source}"))]
    Concurrency {
        /// Underlying concurrency error.
        #[snafu(backtrace)]
        source: ConcurrencyError,
    },

    /// Table properties or writer configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config {
        /// Underlying configuration error.
        #[snafu(backtrace)]
        source: ConfigError,
    },

    /// Data file error while staging or reading records.
    #[snafu(display("Data file error: {source}"))]
    Records {
        /// Underlying record error.
        #[snafu(backtrace)]
        source: RecordError,
    },

    /// Checkpoint encoding or lookup error.
    #[snafu(display("Checkpoint error: {source}"))]
    Checkpoint {
        /// Underlying checkpoint error.
        #[snafu(backtrace)]
        source: CheckpointError,
    },

    /// An explicitly requested table service failed.
    #[snafu(display("Table service error: {source}"))]
    TableService {
        /// Underlying service error.
        #[snafu(backtrace)]
        source: TableServiceError,
    },

    /// The commit succeeded but an inline table service run after it failed.
    /// The committed instant stands; do not write the batch again.
    #[snafu(display("Instant {committed} committed, but an inline table service failed: {source}"))]
    InlineTableService {
        /// The completed ingestion instant.
        committed: String,
        /// Underlying service error.
        #[snafu(backtrace)]
        source: TableServiceError,
    },

    /// The instant was not started by this client, or was already committed
    /// or aborted through it.
    #[snafu(display("Instant {instant} is not an open write of this client"))]
    UnknownInstant {
        /// The instant passed in.
        instant: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Ingestion action does not match the table type.
    #[snafu(display("A {table_type:?} table is written with {expected} instants, not {action}"))]
    ActionMismatch {
        /// Action requested.
        action: Action,
        /// Action the table uses.
        expected: Action,
        /// Table type.
        table_type: TableType,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

impl TableError {
    /// Whether the caller may retry the operation (with a fresh instant for
    /// write conflicts).
    pub fn is_retryable(&self) -> bool {
        match self {
            TableError::Timeline { source } => source.is_retryable(),
            TableError::Concurrency { source } => source.is_retryable(),
            TableError::Config { source } => source.is_table_not_initialized(),
            TableError::TableService { source } => source.is_retryable(),
            TableError::Records { .. }
            | TableError::Checkpoint { .. }
            | TableError::InlineTableService { .. }
            | TableError::UnknownInstant { .. }
            | TableError::ActionMismatch { .. } => false,
        }
    }

    /// Whether another writer won the race for a file group.
    pub fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            TableError::Concurrency {
                source: ConcurrencyError::WriteConflict { .. }
            }
        )
    }

    /// Whether the table has not been initialized (yet).
    pub fn is_table_not_found(&self) -> bool {
        match self {
            TableError::Timeline {
                source: TimelineError::TableNotFound { .. },
            } => true,
            TableError::Config { source } => source.is_table_not_initialized(),
            _ => false,
        }
    }
}

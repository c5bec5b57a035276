//! Table services: compaction and clustering.
//!
//! Both services follow the same life cycle on the timeline:
//!
//! ```text
//! IDLE --schedule--> REQUESTED (plan) --execute--> INFLIGHT --commit--> COMPLETED
//! ```
//!
//! - Scheduling runs under the table lock. It reloads the timeline, checks
//!   the trigger, builds a plan from the latest file slices and publishes the
//!   plan as the requested file of a new instant.
//! - Execution rewrites the planned file groups without the lock, then
//!   completes the instant through the concurrency controller like any
//!   ingestion commit.
//! - A pending plan reserves its file groups: writers touching them fail to
//!   commit until the plan completes or is rolled back.
//!
//! Execution is idempotent. Output files carry the service instant's
//! timestamp and are cleared before each attempt, so an instant left INFLIGHT
//! by a crash is simply executed again ([`compaction::resume_pending_compactions`],
//! [`clustering::resume_pending_clustering`]) or rolled back.
//!
//! Services run inline after an ingestion commit or on a background task
//! ([`spawn_async_table_services`]).
pub mod clustering;
pub mod compaction;
mod runner;

pub use runner::{TableServiceContext, TableServiceHandle, spawn_async_table_services};

use std::collections::BTreeSet;

use log::warn;
use snafu::{Backtrace, prelude::*};

use crate::concurrency::{ConcurrencyError, TransactionManager};
use crate::config::ArchivalConfig;
use crate::file_system_view::FileGroupId;
use crate::records::RecordError;
use crate::timeline::archive::archive_if_needed;
use crate::timeline::{ActiveTimeline, Action, Instant, Timeline, TimelineError, TimelineStore};

/// Errors raised by compaction and clustering.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableServiceError {
    /// Timeline error while planning or executing.
    #[snafu(display("Timeline error in table service: {source}"))]
    ServiceTimeline {
        /// Underlying timeline error.
        #[snafu(backtrace)]
        source: TimelineError,
    },

    /// Lock or conflict error while scheduling or completing.
    #[snafu(display("Concurrency error in table service: {source}"))]
    ServiceConcurrency {
        /// Underlying concurrency error.
        #[snafu(backtrace)]
        source: ConcurrencyError,
    },

    /// Data file error while rewriting file groups.
    #[snafu(display("Data file error in table service: {source}"))]
    ServiceRecords {
        /// Underlying record error.
        #[snafu(backtrace)]
        source: RecordError,
    },

    /// A plan names file groups the table no longer shows.
    #[snafu(display("Plan of instant {instant} cannot be executed: {msg}"))]
    InvalidPlan {
        /// Service instant.
        instant: String,
        /// What is missing.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The instant handed to an executor is not a pending instant of the
    /// service's action.
    #[snafu(display("Instant {instant} is not a pending {expected} instant"))]
    NotAServiceInstant {
        /// Instant received.
        instant: String,
        /// Action the executor handles.
        expected: Action,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

impl TableServiceError {
    /// Whether running the service again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TableServiceError::ServiceTimeline { source } => source.is_retryable(),
            TableServiceError::ServiceConcurrency { source } => source.is_retryable(),
            TableServiceError::ServiceRecords { .. }
            | TableServiceError::InvalidPlan { .. }
            | TableServiceError::NotAServiceInstant { .. } => false,
        }
    }
}

/// File groups reserved by every pending compaction and clustering plan in
/// `timeline`.
pub async fn reserved_file_groups(
    store: &TimelineStore,
    timeline: &Timeline,
) -> Result<BTreeSet<FileGroupId>, TimelineError> {
    let mut reserved = BTreeSet::new();
    let planned = timeline
        .pending()
        .filter_actions(&[Action::Compaction, Action::Replace]);
    for instant in &planned {
        reserved.extend(store.read_plan_file_groups(instant).await?);
    }
    Ok(reserved)
}

/// Archive old completed instants under the table lock. Returns the
/// archived instants.
pub async fn archive_timeline(
    active: &mut ActiveTimeline,
    txn: &TransactionManager,
    config: &ArchivalConfig,
) -> Result<Vec<Instant>, TableServiceError> {
    if !config.enabled {
        return Ok(Vec::new());
    }
    let token = txn.acquire().await.context(ServiceConcurrencySnafu)?;
    let result = archive_if_needed(active, config)
        .await
        .context(ServiceTimelineSnafu);
    let released = txn.release(token).await;
    settle(result, released)
}

/// Combine the outcome of work done under the table lock with the outcome of
/// releasing it. The work's own error wins.
pub(crate) fn settle<T>(
    result: Result<T, TableServiceError>,
    released: Result<(), ConcurrencyError>,
) -> Result<T, TableServiceError> {
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(source)) => Err(TableServiceError::ServiceConcurrency { source }),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!("table lock release failed after service error (error={release_err})");
            Err(e)
        }
    }
}

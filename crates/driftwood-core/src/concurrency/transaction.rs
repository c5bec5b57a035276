//! Optimistic commit finalization.
//!
//! [`TransactionManager::commit`] is the only place an ingestion or table
//! service instant becomes COMPLETED:
//!
//! 1. acquire the table lock,
//! 2. reload the timeline,
//! 3. check the instant against every concurrent operation,
//! 4. publish the completed file,
//! 5. release the lock, whatever happened in 2-4.
//!
//! Producing data happens before step 1, without the lock.
use std::sync::Arc;

use log::{debug, warn};
use snafu::prelude::*;

use crate::concurrency::conflict::{
    ConcurrentOperation, ConflictResolutionStrategy, FileGroupConflictStrategy,
    concurrent_operations,
};
use crate::concurrency::lock::{
    FileSystemLockProvider, InProcessLockProvider, LockProvider, LockToken,
};
use crate::concurrency::{CommitTimelineSnafu, ConcurrencyError, WriteConflictSnafu};
use crate::config::{LockProviderKind, WriteConfig};
use crate::file_system_view::FileGroupId;
use crate::storage::TableLocation;
use crate::timeline::{ActiveTimeline, CommitMetadata, Instant, Timeline};

/// Serializes commit finalization across writers.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    lock: Arc<dyn LockProvider>,
    strategy: Arc<dyn ConflictResolutionStrategy>,
}

impl TransactionManager {
    /// Manager with an explicit lock provider and conflict policy.
    pub fn new(
        lock: Arc<dyn LockProvider>,
        strategy: Arc<dyn ConflictResolutionStrategy>,
    ) -> Self {
        Self { lock, strategy }
    }

    /// Manager for the table at `location` configured by `config`.
    pub fn from_config(location: &TableLocation, config: &WriteConfig) -> Self {
        let lock: Arc<dyn LockProvider> = match config.lock_provider {
            LockProviderKind::InProcess => Arc::new(InProcessLockProvider::new(
                location,
                config.lock_acquire_timeout(),
            )),
            LockProviderKind::FileSystem => Arc::new(FileSystemLockProvider::new(
                location.clone(),
                config.lock_acquire_timeout(),
                config.lock_poll_interval(),
                config.lock_expiry(),
            )),
        };
        Self::new(lock, Arc::new(FileGroupConflictStrategy))
    }

    /// The lock provider.
    pub fn lock_provider(&self) -> &Arc<dyn LockProvider> {
        &self.lock
    }

    /// Acquire the table lock. Dropping the token releases it.
    pub async fn acquire(&self) -> Result<LockToken, ConcurrencyError> {
        self.lock.acquire().await
    }

    /// Release the table lock explicitly.
    pub async fn release(&self, token: LockToken) -> Result<(), ConcurrencyError> {
        self.lock.release(token).await
    }

    /// Validate `instant` (INFLIGHT) against concurrent work and complete it
    /// with `metadata`.
    ///
    /// `base` is the timeline snapshot taken when the writer began.
    /// `reserved` lists file groups the instant claims beyond those in its
    /// metadata (the inputs of a table service plan).
    pub async fn commit(
        &self,
        active: &mut ActiveTimeline,
        base: &Timeline,
        instant: &Instant,
        metadata: &CommitMetadata,
        reserved: &[FileGroupId],
    ) -> Result<Instant, ConcurrencyError> {
        let token = self.acquire().await?;
        let result = self
            .validate_and_complete(active, base, instant, metadata, reserved)
            .await;
        let released = self.release(token).await;

        match (result, released) {
            (Ok(completed), Ok(())) => Ok(completed),
            (Ok(_), Err(e)) => {
                // The instant is already completed; the lock is the only leftover.
                warn!("commit completed but lock release failed (instant={instant}, error={e})");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!(
                    "lock release failed after commit error \
                     (instant={instant}, error={release_err})",
                );
                Err(e)
            }
        }
    }

    async fn validate_and_complete(
        &self,
        active: &mut ActiveTimeline,
        base: &Timeline,
        instant: &Instant,
        metadata: &CommitMetadata,
        reserved: &[FileGroupId],
    ) -> Result<Instant, ConcurrencyError> {
        active.reload().await.context(CommitTimelineSnafu)?;
        let current = active.timeline().clone();

        let mut own = ConcurrentOperation::from_metadata(instant.clone(), metadata);
        own.file_groups.extend(reserved.iter().cloned());

        let candidates = concurrent_operations(active.store(), base, &current, instant)
            .await
            .context(CommitTimelineSnafu)?;
        debug!("validating commit (instant={instant}, candidates={})", candidates.len());

        for other in &candidates {
            if let Some(reason) = self.strategy.conflict(&own, other) {
                warn!(
                    "write conflict (instant={instant}, conflicting={}, reason={reason})",
                    other.instant,
                );
                return WriteConflictSnafu {
                    instant: instant.to_string(),
                    conflicting_instant: other.instant.to_string(),
                    reason,
                }
                .fail();
            }
        }

        active
            .complete(instant, metadata)
            .await
            .context(CommitTimelineSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{Action, TimelineStore, WriteOperationType, WriteStat};
    use std::time::Duration;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn metadata_touching(file_id: &str) -> CommitMetadata {
        let mut meta = CommitMetadata::new(WriteOperationType::Upsert);
        meta.add_write_stat(
            "p",
            WriteStat {
                file_id: file_id.to_string(),
                path: format!("p/{file_id}_20250101000000001.base.jsonl"),
                prev_base_instant: None,
                num_writes: 1,
                num_inserts: 1,
                num_updates: 0,
                file_size_bytes: 1,
            },
        );
        meta
    }

    async fn setup()
    -> Result<(TempDir, ActiveTimeline, TransactionManager), Box<dyn std::error::Error>> {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let store = TimelineStore::new(location.clone());
        store.create_layout().await?;
        let active = ActiveTimeline::load(store).await?;
        let config = WriteConfig::default().with_lock_acquire_timeout(Duration::from_secs(5));
        let tm = TransactionManager::from_config(&location, &config);
        Ok((tmp, active, tm))
    }

    async fn start(
        active: &mut ActiveTimeline,
    ) -> Result<(Timeline, Instant), Box<dyn std::error::Error>> {
        let requested = active.begin_instant(Action::Commit).await?;
        let base = active.timeline().clone();
        let inflight = active.transition_to_inflight(&requested).await?;
        Ok((base, inflight))
    }

    #[tokio::test]
    async fn disjoint_concurrent_commits_both_succeed() -> TestResult {
        let (tmp, mut a, tm) = setup().await?;
        let mut b =
            ActiveTimeline::load(TimelineStore::new(TableLocation::local(tmp.path()))).await?;

        let (base_a, ia) = start(&mut a).await?;
        let (base_b, ib) = start(&mut b).await?;

        tm.commit(&mut a, &base_a, &ia, &metadata_touching("fg-a"), &[]).await?;
        tm.commit(&mut b, &base_b, &ib, &metadata_touching("fg-b"), &[]).await?;

        a.reload().await?;
        assert_eq!(a.timeline().commits_timeline().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_concurrent_commits_conflict() -> TestResult {
        let (tmp, mut a, tm) = setup().await?;
        let mut b =
            ActiveTimeline::load(TimelineStore::new(TableLocation::local(tmp.path()))).await?;

        let (base_a, ia) = start(&mut a).await?;
        let (base_b, ib) = start(&mut b).await?;

        tm.commit(&mut a, &base_a, &ia, &metadata_touching("shared"), &[]).await?;
        let err = tm
            .commit(&mut b, &base_b, &ib, &metadata_touching("shared"), &[])
            .await
            .expect_err("b must lose");
        assert!(matches!(err, ConcurrencyError::WriteConflict { .. }));
        assert!(err.is_retryable());

        // The loser stays inflight and the lock is free again.
        b.reload().await?;
        assert_eq!(b.timeline().pending().len(), 1);
        let _token = tm.acquire().await?;
        Ok(())
    }

    #[tokio::test]
    async fn commits_seen_in_the_base_snapshot_do_not_conflict() -> TestResult {
        let (_tmp, mut a, tm) = setup().await?;

        let (base, first) = start(&mut a).await?;
        tm.commit(&mut a, &base, &first, &metadata_touching("fg"), &[]).await?;

        let (base, second) = start(&mut a).await?;
        tm.commit(&mut a, &base, &second, &metadata_touching("fg"), &[]).await?;
        Ok(())
    }

    #[tokio::test]
    async fn lock_timeout_is_reported() -> TestResult {
        let (_tmp, mut a, _) = setup().await?;
        let location = a.store().location().clone();
        let tm = TransactionManager::from_config(
            &location,
            &WriteConfig::default().with_lock_acquire_timeout(Duration::from_millis(20)),
        );

        let (base, inflight) = start(&mut a).await?;
        let held = tm.acquire().await?;
        let err = tm
            .commit(&mut a, &base, &inflight, &metadata_touching("fg"), &[])
            .await
            .expect_err("lock is held");
        assert!(matches!(err, ConcurrencyError::LockAcquisitionTimeout { .. }));
        drop(held);

        tm.commit(&mut a, &base, &inflight, &metadata_touching("fg"), &[]).await?;
        Ok(())
    }
}

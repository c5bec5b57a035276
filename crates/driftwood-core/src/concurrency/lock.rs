//! Table-scoped locks.
//!
//! A [`LockProvider`] hands out at most one [`LockToken`] per table at a time.
//! The token releases the lock when dropped, so every exit path of the
//! holder (early return, `?`, panic, task cancellation) gives the lock back.
//! [`LockProvider::release`] does the same explicitly and reports failures.
//!
//! Two providers ship:
//!
//! - [`InProcessLockProvider`]: a process-wide registry of async mutexes keyed
//!   by table root, for writers sharing one process.
//! - [`FileSystemLockProvider`]: a lock file created with create-new
//!   semantics under `.driftwood/locks/`, for writers in separate processes on
//!   one filesystem. A lock file older than the configured expiry is treated
//!   as left behind by a dead process and broken, so the expiry must exceed
//!   the longest time a writer holds the lock.
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::concurrency::{
    ConcurrencyError, LockAcquisitionTimeoutSnafu, LockFileEncodeSnafu, LockStorageSnafu,
};
use crate::storage::{self, TableLocation, layout};

/// Exclusive, table-scoped lock.
#[async_trait::async_trait]
pub trait LockProvider: Send + Sync + fmt::Debug {
    /// Short provider name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Wait for the lock, up to the provider's timeout.
    async fn acquire(&self) -> Result<LockToken, ConcurrencyError>;

    /// Give the lock back.
    async fn release(&self, token: LockToken) -> Result<(), ConcurrencyError> {
        drop(token);
        Ok(())
    }
}

/// Proof of holding a table lock. Dropping it releases the lock.
pub struct LockToken {
    holder: String,
    acquired_at: std::time::Instant,
    guard: Box<dyn Any + Send + Sync>,
}

impl LockToken {
    fn new(holder: String, guard: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            holder,
            acquired_at: std::time::Instant::now(),
            guard,
        }
    }

    /// Unique id of this acquisition.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// How long the lock has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("holder", &self.holder)
            .field("held_for", &self.held_for())
            .finish_non_exhaustive()
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        debug!("table lock released (holder={}, held_for={:?})", self.holder, self.held_for());
    }
}

type TableMutex = Arc<tokio::sync::Mutex<()>>;

static IN_PROCESS_LOCKS: LazyLock<Mutex<HashMap<PathBuf, TableMutex>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Lock shared by every writer in this process that targets the same table
/// root.
#[derive(Debug, Clone)]
pub struct InProcessLockProvider {
    root: PathBuf,
    timeout: Duration,
}

impl InProcessLockProvider {
    /// Provider for the table at `location`.
    pub fn new(location: &TableLocation, timeout: Duration) -> Self {
        Self {
            root: location.root().to_path_buf(),
            timeout,
        }
    }

    fn table_mutex(&self) -> TableMutex {
        Arc::clone(
            IN_PROCESS_LOCKS
                .lock()
                .entry(self.root.clone())
                .or_default(),
        )
    }
}

#[async_trait::async_trait]
impl LockProvider for InProcessLockProvider {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn acquire(&self) -> Result<LockToken, ConcurrencyError> {
        let mutex = self.table_mutex();
        match tokio::time::timeout(self.timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                let token = LockToken::new(uuid::Uuid::new_v4().to_string(), Box::new(guard));
                debug!(
                    "table lock acquired (holder={}, root={})",
                    token.holder(),
                    self.root.display(),
                );
                Ok(token)
            }
            Err(_) => {
                warn!(
                    "table lock wait timed out (root={}, timeout={:?})",
                    self.root.display(),
                    self.timeout,
                );
                LockAcquisitionTimeoutSnafu {
                    provider: self.name(),
                    timeout: self.timeout,
                }
                .fail()
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LockFileContents {
    holder: String,
    pid: u32,
    acquired_at: chrono::DateTime<chrono::Utc>,
}

/// Holder named by a lock file body; `None` for a body that does not parse.
fn holder_in(bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<LockFileContents>(bytes)
        .ok()
        .map(|c| c.holder)
}

/// What a waiter or holder saw in the lock file at one point in time.
#[derive(Debug)]
struct LockFileState {
    holder: Option<String>,
    age: Duration,
}

/// Removes the lock file on drop unless released explicitly, and only while
/// the file still names `holder`.
struct FileLockGuard {
    path: PathBuf,
    holder: String,
    armed: bool,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Best effort; an undeletable lock file expires eventually.
        match std::fs::read(&self.path) {
            Ok(bytes) if holder_in(&bytes).as_deref() == Some(self.holder.as_str()) => {
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => warn!(
                "table lock file was taken over, leaving it in place (holder={})",
                self.holder
            ),
            Err(_) => {}
        }
    }
}

/// Lock file under `.driftwood/locks/table.lock`.
///
/// The file body names the acquiring holder. Every removal re-reads the file
/// first and goes ahead only while it still names the expected holder, so a
/// holder whose lock was broken never deletes its successor's file.
#[derive(Debug, Clone)]
pub struct FileSystemLockProvider {
    location: TableLocation,
    timeout: Duration,
    poll_interval: Duration,
    expiry: Duration,
}

impl FileSystemLockProvider {
    /// Provider for the table at `location`.
    pub fn new(
        location: TableLocation,
        timeout: Duration,
        poll_interval: Duration,
        expiry: Duration,
    ) -> Self {
        Self {
            location,
            timeout,
            poll_interval,
            expiry,
        }
    }

    async fn try_create(&self, holder: &str) -> Result<bool, ConcurrencyError> {
        let contents = LockFileContents {
            holder: holder.to_string(),
            pid: std::process::id(),
            acquired_at: chrono::Utc::now(),
        };
        let bytes = serde_json::to_vec(&contents).context(LockFileEncodeSnafu)?;
        let rel = layout::table_lock_rel_path();
        // Published via a synced temp file so readers never see an empty body.
        match storage::write_new_atomic(&self.location, &rel, &bytes).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => Ok(false),
            Err(source) => Err(ConcurrencyError::LockStorage { source }),
        }
    }

    /// Current lock file holder and age, `None` if there is no lock file.
    async fn read_state(&self) -> Result<Option<LockFileState>, ConcurrencyError> {
        let rel = layout::table_lock_rel_path();
        let bytes = match storage::read_all_bytes(&self.location, &rel).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => return Err(ConcurrencyError::LockStorage { source }),
        };
        let age = storage::modified_age(&self.location, &rel)
            .await
            .context(LockStorageSnafu)?;
        Ok(age.map(|age| LockFileState {
            holder: holder_in(&bytes),
            age,
        }))
    }

    /// Remove the lock file if it outlived the expiry. Returns whether it did.
    ///
    /// The file is re-read right before removal; if another waiter broke it
    /// and acquired in the meantime, the fresh file is left alone.
    async fn break_if_stale(&self) -> Result<bool, ConcurrencyError> {
        let Some(seen) = self.read_state().await? else {
            return Ok(false);
        };
        if seen.age <= self.expiry {
            return Ok(false);
        }
        match self.read_state().await? {
            Some(now) if now.holder == seen.holder && now.age > self.expiry => {
                warn!(
                    "breaking stale table lock file (holder={:?}, age={:?}, expiry={:?})",
                    now.holder, now.age, self.expiry
                );
                storage::remove_file_if_exists(&self.location, &layout::table_lock_rel_path())
                    .await
                    .context(LockStorageSnafu)
            }
            _ => Ok(false),
        }
    }

    /// Remove the lock file only while it names `holder`. Returns whether it did.
    async fn remove_if_held_by(&self, holder: &str) -> Result<bool, ConcurrencyError> {
        match self.read_state().await? {
            Some(state) if state.holder.as_deref() == Some(holder) => {
                storage::remove_file_if_exists(&self.location, &layout::table_lock_rel_path())
                    .await
                    .context(LockStorageSnafu)
            }
            Some(state) => {
                warn!(
                    "table lock was broken while held, leaving the new holder's file \
                     (holder={holder}, found={:?})",
                    state.holder
                );
                Ok(false)
            }
            None => {
                warn!("table lock file vanished while held (holder={holder})");
                Ok(false)
            }
        }
    }
}

#[async_trait::async_trait]
impl LockProvider for FileSystemLockProvider {
    fn name(&self) -> &'static str {
        "file-system"
    }

    async fn acquire(&self) -> Result<LockToken, ConcurrencyError> {
        let holder = uuid::Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            if self.try_create(&holder).await? {
                debug!("table lock file created (holder={holder})");
                let guard = FileLockGuard {
                    path: self.location.join(&layout::table_lock_rel_path()),
                    holder: holder.clone(),
                    armed: true,
                };
                return Ok(LockToken::new(holder, Box::new(guard)));
            }
            if self.break_if_stale().await? {
                continue;
            }
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                warn!("table lock file wait timed out (timeout={:?})", self.timeout);
                return LockAcquisitionTimeoutSnafu {
                    provider: self.name(),
                    timeout: self.timeout,
                }
                .fail();
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn release(&self, mut token: LockToken) -> Result<(), ConcurrencyError> {
        if let Some(guard) = token.guard.downcast_mut::<FileLockGuard>() {
            guard.armed = false;
        }
        self.remove_if_held_by(token.holder()).await?;
        Ok(())
    }
}

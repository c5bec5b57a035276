//! Filesystem access for a table root.
//!
//! Every byte the engine persists goes through this module: instant state
//! files under `.driftwood/timeline/`, the table properties file, lock files
//! and the JSON-lines data files inside partitions. Higher layers work with
//! table-relative paths (see [`layout`]) and the helpers here resolve them
//! against a [`TableLocation`].
//!
//! Three write flavours are offered:
//!
//! - [`write_atomic`]: temp file + fsync + rename, replacing any existing file.
//! - [`write_new`]: create-only, fails with [`StorageError::AlreadyExists`].
//! - [`write_new_atomic`]: temp file + fsync + hard link into place. The link
//!   fails if the target exists, so the target is created exactly once and is
//!   never observed half-written. Instant state files use this.
//!
//! Only the local filesystem is supported; [`TableLocation`] keeps the door
//! open for other backends.

pub mod layout;

use snafu::{Backtrace, prelude::*};
use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Location of a table root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TableLocation {
    /// A table stored on the local filesystem at the given path.
    Local(PathBuf),
}

impl TableLocation {
    /// Creates a new `TableLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        TableLocation::Local(root.into())
    }

    /// Root directory of the table.
    pub fn root(&self) -> &Path {
        match self {
            TableLocation::Local(root) => root,
        }
    }

    /// Resolve a table-relative path.
    pub fn join(&self, rel: &Path) -> PathBuf {
        match self {
            TableLocation::Local(root) => root.join(rel),
        }
    }
}

impl fmt::Display for TableLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableLocation::Local(root) => write!(f, "{}", root.display()),
        }
    }
}

/// Errors produced by the storage backend implementation.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The specified path already exists when creation was requested with
    /// create-new semantics.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// Underlying backend error that indicates the existing resource.
        source: BackendError,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// An I/O error occurred on the local filesystem.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend I/O error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A durability write did not finish within its time box.
    #[snafu(display("Write to {path} did not complete within {timeout:?}"))]
    TimedOut {
        /// The path being written.
        path: String,
        /// The configured time box.
        timeout: Duration,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Whether this error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    /// Whether this error means a create-only write lost to an existing file.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists { .. })
    }
}

fn classify(path: &Path, e: io::Error) -> StorageError {
    let path = path.display().to_string();
    let backtrace = Backtrace::capture();
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound {
            path,
            source: BackendError::Local(e),
            backtrace,
        },
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path,
            source: BackendError::Local(e),
            backtrace,
        },
        _ => StorageError::OtherIo {
            path,
            source: BackendError::Local(e),
            backtrace,
        },
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Used to ensure cleanup on error paths during atomic writes.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we're likely already handling another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn tmp_path_for(abs: &Path) -> PathBuf {
    let mut name = abs
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    abs.with_file_name(name)
}

async fn write_synced(path: &Path, contents: &[u8]) -> StorageResult<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| classify(path, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| classify(path, e))?;
    file.sync_all().await.map_err(|e| classify(path, e))?;
    Ok(())
}

/// Create the directory `rel_path` (and parents) under `location`.
pub async fn create_dir_all(location: &TableLocation, rel_path: &Path) -> StorageResult<()> {
    let abs = location.join(rel_path);
    fs::create_dir_all(&abs)
        .await
        .map_err(|e| classify(&abs, e))
}

/// Write `contents` to `rel_path` inside `location`, replacing any existing
/// file via write-then-rename.
pub async fn write_atomic(
    location: &TableLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = tmp_path_for(&abs);
    let mut guard = TempFileGuard::new(tmp_path.clone());

    write_synced(&tmp_path, contents).await?;

    fs::rename(&tmp_path, &abs)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: abs.display().to_string(),
        })?;

    guard.disarm();
    Ok(())
}

/// Create a *new* file at `rel_path` and write `contents`, failing if the file
/// already exists.
pub async fn write_new(
    location: &TableLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs)
        .await
        .map_err(|e| classify(&abs, e))?;

    file.write_all(contents)
        .await
        .map_err(|e| classify(&abs, e))?;
    file.sync_all().await.map_err(|e| classify(&abs, e))?;
    Ok(())
}

/// Publish `contents` at `rel_path` exactly once.
///
/// The payload is written and synced to a temporary sibling, then hard-linked
/// to the target name. Linking fails with [`StorageError::AlreadyExists`] when
/// the target is present, so concurrent publishers cannot overwrite each other
/// and readers never see a partially written target.
pub async fn write_new_atomic(
    location: &TableLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = tmp_path_for(&abs);
    let _guard = TempFileGuard::new(tmp_path.clone());

    write_synced(&tmp_path, contents).await?;

    fs::hard_link(&tmp_path, &abs)
        .await
        .map_err(|e| classify(&abs, e))?;

    // The guard unlinks the temp name; the target keeps the inode alive.
    Ok(())
}

/// Run a durability write under a time box.
pub async fn with_write_timeout<T, F>(
    rel_path: &Path,
    timeout: Duration,
    fut: F,
) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => TimedOutSnafu {
            path: rel_path.display().to_string(),
            timeout,
        }
        .fail(),
    }
}

/// Read the file at `rel_path` within `location` as UTF-8.
pub async fn read_to_string(location: &TableLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = location.join(rel_path);
    fs::read_to_string(&abs)
        .await
        .map_err(|e| classify(&abs, e))
}

/// Read the full contents of the file at `rel_path` within `location`.
pub async fn read_all_bytes(location: &TableLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = location.join(rel_path);
    fs::read(&abs).await.map_err(|e| classify(&abs, e))
}

/// Read a file outside any table root (for example a writer config file).
pub async fn read_local_file(path: &Path) -> StorageResult<Vec<u8>> {
    fs::read(path).await.map_err(|e| classify(path, e))
}

/// Whether `rel_path` exists under `location`.
pub async fn exists(location: &TableLocation, rel_path: &Path) -> StorageResult<bool> {
    let abs = location.join(rel_path);
    fs::try_exists(&abs).await.map_err(|e| classify(&abs, e))
}

/// Time since `rel_path` was last modified, `None` if it does not exist.
pub async fn modified_age(
    location: &TableLocation,
    rel_path: &Path,
) -> StorageResult<Option<Duration>> {
    let abs = location.join(rel_path);
    let meta = match fs::metadata(&abs).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(classify(&abs, e)),
    };
    let modified = meta.modified().map_err(|e| classify(&abs, e))?;
    // A clock step backwards reads as a fresh file.
    Ok(Some(modified.elapsed().unwrap_or(Duration::ZERO)))
}

/// One entry returned by [`list_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File or directory name (not a path).
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// List the immediate children of `rel_path`, sorted by name.
///
/// A missing directory yields [`StorageError::NotFound`].
pub async fn list_dir(location: &TableLocation, rel_path: &Path) -> StorageResult<Vec<DirEntry>> {
    let abs = location.join(rel_path);
    let mut rd = fs::read_dir(&abs).await.map_err(|e| classify(&abs, e))?;
    let mut entries = Vec::new();
    while let Some(entry) = rd.next_entry().await.map_err(|e| classify(&abs, e))? {
        let file_type = entry.file_type().await.map_err(|e| classify(&abs, e))?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: file_type.is_dir(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Recursively list files under `rel_path`, skipping directories whose name is
/// in `skip_dirs`. Returned paths are relative to the table root and use `/`.
pub async fn list_files_recursive(
    location: &TableLocation,
    rel_path: &Path,
    skip_dirs: &[&str],
) -> StorageResult<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = vec![rel_path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in list_dir(location, &dir).await? {
            let child = dir.join(&entry.name);
            if entry.is_dir {
                if !skip_dirs.contains(&entry.name.as_str()) {
                    stack.push(child);
                }
            } else {
                out.push(child.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Remove `rel_path`; returns `false` when it did not exist.
pub async fn remove_file_if_exists(
    location: &TableLocation,
    rel_path: &Path,
) -> StorageResult<bool> {
    let abs = location.join(rel_path);
    match fs::remove_file(&abs).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(classify(&abs, e)),
    }
}

/// Rename `from` to `to` (both table-relative), creating the target directory.
pub async fn rename(location: &TableLocation, from: &Path, to: &Path) -> StorageResult<()> {
    let src = location.join(from);
    let dst = location.join(to);
    create_parent_dir(&dst).await?;
    fs::rename(&src, &dst)
        .await
        .map_err(|e| classify(&src, e))
}

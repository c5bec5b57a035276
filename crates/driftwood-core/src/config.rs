//! Table properties and writer configuration.
//!
//! Two kinds of settings exist:
//!
//! - [`TableProperties`] are fixed when a table is created and persisted as
//!   JSON at `.driftwood/table.json`. Every writer of the table reads the same
//!   values (most importantly the [`TableType`]).
//! - [`WriteConfig`] is per writer process. It controls locking, time boxes and
//!   the table services the writer runs. It can be built in code with the
//!   `with_*` setters or loaded from a JSON file; missing fields take their
//!   defaults.
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::checkpoint::STREAMING_CHECKPOINT_KEY;
use crate::storage::{self, StorageError, TableLocation, layout};

/// Current `table.json` format version.
pub const TABLE_FORMAT_VERSION: u32 = 1;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// A configuration file could not be read or written.
    #[snafu(display("Storage error while accessing configuration: {source}"))]
    ConfigStorage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A configuration file is not valid JSON for the expected type.
    #[snafu(display("Failed to parse configuration at {path}: {source}"))]
    Parse {
        /// Path of the offending file.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A value is out of range.
    #[snafu(display("Invalid configuration: {msg}"))]
    Invalid {
        /// What is wrong.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The table was created by a newer, incompatible format version.
    #[snafu(display(
        "Unsupported table format version {found} (supported: {TABLE_FORMAT_VERSION})"
    ))]
    UnsupportedFormatVersion {
        /// Version recorded in `table.json`.
        found: u32,
    },
}

impl ConfigError {
    /// Whether `table.json` is missing: the table is not initialized yet.
    pub fn is_table_not_initialized(&self) -> bool {
        matches!(self, ConfigError::ConfigStorage { source } if source.is_not_found())
    }
}

/// Storage layout of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    /// Every write produces new base files; ingestion uses `commit` instants.
    CopyOnWrite,
    /// Updates append log files that compaction later folds into base files;
    /// ingestion uses `deltacommit` instants.
    MergeOnRead,
}

/// Properties fixed at table creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    /// Human-readable table name.
    pub name: String,
    /// Storage layout.
    pub table_type: TableType,
    /// On-disk format version.
    pub format_version: u32,
    /// Creation timestamp (RFC3339, UTC).
    pub created_at: DateTime<Utc>,
}

impl TableProperties {
    /// Properties for a new table created now.
    pub fn new(name: impl Into<String>, table_type: TableType) -> Self {
        Self {
            name: name.into(),
            table_type,
            format_version: TABLE_FORMAT_VERSION,
            created_at: Utc::now(),
        }
    }

    /// Read `.driftwood/table.json`.
    pub async fn load(location: &TableLocation) -> Result<Self, ConfigError> {
        let rel = layout::table_properties_rel_path();
        let text = storage::read_to_string(location, &rel)
            .await
            .context(ConfigStorageSnafu)?;
        let props: TableProperties = serde_json::from_str(&text).context(ParseSnafu {
            path: rel.display().to_string(),
        })?;
        ensure!(
            props.format_version <= TABLE_FORMAT_VERSION,
            UnsupportedFormatVersionSnafu {
                found: props.format_version,
            }
        );
        Ok(props)
    }

    /// Write `.driftwood/table.json`; fails if it already exists.
    pub async fn create(&self, location: &TableLocation) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(self).context(ParseSnafu {
            path: layout::TABLE_PROPERTIES_FILE_NAME,
        })?;
        storage::write_new(location, &layout::table_properties_rel_path(), &json)
            .await
            .context(ConfigStorageSnafu)
    }
}

/// Which [`crate::concurrency::LockProvider`] a writer uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockProviderKind {
    /// Writers sharing one process.
    #[default]
    InProcess,
    /// Writers in different processes on one filesystem.
    FileSystem,
}

/// Whether a table service runs before `commit` returns or on its own task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableServiceMode {
    /// Run right after each successful ingestion commit.
    #[default]
    Inline,
    /// Run on a background task (see [`crate::table_services::spawn_async_table_services`]).
    Async,
}

/// Compaction settings (merge-on-read tables only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Master switch.
    pub enabled: bool,
    /// Inline or async.
    pub mode: TableServiceMode,
    /// Schedule a compaction after this many delta commits since the last one.
    pub max_delta_commits: usize,
    /// Async polling interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: TableServiceMode::Inline,
            max_delta_commits: 5,
            poll_interval_ms: 1_000,
        }
    }
}

impl CompactionConfig {
    /// Async polling interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Clustering settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Master switch.
    pub enabled: bool,
    /// Inline or async.
    pub mode: TableServiceMode,
    /// Schedule clustering after this many ingestion commits since the last
    /// replace.
    pub max_commits: usize,
    /// Upper bound on records per output file group.
    pub max_records_per_group: usize,
    /// Async polling interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: TableServiceMode::Inline,
            max_commits: 4,
            max_records_per_group: 100_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl ClusteringConfig {
    /// Async polling interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Timeline archival settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchivalConfig {
    /// Archive after each ingestion commit.
    pub enabled: bool,
    /// Completed instants left on the active timeline after archiving.
    pub min_instants_to_keep: usize,
    /// Archive once more than this many completed instants are active.
    pub max_instants_to_keep: usize,
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_instants_to_keep: 20,
            max_instants_to_keep: 30,
        }
    }
}

/// Per-writer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Lock provider used for commit finalization.
    pub lock_provider: LockProviderKind,
    /// How long to wait for the table lock, in milliseconds.
    pub lock_acquire_timeout_ms: u64,
    /// Retry interval of polling lock providers, in milliseconds.
    pub lock_poll_interval_ms: u64,
    /// Age after which a file lock left by a dead process is broken, in
    /// milliseconds.
    pub lock_expiry_ms: u64,
    /// Time box for each instant-file write, in milliseconds.
    pub write_timeout_ms: u64,
    /// Commit metadata key that holds streaming checkpoints.
    pub checkpoint_key: String,
    /// Compaction service.
    pub compaction: CompactionConfig,
    /// Clustering service.
    pub clustering: ClusteringConfig,
    /// Timeline archival.
    pub archival: ArchivalConfig,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            lock_provider: LockProviderKind::InProcess,
            lock_acquire_timeout_ms: 60_000,
            lock_poll_interval_ms: 50,
            lock_expiry_ms: 300_000,
            write_timeout_ms: 30_000,
            checkpoint_key: STREAMING_CHECKPOINT_KEY.to_string(),
            compaction: CompactionConfig::default(),
            clustering: ClusteringConfig::default(),
            archival: ArchivalConfig::default(),
        }
    }
}

impl WriteConfig {
    /// Load a JSON config file. Fields not present keep their defaults.
    pub async fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = storage::read_local_file(path)
            .await
            .context(ConfigStorageSnafu)?;
        let config: WriteConfig = serde_json::from_slice(&bytes).context(ParseSnafu {
            path: path.display().to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.compaction.max_delta_commits > 0,
            InvalidSnafu {
                msg: "compaction.max_delta_commits must be at least 1",
            }
        );
        ensure!(
            self.clustering.max_commits > 0,
            InvalidSnafu {
                msg: "clustering.max_commits must be at least 1",
            }
        );
        ensure!(
            self.clustering.max_records_per_group > 0,
            InvalidSnafu {
                msg: "clustering.max_records_per_group must be at least 1",
            }
        );
        ensure!(
            self.archival.min_instants_to_keep <= self.archival.max_instants_to_keep,
            InvalidSnafu {
                msg: "archival.min_instants_to_keep must not exceed max_instants_to_keep",
            }
        );
        ensure!(
            !self.checkpoint_key.is_empty(),
            InvalidSnafu {
                msg: "checkpoint_key must not be empty",
            }
        );
        Ok(())
    }

    /// Lock wait.
    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    /// Lock polling interval.
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Stale file-lock age.
    pub fn lock_expiry(&self) -> Duration {
        Duration::from_millis(self.lock_expiry_ms)
    }

    /// Instant-file write time box.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Set the lock provider.
    pub fn with_lock_provider(mut self, kind: LockProviderKind) -> Self {
        self.lock_provider = kind;
        self
    }

    /// Set the lock wait.
    pub fn with_lock_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquire_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the instant-file write time box.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the checkpoint metadata key.
    pub fn with_checkpoint_key(mut self, key: impl Into<String>) -> Self {
        self.checkpoint_key = key.into();
        self
    }

    /// Enable compaction after `max_delta_commits` delta commits.
    pub fn with_compaction(mut self, mode: TableServiceMode, max_delta_commits: usize) -> Self {
        self.compaction.enabled = true;
        self.compaction.mode = mode;
        self.compaction.max_delta_commits = max_delta_commits;
        self
    }

    /// Enable clustering after `max_commits` ingestion commits.
    pub fn with_clustering(mut self, mode: TableServiceMode, max_commits: usize) -> Self {
        self.clustering.enabled = true;
        self.clustering.mode = mode;
        self.clustering.max_commits = max_commits;
        self
    }

    /// Set the clustering output size.
    pub fn with_max_records_per_group(mut self, max: usize) -> Self {
        self.clustering.max_records_per_group = max;
        self
    }

    /// Enable archival with the given bounds.
    pub fn with_archival(mut self, min_to_keep: usize, max_to_keep: usize) -> Self {
        self.archival.enabled = true;
        self.archival.min_instants_to_keep = min_to_keep;
        self.archival.max_instants_to_keep = max_to_keep;
        self
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn partial_json_keeps_defaults() -> TestResult {
        let config: WriteConfig =
            serde_json::from_str(r#"{"compaction": {"enabled": true, "max_delta_commits": 1}}"#)?;
        assert!(config.compaction.enabled);
        assert_eq!(config.compaction.max_delta_commits, 1);
        assert_eq!(config.compaction.mode, TableServiceMode::Inline);
        assert_eq!(config.lock_provider, LockProviderKind::InProcess);
        assert_eq!(config.checkpoint_key, STREAMING_CHECKPOINT_KEY);
        Ok(())
    }

    #[test]
    fn validate_rejects_zero_thresholds() {
        let mut config = WriteConfig::default().with_clustering(TableServiceMode::Inline, 0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        config = WriteConfig::default().with_archival(10, 5);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn builders_set_durations() {
        let config = WriteConfig::default()
            .with_lock_acquire_timeout(Duration::from_millis(250))
            .with_write_timeout(Duration::from_secs(2));
        assert_eq!(config.lock_acquire_timeout(), Duration::from_millis(250));
        assert_eq!(config.write_timeout(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn write_config_loads_from_file() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("writer.json");
        let body = br#"{"lock_provider": "file_system", "archival": {"enabled": true}}"#;
        tokio::fs::write(&path, body).await?;

        let config = WriteConfig::from_json_file(&path).await?;
        assert_eq!(config.lock_provider, LockProviderKind::FileSystem);
        assert!(config.archival.enabled);
        assert_eq!(config.archival.min_instants_to_keep, 20);
        Ok(())
    }

    #[tokio::test]
    async fn table_properties_are_create_once() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        storage::create_dir_all(&location, &layout::meta_rel_dir()).await?;

        let props = TableProperties::new("trips", TableType::MergeOnRead);
        props.create(&location).await?;
        assert_eq!(TableProperties::load(&location).await?, props);

        let err = props.create(&location).await.expect_err("second create");
        assert!(matches!(
            err,
            ConfigError::ConfigStorage { ref source } if source.is_already_exists()
        ));
        Ok(())
    }

    #[tokio::test]
    async fn newer_format_versions_are_rejected() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let mut props = TableProperties::new("t", TableType::CopyOnWrite);
        props.format_version = TABLE_FORMAT_VERSION + 1;
        storage::write_atomic(
            &location,
            &layout::table_properties_rel_path(),
            &serde_json::to_vec(&props)?,
        )
        .await?;

        let err = TableProperties::load(&location).await.expect_err("too new");
        assert!(matches!(err, ConfigError::UnsupportedFormatVersion { .. }));
        Ok(())
    }
}

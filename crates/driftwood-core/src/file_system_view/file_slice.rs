//! File groups, file slices and the data files they are made of.
//!
//! Data file names carry everything needed to place a file:
//!
//! ```text
//! <file_id>_<instant>.base.jsonl                       base file
//! <file_id>_<base_instant>_<delta_instant>.log.jsonl   merge-on-read log file
//! ```
//!
//! A log file belongs to the slice whose base instant it names. A file group
//! created by a merge-on-read write starts as a log-only slice whose base
//! instant is the instant of its first log file.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::layout;
use crate::timeline::InstantTime;

/// Identity of a file group: partition plus opaque file id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileGroupId {
    /// Partition path (empty for the table root).
    pub partition: String,
    /// Opaque file id, unique within the partition.
    pub file_id: String,
}

impl FileGroupId {
    /// Build an id.
    pub fn new(partition: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            file_id: file_id.into(),
        }
    }

    /// Fresh file group in `partition`.
    pub fn generate(partition: impl Into<String>) -> Self {
        Self::new(partition, uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for FileGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.partition.is_empty() {
            f.write_str(&self.file_id)
        } else {
            write!(f, "{}/{}", self.partition, self.file_id)
        }
    }
}

/// A base file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseFile {
    /// Table-relative path.
    pub path: String,
    /// Instant that wrote it.
    pub instant: InstantTime,
}

/// A merge-on-read log file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    /// Table-relative path.
    pub path: String,
    /// Base instant of the slice it extends.
    pub base_instant: InstantTime,
    /// Delta commit that wrote it.
    pub delta_instant: InstantTime,
}

/// A data file name decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataFile {
    /// `<file_id>_<instant>.base.jsonl`
    Base {
        /// Owning file group.
        group: FileGroupId,
        /// The file.
        file: BaseFile,
    },
    /// `<file_id>_<base_instant>_<delta_instant>.log.jsonl`
    Log {
        /// Owning file group.
        group: FileGroupId,
        /// The file.
        file: LogFile,
    },
}

impl DataFile {
    /// Decode a table-relative data file path. Returns `None` for names that
    /// do not follow the data file convention.
    pub fn parse(path: &str) -> Option<DataFile> {
        let (partition, name) = layout::split_data_file_path(path);

        if let Some(stem) = name.strip_suffix(&format!(".{}", layout::BASE_FILE_EXT)) {
            let (file_id, instant) = stem.split_once('_')?;
            return Some(DataFile::Base {
                group: FileGroupId::new(partition, file_id),
                file: BaseFile {
                    path: path.to_string(),
                    instant: InstantTime::parse(instant)?,
                },
            });
        }

        let stem = name.strip_suffix(&format!(".{}", layout::LOG_FILE_EXT))?;
        let mut parts = stem.split('_');
        let file_id = parts.next()?;
        let base_instant = InstantTime::parse(parts.next()?)?;
        let delta_instant = InstantTime::parse(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(DataFile::Log {
            group: FileGroupId::new(partition, file_id),
            file: LogFile {
                path: path.to_string(),
                base_instant,
                delta_instant,
            },
        })
    }

    /// Owning file group.
    pub fn group(&self) -> &FileGroupId {
        match self {
            DataFile::Base { group, .. } | DataFile::Log { group, .. } => group,
        }
    }
}

/// One version of a file group: an optional base file plus the log files
/// written against it, oldest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSlice {
    /// Owning file group.
    pub group: FileGroupId,
    /// Instant the slice is keyed by.
    pub base_instant: InstantTime,
    /// Base file, absent for log-only slices.
    pub base_file: Option<BaseFile>,
    /// Log files ordered by delta instant.
    pub log_files: Vec<LogFile>,
}

impl FileSlice {
    /// Empty slice.
    pub fn new(group: FileGroupId, base_instant: InstantTime) -> Self {
        Self {
            group,
            base_instant,
            base_file: None,
            log_files: Vec::new(),
        }
    }

    /// File id of the owning group.
    pub fn file_id(&self) -> &str {
        &self.group.file_id
    }

    /// Partition of the owning group.
    pub fn partition(&self) -> &str {
        &self.group.partition
    }

    /// Whether merge-on-read log files are pending compaction in this slice.
    pub fn has_log_files(&self) -> bool {
        !self.log_files.is_empty()
    }

    /// Instant of the newest file in the slice.
    pub fn latest_instant(&self) -> &InstantTime {
        self.log_files
            .last()
            .map(|l| &l.delta_instant)
            .unwrap_or(&self.base_instant)
    }

    /// Every file path, base first then logs.
    pub fn file_paths(&self) -> Vec<String> {
        self.base_file
            .iter()
            .map(|b| b.path.clone())
            .chain(self.log_files.iter().map(|l| l.path.clone()))
            .collect()
    }

    pub(crate) fn add_log_file(&mut self, log: LogFile) {
        let pos = self
            .log_files
            .partition_point(|l| l.delta_instant < log.delta_instant);
        if self.log_files.get(pos) != Some(&log) {
            self.log_files.insert(pos, log);
        }
    }
}

/// A file group and its slices, keyed by base instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileGroup {
    id: FileGroupId,
    slices: BTreeMap<InstantTime, FileSlice>,
}

impl FileGroup {
    /// Group without slices.
    pub fn new(id: FileGroupId) -> Self {
        Self {
            id,
            slices: BTreeMap::new(),
        }
    }

    /// Identity.
    pub fn id(&self) -> &FileGroupId {
        &self.id
    }

    /// Slices ordered by base instant.
    pub fn slices(&self) -> impl Iterator<Item = &FileSlice> {
        self.slices.values()
    }

    /// The slice with the greatest base instant.
    pub fn latest_slice(&self) -> Option<&FileSlice> {
        self.slices.values().next_back()
    }

    pub(crate) fn slice_mut(&mut self, base_instant: &InstantTime) -> &mut FileSlice {
        self.slices
            .entry(base_instant.clone())
            .or_insert_with(|| FileSlice::new(self.id.clone(), base_instant.clone()))
    }

    pub(crate) fn add_data_file(&mut self, file: DataFile) {
        match file {
            DataFile::Base { file, .. } => {
                let instant = file.instant.clone();
                self.slice_mut(&instant).base_file = Some(file);
            }
            DataFile::Log { file, .. } => {
                let base_instant = file.base_instant.clone();
                self.slice_mut(&base_instant).add_log_file(file);
            }
        }
    }
}

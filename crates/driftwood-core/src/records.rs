//! Records and JSON-lines data files.
//!
//! The engine treats record payloads as opaque JSON. A record only needs a
//! key (for upserts and merging) and a partition (for file placement). Data
//! files hold one JSON-encoded [`Record`] per line and are written once, never
//! appended to.
use std::collections::BTreeMap;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::file_system_view::{DataFile, FileSlice};
use crate::storage::{self, StorageError, TableLocation, layout};
use crate::timeline::InstantTime;

/// Errors raised while reading or writing data files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RecordError {
    /// Underlying storage error.
    #[snafu(display("Storage error while accessing data file: {source}"))]
    DataFileStorage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A line of a data file is not a valid record.
    #[snafu(display("Malformed record at {path}:{line}: {source}"))]
    MalformedRecord {
        /// File (or input) being parsed.
        path: String,
        /// 1-based line number.
        line: usize,
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Serializing a record failed.
    #[snafu(display("Failed to encode record {key}: {source}"))]
    EncodeRecord {
        /// Record key.
        key: String,
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// One keyed, partitioned record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record key, unique within the table.
    pub key: String,
    /// Partition path.
    #[serde(default)]
    pub partition: String,
    /// Opaque payload.
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Record {
    /// Build a record.
    pub fn new(
        key: impl Into<String>,
        partition: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            key: key.into(),
            partition: partition.into(),
            value,
        }
    }
}

/// A batch handed over by a writer.
pub type RecordBatch = Vec<Record>;

/// Parse JSON-lines text into records. Blank lines are skipped.
pub fn parse_records(source: &str, text: &str) -> Result<Vec<Record>, RecordError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).context(MalformedRecordSnafu {
                path: source,
                line: idx + 1,
            })
        })
        .collect()
}

/// Encode records as JSON lines.
pub fn encode_records(records: &[Record]) -> Result<Vec<u8>, RecordError> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record).context(EncodeRecordSnafu {
            key: record.key.clone(),
        })?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Write a new data file. Returns its size in bytes.
pub async fn write_data_file(
    location: &TableLocation,
    rel_path: &str,
    records: &[Record],
) -> Result<u64, RecordError> {
    let bytes = encode_records(records)?;
    storage::write_new(location, Path::new(rel_path), &bytes)
        .await
        .context(DataFileStorageSnafu)?;
    Ok(bytes.len() as u64)
}

/// Read every record of one data file.
pub async fn read_data_file(
    location: &TableLocation,
    rel_path: &str,
) -> Result<Vec<Record>, RecordError> {
    let text = storage::read_to_string(location, Path::new(rel_path))
        .await
        .context(DataFileStorageSnafu)?;
    parse_records(rel_path, &text)
}

/// Merge records by key; later records replace earlier ones. The result is
/// ordered by key.
pub fn merge_records<I>(records: I) -> Vec<Record>
where
    I: IntoIterator<Item = Record>,
{
    let mut by_key: BTreeMap<String, Record> = BTreeMap::new();
    for record in records {
        by_key.insert(record.key.clone(), record);
    }
    by_key.into_values().collect()
}

/// Current records of a file slice: the base file merged with its log files
/// in delta-instant order.
pub async fn read_file_slice(
    location: &TableLocation,
    slice: &FileSlice,
) -> Result<Vec<Record>, RecordError> {
    let mut all = Vec::new();
    for path in slice.file_paths() {
        all.extend(read_data_file(location, &path).await?);
    }
    Ok(merge_records(all))
}

/// Split a batch by partition, keeping the last record per key.
pub fn group_by_partition(records: RecordBatch) -> BTreeMap<String, Vec<Record>> {
    let mut out: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for record in merge_records(records) {
        out.entry(record.partition.clone()).or_default().push(record);
    }
    out
}

/// Delete every data file written at `instant`: base files created by it and
/// log files it appended. Returns the removed paths.
///
/// Used to roll back aborted instants and to clear the leftovers of an
/// interrupted table service run before it is executed again. Files of
/// completed instants never carry the timestamp of a pending one, so nothing
/// visible is touched.
pub async fn delete_files_written_by(
    location: &TableLocation,
    instant: &InstantTime,
) -> Result<Vec<String>, RecordError> {
    let files = storage::list_files_recursive(location, Path::new(""), &[layout::META_DIR_NAME])
        .await
        .context(DataFileStorageSnafu)?;

    let mut removed = Vec::new();
    for path in files {
        let written_here = match DataFile::parse(&path) {
            Some(DataFile::Base { file, .. }) => &file.instant == instant,
            Some(DataFile::Log { file, .. }) => &file.delta_instant == instant,
            None => false,
        };
        if written_here
            && storage::remove_file_if_exists(location, Path::new(&path))
                .await
                .context(DataFileStorageSnafu)?
        {
            debug!("removed data file (instant={instant}, path={path})");
            removed.push(path);
        }
    }
    Ok(removed)
}

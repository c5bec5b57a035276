//! On-disk layout helpers for a table root.
//!
//! This module centralizes all *relative* path conventions under a table root:
//! - the metadata directory (`.driftwood/`) and table properties file
//! - the active and archived timeline directories
//! - the file-lock location
//! - data file naming inside partitions
//!
//! The functions here return relative [`std::path::PathBuf`] values. Callers
//! join them with a [`crate::storage::TableLocation`] before doing IO.

use std::path::{Path, PathBuf};

/// Directory holding every piece of table metadata.
pub const META_DIR_NAME: &str = ".driftwood";

/// Name of the JSON file holding [`crate::config::TableProperties`].
pub const TABLE_PROPERTIES_FILE_NAME: &str = "table.json";

/// Directory of the active timeline, relative to the metadata directory.
pub const TIMELINE_DIR_NAME: &str = "timeline";

/// Directory of archived instant files, relative to the metadata directory.
pub const ARCHIVED_DIR_NAME: &str = "archived";

/// Directory of lock files, relative to the metadata directory.
pub const LOCKS_DIR_NAME: &str = "locks";

/// Extension of base files.
pub const BASE_FILE_EXT: &str = "base.jsonl";

/// Extension of merge-on-read log files.
pub const LOG_FILE_EXT: &str = "log.jsonl";

/// Relative path: `.driftwood/`
pub fn meta_rel_dir() -> PathBuf {
    PathBuf::from(META_DIR_NAME)
}

/// Relative path: `.driftwood/table.json`
pub fn table_properties_rel_path() -> PathBuf {
    meta_rel_dir().join(TABLE_PROPERTIES_FILE_NAME)
}

/// Relative path: `.driftwood/timeline/`
pub fn timeline_rel_dir() -> PathBuf {
    meta_rel_dir().join(TIMELINE_DIR_NAME)
}

/// Relative path: `.driftwood/archived/`
pub fn archived_rel_dir() -> PathBuf {
    meta_rel_dir().join(ARCHIVED_DIR_NAME)
}

/// Relative path: `.driftwood/locks/table.lock`
pub fn table_lock_rel_path() -> PathBuf {
    meta_rel_dir().join(LOCKS_DIR_NAME).join("table.lock")
}

/// File name of a base file: `<file_id>_<instant>.base.jsonl`.
pub fn base_file_name(file_id: &str, instant: &str) -> String {
    format!("{file_id}_{instant}.{BASE_FILE_EXT}")
}

/// File name of a log file:
/// `<file_id>_<base_instant>_<delta_instant>.log.jsonl`.
pub fn log_file_name(file_id: &str, base_instant: &str, delta_instant: &str) -> String {
    format!("{file_id}_{base_instant}_{delta_instant}.{LOG_FILE_EXT}")
}

/// Table-relative path of a data file inside `partition`, `/`-separated as
/// recorded in write statistics.
pub fn data_file_rel_path(partition: &str, file_name: &str) -> String {
    if partition.is_empty() {
        file_name.to_string()
    } else {
        format!("{partition}/{file_name}")
    }
}

/// Split a table-relative data file path into `(partition, file_name)`.
pub fn split_data_file_path(rel: &str) -> (String, String) {
    match rel.rsplit_once('/') {
        Some((partition, name)) => (partition.to_string(), name.to_string()),
        None => (String::new(), rel.to_string()),
    }
}

/// Whether a relative path points into the metadata directory.
pub fn is_meta_path(rel: &Path) -> bool {
    rel.components()
        .next()
        .is_some_and(|c| c.as_os_str() == META_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_file_names_follow_convention() {
        assert_eq!(
            base_file_name("fg-1", "20250101000000000"),
            "fg-1_20250101000000000.base.jsonl"
        );
        assert_eq!(
            log_file_name("fg-1", "20250101000000000", "20250101000000999"),
            "fg-1_20250101000000000_20250101000000999.log.jsonl"
        );
    }

    #[test]
    fn split_data_file_path_handles_nested_and_root_partitions() {
        assert_eq!(
            split_data_file_path("2025/01/01/a.base.jsonl"),
            ("2025/01/01".to_string(), "a.base.jsonl".to_string())
        );
        assert_eq!(
            split_data_file_path("a.base.jsonl"),
            (String::new(), "a.base.jsonl".to_string())
        );
    }

    #[test]
    fn data_file_paths_round_trip_through_split() {
        let path = data_file_rel_path("2025/01", "a.base.jsonl");
        assert_eq!(path, "2025/01/a.base.jsonl");
        assert_eq!(data_file_rel_path("", "a.base.jsonl"), "a.base.jsonl");
        assert_eq!(
            split_data_file_path(&path),
            ("2025/01".to_string(), "a.base.jsonl".to_string())
        );
    }

    #[test]
    fn meta_paths_are_detected() {
        assert!(is_meta_path(&timeline_rel_dir()));
        assert!(!is_meta_path(Path::new("p1/x.base.jsonl")));
    }
}

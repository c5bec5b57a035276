//! Payloads stored inside instant files.
//!
//! - Completed `commit`, `deltacommit`, `compaction` and `replacecommit` files
//!   hold a [`CommitMetadata`].
//! - Requested `compaction` files hold a [`CompactionPlan`].
//! - Requested `replacecommit` files hold a [`ClusteringPlan`].
//! - Requested ingestion instants and every inflight file hold `{}`.
//!
//! All payloads are JSON so the timeline stays inspectable with basic tools.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::file_system_view::FileGroupId;
use crate::timeline::instant::InstantTime;

/// What produced a commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperationType {
    /// Every record goes to a new file group.
    Insert,
    /// Existing keys update their file group, new keys get a new one.
    #[default]
    Upsert,
    /// Compaction of merge-on-read log files.
    Compact,
    /// Clustering (file group reorganization).
    Cluster,
}

/// Statistics for one file written by a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStat {
    /// Opaque file group id.
    pub file_id: String,
    /// Table-relative path of the file written.
    pub path: String,
    /// Base instant of the slice this write extended or replaced, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_base_instant: Option<InstantTime>,
    /// Records in the written file.
    pub num_writes: u64,
    /// Records whose key was new to the file group.
    pub num_inserts: u64,
    /// Records whose key already existed in the file group.
    pub num_updates: u64,
    /// Size of the written file in bytes.
    pub file_size_bytes: u64,
}

/// Metadata attached to a completed instant.
///
/// `extra_metadata` is the writer-controlled extension point; streaming
/// checkpoints live there (see [`crate::checkpoint`]).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetadata {
    /// Operation that produced the commit.
    #[serde(default)]
    pub operation: WriteOperationType,
    /// Files written, grouped by partition.
    #[serde(default)]
    pub partition_to_write_stats: BTreeMap<String, Vec<WriteStat>>,
    /// File groups superseded by this instant (replace commits only).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partition_to_replaced_file_ids: BTreeMap<String, Vec<String>>,
    /// Arbitrary writer-supplied key/value pairs.
    #[serde(default)]
    pub extra_metadata: BTreeMap<String, String>,
}

impl CommitMetadata {
    /// Empty metadata for `operation`.
    pub fn new(operation: WriteOperationType) -> Self {
        Self {
            operation,
            ..Self::default()
        }
    }

    /// Record a written file.
    pub fn add_write_stat(&mut self, partition: &str, stat: WriteStat) {
        self.partition_to_write_stats
            .entry(partition.to_string())
            .or_default()
            .push(stat);
    }

    /// Record file groups replaced by this instant.
    pub fn add_replaced_file_ids<I>(&mut self, partition: &str, file_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.partition_to_replaced_file_ids
            .entry(partition.to_string())
            .or_default()
            .extend(file_ids);
    }

    /// Value stored under `key` in the extension map.
    pub fn get_extra(&self, key: &str) -> Option<&str> {
        self.extra_metadata.get(key).map(String::as_str)
    }

    /// Store `value` under `key` in the extension map.
    pub fn put_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra_metadata.insert(key.into(), value.into());
    }

    /// File groups this instant wrote to.
    pub fn written_file_groups(&self) -> BTreeSet<FileGroupId> {
        self.partition_to_write_stats
            .iter()
            .flat_map(|(partition, stats)| {
                stats
                    .iter()
                    .map(move |s| FileGroupId::new(partition.clone(), s.file_id.clone()))
            })
            .collect()
    }

    /// File groups this instant replaced.
    pub fn replaced_file_groups(&self) -> BTreeSet<FileGroupId> {
        self.partition_to_replaced_file_ids
            .iter()
            .flat_map(|(partition, ids)| {
                ids.iter()
                    .map(move |id| FileGroupId::new(partition.clone(), id.clone()))
            })
            .collect()
    }

    /// Every file group this instant touched (written or replaced).
    pub fn touched_file_groups(&self) -> BTreeSet<FileGroupId> {
        let mut out = self.written_file_groups();
        out.extend(self.replaced_file_groups());
        out
    }

    /// Total records written across all files.
    pub fn total_records_written(&self) -> u64 {
        self.partition_to_write_stats
            .values()
            .flatten()
            .map(|s| s.num_writes)
            .sum()
    }
}

/// One file slice to compact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionOperation {
    /// Partition of the file group.
    pub partition: String,
    /// File group id.
    pub file_id: String,
    /// Base instant of the slice being compacted.
    pub base_instant: InstantTime,
    /// Table-relative base file path, absent for log-only slices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_file: Option<String>,
    /// Table-relative log file paths, oldest first.
    pub log_files: Vec<String>,
}

impl CompactionOperation {
    /// The file group this operation rewrites.
    pub fn file_group_id(&self) -> FileGroupId {
        FileGroupId::new(self.partition.clone(), self.file_id.clone())
    }
}

/// Requested payload of a compaction instant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionPlan {
    /// Slices to compact.
    pub operations: Vec<CompactionOperation>,
}

impl CompactionPlan {
    /// File groups covered by the plan.
    pub fn file_groups(&self) -> BTreeSet<FileGroupId> {
        self.operations.iter().map(|op| op.file_group_id()).collect()
    }
}

/// File groups of one partition rewritten together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringGroup {
    /// Partition of every input file group.
    pub partition: String,
    /// Input file group ids.
    pub file_ids: Vec<String>,
    /// Number of file groups to produce.
    pub num_output_groups: usize,
}

/// Requested payload of a clustering (replace) instant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringPlan {
    /// Groups to rewrite.
    pub input_groups: Vec<ClusteringGroup>,
    /// Upper bound on records per output file group.
    pub max_records_per_group: usize,
}

impl ClusteringPlan {
    /// Input file groups covered by the plan.
    pub fn file_groups(&self) -> BTreeSet<FileGroupId> {
        self.input_groups
            .iter()
            .flat_map(|g| {
                g.file_ids
                    .iter()
                    .map(move |id| FileGroupId::new(g.partition.clone(), id.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(file_id: &str) -> WriteStat {
        WriteStat {
            file_id: file_id.to_string(),
            path: format!("p/{file_id}_20250101000000000.base.jsonl"),
            prev_base_instant: None,
            num_writes: 10,
            num_inserts: 10,
            num_updates: 0,
            file_size_bytes: 100,
        }
    }

    #[test]
    fn touched_file_groups_include_written_and_replaced() {
        let mut meta = CommitMetadata::new(WriteOperationType::Cluster);
        meta.add_write_stat("p", stat("new"));
        meta.add_replaced_file_ids("p", ["old-a".to_string(), "old-b".to_string()]);

        let touched: Vec<_> = meta
            .touched_file_groups()
            .into_iter()
            .map(|g| g.file_id)
            .collect();
        assert_eq!(touched, vec!["new", "old-a", "old-b"]);
        assert_eq!(meta.total_records_written(), 10);
    }

    #[test]
    fn missing_optional_fields_deserialize_to_defaults() {
        let meta: CommitMetadata = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(meta, CommitMetadata::default());
        assert_eq!(meta.operation, WriteOperationType::Upsert);
    }

    #[test]
    fn replaced_ids_are_omitted_when_empty() {
        let json = serde_json::to_string(&CommitMetadata::default()).expect("serialize");
        assert!(!json.contains("partition_to_replaced_file_ids"));
    }

    #[test]
    fn extra_metadata_round_trips_through_json() {
        let mut meta = CommitMetadata::new(WriteOperationType::Insert);
        meta.put_extra("checkpoint", r#"{"id1":"0"}"#);

        let json = serde_json::to_vec(&meta).expect("serialize");
        let decoded: CommitMetadata = serde_json::from_slice(&json).expect("deserialize");
        assert_eq!(decoded.get_extra("checkpoint"), Some(r#"{"id1":"0"}"#));
    }
}

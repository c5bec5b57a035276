//! Routing staged records to file groups and writing their data files.
//!
//! Routing rules per partition of a batch:
//!
//! - `Insert`: every record goes to one new file group.
//! - `Upsert`: a record whose key already lives in a visible file group goes
//!   to that group; the others go to one new file group.
//!
//! Writing rules per target group:
//!
//! | Group | Copy-on-write | Merge-on-read |
//! |---|---|---|
//! | new | base file at the instant | log-only slice (base = delta = instant) |
//! | existing | latest slice merged into a new base file | log file against the latest slice |
//! | already staged by this instant | staged file rewritten with the new records merged in | same |
//!
//! Nothing written here is visible until the instant completes; an abort
//! deletes every file named after the instant.
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use log::debug;
use snafu::prelude::*;

use crate::client::error::{RecordsSnafu, TableError, TimelineSnafu};
use crate::config::TableType;
use crate::file_system_view::{FileGroupId, FileSlice, FileSystemView};
use crate::records::{self, Record, RecordBatch, RecordError};
use crate::storage::{self, TableLocation, layout};
use crate::timeline::{
    CommitMetadata, Instant, InstantTime, Timeline, TimelineStore, WriteOperationType, WriteStat,
};

/// State of one open write between `begin_instant` and `commit`.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    /// The instant, REQUESTED until the first stage.
    pub(crate) instant: Instant,
    /// Snapshot taken when the write began; the OCC base.
    pub(crate) base: Timeline,
    /// Operation of the latest stage call.
    pub(crate) operation: WriteOperationType,
    /// Files written so far, one per file group.
    staged: BTreeMap<FileGroupId, (String, WriteStat)>,
    /// Latest slices of `base`, loaded on first use.
    view: Option<FileSystemView>,
    /// Key owners per partition, from the view, loaded per partition on
    /// first upsert.
    visible_keys: HashMap<String, HashMap<String, FileGroupId>>,
    /// Key owners per partition for records staged by this instant.
    staged_keys: HashMap<String, HashMap<String, FileGroupId>>,
}

/// One group's share of a batch.
struct Routed {
    records: Vec<Record>,
    inserts: u64,
    updates: u64,
}

impl PendingWrite {
    pub(crate) fn new(instant: Instant, base: Timeline) -> Self {
        Self {
            instant,
            base,
            operation: WriteOperationType::default(),
            staged: BTreeMap::new(),
            view: None,
            visible_keys: HashMap::new(),
            staged_keys: HashMap::new(),
        }
    }

    /// Commit metadata for everything staged, plus `extra`.
    pub(crate) fn metadata(&self, extra: BTreeMap<String, String>) -> CommitMetadata {
        let mut metadata = CommitMetadata::new(self.operation);
        for (partition, stat) in self.staged.values() {
            metadata.add_write_stat(partition, stat.clone());
        }
        metadata.extra_metadata = extra;
        metadata
    }

    async fn view(&mut self, store: &TimelineStore) -> Result<&FileSystemView, TableError> {
        let view = match self.view.take() {
            Some(view) => view,
            None => FileSystemView::load(store, &self.base)
                .await
                .context(TimelineSnafu)?,
        };
        Ok(self.view.insert(view))
    }

    async fn load_visible_keys(
        &mut self,
        store: &TimelineStore,
        partition: &str,
    ) -> Result<(), TableError> {
        if self.visible_keys.contains_key(partition) {
            return Ok(());
        }
        let slices = self.view(store).await?.get_latest_file_slices(partition);
        let mut owners = HashMap::new();
        for slice in &slices {
            for record in records::read_file_slice(store.location(), slice)
                .await
                .context(RecordsSnafu)?
            {
                owners.insert(record.key, slice.group.clone());
            }
        }
        debug!(
            "loaded key owners for upsert routing (partition={partition}, keys={})",
            owners.len(),
        );
        self.visible_keys.insert(partition.to_string(), owners);
        Ok(())
    }

    fn owner(&self, partition: &str, key: &str) -> Option<&FileGroupId> {
        self.staged_keys
            .get(partition)
            .and_then(|m| m.get(key))
            .or_else(|| self.visible_keys.get(partition).and_then(|m| m.get(key)))
    }

    fn route(
        &self,
        partition: &str,
        batch: Vec<Record>,
        operation: WriteOperationType,
    ) -> BTreeMap<FileGroupId, Routed> {
        let fresh = FileGroupId::generate(partition);
        let mut routed: BTreeMap<FileGroupId, Routed> = BTreeMap::new();
        for record in batch {
            let owner = match operation {
                WriteOperationType::Upsert => self.owner(partition, &record.key).cloned(),
                _ => None,
            };
            let is_update = owner.is_some();
            let entry = routed.entry(owner.unwrap_or_else(|| fresh.clone())).or_insert(Routed {
                records: Vec::new(),
                inserts: 0,
                updates: 0,
            });
            if is_update {
                entry.updates += 1;
            } else {
                entry.inserts += 1;
            }
            entry.records.push(record);
        }
        routed
    }

    /// Route `batch` and write its data files. Returns the write statistics
    /// of the files written by this call.
    pub(crate) async fn stage(
        &mut self,
        store: &TimelineStore,
        table_type: TableType,
        batch: RecordBatch,
        operation: WriteOperationType,
    ) -> Result<Vec<WriteStat>, TableError> {
        self.operation = operation;
        let ts = self.instant.timestamp().clone();
        let location = store.location().clone();
        let mut written = Vec::new();

        for (partition, records) in records::group_by_partition(batch) {
            if operation == WriteOperationType::Upsert {
                self.load_visible_keys(store, &partition).await?;
            }
            for (group, routed) in self.route(&partition, records, operation) {
                let keys: Vec<String> = routed.records.iter().map(|r| r.key.clone()).collect();
                let stat = self
                    .write_group(store, &location, table_type, &ts, &group, routed)
                    .await?;
                let owners = self.staged_keys.entry(partition.clone()).or_default();
                for key in keys {
                    owners.insert(key, group.clone());
                }
                self.staged
                    .insert(group.clone(), (partition.clone(), stat.clone()));
                written.push(stat);
            }
        }
        Ok(written)
    }

    async fn write_group(
        &mut self,
        store: &TimelineStore,
        location: &TableLocation,
        table_type: TableType,
        ts: &InstantTime,
        group: &FileGroupId,
        routed: Routed,
    ) -> Result<WriteStat, TableError> {
        if let Some((_, previous)) = self.staged.get(group) {
            return restage(location, previous, routed).await.context(RecordsSnafu);
        }

        let latest: Option<FileSlice> =
            self.view(store).await?.get_latest_file_slice(group).cloned();
        let (path, contents, prev_base_instant) = match (table_type, latest) {
            (TableType::CopyOnWrite, Some(slice)) => {
                let mut merged = records::read_file_slice(location, &slice)
                    .await
                    .context(RecordsSnafu)?;
                merged.extend(routed.records);
                let path = layout::data_file_rel_path(
                    &group.partition,
                    &layout::base_file_name(&group.file_id, ts.as_str()),
                );
                (path, records::merge_records(merged), Some(slice.base_instant))
            }
            (TableType::MergeOnRead, Some(slice)) => {
                let path = layout::data_file_rel_path(
                    &group.partition,
                    &layout::log_file_name(
                        &group.file_id,
                        slice.base_instant.as_str(),
                        ts.as_str(),
                    ),
                );
                (path, routed.records, Some(slice.base_instant))
            }
            (TableType::CopyOnWrite, None) => {
                let path = layout::data_file_rel_path(
                    &group.partition,
                    &layout::base_file_name(&group.file_id, ts.as_str()),
                );
                (path, routed.records, None)
            }
            (TableType::MergeOnRead, None) => {
                let path = layout::data_file_rel_path(
                    &group.partition,
                    &layout::log_file_name(&group.file_id, ts.as_str(), ts.as_str()),
                );
                (path, routed.records, None)
            }
        };

        let size = records::write_data_file(location, &path, &contents)
            .await
            .context(RecordsSnafu)?;
        debug!("staged data file (instant={ts}, path={path}, records={})", contents.len());
        Ok(WriteStat {
            file_id: group.file_id.clone(),
            path,
            prev_base_instant,
            num_writes: contents.len() as u64,
            num_inserts: routed.inserts,
            num_updates: routed.updates,
            file_size_bytes: size,
        })
    }
}

/// Rewrite a file this instant already staged with `routed` merged in.
async fn restage(
    location: &TableLocation,
    previous: &WriteStat,
    routed: Routed,
) -> Result<WriteStat, RecordError> {
    let mut merged = records::read_data_file(location, &previous.path).await?;
    merged.extend(routed.records);
    let merged = records::merge_records(merged);

    storage::remove_file_if_exists(location, Path::new(&previous.path))
        .await
        .context(records::DataFileStorageSnafu)?;
    let size = records::write_data_file(location, &previous.path, &merged).await?;
    debug!("restaged data file (path={}, records={})", previous.path, merged.len());

    Ok(WriteStat {
        num_writes: merged.len() as u64,
        num_inserts: previous.num_inserts + routed.inserts,
        num_updates: previous.num_updates + routed.updates,
        file_size_bytes: size,
        ..previous.clone()
    })
}

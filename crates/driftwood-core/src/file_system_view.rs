//! The file group / file slice view of a table.
//!
//! A [`FileSystemView`] answers "which data files does a reader see" for one
//! timeline snapshot. It is derived, never persisted:
//!
//! 1. Walk every completed instant, archived ones first, oldest to newest.
//! 2. For each, place the files listed in its commit metadata into their
//!    file groups (a base file opens a new slice, a log file extends the slice
//!    it names).
//! 3. On a replace instant, evict the file groups it lists; the groups it
//!    wrote are installed by step 2.
//!
//! Files written by pending or aborted instants never appear in completed
//! commit metadata, so they are invisible. A replace instant has no effect
//! until it is completed and part of the snapshot, which is what makes
//! clustering atomic for readers.
//!
//! The view holds the snapshot it was built from. Rebuild it after every
//! timeline reload; a stale view is a correctness bug.
pub mod file_slice;

pub use file_slice::{BaseFile, DataFile, FileGroup, FileGroupId, FileSlice, LogFile};

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};

use crate::timeline::archive::load_archived_timeline;
use crate::timeline::{CommitMetadata, Instant, InstantTime, Timeline, TimelineError, TimelineStore};

/// Latest visible file slices of a table as of one timeline snapshot.
#[derive(Debug, Clone)]
pub struct FileSystemView {
    timeline: Timeline,
    groups: BTreeMap<FileGroupId, FileGroup>,
    replaced: BTreeMap<FileGroupId, InstantTime>,
}

impl FileSystemView {
    /// Build the view for `timeline`, reading commit metadata from `store`.
    pub async fn load(store: &TimelineStore, timeline: &Timeline) -> Result<Self, TimelineError> {
        let archived = load_archived_timeline(store).await?;
        let active = timeline.completed();

        let mut walk: Vec<&Instant> = archived
            .iter()
            .chain(active.iter().filter(|i| {
                // An interrupted archival can leave the same instant in both places.
                !archived.iter().any(|a| a.same_event(i))
            }))
            .collect();
        walk.sort();

        let mut view = Self::empty(timeline.clone());
        for instant in walk {
            let metadata = store.read_commit_metadata_shared(instant).await?;
            view.apply(instant, &metadata);
        }
        debug!(
            "built file system view (groups={}, replaced={})",
            view.groups.len(),
            view.replaced.len(),
        );
        Ok(view)
    }

    /// Build a view from instants and their metadata, oldest first.
    pub fn build<'a, I>(timeline: Timeline, instants: I) -> Self
    where
        I: IntoIterator<Item = (&'a Instant, &'a CommitMetadata)>,
    {
        let mut view = Self::empty(timeline);
        for (instant, metadata) in instants {
            view.apply(instant, metadata);
        }
        view
    }

    fn empty(timeline: Timeline) -> Self {
        Self {
            timeline,
            groups: BTreeMap::new(),
            replaced: BTreeMap::new(),
        }
    }

    fn apply(&mut self, instant: &Instant, metadata: &CommitMetadata) {
        for stats in metadata.partition_to_write_stats.values() {
            for stat in stats {
                let Some(file) = DataFile::parse(&stat.path) else {
                    warn!(
                        "skipping unrecognized data file (instant={instant}, path={})",
                        stat.path
                    );
                    continue;
                };
                if self.replaced.contains_key(file.group()) {
                    warn!(
                        "ignoring write to replaced file group (instant={instant}, group={})",
                        file.group(),
                    );
                    continue;
                }
                self.groups
                    .entry(file.group().clone())
                    .or_insert_with(|| FileGroup::new(file.group().clone()))
                    .add_data_file(file);
            }
        }

        for group in metadata.replaced_file_groups() {
            self.groups.remove(&group);
            self.replaced.insert(group, instant.timestamp().clone());
        }
    }

    /// The snapshot this view was built from.
    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Partitions with at least one visible file group.
    pub fn partitions(&self) -> Vec<String> {
        self.groups
            .keys()
            .map(|id| id.partition.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Visible file groups of `partition`.
    pub fn file_groups<'a>(
        &'a self,
        partition: &'a str,
    ) -> impl Iterator<Item = &'a FileGroup> + 'a {
        self.groups
            .values()
            .filter(move |g| g.id().partition == partition)
    }

    /// The latest slice of every visible file group in `partition`, ordered by
    /// file id.
    pub fn get_latest_file_slices(&self, partition: &str) -> Vec<FileSlice> {
        self.file_groups(partition)
            .filter_map(FileGroup::latest_slice)
            .cloned()
            .collect()
    }

    /// The latest slice of every visible file group in the table.
    pub fn get_all_latest_file_slices(&self) -> Vec<FileSlice> {
        self.groups
            .values()
            .filter_map(FileGroup::latest_slice)
            .cloned()
            .collect()
    }

    /// Latest slice of one file group, `None` if the group is unknown or
    /// replaced.
    pub fn get_latest_file_slice(&self, id: &FileGroupId) -> Option<&FileSlice> {
        self.groups.get(id).and_then(FileGroup::latest_slice)
    }

    /// Whether a completed replace instant superseded `id`.
    pub fn is_replaced(&self, id: &FileGroupId) -> bool {
        self.replaced.contains_key(id)
    }

    /// File groups superseded by completed replace instants, with the
    /// replacing instant.
    pub fn replaced_file_groups(&self) -> &BTreeMap<FileGroupId, InstantTime> {
        &self.replaced
    }
}

//! Moving old completed instants off the active timeline.
//!
//! The active timeline is listed on every reload, so it is kept short: once
//! more than `max_instants_to_keep` completed instants are listed, the oldest
//! ones are moved into `.driftwood/archived/` until `min_instants_to_keep`
//! remain. Only instants strictly older than the oldest pending instant are
//! eligible, which keeps every instant a running writer might still conflict
//! with on the active timeline.
//!
//! Archived instants are never renumbered or rewritten. Their files keep the
//! same names and their data files stay visible, since a timestamp inside the
//! archived range counts as committed (see [`Timeline::is_committed`]).
use log::{debug, info};

use crate::config::ArchivalConfig;
use crate::timeline::active::ActiveTimeline;
use crate::timeline::instant::Instant;
use crate::timeline::snapshot::Timeline;
use crate::timeline::store::TimelineStore;
use crate::timeline::TimelineError;

/// Instants that would be archived from `timeline` under `config`, oldest
/// first.
pub fn instants_to_archive(timeline: &Timeline, config: &ArchivalConfig) -> Vec<Instant> {
    let completed = timeline.completed();
    if completed.len() <= config.max_instants_to_keep {
        return Vec::new();
    }
    let excess = completed.len() - config.min_instants_to_keep;
    let first_pending = timeline.first_pending_instant().map(|i| i.timestamp());

    completed
        .iter()
        .take_while(|i| first_pending.is_none_or(|p| i.timestamp() < p))
        .take(excess)
        .cloned()
        .collect()
}

/// Archive instants when the active timeline grew past
/// `config.max_instants_to_keep`. Returns the archived instants.
///
/// Callers hold the table lock so no other writer archives concurrently.
pub async fn archive_if_needed(
    active: &mut ActiveTimeline,
    config: &ArchivalConfig,
) -> Result<Vec<Instant>, TimelineError> {
    if !config.enabled {
        return Ok(Vec::new());
    }
    active.reload().await?;

    let victims = instants_to_archive(active.timeline(), config);
    if victims.is_empty() {
        debug!("nothing to archive (completed={})", active.timeline().completed().len());
        return Ok(victims);
    }

    for instant in &victims {
        active.store().archive(instant).await?;
    }
    active.reload().await?;

    info!(
        "archived timeline instants (archived={}, up_to={})",
        victims.len(),
        victims[victims.len() - 1].timestamp(),
    );
    Ok(victims)
}

/// Completed instants in the archive, timestamp ascending.
pub async fn load_archived_timeline(store: &TimelineStore) -> Result<Timeline, TimelineError> {
    store.ensure_table_exists().await?;
    let archived = store
        .list_archived_instants()
        .await?
        .into_iter()
        .filter(Instant::is_completed)
        .collect();
    Ok(Timeline::new(archived, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TableLocation;
    use crate::timeline::Action;
    use crate::timeline::instant::{InstantTime, State};
    use crate::timeline::metadata::CommitMetadata;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn instant(t: &str, state: State) -> Instant {
        Instant::new(
            InstantTime::parse(t).expect("valid"),
            Action::Commit,
            state,
        )
    }

    fn config(min: usize, max: usize) -> ArchivalConfig {
        ArchivalConfig {
            enabled: true,
            min_instants_to_keep: min,
            max_instants_to_keep: max,
        }
    }

    #[test]
    fn nothing_is_archived_below_the_high_water_mark() {
        let timeline = Timeline::new(
            vec![
                instant("20250101000000001", State::Completed),
                instant("20250101000000002", State::Completed),
            ],
            None,
        );
        assert!(instants_to_archive(&timeline, &config(1, 2)).is_empty());
    }

    #[test]
    fn archival_stops_at_the_oldest_pending_instant() {
        let timeline = Timeline::new(
            vec![
                instant("20250101000000001", State::Completed),
                instant("20250101000000002", State::Inflight),
                instant("20250101000000003", State::Completed),
                instant("20250101000000004", State::Completed),
                instant("20250101000000005", State::Completed),
            ],
            None,
        );
        let victims = instants_to_archive(&timeline, &config(1, 2));
        let stamps: Vec<_> = victims.iter().map(|i| i.timestamp().as_str()).collect();
        assert_eq!(stamps, vec!["20250101000000001"]);
    }

    #[tokio::test]
    async fn archived_instants_leave_the_active_timeline() -> TestResult {
        let tmp = TempDir::new()?;
        let store = TimelineStore::new(TableLocation::local(tmp.path()));
        store.create_layout().await?;
        let mut active = ActiveTimeline::load(store.clone()).await?;

        let mut done = Vec::new();
        for _ in 0..5 {
            let i = active.begin_instant(Action::Commit).await?;
            let i = active.transition_to_inflight(&i).await?;
            done.push(active.complete(&i, &CommitMetadata::default()).await?);
        }

        let archived = archive_if_needed(&mut active, &config(2, 4)).await?;
        assert_eq!(archived, done[..3].to_vec());
        assert_eq!(active.timeline().instants(), &done[3..]);
        assert_eq!(active.timeline().archived_up_to(), Some(done[2].timestamp()));
        assert!(active.timeline().is_committed(done[0].timestamp()));

        let history = load_archived_timeline(&store).await?;
        assert_eq!(history.instants(), &done[..3]);
        // Metadata of archived instants stays readable.
        active.read_commit_metadata(&done[0]).await?;
        Ok(())
    }

    #[tokio::test]
    async fn disabled_archival_is_a_no_op() -> TestResult {
        let tmp = TempDir::new()?;
        let store = TimelineStore::new(TableLocation::local(tmp.path()));
        store.create_layout().await?;
        let mut active = ActiveTimeline::load(store).await?;
        for _ in 0..3 {
            let i = active.begin_instant(Action::Commit).await?;
            let i = active.transition_to_inflight(&i).await?;
            active.complete(&i, &CommitMetadata::default()).await?;
        }

        let cfg = ArchivalConfig {
            enabled: false,
            ..config(0, 1)
        };
        assert!(archive_if_needed(&mut active, &cfg).await?.is_empty());
        assert_eq!(active.timeline().len(), 3);
        Ok(())
    }
}

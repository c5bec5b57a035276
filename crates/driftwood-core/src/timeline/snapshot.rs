//! Immutable, ordered views over a set of instants.
//!
//! A [`Timeline`] is what readers reason about: it never changes after it is
//! built, so two reads against the same snapshot always agree. Filtering
//! produces a new, smaller `Timeline`; iteration is lazy and restartable.
use crate::timeline::instant::{Action, Instant, InstantTime, State};

/// An ordered snapshot of instants, timestamp ascending.
///
/// `archived_up_to` is the newest instant time moved to the archive when the
/// snapshot was taken. Instants at or before it are no longer listed but are
/// known to have completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    instants: Vec<Instant>,
    archived_up_to: Option<InstantTime>,
}

impl Timeline {
    /// Build a snapshot; instants are sorted.
    pub fn new(mut instants: Vec<Instant>, archived_up_to: Option<InstantTime>) -> Self {
        instants.sort();
        Self {
            instants,
            archived_up_to,
        }
    }

    fn derive(&self, instants: Vec<Instant>) -> Self {
        Self {
            instants,
            archived_up_to: self.archived_up_to.clone(),
        }
    }

    /// Snapshot restricted to instants matching `pred`.
    pub fn filter<F>(&self, pred: F) -> Timeline
    where
        F: Fn(&Instant) -> bool,
    {
        self.derive(self.instants.iter().filter(|i| pred(i)).cloned().collect())
    }

    /// All instants, ordered.
    pub fn instants(&self) -> &[Instant] {
        &self.instants
    }

    /// Iterate instants in timestamp order.
    pub fn iter(&self) -> std::slice::Iter<'_, Instant> {
        self.instants.iter()
    }

    /// Number of instants.
    pub fn len(&self) -> usize {
        self.instants.len()
    }

    /// Whether the snapshot holds no instants.
    pub fn is_empty(&self) -> bool {
        self.instants.is_empty()
    }

    /// Newest archived instant time, if anything was archived.
    pub fn archived_up_to(&self) -> Option<&InstantTime> {
        self.archived_up_to.as_ref()
    }

    /// Completed instants only.
    pub fn completed(&self) -> Timeline {
        self.filter(Instant::is_completed)
    }

    /// Requested or inflight instants only.
    pub fn pending(&self) -> Timeline {
        self.filter(Instant::is_pending)
    }

    /// Instants whose action is in `actions`.
    pub fn filter_actions(&self, actions: &[Action]) -> Timeline {
        self.filter(|i| actions.contains(&i.action()))
    }

    /// Lazy, restartable iteration over completed instants with an action in
    /// `actions`, timestamp ascending.
    pub fn completed_instants<'a>(
        &'a self,
        actions: &'a [Action],
    ) -> impl Iterator<Item = &'a Instant> + Clone + 'a {
        self.instants
            .iter()
            .filter(move |i| i.is_completed() && actions.contains(&i.action()))
    }

    /// Completed `commit` and `deltacommit` instants.
    pub fn commits_timeline(&self) -> Timeline {
        self.filter(|i| i.is_completed() && i.action().is_write_commit())
    }

    /// Completed `replacecommit` instants.
    pub fn completed_replace_timeline(&self) -> Timeline {
        self.filter(|i| i.is_completed() && i.action() == Action::Replace)
    }

    /// Oldest instant.
    pub fn first_instant(&self) -> Option<&Instant> {
        self.instants.first()
    }

    /// Newest instant.
    pub fn last_instant(&self) -> Option<&Instant> {
        self.instants.last()
    }

    /// Newest completed instant.
    pub fn last_completed_instant(&self) -> Option<&Instant> {
        self.instants.iter().rev().find(|i| i.is_completed())
    }

    /// Oldest pending instant.
    pub fn first_pending_instant(&self) -> Option<&Instant> {
        self.instants.iter().find(|i| i.is_pending())
    }

    /// Newest instant time known to this snapshot, including the archive.
    pub fn max_instant_time(&self) -> Option<&InstantTime> {
        match (self.last_instant(), self.archived_up_to.as_ref()) {
            (Some(i), Some(a)) => Some(i.timestamp().max(a)),
            (Some(i), None) => Some(i.timestamp()),
            (None, a) => a,
        }
    }

    /// The instant with this timestamp and action, in whatever state.
    pub fn find(&self, timestamp: &InstantTime, action: Action) -> Option<&Instant> {
        self.instants
            .iter()
            .find(|i| i.timestamp() == timestamp && i.action() == action)
    }

    /// Whether any instant uses `timestamp`.
    pub fn contains_timestamp(&self, timestamp: &InstantTime) -> bool {
        self.instants.iter().any(|i| i.timestamp() == timestamp)
    }

    /// Whether `timestamp` precedes every instant this snapshot still lists
    /// and falls within the archived range.
    pub fn is_before_timeline_starts(&self, timestamp: &InstantTime) -> bool {
        let archived = self
            .archived_up_to
            .as_ref()
            .is_some_and(|boundary| timestamp <= boundary);
        let before_first = self
            .first_instant()
            .is_none_or(|first| timestamp < first.timestamp());
        archived && before_first
    }

    /// Whether data written at `timestamp` is committed in this snapshot:
    /// a completed instant with that timestamp exists, or the timestamp lies in
    /// the archived range and no pending instant claims it.
    pub fn is_committed(&self, timestamp: &InstantTime) -> bool {
        let mut listed = self
            .instants
            .iter()
            .filter(|i| i.timestamp() == timestamp)
            .peekable();
        if listed.peek().is_some() {
            return listed.any(Instant::is_completed);
        }
        self.archived_up_to
            .as_ref()
            .is_some_and(|boundary| timestamp <= boundary)
    }

    /// Completed instants with `begin < timestamp <= end`.
    ///
    /// `begin = None` starts from the beginning of the timeline. This is the
    /// incremental-pull contract: pass the last instant already consumed as
    /// `begin`.
    pub fn get_instants_in_range(
        &self,
        begin_exclusive: Option<&InstantTime>,
        end_inclusive: &InstantTime,
    ) -> Timeline {
        self.filter(|i| {
            i.is_completed()
                && begin_exclusive.is_none_or(|b| i.timestamp() > b)
                && i.timestamp() <= end_inclusive
        })
    }

    /// Instants strictly after `timestamp`.
    pub fn find_instants_after(&self, timestamp: &InstantTime) -> Timeline {
        self.filter(|i| i.timestamp() > timestamp)
    }

    /// Number of completed instants with an action in `actions` and a
    /// timestamp strictly after `after` (or all of them when `after` is None).
    pub fn count_completed_since(&self, actions: &[Action], after: Option<&InstantTime>) -> usize {
        self.completed_instants(actions)
            .filter(|i| after.is_none_or(|a| i.timestamp() > a))
            .count()
    }

    /// Whether an instant with the same `(timestamp, action)` is listed in
    /// state `state`.
    pub fn contains_in_state(&self, instant: &Instant, state: State) -> bool {
        self.instants
            .iter()
            .any(|i| i.same_event(instant) && i.state() == state)
    }

    /// Replace the listed copy of `instant` (same timestamp and action) or
    /// insert it in order.
    pub(crate) fn upsert(&mut self, instant: Instant) {
        self.instants.retain(|i| !i.same_event(&instant));
        let pos = self.instants.partition_point(|i| i < &instant);
        self.instants.insert(pos, instant);
    }

    /// Drop the listed copy of `instant`.
    pub(crate) fn remove(&mut self, instant: &Instant) {
        self.instants.retain(|i| !i.same_event(instant));
    }
}

impl<'a> IntoIterator for &'a Timeline {
    type Item = &'a Instant;
    type IntoIter = std::slice::Iter<'a, Instant>;

    fn into_iter(self) -> Self::IntoIter {
        self.instants.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(t: &str, action: Action, state: State) -> Instant {
        Instant::new(InstantTime::parse(t).expect("valid"), action, state)
    }

    fn ts(t: &str) -> InstantTime {
        InstantTime::parse(t).expect("valid")
    }

    fn sample() -> Timeline {
        Timeline::new(
            vec![
                instant("20250101000000004", Action::Replace, State::Completed),
                instant("20250101000000001", Action::Commit, State::Completed),
                instant("20250101000000002", Action::DeltaCommit, State::Completed),
                instant("20250101000000003", Action::Compaction, State::Completed),
                instant("20250101000000005", Action::DeltaCommit, State::Inflight),
            ],
            None,
        )
    }

    fn stamps(t: &Timeline) -> Vec<&str> {
        t.iter().map(|i| i.timestamp().as_str()).collect()
    }

    #[test]
    fn instants_are_sorted_by_timestamp() {
        assert_eq!(
            stamps(&sample()),
            vec![
                "20250101000000001",
                "20250101000000002",
                "20250101000000003",
                "20250101000000004",
                "20250101000000005",
            ]
        );
    }

    #[test]
    fn derived_views_filter_by_action_and_state() {
        let t = sample();
        assert_eq!(
            stamps(&t.commits_timeline()),
            vec!["20250101000000001", "20250101000000002"]
        );
        assert_eq!(stamps(&t.completed_replace_timeline()), vec!["20250101000000004"]);
        assert_eq!(stamps(&t.pending()), vec!["20250101000000005"]);
    }

    #[test]
    fn completed_instants_iterator_is_restartable() {
        let t = sample();
        let actions = [Action::DeltaCommit, Action::Compaction];
        let iter = t.completed_instants(&actions);
        let first: Vec<_> = iter.clone().collect();
        let second: Vec<_> = iter.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn range_is_begin_exclusive_end_inclusive() {
        let t = sample();
        let range =
            t.get_instants_in_range(Some(&ts("20250101000000001")), &ts("20250101000000004"));
        assert_eq!(
            stamps(&range),
            vec!["20250101000000002", "20250101000000003", "20250101000000004"]
        );

        let from_start = t.get_instants_in_range(None, &ts("20250101000000002"));
        assert_eq!(stamps(&from_start), vec!["20250101000000001", "20250101000000002"]);

        // Pending instants never show up in incremental pulls.
        let tail =
            t.get_instants_in_range(Some(&ts("20250101000000004")), &ts("20250101000000009"));
        assert!(tail.is_empty());
    }

    #[test]
    fn lookups_by_timestamp() {
        let t = sample();
        assert!(t.contains_timestamp(&ts("20250101000000003")));
        assert!(!t.contains_timestamp(&ts("20250101000000009")));
        assert!(t.find(&ts("20250101000000003"), Action::Compaction).is_some());
        assert!(t.find(&ts("20250101000000003"), Action::Commit).is_none());
        assert_eq!(
            stamps(&t.find_instants_after(&ts("20250101000000003"))),
            vec!["20250101000000004", "20250101000000005"]
        );
    }

    #[test]
    fn committed_check_honours_archive_boundary() {
        let t = Timeline::new(
            vec![
                instant("20250101000000005", Action::Commit, State::Completed),
                instant("20250101000000006", Action::Commit, State::Inflight),
            ],
            Some(ts("20250101000000004")),
        );
        assert!(t.is_committed(&ts("20250101000000002")));
        assert!(t.is_before_timeline_starts(&ts("20250101000000002")));
        assert!(t.is_committed(&ts("20250101000000005")));
        assert!(!t.is_committed(&ts("20250101000000006")));
        assert!(!t.is_committed(&ts("20250101000000007")));
        assert_eq!(t.max_instant_time(), Some(&ts("20250101000000006")));
    }

    #[test]
    fn count_completed_since_skips_older_instants() {
        let t = sample();
        assert_eq!(t.count_completed_since(&[Action::DeltaCommit], None), 1);
        assert_eq!(
            t.count_completed_since(
                &[Action::Commit, Action::DeltaCommit],
                Some(&ts("20250101000000001"))
            ),
            1
        );
    }

    #[test]
    fn upsert_replaces_same_event() {
        let mut t = sample();
        let inflight = instant("20250101000000005", Action::DeltaCommit, State::Inflight);
        t.upsert(inflight.with_state(State::Completed));
        assert_eq!(t.len(), 5);
        assert!(t.contains_in_state(&inflight, State::Completed));
        t.remove(&inflight);
        assert_eq!(t.len(), 4);
    }
}

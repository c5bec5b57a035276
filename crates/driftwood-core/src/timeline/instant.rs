//! Instants: the atomic, timestamped records that make up the timeline.
//!
//! An [`Instant`] is the triple `(timestamp, action, state)`. Each state of an
//! instant is persisted as its own file, named after the triple:
//!
//! ```text
//! 20250101093000123.deltacommit.requested
//! 20250101093000123.deltacommit.inflight
//! 20250101093000123.deltacommit
//! ```
//!
//! The completed file carries no state suffix. Directory listing plus
//! [`Instant::parse_file_name`] is all that is needed to rebuild the timeline.
use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

/// Monotonic timeline key in `yyyyMMddHHmmssSSS` form.
///
/// Instant times are fixed width, so lexicographic and chronological order
/// agree.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstantTime(String);

impl InstantTime {
    /// Number of digits in an instant time.
    pub const LEN: usize = 17;

    /// Validate and wrap an instant time string.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == Self::LEN && s.bytes().all(|b| b.is_ascii_digit()) {
            Some(InstantTime(s.to_string()))
        } else {
            None
        }
    }

    pub(crate) fn new_unchecked(s: String) -> Self {
        debug_assert!(s.len() == Self::LEN);
        InstantTime(s)
    }

    /// The underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstantTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InstantTime {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The kind of table state transition an instant records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Copy-on-write commit: writes new base files.
    Commit,
    /// Merge-on-read commit: appends log files.
    DeltaCommit,
    /// Merge-on-read compaction: folds log files into new base files.
    Compaction,
    /// Replaces a set of file groups with another (clustering).
    Replace,
}

impl Action {
    /// Every action, in declaration order.
    pub const ALL: [Action; 4] = [
        Action::Commit,
        Action::DeltaCommit,
        Action::Compaction,
        Action::Replace,
    ];

    /// File extension used in instant file names.
    pub fn file_ext(self) -> &'static str {
        match self {
            Action::Commit => "commit",
            Action::DeltaCommit => "deltacommit",
            Action::Compaction => "compaction",
            Action::Replace => "replacecommit",
        }
    }

    /// Inverse of [`Action::file_ext`].
    pub fn from_file_ext(ext: &str) -> Option<Action> {
        Action::ALL.into_iter().find(|a| a.file_ext() == ext)
    }

    /// Actions written by ingestion (as opposed to table services).
    pub fn is_write_commit(self) -> bool {
        matches!(self, Action::Commit | Action::DeltaCommit)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_ext())
    }
}

/// Lifecycle state of an instant. Ordering follows the lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Planned, nothing written yet.
    Requested,
    /// Data is being written.
    Inflight,
    /// Durably finalized and visible to readers.
    Completed,
}

impl State {
    /// The only state this one may move to.
    pub fn next(self) -> Option<State> {
        match self {
            State::Requested => Some(State::Inflight),
            State::Inflight => Some(State::Completed),
            State::Completed => None,
        }
    }

    /// File name suffix; completed files have none.
    pub fn file_suffix(self) -> Option<&'static str> {
        match self {
            State::Requested => Some("requested"),
            State::Inflight => Some("inflight"),
            State::Completed => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Requested => "REQUESTED",
            State::Inflight => "INFLIGHT",
            State::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

/// One timeline event and its lifecycle state.
///
/// Instants are values: a transition produces a new `Instant` rather than
/// mutating the old one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instant {
    timestamp: InstantTime,
    action: Action,
    state: State,
}

impl Instant {
    /// Build an instant.
    pub fn new(timestamp: InstantTime, action: Action, state: State) -> Self {
        Self {
            timestamp,
            action,
            state,
        }
    }

    /// Instant time.
    pub fn timestamp(&self) -> &InstantTime {
        &self.timestamp
    }

    /// Action.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the instant is completed.
    pub fn is_completed(&self) -> bool {
        self.state == State::Completed
    }

    /// Whether the instant is requested or inflight.
    pub fn is_pending(&self) -> bool {
        self.state != State::Completed
    }

    /// Same timestamp and action, different state.
    pub fn with_state(&self, state: State) -> Instant {
        Instant {
            timestamp: self.timestamp.clone(),
            action: self.action,
            state,
        }
    }

    /// Whether both instants denote the same `(timestamp, action)`.
    pub fn same_event(&self, other: &Instant) -> bool {
        self.timestamp == other.timestamp && self.action == other.action
    }

    /// File name of this instant's current state.
    pub fn file_name(&self) -> String {
        Self::file_name_for(&self.timestamp, self.action, self.state)
    }

    /// File name of `(timestamp, action, state)`.
    pub fn file_name_for(timestamp: &InstantTime, action: Action, state: State) -> String {
        match state.file_suffix() {
            Some(suffix) => format!("{timestamp}.{}.{suffix}", action.file_ext()),
            None => format!("{timestamp}.{}", action.file_ext()),
        }
    }

    /// Parse an instant file name. Returns `None` when the name does not
    /// follow the instant file convention.
    pub fn parse_file_name(name: &str) -> Option<Instant> {
        let mut parts = name.split('.');
        let timestamp = InstantTime::parse(parts.next()?)?;
        let action = Action::from_file_ext(parts.next()?)?;
        let state = match parts.next() {
            None => State::Completed,
            Some("requested") => State::Requested,
            Some("inflight") => State::Inflight,
            Some(_) => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Instant::new(timestamp, action, state))
    }
}

impl PartialOrd for Instant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.action.cmp(&other.action))
            .then(self.state.cmp(&other.state))
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}__{}__{}]", self.timestamp, self.action, self.state)
    }
}

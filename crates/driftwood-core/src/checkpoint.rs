//! Per-writer checkpoint bookkeeping stored in commit metadata.
//!
//! Streaming writers record how far they got by putting an entry into the
//! extra metadata of each commit they produce. The value under the checkpoint
//! key is a JSON object mapping writer identifiers to batch ids:
//!
//! ```text
//! "_driftwood_streaming_sink_checkpoint": "{\"id1\":\"7\"}"
//! ```
//!
//! A commit carries only the entry of the writer that produced it. Finding a
//! writer's checkpoint therefore scans the commits timeline newest to oldest
//! and stops at the first commit with a non-empty entry for that identifier.
//! Entries of other identifiers are never consulted, however recent.
//!
//! The scan is repeated on every lookup. Commit metadata reads are served from
//! the store's cache of immutable completed instants, so a rescan costs a
//! walk over the listing rather than file reads.
use std::collections::BTreeMap;

use log::debug;
use snafu::{Backtrace, prelude::*};

use crate::timeline::{CommitMetadata, Timeline, TimelineError, TimelineStore};

/// Well-known commit metadata key for streaming checkpoints.
pub const STREAMING_CHECKPOINT_KEY: &str = "_driftwood_streaming_sink_checkpoint";

/// Errors raised while reading or writing checkpoints.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CheckpointError {
    /// Commit metadata could not be read.
    #[snafu(display("Timeline error while reading checkpoints: {source}"))]
    CheckpointTimeline {
        /// Underlying timeline error.
        #[snafu(backtrace)]
        source: TimelineError,
    },

    /// The value under the checkpoint key is not a JSON object of strings.
    #[snafu(display("Malformed checkpoint value under {key} in instant {instant}: {source}"))]
    MalformedCheckpoint {
        /// Instant carrying the value.
        instant: String,
        /// Metadata key.
        key: String,
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A new checkpoint value could not be serialized.
    #[snafu(display("Failed to encode the checkpoint of writer {writer_id}: {source}"))]
    EncodeCheckpoint {
        /// Writer whose entry was being encoded.
        writer_id: String,
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Writer identifiers and batch ids must be non-empty.
    #[snafu(display("Invalid checkpoint entry: {msg}"))]
    InvalidCheckpoint {
        /// What is wrong.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// Encode the checkpoint value of one commit.
pub fn encode_checkpoint(writer_id: &str, batch_id: &str) -> Result<String, CheckpointError> {
    ensure!(
        !writer_id.is_empty(),
        InvalidCheckpointSnafu {
            msg: "writer identifier is empty",
        }
    );
    ensure!(
        !batch_id.is_empty(),
        InvalidCheckpointSnafu {
            msg: format!("batch id for writer {writer_id} is empty"),
        }
    );
    let entry = BTreeMap::from([(writer_id, batch_id)]);
    serde_json::to_string(&entry).context(EncodeCheckpointSnafu { writer_id })
}

/// Attach the checkpoint of `writer_id` to commit metadata.
pub fn put_checkpoint(
    metadata: &mut CommitMetadata,
    key: &str,
    writer_id: &str,
    batch_id: &str,
) -> Result<(), CheckpointError> {
    let value = encode_checkpoint(writer_id, batch_id)?;
    metadata.put_extra(key, value);
    Ok(())
}

/// Decode a checkpoint value into `{writer_id -> batch_id}`.
pub fn decode_checkpoint(
    instant: &str,
    key: &str,
    value: &str,
) -> Result<BTreeMap<String, String>, CheckpointError> {
    serde_json::from_str(value).context(MalformedCheckpointSnafu { instant, key })
}

/// The checkpoint of `writer_id` in one commit's metadata, if it has a
/// non-empty one.
pub fn checkpoint_in(
    instant: &str,
    metadata: &CommitMetadata,
    key: &str,
    writer_id: &str,
) -> Result<Option<String>, CheckpointError> {
    let Some(value) = metadata.get_extra(key).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let mut entries = decode_checkpoint(instant, key, value)?;
    Ok(entries.remove(writer_id).filter(|b| !b.is_empty()))
}

/// Latest checkpoint of `writer_id` in `commits_timeline`.
///
/// Only completed `commit` and `deltacommit` instants are scanned, newest
/// first. Returns `None` for an identifier that never committed; callers
/// treat that as "start of stream".
pub async fn get_valid_checkpoint(
    store: &TimelineStore,
    commits_timeline: &Timeline,
    metadata_key: &str,
    writer_id: &str,
) -> Result<Option<String>, CheckpointError> {
    for instant in commits_timeline.commits_timeline().iter().rev() {
        let metadata = store
            .read_commit_metadata_shared(instant)
            .await
            .context(CheckpointTimelineSnafu)?;
        if let Some(batch_id) =
            checkpoint_in(instant.timestamp().as_str(), &metadata, metadata_key, writer_id)?
        {
            debug!(
                "found checkpoint (writer_id={writer_id}, batch_id={batch_id}, instant={instant})",
            );
            return Ok(Some(batch_id));
        }
    }
    debug!("no checkpoint for writer (writer_id={writer_id})");
    Ok(None)
}

/// Whether a streaming driver should skip `batch_id` because it is not newer
/// than the committed checkpoint.
///
/// Numeric batch ids compare numerically; anything else only skips an exact
/// repeat of the last committed batch.
pub fn should_skip_batch(last_committed: Option<&str>, batch_id: &str) -> bool {
    let Some(last) = last_committed else {
        return false;
    };
    match (last.parse::<u64>(), batch_id.parse::<u64>()) {
        (Ok(last), Ok(batch)) => batch <= last,
        _ => last == batch_id,
    }
}

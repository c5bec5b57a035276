//! Commit timeline and multi-writer coordination for driftwood tables.
//!
//! A driftwood table is a directory of immutable data files plus a timeline
//! of instants under `.driftwood/`. This crate provides:
//!
//! - The timeline: instants moving REQUESTED -> INFLIGHT -> COMPLETED, one
//!   create-once file per state, reloaded by listing (`timeline` module).
//! - Snapshot views of the latest file slice per file group, honoring
//!   replaced file groups (`file_system_view` module).
//! - Per-writer streaming checkpoints kept in commit metadata
//!   (`checkpoint` module).
//! - Lock providers and optimistic conflict detection at commit time
//!   (`concurrency` module).
//! - Compaction, clustering and archival, run inline or on background tasks
//!   (`table_services` module).
//! - [`client::WriteClient`], the writer-facing entry point tying them
//!   together.
//!
//! Record payloads are opaque JSON (`records` module); query execution is
//! left to other crates.
#![deny(missing_docs)]
pub mod checkpoint;
pub mod client;
pub mod concurrency;
pub mod config;
pub mod file_system_view;
pub mod records;
pub mod storage;
pub mod table_services;
pub mod timeline;

pub use client::{TableError, WriteClient};
pub use config::{TableProperties, TableType, WriteConfig};
pub use records::{Record, RecordBatch};
pub use storage::TableLocation;
pub use timeline::{Action, Instant, InstantTime, State, WriteOperationType};

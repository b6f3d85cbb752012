#![deny(clippy::all)]

//! Container log collection, transport, and archival pipeline.
//!
//! Application containers write log files to a shared directory; the
//! [`agent`] tails them and publishes size-bounded, possibly fragmented
//! batches to a partitioned broker. The [`dumper`] consumes per-app topics,
//! reassembles batches, reorders records by event time within a buffer
//! window, and appends them to per-app aggregated files with
//! application-owned consumer offsets. The [`archiver`] and [`cleaner`]
//! roll, compress, and expire what lands on disk.
//!
//! Delivery is at-least-once end to end: the agent commits file offsets
//! only after broker acknowledgement, and the dumper persists broker
//! offsets only after durable appends.

pub mod agent;
pub mod archiver;
pub mod cleaner;
pub mod cli;
pub mod dumper;
pub mod kafka;
pub mod path_lock;
pub mod schedule;
pub mod signal;
pub mod wire;

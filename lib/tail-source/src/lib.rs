#![deny(clippy::all)]

//! Tailing machinery for the log collection agent: directory scanning,
//! per-file positional reads, multi-line record framing, and the durable
//! per-path offset store.

mod framer;
mod offsets;
mod scanner;
mod watcher;

pub use self::framer::{Record, RecordFramer};
pub use self::offsets::{OffsetStore, OffsetsView, OFFSET_FILE_NAME};
pub use self::scanner::Scanner;
pub use self::watcher::{FileWatcher, RawLine};

pub type FilePosition = u64;

/// Where a watcher starts reading when it is created.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum ReadFrom {
    #[default]
    Beginning,
    Checkpoint(FilePosition),
}

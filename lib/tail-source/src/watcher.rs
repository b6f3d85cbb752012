use std::{
    io::{self, SeekFrom},
    path::PathBuf,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncSeekExt, BufReader},
};
use tracing::{debug, warn};

use crate::{FilePosition, ReadFrom};

/// A whole line read out of a watched file, without its trailing newline.
///
/// `end_position` is the byte offset just past the line's newline; committing
/// it as the file's offset means this line will not be re-read.
#[derive(Debug)]
pub struct RawLine {
    pub end_position: FilePosition,
    pub bytes: Bytes,
}

/// The `FileWatcher` struct defines the per-path reader which yields whole
/// newline-terminated lines from a position it maintains. A partial line at
/// the end of the file stays buffered until its newline arrives, so the
/// position after an emitted line never splits a record.
///
/// A `FileWatcher` tracks _only one_ file. The agent is responsible for
/// clearing away watchers whose files no longer exist.
pub struct FileWatcher {
    path: PathBuf,
    reader: BufReader<File>,
    /// Offset of the raw read cursor, including buffered partial-line bytes.
    read_pos: FilePosition,
    devno: u64,
    inode: u64,
    is_dead: bool,
    max_line_bytes: usize,
    discarding: bool,
    buf: BytesMut,
}

impl FileWatcher {
    /// Create a new `FileWatcher` positioned according to `read_from`.
    ///
    /// A checkpoint beyond the current end of the file means the file was
    /// truncated or replaced while unwatched; reading restarts from 0.
    pub async fn new(
        path: PathBuf,
        read_from: ReadFrom,
        max_line_bytes: usize,
    ) -> Result<FileWatcher, io::Error> {
        let f = File::open(&path).await?;
        let metadata = f.metadata().await?;
        let len = metadata.len();
        let (devno, inode) = device_and_inode(&metadata);
        let mut reader = BufReader::new(f);

        let start = match read_from {
            ReadFrom::Checkpoint(pos) if pos <= len => pos,
            ReadFrom::Checkpoint(pos) => {
                debug!(
                    message = "Stored offset is beyond the end of the file; restarting from 0.",
                    ?path,
                    %pos,
                );
                0
            }
            ReadFrom::Beginning => 0,
        };
        let read_pos = reader.seek(SeekFrom::Start(start)).await?;

        Ok(FileWatcher {
            path,
            reader,
            read_pos,
            devno,
            inode,
            is_dead: false,
            max_line_bytes,
            discarding: false,
            buf: BytesMut::new(),
        })
    }

    /// Whether the file now at the watched path is a different inode than
    /// the one being read, which is how rename-and-recreate rotation shows
    /// up to a poller. The caller reacts as it would to a removal.
    pub fn replaced_by(&self, metadata: &std::fs::Metadata) -> bool {
        device_and_inode(metadata) != (self.devno, self.inode)
    }

    pub fn set_dead(&mut self) {
        self.is_dead = true;
    }

    pub fn dead(&self) -> bool {
        self.is_dead
    }

    /// Whether the underlying file has shrunk below the read cursor, which
    /// is how in-place truncation shows up. The caller reacts by discarding
    /// this watcher and its offset record.
    pub async fn truncated(&self) -> Result<bool, io::Error> {
        let len = self.reader.get_ref().metadata().await?.len();
        Ok(len < self.read_pos)
    }

    /// Read a single line from the underlying file.
    ///
    /// Returns `None` at the current end of file; the caller polls again
    /// once the file may have grown. Lines longer than `max_line_bytes` are
    /// discarded up to their newline.
    pub async fn read_line(&mut self) -> Result<Option<RawLine>, io::Error> {
        loop {
            let available = match self.reader.fill_buf().await {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.kind() == io::ErrorKind::NotFound {
                        self.set_dead();
                    }
                    return Err(e);
                }
            };
            if available.is_empty() {
                return Ok(None);
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let used = match newline {
                Some(i) => {
                    if !self.discarding {
                        self.buf.extend_from_slice(&available[..i]);
                    }
                    i + 1
                }
                None => {
                    if !self.discarding {
                        self.buf.extend_from_slice(available);
                    }
                    available.len()
                }
            };
            self.reader.consume(used);
            self.read_pos += used as u64;

            if !self.discarding && self.buf.len() > self.max_line_bytes {
                warn!(
                    message = "Found line that exceeds max_line_bytes; discarding.",
                    path = ?self.path,
                );
                self.discarding = true;
            }

            if newline.is_some() {
                if self.discarding {
                    self.discarding = false;
                    self.buf.clear();
                    continue;
                }
                return Ok(Some(RawLine {
                    end_position: self.read_pos,
                    bytes: self.buf.split().freeze(),
                }));
            }
        }
    }
}

#[cfg(unix)]
fn device_and_inode(metadata: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
fn device_and_inode(_metadata: &std::fs::Metadata) -> (u64, u64) {
    (0, 0)
}

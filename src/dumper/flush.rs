//! Draining sorted buffers into aggregated files.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use tokio::io::AsyncWriteExt;

use super::buffer::SortedBuffer;

/// What one flush pass took out of a buffer: the bytes to append and the
/// highest broker offset observed per (topic, partition).
#[derive(Debug, Default)]
pub(super) struct Drained {
    pub content: String,
    pub offsets: HashMap<(String, i32), i64>,
    pub taken: usize,
}

/// Pop records whose event time has aged past the buffer window, oldest
/// first, up to `length_cap` of them. With `drain_all` every record is due
/// regardless of age (shutdown drain).
pub(super) fn drain_due(
    buffer: &SortedBuffer,
    now_ms: i64,
    window_ms: i64,
    length_cap: usize,
    drain_all: bool,
) -> Drained {
    let mut drained = Drained::default();
    while drain_all || drained.taken < length_cap {
        let Some((_, item)) = buffer.pop_front_if(|t| drain_all || now_ms - t >= window_ms)
        else {
            break;
        };
        drained.content.push_str(&item.content);
        drained.taken += 1;
        drained
            .offsets
            .entry((item.topic, item.partition))
            .and_modify(|existing| *existing = (*existing).max(item.offset))
            .or_insert(item.offset);
    }
    drained
}

/// Append a whole write buffer to the output file, creating the file and
/// its parent directories as needed. Each call is a single write so a
/// record can never be split across failures.
pub(super) async fn append(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::super::buffer::{BufferItem, SortedBuffer};
    use super::{append, drain_due};

    const WINDOW_MS: i64 = 60_000;

    fn item(content: &str, partition: i32, offset: i64) -> BufferItem {
        BufferItem {
            content: content.to_owned(),
            topic: "web.v3".to_owned(),
            partition,
            offset,
        }
    }

    #[test]
    fn only_aged_records_are_taken() {
        let buffer = SortedBuffer::default();
        let now = 1_000_000;
        buffer.insert(now - WINDOW_MS, item("old\n", 0, 1));
        buffer.insert(now - 1_000, item("fresh\n", 0, 2));

        let drained = drain_due(&buffer, now, WINDOW_MS, 100, false);
        assert_eq!(drained.content, "old\n");
        assert_eq!(drained.taken, 1);
        assert_eq!(buffer.len(), 1, "fresh record stays buffered");
    }

    #[test]
    fn drains_in_ascending_event_time() {
        let buffer = SortedBuffer::default();
        let now = 1_000_000;
        // Arrival order is reversed; event time must win.
        buffer.insert(now - 70_000, item("later\n", 0, 2));
        buffer.insert(now - 80_000, item("earlier\n", 0, 1));

        let drained = drain_due(&buffer, now, WINDOW_MS, 100, false);
        assert_eq!(drained.content, "earlier\nlater\n");
    }

    #[test]
    fn length_cap_bounds_one_pass() {
        let buffer = SortedBuffer::default();
        let now = 1_000_000;
        for i in 0..10 {
            buffer.insert(now - WINDOW_MS - i, item(&format!("{i}\n"), 0, i));
        }
        let drained = drain_due(&buffer, now, WINDOW_MS, 4, false);
        assert_eq!(drained.taken, 4);
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn records_max_offset_per_partition() {
        let buffer = SortedBuffer::default();
        let now = 1_000_000;
        buffer.insert(now - 70_000, item("a\n", 0, 5));
        buffer.insert(now - 69_000, item("b\n", 0, 3));
        buffer.insert(now - 68_000, item("c\n", 1, 9));

        let drained = drain_due(&buffer, now, WINDOW_MS, 100, false);
        assert_eq!(
            drained.offsets.get(&("web.v3".to_owned(), 0)),
            Some(&5),
        );
        assert_eq!(
            drained.offsets.get(&("web.v3".to_owned(), 1)),
            Some(&9),
        );
    }

    #[test]
    fn drain_all_ignores_window_and_cap() {
        let buffer = SortedBuffer::default();
        let now = 1_000_000;
        for i in 0..5 {
            buffer.insert(now - i, item(&format!("{i}\n"), 0, i));
        }
        let drained = drain_due(&buffer, now, WINDOW_MS, 2, true);
        assert_eq!(drained.taken, 5);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn append_creates_parents_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web").join("access.log");

        append(&path, b"one [h1]\n").await.unwrap();
        append(&path, b"two [h2]\n").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "one [h1]\ntwo [h2]\n");
    }
}

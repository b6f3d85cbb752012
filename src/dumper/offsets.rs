//! Application-owned consumer offsets.
//!
//! One file per (topic, partition) under a bookkeeping directory inside the
//! output root, named `<topic>.<partition>.offset`, containing the highest
//! broker offset whose record has been durably written. Files are rewritten
//! whole on each persist tick.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use tracing::{debug, warn};

pub const OFFSETS_DIR_NAME: &str = "__dumper_offsets";
const OFFSET_FILE_EXT: &str = "offset";

/// Highest dumped broker offset per partition of one topic. Writers merge
/// with max semantics, so redelivered or reordered flushes can never move an
/// offset backwards.
#[derive(Debug, Clone)]
pub struct TopicOffsets {
    topic: String,
    partitions: Arc<DashMap<i32, i64>>,
}

impl TopicOffsets {
    pub fn new(topic: &str) -> TopicOffsets {
        TopicOffsets {
            topic: topic.to_owned(),
            partitions: Arc::new(DashMap::new()),
        }
    }

    /// Load persisted offsets for a topic from the bookkeeping directory.
    pub fn load(dir: &Path, topic: &str) -> TopicOffsets {
        let offsets = TopicOffsets::new(topic);
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return offsets,
            Err(error) => {
                warn!(message = "Unable to read offsets directory.", %error);
                return offsets;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(partition) = parse_offset_file_name(&path, topic) else {
                continue;
            };
            match fs::read_to_string(&path) {
                Ok(content) => match content.trim().parse::<i64>() {
                    Ok(offset) => {
                        debug!(
                            message = "Loaded stored offset.",
                            topic = %offsets.topic,
                            %partition,
                            %offset,
                        );
                        offsets.partitions.insert(partition, offset);
                    }
                    Err(error) => {
                        warn!(message = "Malformed offset file.", ?path, %error);
                    }
                },
                Err(error) => {
                    warn!(message = "Unable to read offset file.", ?path, %error);
                }
            }
        }
        offsets
    }

    pub fn get(&self, partition: i32) -> Option<i64> {
        self.partitions.get(&partition).map(|r| *r.value())
    }

    /// Record an offset, keeping the maximum of the existing and new values.
    pub fn max_merge(&self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .and_modify(|existing| *existing = (*existing).max(offset))
            .or_insert(offset);
    }

    pub fn partitions(&self) -> Vec<(i32, i64)> {
        self.partitions
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Rewrite the per-partition offset files. Zero entries are skipped;
    /// an offset of zero is indistinguishable from never-dumped.
    pub fn persist(&self, dir: &Path) {
        for (partition, offset) in self.partitions() {
            if offset == 0 {
                continue;
            }
            let path = offset_file_path(dir, &self.topic, partition);
            if let Err(error) = fs::write(&path, offset.to_string()) {
                warn!(message = "Unable to write offset file.", ?path, %error);
            }
        }
    }
}

pub fn offset_file_path(dir: &Path, topic: &str, partition: i32) -> PathBuf {
    dir.join(format!("{topic}.{partition}.{OFFSET_FILE_EXT}"))
}

/// Recover the partition number from `<topic>.<partition>.offset`, or `None`
/// when the file belongs to another topic.
fn parse_offset_file_name(path: &Path, topic: &str) -> Option<i32> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{OFFSET_FILE_EXT}"))?;
    let partition = stem.strip_prefix(&format!("{topic}."))?;
    partition.parse().ok()
}

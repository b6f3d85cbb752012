//! Per-output-file reordering buffer.
//!
//! Items sort by event time; equal timestamps keep their insertion order by
//! way of an explicit secondary sequence key, so no two items ever compare
//! equal and nothing is coalesced.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use dashmap::DashMap;

/// One buffered record, retaining where it came from so a flush can advance
/// the right broker offset.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferItem {
    pub content: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BufferKey {
    event_time_ms: i64,
    insert_seq: u64,
}

/// A time-sorted queue of records bound for one output file. Insert and
/// pop-front are safe to call from any task.
#[derive(Debug, Default)]
pub struct SortedBuffer {
    items: Mutex<BTreeMap<BufferKey, BufferItem>>,
    insert_seq: AtomicU64,
}

impl SortedBuffer {
    pub fn len(&self) -> usize {
        self.items.lock().expect("buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, event_time_ms: i64, item: BufferItem) {
        let key = BufferKey {
            event_time_ms,
            insert_seq: self.insert_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.items.lock().expect("buffer poisoned").insert(key, item);
    }

    /// Pop the oldest item only if its event time satisfies `due`. Checking
    /// and popping happen under one lock, so a concurrent insert cannot
    /// slip a non-due item into the pop.
    pub fn pop_front_if(&self, due: impl FnOnce(i64) -> bool) -> Option<(i64, BufferItem)> {
        let mut items = self.items.lock().expect("buffer poisoned");
        let (key, _) = items.first_key_value()?;
        if !due(key.event_time_ms) {
            return None;
        }
        items
            .pop_first()
            .map(|(key, item)| (key.event_time_ms, item))
    }
}

/// Registry of buffers keyed by output file path, as carried in the batch.
#[derive(Debug, Clone, Default)]
pub struct BufferMap {
    buffers: Arc<DashMap<String, Arc<SortedBuffer>>>,
}

impl BufferMap {
    pub fn new() -> BufferMap {
        BufferMap::default()
    }

    pub fn get_or_create(&self, path: &str) -> Arc<SortedBuffer> {
        Arc::clone(
            &self
                .buffers
                .entry(path.to_owned())
                .or_insert_with(|| Arc::new(SortedBuffer::default())),
        )
    }

    /// Snapshot of the current (path, buffer) pairs for a flush pass.
    pub fn entries(&self) -> Vec<(String, Arc<SortedBuffer>)> {
        self.buffers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}

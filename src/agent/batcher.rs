//! Record accumulation up to the batch byte cap.

use tail_source::{FilePosition, Record};

/// A batch ready to ship: its records in source order and the file offset
/// just past the last one, which becomes the committed offset once every
/// fragment of the batch is acknowledged.
#[derive(Debug, PartialEq)]
pub struct SealedBatch {
    pub records: Vec<String>,
    pub end_position: FilePosition,
}

/// Accumulates records until adding the next one would push the summed
/// record bytes past the cap. A single record larger than the cap still
/// ships as a batch of one; fragmentation handles the size downstream.
#[derive(Debug)]
pub struct Batcher {
    cap: usize,
    records: Vec<String>,
    bytes: usize,
    end_position: FilePosition,
}

impl Batcher {
    pub fn new(cap: usize) -> Batcher {
        Batcher {
            cap,
            records: Vec::new(),
            bytes: 0,
            end_position: 0,
        }
    }

    /// Add a record, returning the batch sealed before it when the record
    /// does not fit.
    pub fn push(&mut self, record: Record) -> Option<SealedBatch> {
        let sealed = if !self.records.is_empty() && self.bytes + record.text.len() > self.cap {
            self.take()
        } else {
            None
        };
        self.bytes += record.text.len();
        self.records.push(record.text);
        self.end_position = record.end_position;
        sealed
    }

    /// Seal and return whatever has accumulated. Called at the end of a
    /// read pass so records ship without waiting for a full batch.
    pub fn take(&mut self) -> Option<SealedBatch> {
        if self.records.is_empty() {
            return None;
        }
        self.bytes = 0;
        Some(SealedBatch {
            records: std::mem::take(&mut self.records),
            end_position: self.end_position,
        })
    }
}

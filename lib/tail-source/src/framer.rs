use std::sync::LazyLock;

use regex::Regex;

use crate::{watcher::RawLine, FilePosition};

/// A record header starts at a line that looks like the beginning of a log
/// statement: a bracketed level or date, a long leading number, a dotted-quad
/// address, or a `time=` prefix. Everything else is a continuation line.
static HEADER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\[[A-Za-z]+|\[\d{4,}|\d{4,}|\d+\.\d+\.\d+\.\d+|time=)")
        .expect("header pattern must compile")
});

/// One whole log record: a header line plus any continuation lines joined
/// with the newlines they arrived with. `end_position` is the file offset
/// just past the record's last line.
#[derive(Debug, PartialEq)]
pub struct Record {
    pub text: String,
    pub end_position: FilePosition,
}

/// Joins raw lines into multi-line records.
///
/// A line matching the header pattern finalizes the record buffered before
/// it and starts a new one; a non-matching line is appended to the buffered
/// record. The caller finalizes the trailing record with `finish` once a
/// read pass reaches the end of the file, so a record is never held back
/// waiting for the next header.
#[derive(Debug, Default)]
pub struct RecordFramer {
    pending: Option<Record>,
}

impl RecordFramer {
    pub fn new() -> RecordFramer {
        RecordFramer::default()
    }

    /// Feed one line. Returns the previous record when `line` starts a new
    /// one.
    pub fn push(&mut self, line: &RawLine) -> Option<Record> {
        let text = String::from_utf8_lossy(&line.bytes);

        if HEADER_PATTERN.is_match(&text) {
            let done = self.pending.take();
            self.pending = Some(Record {
                text: text.into_owned(),
                end_position: line.end_position,
            });
            return done;
        }

        match self.pending.as_mut() {
            Some(record) => {
                record.text.push('\n');
                record.text.push_str(&text);
                record.end_position = line.end_position;
            }
            // A continuation with nothing to continue (e.g. the watcher
            // started mid-record); carry it as a record of its own so no
            // bytes are dropped.
            None => {
                self.pending = Some(Record {
                    text: text.into_owned(),
                    end_position: line.end_position,
                });
            }
        }
        None
    }

    /// Finalize and return the buffered record, if any. Called at the end
    /// of a read pass.
    pub fn finish(&mut self) -> Option<Record> {
        self.pending.take()
    }
}

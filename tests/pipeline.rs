//! End-to-end exercises of the record path that need no broker: tailing
//! and framing on the agent side, the wire codec in the middle, and the
//! offset-store recovery contract.

use std::io::Write;

use similar_asserts::assert_eq;
use tempfile::tempdir;

use logship::wire::{assemble, fragment, Batch, PacketIds};
use tail_source::{FileWatcher, OffsetStore, ReadFrom, Record, RecordFramer};

const MAX_LINE_BYTES: usize = 1024 * 1024;

async fn read_records(watcher: &mut FileWatcher) -> Vec<Record> {
    let mut framer = RecordFramer::new();
    let mut records = Vec::new();
    while let Some(line) = watcher.read_line().await.unwrap() {
        records.extend(framer.push(&line));
    }
    records.extend(framer.finish());
    records
}

/// A single small batch travels file → records → packets → batch intact,
/// and the dumper-side line format appends the host in brackets.
#[tokio::test]
async fn single_small_batch_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("access.log");
    std::fs::write(&path, "2024-01-01 00:00:01 INFO hello\n").unwrap();

    let mut watcher = FileWatcher::new(path.clone(), ReadFrom::Beginning, MAX_LINE_BYTES)
        .await
        .unwrap();
    let records = read_records(&mut watcher).await;
    assert_eq!(records.len(), 1);

    let batch = Batch {
        path: path.to_string_lossy().into_owned(),
        msgs: records.into_iter().map(|r| r.text).collect(),
        time: "2024-01-01 00:00:02".to_owned(),
        host: "h1".to_owned(),
    };
    let packets = fragment(&batch, PacketIds::new().next(), 10 * 1024).unwrap();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].total, 1);

    let decoded = assemble(packets.iter().map(|p| p.msg.as_slice())).unwrap();
    assert_eq!(decoded, batch);

    let line = format!(
        "{} [{}]\n",
        decoded.msgs[0].trim_end_matches(['\r', '\n']),
        decoded.host,
    );
    assert_eq!(line, "2024-01-01 00:00:01 INFO hello [h1]\n");
}

/// Fragments arrive out of order; ordering the payloads by seq still
/// reproduces the batch.
#[test]
fn fragmented_batch_reassembles_out_of_order() {
    let batch = Batch {
        path: "/var/log/apps/web/access.log".to_owned(),
        msgs: vec!["2024-01-01 00:00:01 INFO hello".to_owned(); 40],
        time: "2024-01-01 00:00:02".to_owned(),
        host: "h1".to_owned(),
    };
    let mut packets = fragment(&batch, 7, 100).unwrap();
    assert!(packets.len() > 2, "batch must actually fragment");

    packets.reverse();
    packets.sort_by_key(|p| p.seq);
    let decoded = assemble(packets.iter().map(|p| p.msg.as_slice())).unwrap();
    assert_eq!(decoded, batch);
}

/// Stack traces join their header line; the framed records cover the file
/// bytes exactly.
#[tokio::test]
async fn multi_line_records_join_and_cover_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    let segment = "2024-01-01 00:00:01 ERROR oops\n  at stack line\n2024-01-01 00:00:02 INFO next\n";
    std::fs::write(&path, segment).unwrap();

    let mut watcher = FileWatcher::new(path, ReadFrom::Beginning, MAX_LINE_BYTES)
        .await
        .unwrap();
    let records = read_records(&mut watcher).await;

    assert_eq!(
        records.iter().map(|r| r.text.as_str()).collect::<Vec<_>>(),
        vec![
            "2024-01-01 00:00:01 ERROR oops\n  at stack line",
            "2024-01-01 00:00:02 INFO next",
        ],
    );
    assert_eq!(records.last().unwrap().end_position, segment.len() as u64);
}

/// Kill-and-restart: everything before the committed offset was already
/// shipped; a fresh watcher seeded from the store re-reads exactly the
/// rest.
#[tokio::test]
async fn restart_resumes_from_committed_offset() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    let offset_file = dir.path().join("offsets.json");
    std::fs::write(&path, "[INFO] one\n[INFO] two\n").unwrap();

    // First life: read one record, commit, "crash".
    {
        let store = OffsetStore::new(&offset_file);
        let mut watcher = FileWatcher::new(path.clone(), ReadFrom::Beginning, MAX_LINE_BYTES)
            .await
            .unwrap();
        let mut framer = RecordFramer::new();
        let first = loop {
            let line = watcher.read_line().await.unwrap().unwrap();
            if let Some(record) = framer.push(&line) {
                break record;
            }
        };
        assert_eq!(first.text, "[INFO] one");
        store.view().update(&path, first.end_position);
        store.write_offsets().unwrap();
    }

    // More lines land while nobody watches.
    let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(b"[INFO] three\n").unwrap();
    drop(f);

    // Second life: resume from the store.
    {
        let mut store = OffsetStore::new(&offset_file);
        store.read_offsets();
        let committed = store.view().get(&path).unwrap();
        let mut watcher = FileWatcher::new(path, ReadFrom::Checkpoint(committed), MAX_LINE_BYTES)
            .await
            .unwrap();
        let records = read_records(&mut watcher).await;
        assert_eq!(
            records.iter().map(|r| r.text.as_str()).collect::<Vec<_>>(),
            vec!["[INFO] two", "[INFO] three"],
        );
    }
}

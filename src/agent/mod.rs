//! The agent stage: tails log files under the watched root, frames
//! multi-line records, batches and fragments them, and publishes to the
//! broker with durable per-file progress.
//!
//! Delivery contract: the committed offset of a file advances only after
//! every fragment of the batch covering those bytes has been acknowledged
//! by the broker. Restart replays from the last committed offset, so
//! records are never lost and may be duplicated (at-least-once).

mod batcher;

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
    time::Duration,
};

use chrono::Local;
use dashmap::DashMap;
use rdkafka::{
    error::KafkaError,
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use regex::Regex;
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use tail_source::{
    FileWatcher, OffsetStore, OffsetsView, ReadFrom, RecordFramer, Scanner, OFFSET_FILE_NAME,
};

use crate::{cli::AgentOpts, kafka, path_lock::PathLocks, signal, wire};

use self::batcher::{Batcher, SealedBatch};

const OFFSET_SAVE_INTERVAL: Duration = Duration::from_secs(1);
const READ_IDLE_INTERVAL: Duration = Duration::from_secs(1);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Container runtimes mount application log directories under an
/// `empty-dir/log` volume; the path segment after it names the app.
static TOPIC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".+kubernetes\.io~empty-dir/log.*?/(.+?)/.+").expect("topic pattern must compile")
});

#[derive(Debug, Snafu)]
pub enum AgentError {
    #[snafu(display("KAFKA_ADDR must be set to the broker bootstrap address"))]
    MissingBrokerAddress,
    #[snafu(display("Log root {} is not a directory", path.display()))]
    MissingLogRoot { path: PathBuf },
    #[snafu(display("Log root is not expressible as a scan pattern"))]
    UnusableScanPattern,
    #[snafu(display("Could not create Kafka producer: {source}"))]
    CreateProducer { source: KafkaError },
    #[snafu(display("Could not resolve hostname: {source}"))]
    ResolveHostname { source: io::Error },
}

struct Context {
    topic_suffix: String,
    send_max_size: usize,
    hostname: String,
    offsets: Arc<OffsetsView>,
    locks: PathLocks,
    producer: FutureProducer,
    packet_ids: wire::PacketIds,
    /// Paths with a live tail task; one read loop per path.
    active: DashMap<PathBuf, ()>,
    shutdown: watch::Receiver<bool>,
}

pub async fn run(opts: AgentOpts) -> Result<(), AgentError> {
    let brokers = opts
        .kafka_addr
        .clone()
        .filter(|addr| !addr.is_empty())
        .ok_or(AgentError::MissingBrokerAddress)?;

    if !opts.log_path.is_dir() {
        return Err(AgentError::MissingLogRoot {
            path: opts.log_path.clone(),
        });
    }

    let hostname = hostname::get()
        .context(ResolveHostnameSnafu)?
        .to_string_lossy()
        .into_owned();

    let offset_file_path = opts
        .offset_file_path
        .clone()
        .unwrap_or_else(|| opts.log_path.join(OFFSET_FILE_NAME));

    // The pipeline must never ship its own bookkeeping files.
    let mut offset_tmp = offset_file_path.clone().into_os_string();
    offset_tmp.push(".new");
    let exclude = vec![
        offset_file_path.clone(),
        PathBuf::from(offset_tmp),
        opts.log_path.join(crate::dumper::OFFSETS_DIR_NAME).join("**"),
    ];
    let scanner = Scanner::new(&opts.log_path, &exclude).ok_or(AgentError::UnusableScanPattern)?;

    let mut store = OffsetStore::new(&offset_file_path);
    store.read_offsets();
    let store = Arc::new(store);

    let producer: FutureProducer = kafka::producer_config(&brokers)
        .create()
        .context(CreateProducerSnafu)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(Context {
        topic_suffix: opts.topic_suffix.clone(),
        send_max_size: opts.send_max_size.max(1),
        hostname,
        offsets: store.view(),
        locks: PathLocks::new(),
        producer,
        packet_ids: wire::PacketIds::new(),
        active: DashMap::new(),
        shutdown: shutdown_rx,
    });

    info!(
        message = "Agent starting.",
        log_path = ?opts.log_path,
        offset_file = ?offset_file_path,
        host = %ctx.hostname,
    );

    tokio::spawn(persist_loop(Arc::clone(&store), ctx.shutdown.clone()));

    let shutdown = signal::shutdown_signal();
    tokio::pin!(shutdown);
    let mut scan = tokio::time::interval(Duration::from_secs(opts.scan_interval.max(1)));
    loop {
        tokio::select! {
            _ = scan.tick() => {
                let found = scanner.scan().into_iter().collect::<HashSet<_>>();
                for path in &found {
                    if ctx.active.contains_key(path) {
                        continue;
                    }
                    ctx.active.insert(path.clone(), ());
                    tokio::spawn(tail_file(Arc::clone(&ctx), path.clone()));
                }
                // Stored offsets for files that vanished while unwatched
                // (e.g. across an agent restart) age out of the store.
                for stale in ctx.offsets.paths() {
                    if !ctx.active.contains_key(&stale) && !found.contains(&stale) {
                        ctx.offsets.set_dead(&stale);
                    }
                }
            }
            _ = &mut shutdown => break,
        }
    }

    info!(message = "Shutting down; persisting offsets.");
    let _ = shutdown_tx.send(true);
    if let Err(error) = store.write_offsets() {
        error!(message = "Unable to persist offsets on shutdown.", %error);
    }
    Ok(())
}

/// Serialize the committed offsets once per second.
async fn persist_loop(store: Arc<OffsetStore>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(OFFSET_SAVE_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(error) = store.write_offsets() {
                    warn!(message = "Unable to write offset file.", %error);
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// The per-file read loop: read to EOF, frame records, ship batches, then
/// idle until the file grows. Exits when the file is removed, renamed, or
/// truncated; the discovery scan re-creates the loop as needed.
async fn tail_file(ctx: Arc<Context>, path: PathBuf) {
    let lock_name = path.to_string_lossy().into_owned();
    let Some(_guard) = ctx.locks.try_lock(&lock_name) else {
        ctx.active.remove(&path);
        return;
    };

    let read_from = ctx
        .offsets
        .get(&path)
        .map(ReadFrom::Checkpoint)
        .unwrap_or(ReadFrom::Beginning);
    let mut watcher = match FileWatcher::new(path.clone(), read_from, MAX_LINE_BYTES).await {
        Ok(watcher) => watcher,
        Err(error) => {
            warn!(message = "Unable to open file; retrying on next scan.", ?path, %error);
            ctx.active.remove(&path);
            return;
        }
    };
    info!(message = "Watching file.", ?path, ?read_from);

    let topic = derive_topic(&path, &ctx.topic_suffix);
    let mut shutdown = ctx.shutdown.clone();

    loop {
        // One pass from the current position to EOF.
        let mut framer = RecordFramer::new();
        let mut batcher = Batcher::new(ctx.send_max_size);
        loop {
            match watcher.read_line().await {
                Ok(Some(line)) => {
                    if let Some(record) = framer.push(&line) {
                        if let Some(batch) = batcher.push(record) {
                            publish(&ctx, &topic, &path, batch).await;
                        }
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(message = "Error reading file.", ?path, %error);
                    break;
                }
            }
        }
        if let Some(record) = framer.finish() {
            if let Some(batch) = batcher.push(record) {
                publish(&ctx, &topic, &path, batch).await;
            }
        }
        if let Some(batch) = batcher.take() {
            publish(&ctx, &topic, &path, batch).await;
        }

        if watcher.dead() {
            info!(message = "File is gone; dropping watcher.", ?path);
            ctx.offsets.reset(&path);
            ctx.active.remove(&path);
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(READ_IDLE_INTERVAL) => {}
            _ = shutdown.changed() => {
                ctx.active.remove(&path);
                return;
            }
        }

        match tokio::fs::metadata(&path).await {
            Ok(meta) if watcher.replaced_by(&meta) => {
                info!(message = "File replaced under its path; restarting from 0.", ?path);
                ctx.offsets.reset(&path);
                ctx.active.remove(&path);
                return;
            }
            Ok(_) => match watcher.truncated().await {
                Ok(true) => {
                    info!(message = "File truncated; restarting from 0.", ?path);
                    ctx.offsets.reset(&path);
                    ctx.active.remove(&path);
                    return;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(message = "Unable to stat watched file.", ?path, %error);
                }
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                // An observed rename or removal discards the record; a
                // rotated file re-enters through the next scan from 0.
                info!(message = "File removed or renamed; dropping watcher.", ?path);
                ctx.offsets.reset(&path);
                ctx.active.remove(&path);
                return;
            }
            Err(error) => {
                warn!(message = "Unable to stat watched file.", ?path, %error);
            }
        }
    }
}

/// Ship one sealed batch: encode, fragment, send every packet synchronously
/// with indefinite 1 s-backoff retry, then commit the file offset.
async fn publish(ctx: &Context, topic: &str, path: &Path, batch: SealedBatch) {
    let end_position = batch.end_position;
    let wire_batch = wire::Batch {
        path: path.to_string_lossy().into_owned(),
        msgs: batch.records,
        time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        host: ctx.hostname.clone(),
    };

    // An encode failure is a bug signal; the loop holds position until it
    // clears rather than dropping data.
    let packets = loop {
        match wire::fragment(&wire_batch, ctx.packet_ids.next(), ctx.send_max_size) {
            Ok(packets) => break packets,
            Err(error) => {
                error!(message = "Unable to encode batch.", ?path, %error);
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    };

    let total = packets.len();
    for packet in packets {
        let bytes = loop {
            match packet.to_bytes() {
                Ok(bytes) => break bytes,
                Err(error) => {
                    error!(message = "Unable to encode packet.", ?path, %error);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        };
        loop {
            let record = FutureRecord::<(), Vec<u8>>::to(topic).payload(&bytes);
            match ctx.producer.send(record, Timeout::Never).await {
                Ok(_) => break,
                Err((error, _)) => {
                    warn!(message = "Broker send failed; retrying.", %topic, ?path, %error);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    // Every fragment is acknowledged; the bytes are the broker's problem
    // now.
    ctx.offsets.update(path, end_position);
    debug!(
        message = "Published batch.",
        %topic,
        ?path,
        packets = total,
        committed = end_position,
    );
}

/// Topic for a file: the app segment of a container log mount, or the
/// parent directory name, with the configured suffix appended.
fn derive_topic(path: &Path, suffix: &str) -> String {
    let text = path.to_string_lossy();
    let app = TOPIC_PATTERN
        .captures(&text)
        .and_then(|captures| captures.get(1))
        .map(|app| app.as_str().to_owned())
        .or_else(|| {
            path.parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "unknown".to_owned());
    format!("{app}{suffix}")
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use similar_asserts::assert_eq;

    use super::derive_topic;

    #[test]
    fn topic_from_container_mount_path() {
        let path = Path::new(
            "/var/lib/kubelet/pods/7d/volumes/kubernetes.io~empty-dir/log-volume/web/access.log",
        );
        assert_eq!(derive_topic(path, ".v3"), "web.v3");
    }

    #[test]
    fn topic_falls_back_to_parent_directory() {
        assert_eq!(
            derive_topic(Path::new("/var/log/apps/billing/app.log"), ".v3"),
            "billing.v3",
        );
    }
}

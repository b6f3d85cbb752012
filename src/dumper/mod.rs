//! The dumper stage: consumes broker partitions for a dynamically
//! discovered set of topics, reassembles fragmented batches, buffers
//! records in per-output-file time-sorted queues, and appends them to
//! aggregated log files in event-time order.
//!
//! Crash-safety contract: a broker offset becomes durable only after the
//! records it covers have been appended to the output file. Replay after a
//! crash re-emits at most the records written since the last offset-file
//! rewrite (at-least-once).

mod buffer;
mod event_time;
mod flush;
mod fragments;
mod offsets;

use std::{
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use dashmap::DashMap;
use rdkafka::{
    consumer::{BaseConsumer, Consumer, StreamConsumer},
    error::KafkaError,
    Message, Offset, TopicPartitionList,
};
use snafu::{ResultExt, Snafu};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::{
    cli::DumperOpts,
    kafka,
    path_lock::PathLocks,
    signal,
    wire::{Batch, Packet},
};

use self::buffer::{BufferItem, BufferMap, SortedBuffer};
use self::fragments::{FragmentCache, FRAGMENT_TTL};
use self::offsets::TopicOffsets;

pub use self::offsets::OFFSETS_DIR_NAME;

const TOPIC_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const FRAGMENT_PURGE_INTERVAL: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum DumperError {
    #[snafu(display("KAFKA_ADDR must be set to the broker bootstrap address"))]
    MissingBrokerAddress,
    #[snafu(display("Could not create offsets directory {}: {source}", path.display()))]
    CreateOffsetsDir { path: PathBuf, source: io::Error },
    #[snafu(display("Could not create Kafka consumer: {source}"))]
    CreateConsumer { source: KafkaError },
}

struct Context {
    brokers: String,
    dry_run: bool,
    topic_suffix: String,
    offsets_dir: PathBuf,
    save_interval: Duration,
    window_ms: i64,
    buffer_length: usize,
    buffers: BufferMap,
    topics: DashMap<String, TopicOffsets>,
    fragments: FragmentCache,
    locks: PathLocks,
    handler_slots: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

pub async fn run(opts: DumperOpts) -> Result<(), DumperError> {
    let brokers = opts
        .kafka_addr
        .clone()
        .filter(|addr| !addr.is_empty())
        .ok_or(DumperError::MissingBrokerAddress)?;

    let offsets_dir = opts.log_path.join(OFFSETS_DIR_NAME);
    std::fs::create_dir_all(&offsets_dir).context(CreateOffsetsDirSnafu {
        path: offsets_dir.clone(),
    })?;

    let admin: Arc<BaseConsumer> = Arc::new(
        kafka::consumer_config(&brokers, opts.runtime.dry_run)
            .create()
            .context(CreateConsumerSnafu)?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(Context {
        brokers,
        dry_run: opts.runtime.dry_run,
        topic_suffix: opts.topic_suffix.clone(),
        offsets_dir,
        save_interval: Duration::from_secs(opts.save_interval.max(1)),
        window_ms: opts.buffer_time as i64 * 1000,
        buffer_length: opts.buffer_length.max(1),
        buffers: BufferMap::new(),
        topics: DashMap::new(),
        fragments: FragmentCache::new(),
        locks: PathLocks::new(),
        handler_slots: Arc::new(Semaphore::new(opts.handler_size.max(1))),
        shutdown: shutdown_rx,
    });

    info!(
        message = "Dumper starting.",
        log_path = ?opts.log_path,
        topic_suffix = %ctx.topic_suffix,
    );

    tokio::spawn(flush_loop(Arc::clone(&ctx)));
    tokio::spawn(purge_loop(Arc::clone(&ctx)));

    let shutdown = signal::shutdown_signal();
    tokio::pin!(shutdown);
    let mut check = tokio::time::interval(TOPIC_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = check.tick() => discover_topics(&ctx, &admin).await,
            _ = &mut shutdown => break,
        }
    }

    info!(message = "Shutting down; draining buffers and persisting offsets.");
    let _ = shutdown_tx.send(true);
    drain_all(&ctx).await;
    persist_offsets(&ctx);
    Ok(())
}

/// List broker topics and start a consumer task for each new one matching
/// the configured suffix.
async fn discover_topics(ctx: &Arc<Context>, admin: &Arc<BaseConsumer>) {
    let admin = Arc::clone(admin);
    let names = tokio::task::spawn_blocking(move || {
        admin.fetch_metadata(None, METADATA_TIMEOUT).map(|metadata| {
            metadata
                .topics()
                .iter()
                .map(|topic| topic.name().to_owned())
                .collect::<Vec<_>>()
        })
    })
    .await;

    let names = match names {
        Ok(Ok(names)) => names,
        Ok(Err(error)) => {
            warn!(message = "Unable to list broker topics.", %error);
            return;
        }
        Err(error) => {
            warn!(message = "Topic listing task failed.", %error);
            return;
        }
    };

    for name in names {
        if !name.ends_with(&ctx.topic_suffix) || ctx.topics.contains_key(&name) {
            continue;
        }
        info!(message = "Adding topic handler.", topic = %name);
        ctx.topics
            .insert(name.clone(), TopicOffsets::load(&ctx.offsets_dir, &name));
        tokio::spawn(consumer_task(Arc::clone(ctx), name));
    }
}

async fn consumer_task(ctx: Arc<Context>, topic: String) {
    if let Err(error) = consume_topic(&ctx, &topic).await {
        warn!(message = "Consumer task exited.", %topic, %error);
    }
    // Release the mapping; the next discovery pass reopens the topic.
    ctx.topics.remove(&topic);
}

async fn consume_topic(ctx: &Arc<Context>, topic: &str) -> Result<(), KafkaError> {
    let consumer: StreamConsumer = kafka::consumer_config(&ctx.brokers, ctx.dry_run).create()?;
    let Some(offsets) = ctx.topics.get(topic).map(|entry| entry.value().clone()) else {
        return Ok(());
    };

    // Resume every partition from just past the stored offset. Partitions
    // never dumped before start from the beginning.
    let metadata = consumer.fetch_metadata(Some(topic), METADATA_TIMEOUT)?;
    let mut assignment = TopicPartitionList::new();
    for topic_metadata in metadata.topics() {
        if topic_metadata.name() != topic {
            continue;
        }
        for partition in topic_metadata.partitions() {
            let start = match offsets.get(partition.id()) {
                Some(stored) => {
                    debug!(
                        message = "Seeking partition past stored offset.",
                        %topic,
                        partition = partition.id(),
                        %stored,
                    );
                    Offset::Offset(stored + 1)
                }
                None => Offset::Beginning,
            };
            assignment.add_partition_offset(topic, partition.id(), start)?;
        }
    }
    consumer.assign(&assignment)?;

    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            received = consumer.recv() => {
                let msg = received?;
                let partition = msg.partition();
                let offset = msg.offset();

                // Redelivery below the stored offset happens after a seek;
                // the record is already on disk.
                if offset <= offsets.get(partition).unwrap_or(i64::MIN) {
                    debug!(message = "Skipping redelivered message.", %topic, %partition, %offset);
                    continue;
                }

                let payload = msg.payload().map(<[u8]>::to_vec).unwrap_or_default();
                let Ok(permit) = Arc::clone(&ctx.handler_slots).acquire_owned().await else {
                    return Ok(());
                };
                let ctx = Arc::clone(ctx);
                let offsets = offsets.clone();
                let topic = topic.to_owned();
                tokio::spawn(async move {
                    handle_message(&ctx, &offsets, &topic, partition, offset, payload).await;
                    drop(permit);
                });
            }
        }
    }
}

/// Decode one broker message into records, waiting for sibling fragments
/// when the batch was split.
///
/// Poison payloads and reassembly timeouts advance the offset anyway so the
/// partition keeps flowing.
async fn handle_message(
    ctx: &Context,
    offsets: &TopicOffsets,
    topic: &str,
    partition: i32,
    offset: i64,
    payload: Vec<u8>,
) {
    let packet = match Packet::from_bytes(&payload) {
        Ok(packet) => packet,
        Err(error) => {
            warn!(message = "Undecodable packet; dropping.", %topic, %partition, %offset, %error);
            offsets.max_merge(partition, offset);
            return;
        }
    };

    if packet.total == 0 || packet.seq == 0 || packet.seq > packet.total {
        warn!(
            message = "Invalid packet envelope; dropping.",
            %topic, %partition, %offset, id = %packet.id, seq = %packet.seq, total = %packet.total,
        );
        offsets.max_merge(partition, offset);
        return;
    }

    let batch_bytes = if packet.total == 1 {
        packet.msg
    } else if packet.seq < packet.total {
        // A non-final fragment just waits in the cache; its offset is
        // covered by the max-merge of the batch's final fragment.
        ctx.fragments.insert(packet.id, packet.seq, packet.msg);
        return;
    } else {
        let started = Instant::now();
        loop {
            if let Some(parts) = ctx.fragments.collect(packet.id, packet.total) {
                let mut bytes = parts.concat();
                bytes.extend_from_slice(&packet.msg);
                break bytes;
            }
            if started.elapsed() >= FRAGMENT_TTL {
                warn!(
                    message = "Incomplete batch; dropping.",
                    %topic, %partition, %offset, id = %packet.id, total = %packet.total,
                );
                offsets.max_merge(partition, offset);
                return;
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    };

    match Batch::from_bytes(&batch_bytes) {
        Ok(batch) => disperse(ctx, batch, topic, partition, offset).await,
        Err(error) => {
            warn!(message = "Undecodable batch; dropping.", %topic, %partition, %offset, id = %packet.id, %error);
            offsets.max_merge(partition, offset);
        }
    }
    ctx.fragments.remove_id(packet.id, packet.total);
}

/// Spread a batch's records into the sorted buffer of its output file.
/// Blocks (sleep-poll) while the buffer is at its length cap.
async fn disperse(ctx: &Context, batch: Batch, topic: &str, partition: i32, offset: i64) {
    let buffer = ctx.buffers.get_or_create(&batch.path);

    while buffer.len() >= ctx.buffer_length {
        debug!(
            message = "Buffer at capacity; waiting for flush.",
            path = %batch.path,
            len = buffer.len(),
        );
        tokio::time::sleep(RETRY_BACKOFF).await;
    }

    let now_ms = Utc::now().timestamp_millis();
    for msg in &batch.msgs {
        let event_time_ms = match event_time::extract_event_time_ms(msg) {
            Some(ms) => ms,
            None => {
                debug!(message = "No event time in record; using now.", path = %batch.path);
                now_ms
            }
        };
        let content = format!("{} [{}]\n", msg.trim_end_matches(['\r', '\n']), batch.host);
        buffer.insert(
            event_time_ms,
            BufferItem {
                content,
                topic: topic.to_owned(),
                partition,
                offset,
            },
        );
    }
}

/// Periodic flush of every buffer, one task per buffer per tick, followed
/// by an offset-file rewrite.
async fn flush_loop(ctx: Arc<Context>) {
    let mut shutdown = ctx.shutdown.clone();
    let mut tick = tokio::time::interval(ctx.save_interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }
        for (path, buffer) in ctx.buffers.entries() {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                let Some(_guard) = ctx.locks.try_lock(&path) else {
                    debug!(message = "Flush already running for path; skipping.", %path);
                    return;
                };
                flush_locked(&ctx, &path, &buffer, false).await;
            });
        }
        persist_offsets(&ctx);
    }
}

/// Drain due records and append them, holding the per-path lock. Appends
/// retry forever; buffered data is never dropped on I/O errors.
async fn flush_locked(ctx: &Context, path: &str, buffer: &SortedBuffer, drain_all: bool) {
    let now_ms = Utc::now().timestamp_millis();
    let drained = flush::drain_due(buffer, now_ms, ctx.window_ms, ctx.buffer_length, drain_all);
    if drained.content.is_empty() {
        return;
    }

    loop {
        match flush::append(std::path::Path::new(path), drained.content.as_bytes()).await {
            Ok(()) => break,
            Err(error) => {
                warn!(message = "Unable to append to output file; retrying.", %path, %error);
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }

    // The write is durable; only now may the broker offsets move.
    for ((topic, partition), offset) in &drained.offsets {
        match ctx.topics.get(topic) {
            Some(entry) => entry.max_merge(*partition, *offset),
            None => debug!(message = "Topic released before offset merge.", %topic),
        }
    }

    debug!(
        message = "Flushed records.",
        %path,
        records = drained.taken,
        bytes = drained.content.len(),
        remaining = buffer.len(),
    );
}

fn persist_offsets(ctx: &Context) {
    let all = ctx
        .topics
        .iter()
        .map(|entry| entry.value().clone())
        .collect::<Vec<_>>();
    for offsets in all {
        offsets.persist(&ctx.offsets_dir);
    }
}

/// Shutdown drain: every buffer is written out regardless of the window,
/// waiting for (rather than skipping past) per-path locks.
async fn drain_all(ctx: &Arc<Context>) {
    for (path, buffer) in ctx.buffers.entries() {
        loop {
            if let Some(_guard) = ctx.locks.try_lock(&path) {
                flush_locked(ctx, &path, &buffer, true).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn purge_loop(ctx: Arc<Context>) {
    let mut shutdown = ctx.shutdown.clone();
    let mut tick = tokio::time::interval(FRAGMENT_PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => ctx.fragments.remove_expired(),
            _ = shutdown.changed() => return,
        }
    }
}

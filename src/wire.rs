//! The on-the-wire envelope shared by the agent and the dumper.
//!
//! A sealed [`Batch`] is JSON-encoded and carried as one or more [`Packet`]s,
//! each small enough for a single broker message. Concatenating the payloads
//! of one `id` in ascending `seq` order yields the encoded batch again.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A group of whole log records from a single file, carried as one logical
/// broker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Absolute path of the source log file; also names the output file.
    pub path: String,
    /// Log records, in source order, newlines of multi-line records intact.
    pub msgs: Vec<String>,
    /// Collection timestamp at the agent.
    pub time: String,
    /// Host the agent runs on.
    pub host: String,
}

/// A broker-message-sized slice of an encoded [`Batch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub id: i64,
    pub seq: u32,
    pub total: u32,
    #[serde(with = "base64_bytes")]
    pub msg: Vec<u8>,
}

impl Batch {
    pub fn from_bytes(bytes: &[u8]) -> Result<Batch, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl Packet {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Packet, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Encode a batch and split it into packets of at most `cap` payload bytes.
///
/// A batch that fits in `cap` bytes produces exactly one packet; `cap + 1`
/// bytes produce two, the second non-empty.
pub fn fragment(batch: &Batch, id: i64, cap: usize) -> Result<Vec<Packet>, serde_json::Error> {
    let bytes = serde_json::to_vec(batch)?;
    let total = bytes.len().div_ceil(cap).max(1) as u32;
    Ok(bytes
        .chunks(cap)
        .enumerate()
        .map(|(i, chunk)| Packet {
            id,
            seq: i as u32 + 1,
            total,
            msg: chunk.to_vec(),
        })
        .collect())
}

/// Concatenate fragment payloads, already ordered by ascending `seq`, and
/// decode the batch they carry.
pub fn assemble<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> Result<Batch, serde_json::Error> {
    let mut bytes = Vec::new();
    for payload in payloads {
        bytes.extend_from_slice(payload);
    }
    Batch::from_bytes(&bytes)
}

/// Source of batch identifiers: the nanosecond clock, forced strictly
/// monotonic so two batches sealed within the same clock tick still get
/// distinct ids.
#[derive(Debug, Default)]
pub struct PacketIds {
    last: AtomicI64,
}

impl PacketIds {
    pub fn new() -> PacketIds {
        PacketIds::default()
    }

    pub fn next(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }
}

mod base64_bytes {
    use base64::prelude::{Engine as _, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        BASE64_STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

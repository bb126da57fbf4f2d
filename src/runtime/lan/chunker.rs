//! Fragmentation and reassembly of content too large for one datagram.
//!
//! The sender cuts the UTF-8 bytes of the content into contiguous slices of
//! at most `chunk_size` bytes and base64-encodes each one. The receiver keeps
//! one [`ReassemblyBuffer`] per `message_id` until every index has arrived,
//! the buffer goes quiet for longer than the reassembly timeout, or the
//! fragments contradict each other.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use uuid::Uuid;

use super::protocol::{ChunkFragment, MessageHeader};

/// Fragments per message above which a transmission is refused (sender) or
/// discarded (receiver). With the default chunk size this caps a message at
/// roughly 30 MB.
pub const MAX_TOTAL_CHUNKS: u32 = 1024;

/// How many partially received messages are kept at once. When a new
/// message arrives beyond this, the buffer that has been idle longest goes.
pub const MAX_PENDING_MESSAGES: usize = 32;

/// Decoded bytes held across all partial messages. Enough for one message
/// at the largest chunk size; beyond it the longest-idle buffers go first.
pub const MAX_PENDING_BYTES: usize = 64 * 1024 * 1024;

/// Default idle time after which a partial message is abandoned.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of fragments needed for `len` bytes.
pub fn fragment_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

/// Split `content` into fragments sharing one fresh message id.
pub fn split_into_fragments(
    content: &str,
    chunk_size: usize,
    header: &MessageHeader,
) -> Vec<ChunkFragment> {
    let bytes = content.as_bytes();
    let total_chunks = fragment_count(bytes.len(), chunk_size) as u32;
    let message_id = Uuid::new_v4().to_string();

    bytes
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(index, slice)| ChunkFragment {
            header: header.clone(),
            message_id: message_id.clone(),
            chunk_index: index as u32,
            total_chunks,
            payload_base64: STANDARD.encode(slice),
        })
        .collect()
}

/// A message whose fragments have all arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    /// Header of the fragment that completed the message.
    pub header: MessageHeader,
    pub content: String,
}

struct ReassemblyBuffer {
    total_chunks: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    bytes: usize,
    last_activity: Instant,
}

/// Receive-side reassembly state, keyed by `message_id`.
///
/// Owned by a single listener task, so no locking is involved.
pub struct Reassembler {
    pending: HashMap<String, ReassemblyBuffer>,
    pending_bytes: usize,
    max_pending_bytes: usize,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            pending_bytes: 0,
            max_pending_bytes: MAX_PENDING_BYTES,
            timeout,
        }
    }

    /// Replace the [`MAX_PENDING_BYTES`] ceiling.
    pub fn with_byte_limit(mut self, max_pending_bytes: usize) -> Self {
        self.max_pending_bytes = max_pending_bytes;
        self
    }

    /// Store `fragment` and return the full content once every index for its
    /// message is present. The buffer is removed in the same step.
    ///
    /// A repeated index overwrites the stored slice. A fragment whose
    /// `total_chunks` disagrees with the buffer, or whose payload is not valid
    /// base64, discards the whole buffer. So does pushing the total held
    /// bytes past the limit when no other buffer is left to evict.
    pub fn accept(&mut self, fragment: ChunkFragment, now: Instant) -> Option<CompletedMessage> {
        self.evict_expired(now);

        let ChunkFragment {
            header,
            message_id,
            chunk_index,
            total_chunks,
            payload_base64,
        } = fragment;

        if total_chunks == 0 || total_chunks > MAX_TOTAL_CHUNKS || chunk_index >= total_chunks {
            log::debug!(
                "dropping fragment {}/{} of {}: out of bounds",
                chunk_index,
                total_chunks,
                message_id
            );
            self.remove(&message_id);
            return None;
        }

        let payload = match STANDARD.decode(payload_base64.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::debug!("dropping message {}: bad fragment payload: {}", message_id, e);
                self.remove(&message_id);
                return None;
            }
        };

        if !self.pending.contains_key(&message_id) && self.pending.len() >= MAX_PENDING_MESSAGES {
            self.evict_oldest();
        }

        let buffer = self
            .pending
            .entry(message_id.clone())
            .or_insert_with(|| ReassemblyBuffer {
                total_chunks,
                chunks: BTreeMap::new(),
                bytes: 0,
                last_activity: now,
            });

        if buffer.total_chunks != total_chunks {
            log::debug!(
                "dropping message {}: total chunks changed from {} to {}",
                message_id,
                buffer.total_chunks,
                total_chunks
            );
            self.remove(&message_id);
            return None;
        }

        let added = payload.len();
        let replaced = buffer.chunks.insert(chunk_index, payload).map_or(0, |old| old.len());
        buffer.bytes = buffer.bytes + added - replaced;
        buffer.last_activity = now;
        let complete = buffer.chunks.len() == total_chunks as usize;
        self.pending_bytes = self.pending_bytes + added - replaced;

        if !complete {
            self.enforce_byte_limit(&message_id);
            return None;
        }

        let buffer = self.remove(&message_id)?;
        let bytes: Vec<u8> = buffer.chunks.into_values().flatten().collect();
        match String::from_utf8(bytes) {
            Ok(content) => Some(CompletedMessage { header, content }),
            Err(e) => {
                log::debug!("dropping message {}: content is not UTF-8: {}", message_id, e);
                None
            }
        }
    }

    /// Drop every buffer that has not seen a fragment within the timeout.
    /// Returns how many were dropped.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        let timeout = self.timeout;
        let pending_bytes = &mut self.pending_bytes;
        self.pending.retain(|_, buffer| {
            let alive = now.saturating_duration_since(buffer.last_activity) < timeout;
            if !alive {
                *pending_bytes -= buffer.bytes;
            }
            alive
        });
        let evicted = before - self.pending.len();
        if evicted > 0 {
            log::debug!("evicted {} stale reassembly buffer(s)", evicted);
        }
        evicted
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Decoded bytes currently held for partial messages.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    fn remove(&mut self, message_id: &str) -> Option<ReassemblyBuffer> {
        let buffer = self.pending.remove(message_id)?;
        self.pending_bytes -= buffer.bytes;
        Some(buffer)
    }

    /// Evict other buffers, longest idle first, until the byte limit holds.
    /// Drops `current` too if it alone is over.
    fn enforce_byte_limit(&mut self, current: &str) {
        while self.pending_bytes > self.max_pending_bytes {
            let oldest = self
                .pending
                .iter()
                .filter(|(id, _)| id.as_str() != current)
                .min_by_key(|(_, buffer)| buffer.last_activity)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    log::debug!("evicting message {}: reassembly byte limit reached", id);
                    self.remove(&id);
                }
                None => {
                    log::debug!(
                        "dropping message {}: larger than reassembly byte limit",
                        current
                    );
                    self.remove(current);
                    return;
                }
            }
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, buffer)| buffer.last_activity)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.remove(&id);
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TIMEOUT)
    }
}

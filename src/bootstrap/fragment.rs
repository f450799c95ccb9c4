//! Fragmenting a byte blob into transport-sized chunks and putting it back
//! together, with enough bookkeeping for targeted retransmission.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One chunk of a larger blob, addressed by byte offset. Every part carries
/// the blob's total size so a receiver can tell completion without any
/// out-of-band handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub offset: u64,
    pub total_size: u64,
    pub data: Vec<u8>,
}

/// Splits `blob` into consecutive parts of at most `chunk_size` bytes.
/// An empty blob still yields one empty part, so the receiver learns the
/// total size.
pub fn split_into_parts(blob: &[u8], chunk_size: usize) -> Vec<Part> {
    let total_size = blob.len() as u64;
    if blob.is_empty() {
        return vec![Part {
            offset: 0,
            total_size: 0,
            data: Vec::new(),
        }];
    }
    blob.chunks(chunk_size)
        .enumerate()
        .map(|(i, chunk)| Part {
            offset: (i * chunk_size) as u64,
            total_size,
            data: chunk.to_vec(),
        })
        .collect()
}

/// Reassembles a fragment stream, tracking received chunks in a sorted map
/// keyed by offset.
#[derive(Debug, Default)]
pub struct PartCollector {
    total_size: Option<u64>,
    received: BTreeMap<u64, Vec<u8>>,
}

impl PartCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts one part. A part announcing a different total size means the
    /// sender restarted with a new blob; collection starts over.
    pub fn offer(&mut self, part: Part) {
        if self.total_size != Some(part.total_size) {
            if self.total_size.is_some() {
                tracing::warn!(
                    "fragment stream changed total size ({:?} -> {}), restarting collection",
                    self.total_size,
                    part.total_size
                );
            }
            self.received.clear();
            self.total_size = Some(part.total_size);
        }
        self.received.insert(part.offset, part.data);
    }

    pub fn reset(&mut self) {
        self.total_size = None;
        self.received.clear();
    }

    /// Lowest byte offset not yet covered, for targeted retransmission.
    /// `None` once the blob is complete.
    pub fn first_missing_piece(&self) -> Option<u64> {
        let Some(total) = self.total_size else {
            return Some(0);
        };
        let mut covered = 0u64;
        for (offset, data) in &self.received {
            if *offset > covered {
                return Some(covered);
            }
            covered = covered.max(offset + data.len() as u64);
        }
        if covered >= total { None } else { Some(covered) }
    }

    pub fn complete(&self) -> bool {
        self.total_size.is_some() && self.first_missing_piece().is_none()
    }

    /// The whole blob, once complete.
    pub fn reassemble(&self) -> Option<Vec<u8>> {
        if !self.complete() {
            return None;
        }
        let total = self.total_size.unwrap_or(0) as usize;
        let mut blob = Vec::with_capacity(total);
        for (offset, data) in &self.received {
            let offset = *offset as usize;
            // Overlapping retransmissions only ever repeat identical bytes.
            if offset + data.len() > blob.len() {
                let skip = blob.len() - offset;
                blob.extend_from_slice(&data[skip..]);
            }
        }
        blob.truncate(total);
        Some(blob)
    }
}

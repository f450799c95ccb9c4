//! Consumed Collaborator Interfaces
//!
//! The control plane does not own a storage engine, a consensus engine, or a
//! failure detector; it consumes them through the narrow interfaces defined
//! here.
//!
//! ## Core Concepts
//! - **KvStore**: get/put/range-scan over raw byte keys. Used both as the
//!   data store and as the place update-log records are persisted under a
//!   reserved key prefix.
//! - **ReplicatedLog**: agreement on update ordering. This crate only ever
//!   proposes; committed updates come back through the node's event channel.
//! - **ClusterEvent**: the failure detector's join/fail feed, treated as an
//!   opaque source of address events.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::ops::Bound;
use std::sync::RwLock;

use crate::updates::Update;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No node currently serves the requested range. For the reserved
    /// update-log range this indicates cluster-wide misconfiguration, not a
    /// transient blip.
    #[error("no responsible node for the requested range")]
    NoResponsible,
    #[error("store i/o failed: {0}")]
    Io(String),
}

/// The physical storage engine, by interface only.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError>;

    /// Ascending scan over `(from, to]`.
    fn scan_range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// The external consensus engine, by interface only. Deciding the order of
/// updates is out of scope here; proposing is all this crate does.
pub trait ReplicatedLog: Send + Sync {
    fn propose(&self, update: Update) -> Result<(), StoreError>;
}

/// Join/fail events from the failure detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Joined(SocketAddr),
    Failed(SocketAddr),
}

/// In-memory store used by the node runtime and tests. An ordered map under
/// a lock, since backfill needs range scans.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        data.insert(key, value);
        Ok(())
    }

    fn scan_range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(data
            .range::<[u8], _>((Bound::Excluded(from), Bound::Included(to)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::lut::schema::META_SCHEMA_ID;
use crate::lut::{LookupTable, MASTER_SET_ID};
use crate::store::KvStore;
use crate::updates::types::{Update, UpdateError, VNodeHooks};

/// Reserved key prefix for persisted update-log records: the metadata
/// schema id followed by a log marker, so the master group serves it.
pub const UPDATE_LOG_MARKER: &[u8] = b"ulog/";

/// Store key of the update record for `version`: reserved prefix plus the
/// version as 8 big-endian bytes, so records sort in version order.
pub fn update_log_key(version: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + UPDATE_LOG_MARKER.len() + 8);
    key.extend_from_slice(&META_SCHEMA_ID);
    key.extend_from_slice(UPDATE_LOG_MARKER);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Outcome of feeding one committed update to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update (and possibly queued successors) were applied.
    Applied { version: i64 },
    /// The update's version is not above the map's; redelivery is a no-op.
    AlreadyApplied,
    /// A gap was detected; the update is queued and a backfill was issued.
    Stalled { map_version: i64, queued: i64 },
}

/// Applies committed updates to the node's table strictly in version order.
///
/// Out-of-order arrivals are queued in a stall buffer and the missing range
/// is backfilled from the reserved update-log keys in the store. The buffer
/// drains monotonically: the lowest pending update is applied repeatedly
/// until the next one no longer chains.
pub struct UpdateManager<S: KvStore> {
    table: LookupTable,
    self_addr: SocketAddr,
    store: Arc<S>,
    stalled: BTreeMap<i64, Update>,
}

impl<S: KvStore> UpdateManager<S> {
    pub fn new(table: LookupTable, self_addr: SocketAddr, store: Arc<S>) -> Self {
        UpdateManager {
            table,
            self_addr,
            store,
            stalled: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &LookupTable {
        &self.table
    }

    pub fn self_addr(&self) -> &SocketAddr {
        &self.self_addr
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Whether a version gap is still waiting on backfilled records. The
    /// node runtime keeps a retry timer armed while this holds.
    pub fn awaiting_backfill(&self) -> bool {
        !self.stalled.is_empty()
    }

    /// Feeds one committed update in.
    pub fn handle_update(
        &mut self,
        update: Update,
        hooks: &mut dyn VNodeHooks,
    ) -> Result<UpdateOutcome, UpdateError> {
        if update.version <= self.table.version() {
            tracing::debug!(
                "ignoring already-applied update v{} (map at v{})",
                update.version,
                self.table.version()
            );
            return Ok(UpdateOutcome::AlreadyApplied);
        }

        if update.applicable(&self.table) {
            self.apply_and_persist(&update, hooks)?;
            self.drain_stalled(hooks)?;
            return Ok(UpdateOutcome::Applied {
                version: self.table.version(),
            });
        }

        let map_version = self.table.version();
        tracing::warn!(
            "update v{} does not chain from map v{}, queuing and backfilling",
            update.version,
            map_version
        );
        let queued = update.version;
        self.stalled.insert(update.version, update);
        self.run_backfill(hooks)?;

        if self.stalled.is_empty() {
            Ok(UpdateOutcome::Applied {
                version: self.table.version(),
            })
        } else {
            Ok(UpdateOutcome::Stalled {
                map_version: self.table.version(),
                queued,
            })
        }
    }

    /// Reads the missing update records `(map version, highest stalled]`
    /// from the store and drains whatever now chains. Called on arrival of
    /// a gapped update and again from the catch-up timer; a failed read is
    /// never fatal here, only loud.
    pub fn run_backfill(&mut self, hooks: &mut dyn VNodeHooks) -> Result<(), UpdateError> {
        let Some(target) = self.stalled.keys().next_back().copied() else {
            return Ok(());
        };
        let from = update_log_key(self.table.version());
        let to = update_log_key(target);
        match self.store.scan_range(&from, &to) {
            Ok(records) => {
                for (_, value) in records {
                    let update = Update::decode(&value)?;
                    if update.version > self.table.version() {
                        self.stalled.entry(update.version).or_insert(update);
                    }
                }
                self.drain_stalled(hooks)?;
                if self.awaiting_backfill() {
                    tracing::warn!(
                        "backfill incomplete: map at v{}, still missing up to v{}",
                        self.table.version(),
                        target
                    );
                }
            }
            Err(e) => {
                // An unreachable update-log range means the cluster is
                // misconfigured; keep retrying rather than dropping updates.
                tracing::error!(
                    "backfill read for (v{}, v{}] failed: {}; will retry",
                    self.table.version(),
                    target,
                    e
                );
            }
        }
        Ok(())
    }

    fn drain_stalled(&mut self, hooks: &mut dyn VNodeHooks) -> Result<(), UpdateError> {
        while let Some((&version, _)) = self.stalled.first_key_value() {
            if version <= self.table.version() {
                self.stalled.remove(&version);
                continue;
            }
            let applicable = self
                .stalled
                .get(&version)
                .map(|u| u.applicable(&self.table))
                .unwrap_or(false);
            if !applicable {
                break;
            }
            if let Some(update) = self.stalled.remove(&version) {
                self.apply_and_persist(&update, hooks)?;
            }
        }
        Ok(())
    }

    fn apply_and_persist(
        &mut self,
        update: &Update,
        hooks: &mut dyn VNodeHooks,
    ) -> Result<(), UpdateError> {
        let was_master = self.is_master_member();
        update.apply(&mut self.table, Some(&self.self_addr), hooks)?;
        let is_master = self.is_master_member();

        // A flip of our master-group role that no action explains means our
        // replay disagrees with what we should have been told. Halting beats
        // carrying on in an inconsistent role.
        if was_master != is_master && !update.touches_master_group() {
            tracing::error!(
                "master-group membership flipped ({} -> {}) without a covering action in v{}",
                was_master,
                is_master,
                update.version
            );
            return Err(UpdateError::MasterDivergence);
        }

        self.store
            .put(update_log_key(update.version), update.encode())
            .map_err(|e| UpdateError::Store(e.to_string()))?;
        tracing::debug!("applied update, map now at v{}", self.table.version());
        Ok(())
    }

    fn is_master_member(&self) -> bool {
        let Some(self_id) = self.table.host_id_of(&self.self_addr) else {
            return false;
        };
        self.table
            .rep_set(MASTER_SET_ID)
            .map(|s| s.contains(self_id))
            .unwrap_or(false)
    }
}

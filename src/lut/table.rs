use std::collections::BTreeSet;
use std::net::SocketAddr;

use rand::Rng;

use crate::keys::{Bound, Key, KeyRange};
use crate::lut::group::Group;
use crate::lut::schema::{SchemaCatalog, SchemaId};

pub const GROUP_COUNT: usize = 256;

/// Routing failures surfaced by the lookup table.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    /// The key matches no registered schema range. A data/routing error the
    /// caller should surface, not retry blindly.
    #[error("key belongs to no registered schema")]
    NoSuchSchema,
    /// No replication set currently covers the key. Recoverable: retry once
    /// the map advances.
    #[error("no replication set is responsible for the key")]
    NoResponsibleForKey,
    /// The groups contradict each other. Fatal: callers must log and halt
    /// rather than serve possibly-wrong routing data.
    #[error("lookup table is internally inconsistent: {0}")]
    BrokenMap(String),
}

/// A fixed-size set of host ids jointly storing one partition's replicas.
///
/// `version` increments whenever membership changes; the consensus layer
/// uses it as the replica-group epoch. Members are pairwise distinct and
/// reference non-vacant host slots while the set is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSet {
    pub id: u32,
    pub version: u32,
    pub members: Vec<u32>,
}

impl ReplicationSet {
    pub fn new(id: u32, version: u32, members: Vec<u32>) -> Self {
        ReplicationSet {
            id,
            version,
            members,
        }
    }

    pub fn contains(&self, host_id: u32) -> bool {
        self.members.contains(&host_id)
    }

    pub fn member_set(&self) -> BTreeSet<u32> {
        self.members.iter().copied().collect()
    }
}

/// Id of the master group: the distinguished replication set that also
/// stores cluster metadata and the update log.
pub const MASTER_SET_ID: u32 = 0;

/// The cluster-wide partition map.
///
/// Says which replication set owns which slice of the key space and where
/// replica sets live. Created once at genesis, then mutated only by applying
/// updates in exact version order; a single logical actor per node performs
/// those mutations, so the structure itself carries no locks.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    version: i64,
    scatter_width: u32,
    hosts: Vec<Option<SocketAddr>>,
    replication_sets: Vec<Option<ReplicationSet>>,
    groups: Box<[Group; GROUP_COUNT]>,
    catalog: SchemaCatalog,
    master_rep_size: usize,
}

impl LookupTable {
    pub fn new(scatter_width: u32) -> Self {
        LookupTable {
            version: 0,
            scatter_width,
            hosts: Vec::new(),
            replication_sets: Vec::new(),
            groups: Box::new(std::array::from_fn(|i| Group::new(i as u8))),
            catalog: SchemaCatalog::new(),
            master_rep_size: 0,
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    pub fn scatter_width(&self) -> u32 {
        self.scatter_width
    }

    pub fn master_rep_size(&self) -> usize {
        self.master_rep_size
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub(crate) fn catalog_mut(&mut self) -> &mut SchemaCatalog {
        &mut self.catalog
    }

    // ------------------------------------------------------------------
    // hosts
    // ------------------------------------------------------------------

    pub fn host(&self, id: u32) -> Option<&SocketAddr> {
        self.hosts.get(id as usize).and_then(|slot| slot.as_ref())
    }

    pub fn hosts_len(&self) -> usize {
        self.hosts.len()
    }

    /// Id of the slot currently holding `addr`, if any.
    pub fn host_id_of(&self, addr: &SocketAddr) -> Option<u32> {
        self.hosts
            .iter()
            .position(|slot| slot.as_ref() == Some(addr))
            .map(|i| i as u32)
    }

    pub fn live_host_ids(&self) -> Vec<u32> {
        self.hosts
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Vacant slot ids eligible for reuse.
    pub fn vacant_host_ids(&self) -> Vec<u32> {
        self.hosts
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Installs or vacates a host slot, growing the dense array as needed.
    pub(crate) fn put_host(&mut self, id: u32, addr: Option<SocketAddr>) {
        let idx = id as usize;
        if idx >= self.hosts.len() {
            self.hosts.resize(idx + 1, None);
        }
        self.hosts[idx] = addr;
    }

    // ------------------------------------------------------------------
    // replication sets
    // ------------------------------------------------------------------

    pub fn rep_set(&self, id: u32) -> Option<&ReplicationSet> {
        self.replication_sets
            .get(id as usize)
            .and_then(|slot| slot.as_ref())
    }

    pub fn rep_sets_len(&self) -> usize {
        self.replication_sets.len()
    }

    pub fn iter_rep_sets(&self) -> impl Iterator<Item = &ReplicationSet> {
        self.replication_sets.iter().flatten()
    }

    pub(crate) fn put_rep_set(&mut self, set: ReplicationSet) {
        let idx = set.id as usize;
        if idx >= self.replication_sets.len() {
            self.replication_sets.resize(idx + 1, None);
        }
        if set.id == MASTER_SET_ID {
            self.master_rep_size = set.members.len();
        }
        self.replication_sets[idx] = Some(set);
    }

    pub(crate) fn remove_rep_set(&mut self, id: u32) {
        if let Some(slot) = self.replication_sets.get_mut(id as usize) {
            *slot = None;
        }
    }

    // ------------------------------------------------------------------
    // groups
    // ------------------------------------------------------------------

    pub fn group(&self, prefix: u8) -> &Group {
        &self.groups[prefix as usize]
    }

    /// The group that stores boundaries starting with `key`'s first byte.
    /// Group storage is dense, so locating the bucket never allocates.
    pub(crate) fn group_for_mut(&mut self, key: &Key) -> &mut Group {
        &mut self.groups[key.first_byte() as usize]
    }

    /// Replaces a whole group, used when decoding a snapshot.
    pub(crate) fn install_group(&mut self, group: Group) {
        let prefix = group.prefix() as usize;
        self.groups[prefix] = group;
    }

    pub(crate) fn install_catalog(&mut self, catalog: SchemaCatalog) {
        self.catalog = catalog;
    }

    // ------------------------------------------------------------------
    // routing queries
    // ------------------------------------------------------------------

    /// Largest virtual-node boundary `<= key`, searching downward through
    /// the sparse groups: an empty or higher-only group means the true floor
    /// lives in a lower-numbered one.
    fn floor_entry(&self, key: &Key) -> Option<(&Key, u32)> {
        let start = key.first_byte() as usize;
        if let Some(hit) = self.groups[start].floor(key) {
            return Some(hit);
        }
        for g in (0..start).rev() {
            if let Some(hit) = self.groups[g].last() {
                return Some(hit);
            }
        }
        None
    }

    /// Smallest virtual-node boundary strictly above `key`, searching upward
    /// through the groups.
    pub fn successor_of(&self, key: &Key) -> Option<(&Key, u32)> {
        let start = key.first_byte() as usize;
        if let Some(hit) = self.groups[start].strictly_higher(key) {
            return Some(hit);
        }
        for g in start + 1..GROUP_COUNT {
            if let Some(hit) = self.groups[g].first() {
                return Some(hit);
            }
        }
        None
    }

    /// The replication set serving `key`.
    ///
    /// The matched boundary must share the key's schema-id prefix; a
    /// mismatch means the floor belongs to a different (probably stale)
    /// schema, which is reported as "no responsible node in this schema"
    /// rather than returned as a wrong answer.
    pub fn responsibles_for(&self, key: &Key) -> Result<&ReplicationSet, RoutingError> {
        let schema = self
            .catalog
            .schema_of_key(key)
            .ok_or(RoutingError::NoSuchSchema)?;
        let (boundary, set_id) = self
            .floor_entry(key)
            .ok_or(RoutingError::NoResponsibleForKey)?;
        if !boundary.starts_with(&schema.id) {
            return Err(RoutingError::NoResponsibleForKey);
        }
        self.rep_set(set_id)
            .ok_or(RoutingError::NoResponsibleForKey)
    }

    /// The contiguous range `key`'s virtual node is responsible for:
    /// its boundary (inclusive) up to the next boundary or the schema's
    /// upper end (exclusive).
    pub fn responsibility_range_of(&self, key: &Key) -> Result<KeyRange, RoutingError> {
        let schema = self
            .catalog
            .schema_of_key(key)
            .ok_or(RoutingError::NoSuchSchema)?;
        let (boundary, _) = self
            .floor_entry(key)
            .ok_or(RoutingError::NoResponsibleForKey)?;
        if !boundary.starts_with(&schema.id) {
            return Err(RoutingError::NoResponsibleForKey);
        }
        let begin = boundary.clone();
        let successor = self.successor_of(key).map(|(k, _)| k.clone());
        let schema_end = schema.id_key().inc();

        let end = match (successor, schema_end) {
            (Some(s), Some(e)) => Bound::Exclusive(s.min(e)),
            (Some(s), None) => Bound::Exclusive(s),
            (None, Some(e)) => Bound::Exclusive(e),
            (None, None) => Bound::Unbounded,
        };
        Ok(KeyRange::span(Bound::Inclusive(begin), end))
    }

    /// Splits `range` into contiguous `(sub-range, set id)` pieces, one per
    /// covering virtual node, preserving the caller's outer bounds on the
    /// first and last pieces.
    pub fn all_responsibles_for(
        &self,
        range: &KeyRange,
    ) -> Result<Vec<(KeyRange, u32)>, RoutingError> {
        let mut out = Vec::new();
        let mut remaining = range.clone();
        while let KeyRange::Span { begin, end } = remaining {
            let begin_key = match &begin {
                Bound::Inclusive(k) | Bound::Exclusive(k) => k.clone(),
                Bound::Unbounded => Key::ZERO,
            };
            let (piece_set, split) = self.piece_at(&begin_key)?;
            if let Some(next) = &split {
                if *next <= begin_key {
                    return Err(RoutingError::BrokenMap(format!(
                        "successor {:?} does not advance past {:?}",
                        next, begin_key
                    )));
                }
            }
            match split {
                Some(next) if below_end(&next, &end) => {
                    out.push((
                        KeyRange::span(begin, Bound::Exclusive(next.clone())),
                        piece_set,
                    ));
                    remaining = KeyRange::Span {
                        begin: Bound::Inclusive(next),
                        end,
                    };
                }
                _ => {
                    out.push((KeyRange::Span { begin, end }, piece_set));
                    remaining = KeyRange::EMPTY;
                }
            }
        }
        Ok(out)
    }

    /// The first piece of [`Self::all_responsibles_for`], for forwarding a
    /// sequential range query one hop at a time.
    pub fn first_responsible_for(
        &self,
        range: &KeyRange,
    ) -> Result<(KeyRange, &ReplicationSet), RoutingError> {
        let KeyRange::Span { begin, end } = range else {
            return Err(RoutingError::NoResponsibleForKey);
        };
        let begin_key = match begin {
            Bound::Inclusive(k) | Bound::Exclusive(k) => k.clone(),
            Bound::Unbounded => Key::ZERO,
        };
        let (set_id, split) = self.piece_at(&begin_key)?;
        let piece = match split {
            Some(next) if range.contains(&next) => {
                KeyRange::span(begin.clone(), Bound::Exclusive(next))
            }
            _ => range.clone(),
        };
        let set = self
            .rep_set(set_id)
            .ok_or(RoutingError::NoResponsibleForKey)?;
        Ok((piece, set))
    }

    /// Owner of the sub-range starting at `begin_key` plus the boundary that
    /// ends it, with the consistency checks that make a bad map fatal.
    fn piece_at(&self, begin_key: &Key) -> Result<(u32, Option<Key>), RoutingError> {
        let schema = self
            .catalog
            .schema_of_key(begin_key)
            .ok_or(RoutingError::NoSuchSchema)?;
        let (boundary, set_id) = self
            .floor_entry(begin_key)
            .ok_or(RoutingError::NoResponsibleForKey)?;
        if boundary > begin_key {
            return Err(RoutingError::BrokenMap(format!(
                "floor {:?} lies above probe {:?}",
                boundary, begin_key
            )));
        }
        if !boundary.starts_with(&schema.id) {
            return Err(RoutingError::NoResponsibleForKey);
        }
        let next = self.successor_of(begin_key).map(|(k, _)| k.clone());
        Ok((set_id, next))
    }

    /// A concrete host address to send a request for `key` to. Prefers the
    /// local node (or another process on the same physical host) to save a
    /// network hop; otherwise picks a member uniformly at random.
    pub fn destination_for(
        &self,
        key: &Key,
        self_addr: &SocketAddr,
    ) -> Result<SocketAddr, RoutingError> {
        let set = self.responsibles_for(key)?;
        let addrs: Vec<SocketAddr> = set
            .members
            .iter()
            .filter_map(|m| self.host(*m).copied())
            .collect();
        if addrs.is_empty() {
            return Err(RoutingError::NoResponsibleForKey);
        }
        if let Some(local) = addrs.iter().find(|a| *a == self_addr) {
            return Ok(*local);
        }
        if let Some(same_host) = addrs.iter().find(|a| a.ip() == self_addr.ip()) {
            return Ok(*same_host);
        }
        let idx = rand::thread_rng().gen_range(0..addrs.len());
        Ok(addrs[idx])
    }

    /// Every virtual node whose replication set contains `host_id`.
    /// Full scan over all 256 groups; bootstrap/administration only.
    pub fn virtual_nodes_at(&self, host_id: u32) -> Vec<(Key, u32)> {
        let mut out = Vec::new();
        for group in self.groups.iter() {
            for (key, set_id) in group.iter() {
                if self
                    .rep_set(set_id)
                    .map(|s| s.contains(host_id))
                    .unwrap_or(false)
                {
                    out.push((key.clone(), set_id));
                }
            }
        }
        out
    }

    /// Every virtual-node boundary inside a schema's range. Full scan over
    /// all 256 groups; bootstrap/administration only.
    pub fn virtual_nodes_in_schema(&self, id: &SchemaId) -> Vec<(Key, u32)> {
        let mut out = Vec::new();
        for group in self.groups.iter() {
            for (key, set_id) in group.iter() {
                if key.starts_with(id) {
                    out.push((key.clone(), set_id));
                }
            }
        }
        out
    }
}

/// Whether `key` lies below an end bound.
fn below_end(key: &Key, end: &Bound) -> bool {
    match end {
        Bound::Inclusive(e) => key <= e,
        Bound::Exclusive(e) => key < e,
        Bound::Unbounded => true,
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use crate::keys::Key;
use crate::lut::schema::CatalogError;
use crate::lut::{LookupTable, ReplicationSet, Schema, SchemaId};
use crate::updates::types::{Action, Update};

/// Copy-on-write overlay over a base lookup table.
///
/// The placement policy stages its proposed changes here without mutating
/// the shared table; reads fall through to the base unless locally
/// overridden. [`WorkingBuffer::assemble_update`] then diffs the staged
/// state into one minimal update for the replicated log.
pub struct WorkingBuffer<'a> {
    base: &'a LookupTable,
    hosts: BTreeMap<u32, Option<SocketAddr>>,
    sets: BTreeMap<u32, Option<ReplicationSet>>,
    vnodes: BTreeMap<Key, Option<u32>>,
    added_schemas: Vec<Schema>,
    dropped_schemas: Vec<SchemaId>,
}

impl<'a> WorkingBuffer<'a> {
    pub fn new(base: &'a LookupTable) -> Self {
        WorkingBuffer {
            base,
            hosts: BTreeMap::new(),
            sets: BTreeMap::new(),
            vnodes: BTreeMap::new(),
            added_schemas: Vec::new(),
            dropped_schemas: Vec::new(),
        }
    }

    pub fn base(&self) -> &LookupTable {
        self.base
    }

    // ------------------------------------------------------------------
    // reads (staged state wins, base shines through)
    // ------------------------------------------------------------------

    pub fn host(&self, id: u32) -> Option<SocketAddr> {
        match self.hosts.get(&id) {
            Some(staged) => *staged,
            None => self.base.host(id).copied(),
        }
    }

    pub fn hosts_len(&self) -> usize {
        let staged_top = self
            .hosts
            .keys()
            .next_back()
            .map(|id| *id as usize + 1)
            .unwrap_or(0);
        self.base.hosts_len().max(staged_top)
    }

    pub fn host_id_of(&self, addr: &SocketAddr) -> Option<u32> {
        (0..self.hosts_len() as u32).find(|id| self.host(*id) == Some(*addr))
    }

    pub fn live_host_ids(&self) -> Vec<u32> {
        (0..self.hosts_len() as u32)
            .filter(|id| self.host(*id).is_some())
            .collect()
    }

    pub fn vacant_host_ids(&self) -> Vec<u32> {
        (0..self.hosts_len() as u32)
            .filter(|id| self.host(*id).is_none())
            .collect()
    }

    pub fn rep_set(&self, id: u32) -> Option<&ReplicationSet> {
        match self.sets.get(&id) {
            Some(staged) => staged.as_ref(),
            None => self.base.rep_set(id),
        }
    }

    pub fn next_set_id(&self) -> u32 {
        let staged_top = self
            .sets
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(0);
        (self.base.rep_sets_len() as u32).max(staged_top)
    }

    pub fn rep_set_ids(&self) -> Vec<u32> {
        (0..self.next_set_id())
            .filter(|id| self.rep_set(*id).is_some())
            .collect()
    }

    /// Member sets of every live copyset, staged included, keyed for
    /// set-equality dedup.
    pub fn copyset_members(&self) -> BTreeSet<BTreeSet<u32>> {
        self.rep_set_ids()
            .into_iter()
            .filter_map(|id| self.rep_set(id).map(ReplicationSet::member_set))
            .collect()
    }

    pub fn schema(&self, id: &SchemaId) -> Option<&Schema> {
        if self.dropped_schemas.contains(id) {
            return None;
        }
        self.added_schemas
            .iter()
            .find(|s| s.id == *id)
            .or_else(|| self.base.catalog().get(id))
    }

    pub fn schema_by_name(&self, name: &str) -> Option<&Schema> {
        self.added_schemas
            .iter()
            .find(|s| s.name == name)
            .or_else(|| self.base.catalog().get_by_name(name))
            .filter(|s| !self.dropped_schemas.contains(&s.id))
    }

    pub fn vnode(&self, key: &Key) -> Option<u32> {
        match self.vnodes.get(key) {
            Some(staged) => *staged,
            None => self.base.group(key.first_byte()).get(key),
        }
    }

    /// The group index that will store `key`'s boundary. Group storage is
    /// dense, so the lookup never allocates; staging itself is flat.
    pub fn find_group_or_add_new(&self, key: &Key) -> u8 {
        key.first_byte()
    }

    // ------------------------------------------------------------------
    // staged writes (no-op stages are dropped to keep the diff minimal)
    // ------------------------------------------------------------------

    pub fn put_host(&mut self, id: u32, addr: Option<SocketAddr>) {
        if self.base.host(id).copied() == addr {
            self.hosts.remove(&id);
        } else {
            self.hosts.insert(id, addr);
        }
    }

    pub fn put_rep_set(&mut self, set: ReplicationSet) {
        if self.base.rep_set(set.id) == Some(&set) {
            self.sets.remove(&set.id);
        } else {
            self.sets.insert(set.id, Some(set));
        }
    }

    pub fn remove_rep_set(&mut self, id: u32) {
        if self.base.rep_set(id).is_none() {
            self.sets.remove(&id);
        } else {
            self.sets.insert(id, None);
        }
    }

    pub fn put_rep_group(&mut self, key: Key, set_id: Option<u32>) {
        if self.base.group(key.first_byte()).get(&key) == set_id {
            self.vnodes.remove(&key);
        } else {
            self.vnodes.insert(key, set_id);
        }
    }

    pub fn add_schema(&mut self, schema: Schema) -> Result<(), CatalogError> {
        if self.schema(&schema.id).is_some() {
            return Err(CatalogError::IdTaken(schema.id));
        }
        if self.schema_by_name(&schema.name).is_some() {
            return Err(CatalogError::NameTaken(schema.name));
        }
        self.added_schemas.push(schema);
        Ok(())
    }

    pub fn remove_schema(&mut self, id: &SchemaId) {
        if let Some(pos) = self.added_schemas.iter().position(|s| s.id == *id) {
            self.added_schemas.remove(pos);
            return;
        }
        if self.base.catalog().contains_id(id) && !self.dropped_schemas.contains(id) {
            self.dropped_schemas.push(*id);
        }
    }

    /// Number of staged structural changes; the placement policy caps its
    /// work per invocation on this.
    pub fn staged_action_count(&self) -> usize {
        self.hosts.len()
            + self.sets.len()
            + self.vnodes.len()
            + self.added_schemas.len()
            + self.dropped_schemas.len()
    }

    /// Diffs the staged state into one update chaining from the base
    /// version. Returns `None` when nothing changed.
    pub fn assemble_update(self) -> Option<Update> {
        if self.staged_action_count() == 0 {
            return None;
        }
        let mut actions = Vec::with_capacity(self.staged_action_count());
        for schema in self.added_schemas {
            actions.push(Action::CreateSchema { schema });
        }
        for id in self.dropped_schemas {
            actions.push(Action::DropSchema { id });
        }
        for (id, addr) in self.hosts {
            actions.push(Action::PutHost { id, addr });
        }
        for (id, set) in self.sets {
            actions.push(match set {
                Some(set) => Action::PutReplicationSet {
                    id,
                    version: set.version,
                    members: Some(set.members),
                },
                None => Action::PutReplicationSet {
                    id,
                    version: 0,
                    members: None,
                },
            });
        }
        for (key, set_id) in self.vnodes {
            actions.push(Action::PutReplicationGroup { key, set_id });
        }
        Some(Update {
            previous_version: self.base.version(),
            version: self.base.version() + 1,
            actions,
        })
    }
}

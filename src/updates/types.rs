use std::net::SocketAddr;

use crate::keys::Key;
use crate::lut::schema::CatalogError;
use crate::lut::{LookupTable, MASTER_SET_ID, ReplicationSet, Schema, SchemaId};
use crate::wire::{self, ByteReader, WireError};

// Wire tags. Fixed per variant and never renumbered: nodes of different
// builds must agree on persisted update records.
const TAG_PUT_HOST: u8 = 1;
const TAG_PUT_REPLICATION_SET: u8 = 2;
const TAG_PUT_REPLICATION_GROUP: u8 = 3;
const TAG_CREATE_SCHEMA: u8 = 4;
const TAG_DROP_SCHEMA: u8 = 5;

/// One mutation of the lookup table. `None` payloads are tombstones:
/// a vacated host slot, a dissolved replication set, a removed virtual node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    PutHost {
        id: u32,
        addr: Option<SocketAddr>,
    },
    PutReplicationSet {
        id: u32,
        version: u32,
        members: Option<Vec<u32>>,
    },
    PutReplicationGroup {
        key: Key,
        set_id: Option<u32>,
    },
    CreateSchema {
        schema: Schema,
    },
    DropSchema {
        id: SchemaId,
    },
}

/// Apply ordering. Replication-group actions may reference a schema or
/// replication set created earlier in the same update, so actions execute
/// grouped by class in this order regardless of their array position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionClass {
    Schema,
    Host,
    ReplicationSet,
    ReplicationGroup,
}

impl Action {
    pub fn class(&self) -> ActionClass {
        match self {
            Action::CreateSchema { .. } | Action::DropSchema { .. } => ActionClass::Schema,
            Action::PutHost { .. } => ActionClass::Host,
            Action::PutReplicationSet { .. } => ActionClass::ReplicationSet,
            Action::PutReplicationGroup { .. } => ActionClass::ReplicationGroup,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Action::PutHost { id, addr } => {
                wire::put_u8(buf, TAG_PUT_HOST);
                wire::put_i32(buf, *id as i32);
                wire::put_opt_addr(buf, addr.as_ref());
            }
            Action::PutReplicationSet {
                id,
                version,
                members,
            } => {
                wire::put_u8(buf, TAG_PUT_REPLICATION_SET);
                wire::put_i32(buf, *id as i32);
                wire::put_i32(buf, *version as i32);
                match members {
                    Some(m) => {
                        wire::put_i32(buf, m.len() as i32);
                        for member in m {
                            wire::put_i32(buf, *member as i32);
                        }
                    }
                    None => wire::put_i32(buf, -1),
                }
            }
            Action::PutReplicationGroup { key, set_id } => {
                wire::put_u8(buf, TAG_PUT_REPLICATION_GROUP);
                wire::put_len_bytes(buf, key.as_bytes());
                wire::put_i32(buf, set_id.map(|s| s as i32).unwrap_or(-1));
            }
            Action::CreateSchema { schema } => {
                wire::put_u8(buf, TAG_CREATE_SCHEMA);
                schema.encode(buf);
            }
            Action::DropSchema { id } => {
                wire::put_u8(buf, TAG_DROP_SCHEMA);
                buf.extend_from_slice(id);
            }
        }
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let tag = r.u8()?;
        match tag {
            TAG_PUT_HOST => {
                let id = r.i32()?;
                let addr = r.opt_addr()?;
                Ok(Action::PutHost {
                    id: id as u32,
                    addr,
                })
            }
            TAG_PUT_REPLICATION_SET => {
                let id = r.i32()? as u32;
                let version = r.i32()? as u32;
                let count = r.i32()?;
                let members = if count < 0 {
                    None
                } else {
                    let mut m = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        m.push(r.i32()? as u32);
                    }
                    Some(m)
                };
                Ok(Action::PutReplicationSet {
                    id,
                    version,
                    members,
                })
            }
            TAG_PUT_REPLICATION_GROUP => {
                let key = Key::from(r.len_bytes()?);
                let raw = r.i32()?;
                let set_id = if raw < 0 { None } else { Some(raw as u32) };
                Ok(Action::PutReplicationGroup { key, set_id })
            }
            TAG_CREATE_SCHEMA => Ok(Action::CreateSchema {
                schema: Schema::decode(r)?,
            }),
            TAG_DROP_SCHEMA => {
                let id_bytes = r.bytes(2)?;
                Ok(Action::DropSchema {
                    id: [id_bytes[0], id_bytes[1]],
                })
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

/// Side effects of replication-set membership transitions, fired while an
/// update is applied. This is how the map tells the rest of the node to
/// start or stop serving a partition, or to reconfigure its replica view.
pub trait VNodeHooks {
    /// The local node just became a member of `set`.
    fn start_vnode(&mut self, set: &ReplicationSet);
    /// The local node is no longer a member of the set.
    fn kill_vnode(&mut self, set_id: u32, old_members: &[u32]);
    /// Membership changed while the local node stayed a member.
    fn reconf(&mut self, set: &ReplicationSet, old_members: &[u32]);
}

/// Hooks that do nothing; for tools and tests that replay updates without a
/// serving node attached.
pub struct NullHooks;

impl VNodeHooks for NullHooks {
    fn start_vnode(&mut self, _set: &ReplicationSet) {}
    fn kill_vnode(&mut self, _set_id: u32, _old_members: &[u32]) {}
    fn reconf(&mut self, _set: &ReplicationSet, _old_members: &[u32]) {}
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("update chains from version {previous}, map is at {map}")]
    NotApplicable { previous: i64, map: i64 },
    #[error("update advances version {previous} to {version}, not by exactly 1")]
    BadVersionChain { previous: i64, version: i64 },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("dropped schema {0:02x?} is not registered")]
    UnknownSchema(SchemaId),
    #[error("virtual-node key {0:?} lies outside every registered schema")]
    KeyOutsideSchemas(Key),
    #[error("replication group references unknown set {0}")]
    UnknownReplicationSet(u32),
    #[error("replication set {0} has duplicate members")]
    DuplicateMembers(u32),
    #[error("local master-group membership changed without a covering action")]
    MasterDivergence,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("update log store failed: {0}")]
    Store(String),
}

/// A versioned diff against the lookup table.
///
/// Produced by the placement policy, ordered by the external replicated
/// log, and applied by every node. An update chains exactly one version
/// forward; anything else is queued or rejected by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub previous_version: i64,
    pub version: i64,
    pub actions: Vec<Action>,
}

impl Update {
    pub fn applicable(&self, table: &LookupTable) -> bool {
        self.previous_version == table.version()
    }

    /// Applies the diff. Actions run grouped by [`ActionClass`]; within a
    /// class, array order is preserved. `self_addr` identifies the local
    /// node so membership transitions can fire `hooks`.
    pub fn apply(
        &self,
        table: &mut LookupTable,
        self_addr: Option<&SocketAddr>,
        hooks: &mut dyn VNodeHooks,
    ) -> Result<(), UpdateError> {
        if !self.applicable(table) {
            return Err(UpdateError::NotApplicable {
                previous: self.previous_version,
                map: table.version(),
            });
        }
        if self.version != self.previous_version + 1 {
            return Err(UpdateError::BadVersionChain {
                previous: self.previous_version,
                version: self.version,
            });
        }
        table.set_version(self.version);

        for action in self.in_class(ActionClass::Schema) {
            match action {
                Action::CreateSchema { schema } => {
                    tracing::debug!("creating schema {:?} ({:02x?})", schema.name, schema.id);
                    table.catalog_mut().insert(schema.clone())?;
                }
                Action::DropSchema { id } => {
                    tracing::debug!("dropping schema {:02x?}", id);
                    table
                        .catalog_mut()
                        .remove(id)
                        .ok_or(UpdateError::UnknownSchema(*id))?;
                }
                _ => unreachable!("not a schema action"),
            }
        }

        for action in self.in_class(ActionClass::Host) {
            let Action::PutHost { id, addr } = action else {
                unreachable!("not a host action");
            };
            table.put_host(*id, *addr);
        }

        // The local id is resolved after host actions: a rejoin in this very
        // update may have (re)installed our address.
        let self_id = self_addr.and_then(|a| table.host_id_of(a));

        for action in self.in_class(ActionClass::ReplicationSet) {
            let Action::PutReplicationSet {
                id,
                version,
                members,
            } = action
            else {
                unreachable!("not a replication-set action");
            };
            apply_rep_set(table, *id, *version, members.as_deref(), self_id, hooks)?;
        }

        for action in self.in_class(ActionClass::ReplicationGroup) {
            let Action::PutReplicationGroup { key, set_id } = action else {
                unreachable!("not a replication-group action");
            };
            if let Some(set_id) = set_id {
                if table.catalog().schema_of_key(key).is_none() {
                    return Err(UpdateError::KeyOutsideSchemas(key.clone()));
                }
                if table.rep_set(*set_id).is_none() {
                    return Err(UpdateError::UnknownReplicationSet(*set_id));
                }
            }
            table.group_for_mut(key).put(key.clone(), *set_id);
        }
        Ok(())
    }

    /// Whether any action in this update touches the master group.
    pub fn touches_master_group(&self) -> bool {
        self.actions.iter().any(|a| match a {
            Action::PutReplicationSet { id, .. } => *id == MASTER_SET_ID,
            Action::PutReplicationGroup { set_id, .. } => *set_id == Some(MASTER_SET_ID),
            _ => false,
        })
    }

    fn in_class(&self, class: ActionClass) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(move |a| a.class() == class)
    }

    // Wire layout: i64 previous version, i64 version, i32 action count,
    // then the tagged actions.

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::put_i64(&mut buf, self.previous_version);
        wire::put_i64(&mut buf, self.version);
        wire::put_i32(&mut buf, self.actions.len() as i32);
        for action in &self.actions {
            action.encode(&mut buf);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(bytes);
        let previous_version = r.i64()?;
        let version = r.i64()?;
        let count = r.count()?;
        let mut actions = Vec::with_capacity(count);
        for _ in 0..count {
            actions.push(Action::decode(&mut r)?);
        }
        r.expect_end()?;
        Ok(Update {
            previous_version,
            version,
            actions,
        })
    }
}

fn apply_rep_set(
    table: &mut LookupTable,
    id: u32,
    version: u32,
    members: Option<&[u32]>,
    self_id: Option<u32>,
    hooks: &mut dyn VNodeHooks,
) -> Result<(), UpdateError> {
    if let Some(m) = members {
        let mut sorted = m.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != m.len() {
            return Err(UpdateError::DuplicateMembers(id));
        }
    }

    let old = table.rep_set(id).cloned();
    match members {
        Some(m) => {
            table.put_rep_set(ReplicationSet::new(id, version, m.to_vec()));
        }
        None => table.remove_rep_set(id),
    }

    let Some(self_id) = self_id else {
        return Ok(());
    };
    let was_member = old.as_ref().map(|s| s.contains(self_id)).unwrap_or(false);
    let is_member = members.map(|m| m.contains(&self_id)).unwrap_or(false);
    let old_members: &[u32] = old.as_ref().map(|s| s.members.as_slice()).unwrap_or(&[]);

    match (was_member, is_member) {
        (false, true) => {
            if let Some(set) = table.rep_set(id) {
                tracing::info!("joining replication set {} (v{})", id, version);
                hooks.start_vnode(set);
            }
        }
        (true, false) => {
            tracing::info!("leaving replication set {}", id);
            hooks.kill_vnode(id, old_members);
        }
        (true, true) => {
            if members != Some(old_members)
                && let Some(set) = table.rep_set(id)
            {
                tracing::info!("replication set {} reconfigured (v{})", id, version);
                hooks.reconf(set, old_members);
            }
        }
        (false, false) => {}
    }
    Ok(())
}

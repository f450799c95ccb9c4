use std::collections::{BTreeMap, HashMap};

use crate::keys::{Key, KeyRange};
use crate::wire::{self, ByteReader, WireError};

/// Fixed-width schema identifier. Every virtual-node key of a schema starts
/// with these two bytes, so a schema owns one contiguous byte range.
pub type SchemaId = [u8; 2];

/// Id of the built-in metadata schema created at genesis. Its partitions are
/// forced onto the master group, which therefore also serves the update log.
pub const META_SCHEMA_ID: SchemaId = [0x00, 0x00];
pub const META_SCHEMA_NAME: &str = "meta";

const META_RFACTOR: &str = "rfactor";
const META_VNODES: &str = "vnodes";
const META_FORCE_MASTER: &str = "forceMaster";

pub const DEFAULT_RFACTOR: usize = 3;
pub const MIN_RFACTOR: usize = 3;

/// A named, independently replicated key-space partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub id: SchemaId,
    pub name: String,
    pub meta: BTreeMap<String, String>,
}

impl Schema {
    pub fn new(id: SchemaId, name: impl Into<String>) -> Self {
        Schema {
            id,
            name: name.into(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.meta.insert(key.to_string(), value.to_string());
        self
    }

    /// Replication factor, defaulting to 3 and never below 3. Unparseable
    /// values fall back to the default.
    pub fn rfactor(&self) -> usize {
        self.meta
            .get(META_RFACTOR)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_RFACTOR)
            .max(MIN_RFACTOR)
    }

    /// Number of sub-partitions, defaulting to 1.
    pub fn vnodes(&self) -> usize {
        self.meta
            .get(META_VNODES)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1)
            .max(1)
    }

    /// Whether this schema's partitions are forced onto replication set 0.
    pub fn force_master(&self) -> bool {
        self.meta
            .get(META_FORCE_MASTER)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }

    pub fn id_key(&self) -> Key {
        Key::new(self.id.to_vec())
    }

    /// The contiguous byte range the schema owns.
    pub fn key_range(&self) -> KeyRange {
        KeyRange::prefix(&self.id_key())
    }

    // Wire layout: 2 id bytes, string name, i32 meta count, (string, string)
    // pairs. Shared between catalog snapshots and schema-creation actions.

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.id);
        wire::put_str(buf, &self.name);
        wire::put_i32(buf, self.meta.len() as i32);
        for (k, v) in &self.meta {
            wire::put_str(buf, k);
            wire::put_str(buf, v);
        }
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let id_bytes = r.bytes(2)?;
        let id = [id_bytes[0], id_bytes[1]];
        let name = r.str()?.to_string();
        let mut schema = Schema::new(id, name);
        let metas = r.count()?;
        for _ in 0..metas {
            let k = r.str()?.to_string();
            let v = r.str()?.to_string();
            schema.meta.insert(k, v);
        }
        Ok(schema)
    }
}

/// Registry mapping schema ids and names to their metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCatalog {
    by_id: BTreeMap<SchemaId, Schema>,
    by_name: HashMap<String, SchemaId>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &SchemaId) -> Option<&Schema> {
        self.by_id.get(id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Schema> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn contains_id(&self, id: &SchemaId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Schema> {
        self.by_id.values()
    }

    /// Registers a schema. Id and name must both be unused.
    pub fn insert(&mut self, schema: Schema) -> Result<(), CatalogError> {
        if self.by_id.contains_key(&schema.id) {
            return Err(CatalogError::IdTaken(schema.id));
        }
        if self.by_name.contains_key(&schema.name) {
            return Err(CatalogError::NameTaken(schema.name));
        }
        self.by_name.insert(schema.name.clone(), schema.id);
        self.by_id.insert(schema.id, schema);
        Ok(())
    }

    pub fn remove(&mut self, id: &SchemaId) -> Option<Schema> {
        let schema = self.by_id.remove(id)?;
        self.by_name.remove(&schema.name);
        Some(schema)
    }

    /// The schema whose id prefixes `key`, if any.
    pub fn schema_of_key(&self, key: &Key) -> Option<&Schema> {
        if key.len() < 2 {
            return None;
        }
        let id: SchemaId = [key.as_bytes()[0], key.as_bytes()[1]];
        self.by_id.get(&id)
    }

    /// Derives an unused id from a schema name: FNV-1a folded to 16 bits,
    /// linear-probed past collisions and the reserved metadata id.
    pub fn derive_id(&self, name: &str) -> Option<SchemaId> {
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in name.as_bytes() {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        let folded = (hash ^ (hash >> 16) ^ (hash >> 32) ^ (hash >> 48)) as u16;

        for probe in 0..=u16::MAX {
            let candidate = folded.wrapping_add(probe).to_be_bytes();
            if candidate != META_SCHEMA_ID && !self.by_id.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    // Wire layout: i32 count, then per schema (ascending id order):
    // 2 id bytes, string name, i32 meta count, meta (string, string) pairs.

    pub fn encode(&self, buf: &mut Vec<u8>) {
        wire::put_i32(buf, self.by_id.len() as i32);
        for schema in self.by_id.values() {
            schema.encode(buf);
        }
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let mut catalog = SchemaCatalog::new();
        let count = r.count()?;
        for _ in 0..count {
            let schema = Schema::decode(r)?;
            catalog
                .insert(schema)
                .map_err(|_| WireError::InvalidLength(count as i64))?;
        }
        Ok(catalog)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("schema id {0:02x?} already registered")]
    IdTaken(SchemaId),
    #[error("schema name {0:?} already registered")]
    NameTaken(String),
}

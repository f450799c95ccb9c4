use std::collections::BTreeMap;
use std::ops::Bound as StdBound;

use crate::keys::{Key, KeyRange};
use crate::wire::{self, ByteReader, WireError};

/// One of the 256 sub-indices of the lookup table.
///
/// Virtual nodes are bucketed by the first byte of their boundary key purely
/// for update locality; logically all groups form a single sorted map. Each
/// group tracks its own version, bumped on every mutation, so a snapshot can
/// tell which buckets changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    prefix: u8,
    version: i64,
    nodes: BTreeMap<Key, u32>,
}

impl Group {
    pub fn new(prefix: u8) -> Self {
        Group {
            prefix,
            version: 0,
            nodes: BTreeMap::new(),
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts or replaces a virtual node; `None` removes it. Either way the
    /// group version advances.
    pub fn put(&mut self, key: Key, set_id: Option<u32>) {
        match set_id {
            Some(id) => {
                self.nodes.insert(key, id);
            }
            None => {
                self.nodes.remove(&key);
            }
        }
        self.version += 1;
    }

    pub fn get(&self, key: &Key) -> Option<u32> {
        self.nodes.get(key).copied()
    }

    /// Largest boundary `<= key`, if any.
    pub fn floor(&self, key: &Key) -> Option<(&Key, u32)> {
        self.nodes
            .range::<Key, _>(..=key)
            .next_back()
            .map(|(k, v)| (k, *v))
    }

    /// Smallest boundary strictly above `key`, if any.
    pub fn strictly_higher(&self, key: &Key) -> Option<(&Key, u32)> {
        self.nodes
            .range::<Key, _>((StdBound::Excluded(key), StdBound::Unbounded))
            .next()
            .map(|(k, v)| (k, *v))
    }

    /// Smallest boundary in the group.
    pub fn first(&self) -> Option<(&Key, u32)> {
        self.nodes.iter().next().map(|(k, v)| (k, *v))
    }

    /// Largest boundary in the group.
    pub fn last(&self) -> Option<(&Key, u32)> {
        self.nodes.iter().next_back().map(|(k, v)| (k, *v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, u32)> {
        self.nodes.iter().map(|(k, v)| (k, *v))
    }

    /// Boundaries lying inside `range`, in ascending order.
    pub fn keys_in<'a>(&'a self, range: &'a KeyRange) -> impl Iterator<Item = (&'a Key, u32)> {
        self.iter().filter(|(k, _)| range.contains(k))
    }

    // Wire layout: u8 prefix, i32 count, count x (Key, i32 set id).

    pub fn encode(&self, buf: &mut Vec<u8>) {
        wire::put_u8(buf, self.prefix);
        wire::put_i32(buf, self.nodes.len() as i32);
        for (key, set_id) in &self.nodes {
            wire::put_len_bytes(buf, key.as_bytes());
            wire::put_i32(buf, *set_id as i32);
        }
    }

    pub fn decode(r: &mut ByteReader<'_>, version: i64) -> Result<Self, WireError> {
        let prefix = r.u8()?;
        let count = r.count()?;
        let mut nodes = BTreeMap::new();
        for _ in 0..count {
            let key = Key::from(r.len_bytes()?);
            let set_id = r.i32()?;
            if set_id < 0 {
                return Err(WireError::InvalidLength(set_id as i64));
            }
            nodes.insert(key, set_id as u32);
        }
        Ok(Group {
            prefix,
            version,
            nodes,
        })
    }
}

//! Whole-table snapshot codec.
//!
//! The bootstrap protocol ships the genesis table to every seed host as one
//! serialized blob; the layout is fixed and encoded by hand so that nodes of
//! different builds agree byte-for-byte.
//!
//! Layout: `i64 version, i32 scatter_width, catalog, i32 host_count,
//! host_count x address, i32 set_count, set_count x (i32 version, u8 size,
//! size x i32 member), 256 x (i64 group_version, i32 group_len,
//! group_bytes)`. A vacant host slot encodes as address length -1; a vacant
//! replication-set slot as version -1 with size 0.

use crate::lut::group::Group;
use crate::lut::schema::SchemaCatalog;
use crate::lut::table::{GROUP_COUNT, LookupTable, ReplicationSet};
use crate::wire::{self, ByteReader, WireError};

impl LookupTable {
    pub fn encode_snapshot(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::put_i64(&mut buf, self.version());
        wire::put_i32(&mut buf, self.scatter_width() as i32);
        self.catalog().encode(&mut buf);

        wire::put_i32(&mut buf, self.hosts_len() as i32);
        for id in 0..self.hosts_len() as u32 {
            wire::put_opt_addr(&mut buf, self.host(id));
        }

        wire::put_i32(&mut buf, self.rep_sets_len() as i32);
        for id in 0..self.rep_sets_len() as u32 {
            match self.rep_set(id) {
                Some(set) => {
                    wire::put_i32(&mut buf, set.version as i32);
                    wire::put_u8(&mut buf, set.members.len() as u8);
                    for member in &set.members {
                        wire::put_i32(&mut buf, *member as i32);
                    }
                }
                None => {
                    wire::put_i32(&mut buf, -1);
                    wire::put_u8(&mut buf, 0);
                }
            }
        }

        for prefix in 0..GROUP_COUNT {
            let group = self.group(prefix as u8);
            wire::put_i64(&mut buf, group.version());
            let mut group_bytes = Vec::new();
            group.encode(&mut group_bytes);
            wire::put_len_bytes(&mut buf, &group_bytes);
        }
        buf
    }

    pub fn decode_snapshot(bytes: &[u8]) -> Result<LookupTable, WireError> {
        let mut r = ByteReader::new(bytes);
        let version = r.i64()?;
        let scatter_width = r.i32()?;
        if scatter_width < 0 {
            return Err(WireError::InvalidLength(scatter_width as i64));
        }
        let catalog = SchemaCatalog::decode(&mut r)?;

        let mut table = LookupTable::new(scatter_width as u32);
        table.set_version(version);
        table.install_catalog(catalog);

        let host_count = r.count()?;
        for id in 0..host_count {
            table.put_host(id as u32, r.opt_addr()?);
        }

        let set_count = r.count()?;
        for id in 0..set_count {
            let set_version = r.i32()?;
            let size = r.u8()? as usize;
            if set_version < 0 {
                // Vacant slot; nothing follows.
                continue;
            }
            let mut members = Vec::with_capacity(size);
            for _ in 0..size {
                let member = r.i32()?;
                if member < 0 {
                    return Err(WireError::InvalidLength(member as i64));
                }
                members.push(member as u32);
            }
            table.put_rep_set(ReplicationSet::new(id as u32, set_version as u32, members));
        }

        for prefix in 0..GROUP_COUNT {
            let group_version = r.i64()?;
            let group_bytes = r.len_bytes()?;
            let mut gr = ByteReader::new(group_bytes);
            let group = Group::decode(&mut gr, group_version)?;
            gr.expect_end()?;
            if group.prefix() as usize != prefix {
                return Err(WireError::UnknownTag(group.prefix()));
            }
            table.install_group(group);
        }
        r.expect_end()?;
        Ok(table)
    }
}

//! Partition Map
//!
//! The authoritative routing structure of the cluster: which replication set
//! owns which slice of the key space, where replica sets are placed, and
//! which schemas exist.
//!
//! ## Core Concepts
//! - **LookupTable**: versioned aggregate of hosts, replication sets, 256
//!   group sub-indices, and the schema catalog. Mutated only by applying
//!   updates in exact version order.
//! - **Group**: one sub-index bucketing virtual nodes by the first byte of
//!   their boundary key, purely for update locality.
//! - **SchemaCatalog**: name/id/metadata registry; a schema id bounds a
//!   contiguous byte range of the key space.
//! - **Snapshot**: the byte-exact whole-table serialization the bootstrap
//!   protocol ships to seed hosts.

pub mod group;
pub mod schema;
pub mod snapshot;
pub mod table;

pub use schema::{Schema, SchemaCatalog, SchemaId};
pub use table::{LookupTable, MASTER_SET_ID, ReplicationSet, RoutingError};

//! Placement & Rebalancing
//!
//! Computes lookup-table diffs from cluster state: where new hosts go, who
//! replaces failed replicas, and how fresh schemas are laid out.
//!
//! ## Core Concepts
//! - **Copysets**: replica sets generated from random permutations of the
//!   live hosts, deduplicated by member-set equality, so each host shares
//!   data with a bounded number of peers (the scatter width) and a
//!   multi-host failure hits a bounded number of partitions.
//! - **Repair**: failed members are replaced from a running min-heap of the
//!   least-loaded candidates.
//! - **Genesis**: the same provisioning code, run once over the seed host
//!   set, produces the cluster's very first table.
//!
//! All output flows through a [`crate::updates::WorkingBuffer`] and comes
//! back as at most one update per control cycle.

pub mod copyset;
pub mod policy;
pub mod stats;

pub use policy::{PlacementError, RebalancePolicy, SchemaRequest};
pub use stats::HostStats;

#[cfg(test)]
mod tests;

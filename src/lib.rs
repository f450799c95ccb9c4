//! Sharded Key-Value Cluster Control Plane
//!
//! This library is the metadata/partitioning brain of a sharded, replicated
//! key-value cluster: a cluster-wide partition map that says which replica
//! set owns which slice of the key space, and the machinery that keeps that
//! map convergent as hosts join, fail, and schemas come and go.
//!
//! ## Architecture Modules
//! The system is composed of loosely coupled subsystems, leaf-first:
//!
//! - **`keys`**: Ordered byte-string keys and half-open key ranges, the
//!   vocabulary everything else routes by.
//! - **`lut`**: The lookup table: hosts, replication sets, 256 group
//!   sub-indices, and the schema catalog, plus its routing queries and the
//!   byte-exact snapshot codec.
//! - **`updates`**: The versioned diff protocol: tagged actions, ordered
//!   apply with membership-transition hooks, the copy-on-write staging
//!   buffer, and gap handling with store-backed backfill.
//! - **`placement`**: The rebalance policy: copyset generation, failure
//!   repair, schema provisioning, and cluster genesis.
//! - **`bootstrap`**: Server/client state machines that seed the very first
//!   table into a quorum of hosts over a size-limited transport.
//! - **`store`**: The narrow interfaces of the collaborators this crate
//!   consumes but does not own (storage engine, replicated log, failure
//!   detector), with an in-memory store for tests and small deployments.
//! - **`node`**: The per-node runtime: one event channel, one consumer,
//!   timers and a UDP pump driving the state machines above.

pub mod bootstrap;
pub mod config;
pub mod keys;
pub mod lut;
pub mod node;
pub mod placement;
pub mod store;
pub mod updates;
pub mod wire;

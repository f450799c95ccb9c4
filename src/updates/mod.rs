//! Update Protocol
//!
//! The versioned, diff-based protocol that mutates the lookup table safely
//! and keeps every node's copy convergent without full-snapshot exchange.
//!
//! ## Core Concepts
//! - **Update/Action**: a diff chaining `previous_version -> version` with a
//!   closed set of tagged actions; actions apply grouped by class so that
//!   replication-group entries can reference schemas and sets created in the
//!   same update.
//! - **VNodeHooks**: membership-transition callbacks fired during apply,
//!   telling the node to start/stop serving a partition or reconfigure.
//! - **WorkingBuffer**: the copy-on-write staging view the placement policy
//!   writes through; diffed into one minimal update.
//! - **UpdateManager**: strict version-order application with a stall buffer
//!   and store-backed backfill for gaps.

pub mod manager;
pub mod types;
pub mod working;

pub use manager::{UpdateManager, UpdateOutcome, update_log_key};
pub use types::{Action, NullHooks, Update, UpdateError, VNodeHooks};
pub use working::WorkingBuffer;

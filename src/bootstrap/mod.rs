//! Cluster Genesis
//!
//! Seeds the very first lookup table into a quorum of fresh hosts over a
//! size-limited transport.
//!
//! ## Core Concepts
//! - **Server**: collects bootstrap pings until the boot threshold is met,
//!   generates the genesis table through the placement policy, streams its
//!   serialized snapshot as fragments, and declares boot-up once every
//!   still-active seed host acknowledged the table.
//! - **Client**: requests the table, reassembles the fragment stream,
//!   replies ready, and finishes on boot-up, in either order.
//! - **Fragments**: `Part` chunks addressed by byte offset, bounded by the
//!   transport's maximum datagram size, collected by `PartCollector`.
//!
//! Both machines are pure (`handle(event) -> effects`); the node runtime
//! owns the socket and the timers and is the single consumer of each
//! machine's events.

pub mod client;
pub mod fragment;
pub mod protocol;
pub mod server;

use std::net::SocketAddr;

use crate::lut::LookupTable;

pub use client::{BootstrapClient, ClientEvent, ClientPhase};
pub use fragment::{Part, PartCollector, split_into_parts};
pub use protocol::{BootMessage, Datagram, decode_message, encode_message};
pub use server::{BootstrapServer, ServerEvent, ServerPhase};

/// What the server hands the node once the cluster is up.
#[derive(Debug, Clone)]
pub struct BootOutcome {
    pub table: LookupTable,
    /// Originally seeded hosts that never became ready.
    pub failed: Vec<SocketAddr>,
    /// Hosts that showed up after seeding began.
    pub joined: Vec<SocketAddr>,
}

/// Instructions a state machine hands back to the runtime.
#[derive(Debug, Clone)]
pub enum Effect {
    Send { to: SocketAddr, msg: BootMessage },
    ServerDone(BootOutcome),
    ClientDone(LookupTable),
    /// The terminal condition was reached; the periodic timer can stop.
    StopTimer,
}

#[cfg(test)]
mod tests;

//! Bootstrap wire messages.
//!
//! Datagrams carry one header byte (two type bits plus a forwarded/origin
//! marker) followed by a bincode payload. The transport bounds message
//! size, which is why the serialized table travels as [`Part`] fragments.

use std::net::SocketAddr;

use crate::bootstrap::fragment::Part;
use crate::wire::WireError;

/// Largest datagram the transport will carry.
pub const MAX_DATAGRAM_SIZE: usize = 60 * 1024;

/// Header byte plus bincode framing for a part's offset/total/length fields.
const PART_OVERHEAD: usize = 64;

/// Fragment payload budget per datagram.
pub const CHUNK_SIZE: usize = MAX_DATAGRAM_SIZE - PART_OVERHEAD;

const TYPE_MASK: u8 = 0b0000_0011;
const TYPE_REQUEST: u8 = 0;
const TYPE_PART: u8 = 1;
const TYPE_READY: u8 = 2;
const TYPE_BOOT_UP: u8 = 3;
const FORWARDED_BIT: u8 = 0b0000_0100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootMessage {
    /// A starting host announcing itself to the bootstrap server.
    Request { origin: SocketAddr },
    /// One fragment of the serialized genesis table.
    Part(Part),
    /// A client acknowledging it holds the complete table.
    Ready { src: SocketAddr, dst: SocketAddr },
    /// The server's signal that the cluster is up.
    BootUp { src: SocketAddr, dst: SocketAddr },
}

/// A decoded datagram: the message plus its forwarded/origin marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub forwarded: bool,
    pub msg: BootMessage,
}

pub fn encode_message(msg: &BootMessage, forwarded: bool) -> Result<Vec<u8>, WireError> {
    let (type_bits, payload) = match msg {
        BootMessage::Request { origin } => (TYPE_REQUEST, bincode::serialize(origin)),
        BootMessage::Part(part) => (TYPE_PART, bincode::serialize(part)),
        BootMessage::Ready { src, dst } => (TYPE_READY, bincode::serialize(&(src, dst))),
        BootMessage::BootUp { src, dst } => (TYPE_BOOT_UP, bincode::serialize(&(src, dst))),
    };
    let payload = payload.map_err(|e| WireError::Payload(e.to_string()))?;
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(type_bits | if forwarded { FORWARDED_BIT } else { 0 });
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub fn decode_message(bytes: &[u8]) -> Result<Datagram, WireError> {
    let Some((&header, payload)) = bytes.split_first() else {
        return Err(WireError::UnexpectedEof(0));
    };
    let forwarded = header & FORWARDED_BIT != 0;
    let msg = match header & TYPE_MASK {
        TYPE_REQUEST => BootMessage::Request {
            origin: bincode::deserialize(payload)
                .map_err(|e| WireError::Payload(e.to_string()))?,
        },
        TYPE_PART => BootMessage::Part(
            bincode::deserialize(payload).map_err(|e| WireError::Payload(e.to_string()))?,
        ),
        TYPE_READY => {
            let (src, dst) = bincode::deserialize(payload)
                .map_err(|e| WireError::Payload(e.to_string()))?;
            BootMessage::Ready { src, dst }
        }
        TYPE_BOOT_UP => {
            let (src, dst) = bincode::deserialize(payload)
                .map_err(|e| WireError::Payload(e.to_string()))?;
            BootMessage::BootUp { src, dst }
        }
        other => return Err(WireError::UnknownTag(other)),
    };
    Ok(Datagram { forwarded, msg })
}

use std::net::SocketAddr;

use crate::bootstrap::Effect;
use crate::bootstrap::fragment::{Part, PartCollector};
use crate::bootstrap::protocol::BootMessage;
use crate::lut::LookupTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Requesting the table until a complete snapshot arrives.
    Waiting,
    /// Holding the table, announcing readiness until boot-up.
    Ready,
    /// Terminal: the local node is bootstrapped.
    Finished,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Periodic retry timer.
    Tick,
    Part(Part),
    BootUp,
}

/// The genesis client state machine.
///
/// Collects the fragmented table snapshot from the server, acknowledges it,
/// and finishes on boot-up. Tolerates reordering: a boot-up arriving before
/// the table is remembered, and the outcome is emitted the moment the
/// snapshot completes.
pub struct BootstrapClient {
    self_addr: SocketAddr,
    server_addr: SocketAddr,
    phase: ClientPhase,
    collector: PartCollector,
    table: Option<LookupTable>,
    started: bool,
}

impl BootstrapClient {
    pub fn new(self_addr: SocketAddr, server_addr: SocketAddr) -> Self {
        BootstrapClient {
            self_addr,
            server_addr,
            phase: ClientPhase::Waiting,
            collector: PartCollector::new(),
            table: None,
            started: false,
        }
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn handle(&mut self, event: ClientEvent) -> Vec<Effect> {
        match self.phase {
            ClientPhase::Waiting => self.handle_waiting(event),
            ClientPhase::Ready => self.handle_ready(event),
            ClientPhase::Finished => Vec::new(),
        }
    }

    fn handle_waiting(&mut self, event: ClientEvent) -> Vec<Effect> {
        match event {
            ClientEvent::Tick => vec![Effect::Send {
                to: self.server_addr,
                msg: BootMessage::Request {
                    origin: self.self_addr,
                },
            }],
            ClientEvent::Part(part) => {
                self.collector.offer(part);
                if !self.collector.complete() {
                    return Vec::new();
                }
                let Some(blob) = self.collector.reassemble() else {
                    return Vec::new();
                };
                match LookupTable::decode_snapshot(&blob) {
                    Ok(table) => {
                        tracing::info!(
                            "received genesis table v{} ({} bytes)",
                            table.version(),
                            blob.len()
                        );
                        self.table = Some(table);
                        let mut effects = vec![Effect::Send {
                            to: self.server_addr,
                            msg: BootMessage::Ready {
                                src: self.self_addr,
                                dst: self.server_addr,
                            },
                        }];
                        if self.started {
                            // Boot-up already arrived; no need to wait for
                            // another one.
                            effects.extend(self.finish());
                        } else {
                            self.phase = ClientPhase::Ready;
                        }
                        effects
                    }
                    Err(e) => {
                        tracing::warn!("snapshot failed to decode ({}), re-collecting", e);
                        self.collector.reset();
                        Vec::new()
                    }
                }
            }
            ClientEvent::BootUp => {
                tracing::debug!("boot-up before the table arrived, remembering");
                self.started = true;
                Vec::new()
            }
        }
    }

    fn handle_ready(&mut self, event: ClientEvent) -> Vec<Effect> {
        match event {
            ClientEvent::Tick => vec![Effect::Send {
                to: self.server_addr,
                msg: BootMessage::Ready {
                    src: self.self_addr,
                    dst: self.server_addr,
                },
            }],
            ClientEvent::Part(_) => Vec::new(),
            ClientEvent::BootUp => self.finish(),
        }
    }

    fn finish(&mut self) -> Vec<Effect> {
        self.phase = ClientPhase::Finished;
        let Some(table) = self.table.clone() else {
            return Vec::new();
        };
        tracing::info!("bootstrapped at table v{}", table.version());
        vec![Effect::ClientDone(table), Effect::StopTimer]
    }
}

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::bootstrap::fragment::{Part, split_into_parts};
use crate::bootstrap::protocol::{BootMessage, CHUNK_SIZE};
use crate::bootstrap::{BootOutcome, Effect};
use crate::lut::LookupTable;
use crate::placement::{PlacementError, RebalancePolicy, SchemaRequest};

/// How recently a host must have pinged to count as active during seeding.
pub const RECENT_PING_WINDOW: Duration = Duration::from_secs(6);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    /// Accumulating pings until the boot threshold is met.
    Collecting,
    /// Streaming the genesis table and waiting for ready replies.
    Seeding,
    /// Terminal: the cluster is up.
    Done,
}

/// Events the runtime feeds into the server machine. `Tick` is the periodic
/// clear-timeout; waiting is retained state, never a blocking call.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Request { origin: SocketAddr, forwarded: bool },
    Ready { src: SocketAddr },
    Tick,
}

/// The genesis server state machine.
///
/// Pure: `handle` consumes events and returns effects; sockets and timers
/// belong to the node runtime. All set/ping bookkeeping is retained state
/// across handler invocations.
pub struct BootstrapServer {
    self_addr: SocketAddr,
    threshold: usize,
    scatter_width: u32,
    initial_schemas: Vec<SchemaRequest>,
    phase: ServerPhase,
    fresh: HashSet<SocketAddr>,
    active: HashSet<SocketAddr>,
    boot_set: HashSet<SocketAddr>,
    ready: HashSet<SocketAddr>,
    last_ping: HashMap<SocketAddr, Instant>,
    parts: Vec<Part>,
    table: Option<LookupTable>,
}

impl BootstrapServer {
    pub fn new(
        self_addr: SocketAddr,
        threshold: usize,
        scatter_width: u32,
        initial_schemas: Vec<SchemaRequest>,
    ) -> Self {
        BootstrapServer {
            self_addr,
            threshold,
            scatter_width,
            initial_schemas,
            phase: ServerPhase::Collecting,
            fresh: HashSet::new(),
            active: HashSet::new(),
            boot_set: HashSet::new(),
            ready: HashSet::new(),
            last_ping: HashMap::new(),
            parts: Vec::new(),
            table: None,
        }
    }

    pub fn phase(&self) -> ServerPhase {
        self.phase
    }

    pub fn handle(
        &mut self,
        event: ServerEvent,
        now: Instant,
    ) -> Result<Vec<Effect>, PlacementError> {
        match self.phase {
            ServerPhase::Collecting => self.handle_collecting(event, now),
            ServerPhase::Seeding => Ok(self.handle_seeding(event, now)),
            ServerPhase::Done => Ok(self.handle_done(event)),
        }
    }

    fn handle_collecting(
        &mut self,
        event: ServerEvent,
        now: Instant,
    ) -> Result<Vec<Effect>, PlacementError> {
        match event {
            ServerEvent::Request { origin, .. } => {
                self.last_ping.insert(origin, now);
                if self.fresh.insert(origin) {
                    tracing::info!(
                        "bootstrap ping from {} ({} fresh)",
                        origin,
                        self.fresh.len()
                    );
                }
                Ok(Vec::new())
            }
            ServerEvent::Ready { src } => {
                tracing::warn!("ignoring early ready from {} while collecting", src);
                Ok(Vec::new())
            }
            ServerEvent::Tick => {
                // Clear-timeout: promote the fresh window into the active
                // set, always counting ourselves.
                self.active.extend(self.fresh.drain());
                self.active.insert(self.self_addr);
                if self.active.len() < self.threshold {
                    tracing::debug!(
                        "collecting: {}/{} hosts",
                        self.active.len(),
                        self.threshold
                    );
                    return Ok(Vec::new());
                }
                self.seed()
            }
        }
    }

    /// Threshold met: build the genesis table, fragment its snapshot, and
    /// push the stream to every seed host.
    fn seed(&mut self) -> Result<Vec<Effect>, PlacementError> {
        let active: Vec<SocketAddr> = self.active.iter().copied().collect();
        let policy = RebalancePolicy::new();
        let table = policy.genesis(
            self.self_addr,
            &active,
            self.scatter_width,
            &self.initial_schemas,
        )?;
        let snapshot = table.encode_snapshot();
        self.parts = split_into_parts(&snapshot, CHUNK_SIZE);
        self.table = Some(table);
        self.boot_set = self.active.clone();
        self.phase = ServerPhase::Seeding;
        tracing::info!(
            "seeding {} hosts with {} bytes in {} fragments",
            self.boot_set.len() - 1,
            snapshot.len(),
            self.parts.len()
        );

        let mut effects = Vec::new();
        for host in &self.boot_set {
            if *host == self.self_addr {
                continue;
            }
            self.push_stream(*host, &mut effects);
        }
        // The server already holds the table; nothing to wait for from self.
        self.ready.insert(self.self_addr);
        Ok(effects)
    }

    fn handle_seeding(&mut self, event: ServerEvent, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            ServerEvent::Request { origin, .. } => {
                self.last_ping.insert(origin, now);
                // A renewed request during seeding means fragments were
                // lost; resend the whole stream.
                tracing::debug!("re-streaming table to {}", origin);
                self.push_stream(origin, &mut effects);
            }
            ServerEvent::Ready { src } => {
                self.last_ping.insert(src, now);
                if self.ready.insert(src) {
                    tracing::info!("{} is ready ({} total)", src, self.ready.len());
                }
                self.check_done(now, &mut effects);
            }
            ServerEvent::Tick => {
                self.check_done(now, &mut effects);
            }
        }
        effects
    }

    /// Recomputes the active set from recent pings intersected with the
    /// original seed set; once every still-active seed is ready, the
    /// cluster is up.
    fn check_done(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        let recent: HashSet<SocketAddr> = self
            .last_ping
            .iter()
            .filter(|(_, t)| now.duration_since(**t) <= RECENT_PING_WINDOW)
            .map(|(a, _)| *a)
            .collect();
        self.active = recent
            .intersection(&self.boot_set)
            .copied()
            .collect();
        self.active.insert(self.self_addr);

        let waiting: Vec<&SocketAddr> = self.active.difference(&self.ready).collect();
        if !waiting.is_empty() {
            tracing::debug!("still waiting on {:?}", waiting);
            return;
        }

        self.phase = ServerPhase::Done;
        let failed: Vec<SocketAddr> = self
            .boot_set
            .iter()
            .filter(|h| !self.ready.contains(h))
            .copied()
            .collect();
        let joined: Vec<SocketAddr> = recent
            .iter()
            .filter(|h| !self.boot_set.contains(h))
            .copied()
            .collect();
        tracing::info!(
            "bootstrap complete: {} ready, {} failed, {} late joiners",
            self.ready.len(),
            failed.len(),
            joined.len()
        );

        let mut recipients = recent.clone();
        recipients.extend(self.ready.iter().copied());
        for host in recipients {
            if host == self.self_addr {
                continue;
            }
            effects.push(Effect::Send {
                to: host,
                msg: BootMessage::BootUp {
                    src: self.self_addr,
                    dst: host,
                },
            });
        }
        if let Some(table) = self.table.clone() {
            effects.push(Effect::ServerDone(BootOutcome {
                table,
                failed,
                joined,
            }));
        }
        effects.push(Effect::StopTimer);
    }

    /// Stragglers after the transition still get told the cluster is up.
    fn handle_done(&mut self, event: ServerEvent) -> Vec<Effect> {
        match event {
            ServerEvent::Request { origin, .. } | ServerEvent::Ready { src: origin } => {
                vec![Effect::Send {
                    to: origin,
                    msg: BootMessage::BootUp {
                        src: self.self_addr,
                        dst: origin,
                    },
                }]
            }
            ServerEvent::Tick => Vec::new(),
        }
    }

    fn push_stream(&self, to: SocketAddr, effects: &mut Vec<Effect>) {
        for part in &self.parts {
            effects.push(Effect::Send {
                to,
                msg: BootMessage::Part(part.clone()),
            });
        }
    }
}

//! Node Runtime
//!
//! Drives the control-plane state machines on one node: a single-consumer
//! event channel, a UDP socket pump for bootstrap datagrams, and periodic
//! timers. Every handler is short and runs to completion; waiting is
//! retained state inside the machines plus a timer, never a blocking call.
//!
//! The runtime owns the node's lookup table (through the update manager)
//! and hands a reference into every component that needs it; there is no
//! process-wide "current table" static.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bootstrap::{
    BootMessage, BootstrapClient, BootstrapServer, ClientEvent, Effect, ServerEvent,
    decode_message, encode_message,
};
use crate::config::NodeConfig;
use crate::lut::{LookupTable, ReplicationSet};
use crate::placement::{HostStats, RebalancePolicy, SchemaRequest};
use crate::store::{ClusterEvent, MemoryStore, ReplicatedLog, StoreError};
use crate::updates::{Update, UpdateError, UpdateManager, VNodeHooks};

const BOOT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const CATCH_UP_INTERVAL: Duration = Duration::from_secs(2);
const REBALANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Everything that can happen to a node, funneled through one channel so
/// handlers never overlap.
#[derive(Debug)]
pub enum NodeEvent {
    Datagram { from: SocketAddr, bytes: Vec<u8> },
    BootTick,
    CatchUpTick,
    RebalanceTick,
    /// An update the replicated log decided on.
    Committed(Update),
    /// Join/fail feed from the failure detector.
    Cluster(ClusterEvent),
    /// Administrative schema create/drop request.
    Schema(SchemaRequest),
    /// A stats sample for one host.
    Stats(u32, HostStats),
}

/// Replicated log that commits straight back into the local event channel.
/// Stands in for the external consensus engine in single-log deployments
/// and tests.
pub struct LoopbackLog {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl LoopbackLog {
    pub fn new(tx: mpsc::UnboundedSender<NodeEvent>) -> Self {
        LoopbackLog { tx }
    }
}

impl ReplicatedLog for LoopbackLog {
    fn propose(&self, update: Update) -> Result<(), StoreError> {
        self.tx
            .send(NodeEvent::Committed(update))
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}

/// Hooks that log partition transitions. A storage node would start and
/// stop its partition servers here; the control plane records the fact.
pub struct LoggingHooks;

impl VNodeHooks for LoggingHooks {
    fn start_vnode(&mut self, set: &ReplicationSet) {
        tracing::info!("serving partitions of replication set {}", set.id);
    }
    fn kill_vnode(&mut self, set_id: u32, _old_members: &[u32]) {
        tracing::info!("releasing partitions of replication set {}", set_id);
    }
    fn reconf(&mut self, set: &ReplicationSet, old_members: &[u32]) {
        tracing::info!(
            "replica view of set {} changed: {:?} -> {:?}",
            set.id,
            old_members,
            set.members
        );
    }
}

enum Phase {
    Booting(BootRole),
    Running(UpdateManager<MemoryStore>),
}

enum BootRole {
    Server(BootstrapServer),
    Client(BootstrapClient),
}

pub struct NodeRuntime {
    config: NodeConfig,
    socket: Arc<UdpSocket>,
    tx: mpsc::UnboundedSender<NodeEvent>,
    rx: mpsc::UnboundedReceiver<NodeEvent>,
    store: Arc<MemoryStore>,
    policy: RebalancePolicy,
    phase: Phase,
    /// Updates committed while still bootstrapping, replayed on transition.
    pending_updates: Vec<Update>,
    pending_cluster: Vec<ClusterEvent>,
    pending_schemas: Vec<SchemaRequest>,
    host_stats: HashMap<u32, HostStats>,
    boot_timer: Option<JoinHandle<()>>,
    catch_up_timer: Option<JoinHandle<()>>,
}

impl NodeRuntime {
    pub async fn start(config: NodeConfig) -> Result<NodeRuntime> {
        let socket = Arc::new(UdpSocket::bind(config.bind).await?);
        let (tx, rx) = mpsc::unbounded_channel();

        let phase = if config.is_bootstrap_server() {
            tracing::info!("starting as bootstrap server on {}", config.bind);
            Phase::Booting(BootRole::Server(BootstrapServer::new(
                config.bind,
                config.boot_threshold,
                config.scatter_width,
                Vec::new(),
            )))
        } else {
            tracing::info!(
                "starting as bootstrap client on {} (server {})",
                config.bind,
                config.seeds[0]
            );
            Phase::Booting(BootRole::Client(BootstrapClient::new(
                config.bind,
                config.seeds[0],
            )))
        };

        Ok(NodeRuntime {
            config,
            socket,
            tx,
            rx,
            store: Arc::new(MemoryStore::new()),
            policy: RebalancePolicy::new(),
            phase,
            pending_updates: Vec::new(),
            pending_cluster: Vec::new(),
            pending_schemas: Vec::new(),
            host_stats: HashMap::new(),
            boot_timer: None,
            catch_up_timer: None,
        })
    }

    /// Sender for feeding external events (consensus decisions, failure
    /// detector output, admin requests) into the node.
    pub fn handle(&self) -> mpsc::UnboundedSender<NodeEvent> {
        self.tx.clone()
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    /// Runs until the node halts. Returns an error only on fatal
    /// divergence, where continuing could serve wrong routing data.
    pub async fn run(mut self) -> Result<()> {
        self.spawn_recv_loop();
        self.boot_timer = Some(self.spawn_interval(BOOT_TICK_INTERVAL, || NodeEvent::BootTick));
        self.spawn_rebalance_timer();

        while let Some(event) = self.rx.recv().await {
            if !self.dispatch(event).await? {
                break;
            }
        }
        Ok(())
    }

    fn spawn_recv_loop(&self) {
        let socket = self.socket.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let _ = tx.send(NodeEvent::Datagram {
                            from,
                            bytes: buf[..len].to_vec(),
                        });
                    }
                    Err(e) => {
                        tracing::error!("failed to receive datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
    }

    fn spawn_interval(
        &self,
        period: Duration,
        event: impl Fn() -> NodeEvent + Send + 'static,
    ) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if tx.send(event()).is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_rebalance_timer(&self) {
        let _ = self.spawn_interval(REBALANCE_INTERVAL, || NodeEvent::RebalanceTick);
    }

    async fn dispatch(&mut self, event: NodeEvent) -> Result<bool> {
        match event {
            NodeEvent::Datagram { from, bytes } => {
                let datagram = match decode_message(&bytes) {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("undecodable datagram from {}: {}", from, e);
                        return Ok(true);
                    }
                };
                let effects = self.feed_boot_machine(datagram.msg, datagram.forwarded);
                self.process_effects(effects).await;
                Ok(true)
            }
            NodeEvent::BootTick => {
                let effects = match &mut self.phase {
                    Phase::Booting(BootRole::Server(server)) => {
                        match server.handle(ServerEvent::Tick, Instant::now()) {
                            Ok(effects) => effects,
                            Err(e) => {
                                tracing::error!("genesis attempt failed: {}", e);
                                Vec::new()
                            }
                        }
                    }
                    Phase::Booting(BootRole::Client(client)) => client.handle(ClientEvent::Tick),
                    Phase::Running(_) => Vec::new(),
                };
                self.process_effects(effects).await;
                Ok(true)
            }
            NodeEvent::CatchUpTick => {
                if let Phase::Running(manager) = &mut self.phase {
                    if manager.awaiting_backfill() {
                        manager.run_backfill(&mut LoggingHooks)?;
                    }
                    if !manager.awaiting_backfill()
                        && let Some(timer) = self.catch_up_timer.take()
                    {
                        timer.abort();
                    }
                }
                Ok(true)
            }
            NodeEvent::Committed(update) => self.on_committed(update),
            NodeEvent::Cluster(ev) => {
                self.pending_cluster.push(ev);
                Ok(true)
            }
            NodeEvent::Schema(req) => {
                self.pending_schemas.push(req);
                Ok(true)
            }
            NodeEvent::Stats(host, stats) => {
                self.host_stats.insert(host, stats);
                Ok(true)
            }
            NodeEvent::RebalanceTick => self.on_rebalance_tick(),
        }
    }

    fn feed_boot_machine(&mut self, msg: BootMessage, forwarded: bool) -> Vec<Effect> {
        match &mut self.phase {
            Phase::Booting(BootRole::Server(server)) => {
                let event = match msg {
                    BootMessage::Request { origin } => {
                        Some(ServerEvent::Request { origin, forwarded })
                    }
                    BootMessage::Ready { src, .. } => Some(ServerEvent::Ready { src }),
                    _ => None,
                };
                match event {
                    Some(event) => match server.handle(event, Instant::now()) {
                        Ok(effects) => effects,
                        Err(e) => {
                            tracing::error!("bootstrap server error: {}", e);
                            Vec::new()
                        }
                    },
                    None => Vec::new(),
                }
            }
            Phase::Booting(BootRole::Client(client)) => {
                let event = match msg {
                    BootMessage::Part(part) => Some(ClientEvent::Part(part)),
                    BootMessage::BootUp { .. } => Some(ClientEvent::BootUp),
                    _ => None,
                };
                event.map(|e| client.handle(e)).unwrap_or_default()
            }
            Phase::Running(_) => Vec::new(),
        }
    }

    async fn process_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, msg } => match encode_message(&msg, false) {
                    Ok(bytes) => {
                        if let Err(e) = self.socket.send_to(&bytes, to).await {
                            tracing::warn!("failed to send to {}: {}", to, e);
                        }
                    }
                    Err(e) => tracing::error!("failed to encode message: {}", e),
                },
                Effect::ServerDone(outcome) => {
                    for failed in &outcome.failed {
                        self.pending_cluster.push(ClusterEvent::Failed(*failed));
                    }
                    for joined in &outcome.joined {
                        self.pending_cluster.push(ClusterEvent::Joined(*joined));
                    }
                    self.go_running(outcome.table);
                }
                Effect::ClientDone(table) => self.go_running(table),
                Effect::StopTimer => {
                    if let Some(timer) = self.boot_timer.take() {
                        timer.abort();
                    }
                }
            }
        }
    }

    fn go_running(&mut self, table: LookupTable) {
        tracing::info!(
            "bootstrapped: table v{}, {} hosts, update handling begins",
            table.version(),
            table.hosts_len()
        );
        let mut manager = UpdateManager::new(table, self.config.bind, self.store.clone());
        for update in std::mem::take(&mut self.pending_updates) {
            if let Err(e) = manager.handle_update(update, &mut LoggingHooks) {
                tracing::error!("buffered update failed to apply: {}", e);
            }
        }
        self.phase = Phase::Running(manager);
    }

    fn on_committed(&mut self, update: Update) -> Result<bool> {
        let Phase::Running(manager) = &mut self.phase else {
            // The map is not seeded yet; replay once it is.
            self.pending_updates.push(update);
            return Ok(true);
        };
        match manager.handle_update(update, &mut LoggingHooks) {
            Ok(outcome) => {
                tracing::debug!("update outcome: {:?}", outcome);
                if manager.awaiting_backfill() && self.catch_up_timer.is_none() {
                    self.catch_up_timer =
                        Some(self.spawn_interval(CATCH_UP_INTERVAL, || NodeEvent::CatchUpTick));
                }
                Ok(true)
            }
            Err(e @ UpdateError::MasterDivergence) => {
                tracing::error!("halting: {}", e);
                Ok(false)
            }
            Err(e) => {
                tracing::error!("halting on apply failure: {}", e);
                Ok(false)
            }
        }
    }

    /// The placement pass runs on the master group's first member only;
    /// everyone else just applies the resulting updates.
    fn on_rebalance_tick(&mut self) -> Result<bool> {
        let Phase::Running(manager) = &mut self.phase else {
            return Ok(true);
        };
        let table = manager.table();
        let is_leader = table
            .host_id_of(&self.config.bind)
            .zip(table.rep_set(crate::lut::MASTER_SET_ID))
            .map(|(id, set)| set.members.first() == Some(&id))
            .unwrap_or(false);
        if !is_leader {
            return Ok(true);
        }
        if self.pending_cluster.is_empty() && self.pending_schemas.is_empty() {
            return Ok(true);
        }

        let mut joined = Vec::new();
        let mut failed = Vec::new();
        for ev in self.pending_cluster.drain(..) {
            match ev {
                ClusterEvent::Joined(a) => joined.push(a),
                ClusterEvent::Failed(a) => failed.push(a),
            }
        }
        let requests = std::mem::take(&mut self.pending_schemas);

        match self
            .policy
            .rebalance(table, &joined, &failed, &self.host_stats, &requests)
        {
            Ok(Some(update)) => {
                tracing::info!(
                    "proposing update v{} with {} actions",
                    update.version,
                    update.actions.len()
                );
                let log = LoopbackLog::new(self.tx.clone());
                if let Err(e) = log.propose(update) {
                    tracing::error!("failed to propose update: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!("rebalance failed: {}", e),
        }
        Ok(true)
    }
}

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::net::SocketAddr;

use crate::keys::Key;
use crate::lut::schema::{CatalogError, META_SCHEMA_ID, META_SCHEMA_NAME};
use crate::lut::{LookupTable, MASTER_SET_ID, ReplicationSet, Schema, SchemaId};
use crate::placement::copyset::create_copysets;
use crate::placement::stats::{HostStats, LoadAverages};
use crate::updates::{NullHooks, Update, WorkingBuffer};

/// Cap on structural actions staged per invocation, bounding how much data
/// movement one control cycle can trigger. Past the cap the optional
/// balancing passes are skipped; repair and schema provisioning always
/// finish what they started.
const MAX_STRUCTURAL_ACTIONS: usize = 5;

/// Size of the least-loaded candidate pool used for replica repair.
const CANDIDATE_POOL: usize = 8;

/// Cluster cpu EMA below which load swaps would not even be considered.
const CPU_SWAP_THRESHOLD: f64 = 0.6;

/// An administrative request to create or drop a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaRequest {
    Create {
        name: String,
        /// Explicit id; derived from the name when absent.
        id: Option<SchemaId>,
        meta: BTreeMap<String, String>,
    },
    Drop {
        id: SchemaId,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("need {needed} live hosts, have {live}")]
    NotEnoughHosts { needed: usize, live: usize },
    #[error("no free schema id left")]
    NoFreeSchemaId,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("genesis update failed to apply: {0}")]
    Genesis(String),
}

/// Computes lookup-table diffs from cluster events and stats.
///
/// Stateless apart from the load averages and the memory of which id a
/// failed address held, which enables the rejoin fast path across
/// invocations: a host coming back at the same address gets its old id, so
/// replica identity is preserved and copysets do not churn.
pub struct RebalancePolicy {
    loads: LoadAverages,
    retired: HashMap<SocketAddr, u32>,
    load_swaps_enabled: bool,
}

impl Default for RebalancePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RebalancePolicy {
    pub fn new() -> Self {
        RebalancePolicy {
            loads: LoadAverages::new(),
            retired: HashMap::new(),
            // Load-based swaps stay off until validated under churn; the
            // interface and gating are kept so enabling is a one-line change.
            load_swaps_enabled: false,
        }
    }

    pub fn loads(&self) -> &LoadAverages {
        &self.loads
    }

    /// One control cycle: fold in stats, place joined hosts, repair around
    /// failed ones, serve schema requests, and assemble at most one update.
    pub fn rebalance(
        &mut self,
        table: &LookupTable,
        joined: &[SocketAddr],
        failed: &[SocketAddr],
        stats: &HashMap<u32, HostStats>,
        requests: &[SchemaRequest],
    ) -> Result<Option<Update>, PlacementError> {
        self.loads.observe(stats);
        let mut working = WorkingBuffer::new(table);

        // Failed addresses to host ids; addresses unknown to the table have
        // nothing to repair.
        let mut failed_ids: HashMap<SocketAddr, u32> = failed
            .iter()
            .filter_map(|a| table.host_id_of(a).map(|id| (*a, id)))
            .collect();

        for addr in joined {
            if working.host_id_of(addr).is_some() {
                // Includes the fast rejoin within one cycle: the address
                // still sits in its old slot, so failing and rejoining nets
                // out to no action at all.
                if failed_ids.remove(addr).is_some() {
                    tracing::info!("host {} rejoined before its slot was vacated", addr);
                }
                continue;
            }
            let id = match self.retired.get(addr) {
                // A failed host back at the same address reclaims its id.
                Some(&old) if working.host(old).is_none() => {
                    tracing::info!("host {} rejoined, reusing id {}", addr, old);
                    old
                }
                _ => match working.vacant_host_ids().first() {
                    Some(&vacant) => vacant,
                    None => working.hosts_len() as u32,
                },
            };
            self.retired.remove(addr);
            working.put_host(id, Some(*addr));
        }

        let mut repair_ids: Vec<u32> = Vec::new();
        for (addr, id) in &failed_ids {
            tracing::warn!("host {} (id {}) failed, vacating slot", addr, id);
            working.put_host(*id, None);
            self.retired.insert(*addr, *id);
            repair_ids.push(*id);
        }
        if !repair_ids.is_empty() {
            self.repair_sets(&mut working, &repair_ids, stats)?;
        }

        for request in requests {
            match request {
                SchemaRequest::Create { name, id, meta } => {
                    if working.schema_by_name(name).is_some() {
                        tracing::warn!("schema {:?} already exists, skipping create", name);
                        continue;
                    }
                    self.provision_schema(&mut working, name, *id, meta)?;
                }
                SchemaRequest::Drop { id } => self.drop_schema(&mut working, id),
            }
        }

        if working.staged_action_count() <= MAX_STRUCTURAL_ACTIONS {
            self.balance_by_size(&mut working, stats);
            self.balance_by_cpu(&mut working, stats);
        } else {
            tracing::debug!(
                "{} structural actions staged, skipping balance passes",
                working.staged_action_count()
            );
        }

        Ok(working.assemble_update())
    }

    /// Replaces every failed member of every replication set with the
    /// least-loaded host not already in that set.
    fn repair_sets(
        &self,
        working: &mut WorkingBuffer<'_>,
        failed: &[u32],
        stats: &HashMap<u32, HostStats>,
    ) -> Result<(), PlacementError> {
        let cluster_avg = average_projected_size(working, failed, stats);
        let mut heap = candidate_heap(working, failed, stats);

        for set_id in working.rep_set_ids() {
            let Some(set) = working.rep_set(set_id) else {
                continue;
            };
            if !set.members.iter().any(|m| failed.contains(m)) {
                continue;
            }
            let mut members = set.members.clone();
            let version = set.version;

            // Estimated bytes a replacement will take on: the mean size of
            // the set's surviving members.
            let survivors: Vec<u64> = members
                .iter()
                .filter(|m| !failed.contains(m))
                .filter_map(|m| stats.get(m).map(HostStats::projected_size))
                .collect();
            let per_member = if survivors.is_empty() {
                cluster_avg
            } else {
                survivors.iter().sum::<u64>() / survivors.len() as u64
            };

            for slot in 0..members.len() {
                if !failed.contains(&members[slot]) {
                    continue;
                }
                // A pool whose cheapest entry is already above the cluster
                // average has gone stale; rebuild it from current stats.
                if let Some(Reverse((cheapest, _))) = heap.peek()
                    && *cheapest > cluster_avg
                    && cluster_avg > 0
                {
                    heap = candidate_heap(working, failed, stats);
                }

                let mut stash = Vec::new();
                let mut replacement = None;
                while let Some(Reverse((cost, id))) = heap.pop() {
                    if members.contains(&id) {
                        stash.push(Reverse((cost, id)));
                        continue;
                    }
                    replacement = Some((cost, id));
                    break;
                }
                for entry in stash {
                    heap.push(entry);
                }
                let Some((cost, id)) = replacement else {
                    return Err(PlacementError::NotEnoughHosts {
                        needed: members.len(),
                        live: working.live_host_ids().len(),
                    });
                };
                tracing::info!(
                    "replacing failed host {} with {} in replication set {}",
                    members[slot],
                    id,
                    set_id
                );
                members[slot] = id;
                // Re-insert with the added load so one idle host does not
                // absorb every replacement of this pass.
                heap.push(Reverse((cost + per_member, id)));
            }
            working.put_rep_set(ReplicationSet::new(set_id, version + 1, members));
        }
        Ok(())
    }

    /// Creates a schema: assigns its id, builds replica sets through the
    /// copyset generator (or routes to the master group), and lays out its
    /// virtual-node boundaries round-robin across the new sets.
    fn provision_schema(
        &self,
        working: &mut WorkingBuffer<'_>,
        name: &str,
        explicit_id: Option<SchemaId>,
        meta: &BTreeMap<String, String>,
    ) -> Result<(), PlacementError> {
        let id = match explicit_id {
            Some(id) => id,
            None => derive_free_id(working, name)?,
        };
        let mut schema = Schema::new(id, name);
        schema.meta = meta.clone();
        let rfactor = schema.rfactor();
        let vnodes = schema.vnodes();

        let set_ids: Vec<u32> = if schema.force_master() {
            vec![MASTER_SET_ID]
        } else {
            let live = working.live_host_ids();
            if live.len() < rfactor {
                return Err(PlacementError::NotEnoughHosts {
                    needed: rfactor,
                    live: live.len(),
                });
            }
            let mut rng = rand::thread_rng();
            let copysets = create_copysets(
                &mut rng,
                &live,
                rfactor,
                working.base().scatter_width(),
                &working.copyset_members(),
            );
            if copysets.is_empty() {
                // Every candidate already exists; share the existing sets of
                // the right size instead of refusing the schema.
                let reusable: Vec<u32> = working
                    .rep_set_ids()
                    .into_iter()
                    .filter(|sid| {
                        working
                            .rep_set(*sid)
                            .map(|s| s.members.len() == rfactor)
                            .unwrap_or(false)
                    })
                    .collect();
                if reusable.is_empty() {
                    return Err(PlacementError::NotEnoughHosts {
                        needed: rfactor,
                        live: live.len(),
                    });
                }
                tracing::warn!(
                    "no fresh copysets available for schema {:?}, reusing {} existing sets",
                    name,
                    reusable.len()
                );
                reusable
            } else {
                copysets
                    .into_iter()
                    .map(|members| {
                        let set_id = working.next_set_id();
                        working.put_rep_set(ReplicationSet::new(set_id, 1, members));
                        set_id
                    })
                    .collect()
            }
        };

        tracing::info!(
            "provisioning schema {:?} ({:02x?}): rfactor {}, {} vnodes over {} sets",
            name,
            id,
            rfactor,
            vnodes,
            set_ids.len()
        );
        working.add_schema(schema)?;
        for (i, boundary) in vnode_boundaries(&id, vnodes).into_iter().enumerate() {
            working.put_rep_group(boundary, Some(set_ids[i % set_ids.len()]));
        }
        Ok(())
    }

    /// Drops a schema: removes the catalog entry and tombstones every
    /// virtual node inside its range.
    fn drop_schema(&self, working: &mut WorkingBuffer<'_>, id: &SchemaId) {
        if working.schema(id).is_none() {
            tracing::warn!("drop request for unknown schema {:02x?}", id);
            return;
        }
        for (key, _) in working.base().virtual_nodes_in_schema(id) {
            working.put_rep_group(key, None);
        }
        working.remove_schema(id);
        tracing::info!("dropped schema {:02x?}", id);
    }

    /// Moves a virtual node from the most to the least loaded host.
    /// Disabled: stages nothing until load swaps are switched on.
    fn balance_by_size(&self, working: &mut WorkingBuffer<'_>, stats: &HashMap<u32, HostStats>) {
        if !self.load_swaps_enabled {
            return;
        }
        let Some((largest, smallest)) = extreme_hosts(stats, |s| s.projected_size() as f64) else {
            return;
        };
        self.swap_one_membership(working, largest, smallest);
    }

    /// Same swap driven by the cpu average instead of stored size.
    /// Disabled: stages nothing until load swaps are switched on.
    fn balance_by_cpu(&self, working: &mut WorkingBuffer<'_>, stats: &HashMap<u32, HostStats>) {
        if !self.load_swaps_enabled {
            return;
        }
        if self.loads.cpu() < CPU_SWAP_THRESHOLD {
            return;
        }
        let Some((busiest, idlest)) = extreme_hosts(stats, |s| s.cpu) else {
            return;
        };
        self.swap_one_membership(working, busiest, idlest);
    }

    fn swap_one_membership(&self, working: &mut WorkingBuffer<'_>, from: u32, to: u32) {
        if from == to {
            return;
        }
        let candidate = working.rep_set_ids().into_iter().find(|sid| {
            working
                .rep_set(*sid)
                .map(|s| s.contains(from) && !s.contains(to))
                .unwrap_or(false)
        });
        let Some(set_id) = candidate else {
            return;
        };
        let Some(set) = working.rep_set(set_id) else {
            return;
        };
        let mut members = set.members.clone();
        let version = set.version;
        for member in members.iter_mut() {
            if *member == from {
                *member = to;
                break;
            }
        }
        tracing::info!(
            "balancing: moving membership of set {} from host {} to {}",
            set_id,
            from,
            to
        );
        working.put_rep_set(ReplicationSet::new(set_id, version + 1, members));
    }

    /// Builds the very first lookup table for a fresh cluster: the dense
    /// host array (bootstrap host at id 0), the master group, the metadata
    /// schema that carries the update log, and any configured schemas.
    pub fn genesis(
        &self,
        bootstrap_addr: SocketAddr,
        active: &[SocketAddr],
        scatter_width: u32,
        initial_schemas: &[SchemaRequest],
    ) -> Result<LookupTable, PlacementError> {
        let mut table = LookupTable::new(scatter_width);

        let mut others: Vec<SocketAddr> = active
            .iter()
            .copied()
            .filter(|a| *a != bootstrap_addr)
            .collect();
        others.sort();
        others.dedup();
        table.put_host(0, Some(bootstrap_addr));
        for (i, addr) in others.iter().enumerate() {
            table.put_host(i as u32 + 1, Some(*addr));
        }

        // Master group: bootstrap host plus the lowest ids up to the
        // default replication factor.
        let master_size = (1 + others.len()).min(crate::lut::schema::DEFAULT_RFACTOR);
        let members: Vec<u32> = (0..master_size as u32).collect();
        table.put_rep_set(ReplicationSet::new(MASTER_SET_ID, 1, members));

        let meta_schema = Schema::new(META_SCHEMA_ID, META_SCHEMA_NAME)
            .with_meta("forceMaster", "true")
            .with_meta("rfactor", &master_size.to_string());
        table.catalog_mut().insert(meta_schema)?;
        let meta_boundary = Key::new(META_SCHEMA_ID.to_vec());
        table
            .group_for_mut(&meta_boundary)
            .put(meta_boundary.clone(), Some(MASTER_SET_ID));

        // Configured schemas go through the same provisioning code a live
        // cluster uses, one update per schema.
        for request in initial_schemas {
            let SchemaRequest::Create { name, id, meta } = request else {
                continue;
            };
            let update = {
                let mut working = WorkingBuffer::new(&table);
                self.provision_schema(&mut working, name, *id, meta)?;
                working.assemble_update()
            };
            if let Some(update) = update {
                update
                    .apply(&mut table, None, &mut NullHooks)
                    .map_err(|e| PlacementError::Genesis(e.to_string()))?;
            }
        }
        Ok(table)
    }
}

/// Lowest-load candidate pool: the bottom-k hosts by combined cpu/mem,
/// ordered in the heap by projected stored size.
fn candidate_heap(
    working: &WorkingBuffer<'_>,
    failed: &[u32],
    stats: &HashMap<u32, HostStats>,
) -> BinaryHeap<Reverse<(u64, u32)>> {
    let mut hosts: Vec<u32> = working
        .live_host_ids()
        .into_iter()
        .filter(|id| !failed.contains(id))
        .collect();
    hosts.sort_by(|a, b| {
        let load = |id: &u32| {
            stats
                .get(id)
                .map(|s| s.cpu + s.mem)
                .unwrap_or(0.0)
        };
        load(a).partial_cmp(&load(b)).unwrap_or(std::cmp::Ordering::Equal)
    });
    hosts
        .into_iter()
        .take(CANDIDATE_POOL)
        .map(|id| {
            let size = stats.get(&id).map(HostStats::projected_size).unwrap_or(0);
            Reverse((size, id))
        })
        .collect()
}

fn average_projected_size(
    working: &WorkingBuffer<'_>,
    failed: &[u32],
    stats: &HashMap<u32, HostStats>,
) -> u64 {
    let sizes: Vec<u64> = working
        .live_host_ids()
        .into_iter()
        .filter(|id| !failed.contains(id))
        .filter_map(|id| stats.get(&id).map(HostStats::projected_size))
        .collect();
    if sizes.is_empty() {
        0
    } else {
        sizes.iter().sum::<u64>() / sizes.len() as u64
    }
}

fn extreme_hosts<F: Fn(&HostStats) -> f64>(
    stats: &HashMap<u32, HostStats>,
    load: F,
) -> Option<(u32, u32)> {
    let max = stats
        .iter()
        .max_by(|a, b| load(a.1).total_cmp(&load(b.1)))?;
    let min = stats
        .iter()
        .min_by(|a, b| load(a.1).total_cmp(&load(b.1)))?;
    Some((*max.0, *min.0))
}

fn derive_free_id(working: &WorkingBuffer<'_>, name: &str) -> Result<SchemaId, PlacementError> {
    let mut candidate = working
        .base()
        .catalog()
        .derive_id(name)
        .ok_or(PlacementError::NoFreeSchemaId)?;
    // The base catalog cannot see schemas staged this cycle; probe past
    // them too.
    for _ in 0..=u16::MAX as u32 {
        if candidate != META_SCHEMA_ID && working.schema(&candidate).is_none() {
            return Ok(candidate);
        }
        candidate = u16::from_be_bytes(candidate).wrapping_add(1).to_be_bytes();
    }
    Err(PlacementError::NoFreeSchemaId)
}

/// Splits a schema's range into `vnodes` equal-width boundaries: the
/// narrowest numeric suffix of 1, 4, or 8 bytes that can express the
/// required number of evenly spaced increments.
pub fn vnode_boundaries(id: &SchemaId, vnodes: usize) -> Vec<Key> {
    let base = Key::new(id.to_vec());
    if vnodes <= 1 {
        return vec![base];
    }
    let width: usize = if vnodes <= 1 << 8 {
        1
    } else if (vnodes as u128) <= 1u128 << 32 {
        4
    } else {
        8
    };
    let space: u128 = 1u128 << (8 * width);
    let step = space / vnodes as u128;
    (0..vnodes)
        .map(|i| {
            let value = (i as u128) * step;
            let bytes = value.to_be_bytes();
            base.append(&bytes[16 - width..])
        })
        .collect()
}

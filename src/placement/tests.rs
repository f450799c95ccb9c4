use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;

use crate::keys::Key;
use crate::lut::schema::META_SCHEMA_ID;
use crate::lut::{LookupTable, ReplicationSet, SchemaId};
use crate::placement::policy::{RebalancePolicy, SchemaRequest, vnode_boundaries};
use crate::placement::stats::HostStats;
use crate::updates::{NullHooks, update_log_key};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn cluster(hosts: usize) -> LookupTable {
    let mut policy = RebalancePolicy::new();
    let active: Vec<SocketAddr> = (0..hosts as u16).map(|i| addr(7000 + i)).collect();
    policy.genesis(addr(7000), &active, 4, &[]).unwrap()
}

fn create_request(name: &str, meta: &[(&str, &str)]) -> SchemaRequest {
    SchemaRequest::Create {
        name: name.to_string(),
        id: None,
        meta: meta
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn no_stats() -> HashMap<u32, HostStats> {
    HashMap::new()
}

// ============================================================
// GENESIS
// ============================================================

#[test]
fn test_genesis_builds_master_group_and_meta_schema() {
    let table = cluster(5);

    assert_eq!(table.hosts_len(), 5);
    assert_eq!(table.host(0), Some(&addr(7000)), "bootstrap host gets id 0");

    let master = table.rep_set(0).expect("master set must exist");
    assert!(master.contains(0), "master group contains the bootstrap host");
    assert_eq!(master.members.len(), 3);
    assert_eq!(table.master_rep_size(), 3);

    // The metadata schema routes the update log onto the master group.
    assert!(table.catalog().get(&META_SCHEMA_ID).is_some());
    let log_key = Key::new(update_log_key(17));
    assert_eq!(table.responsibles_for(&log_key).unwrap().id, 0);
}

#[test]
fn test_genesis_with_two_hosts_has_smaller_master_group() {
    let table = cluster(2);
    assert_eq!(table.master_rep_size(), 2);
}

#[test]
fn test_genesis_provisions_initial_schemas() {
    let policy = RebalancePolicy::new();
    let active: Vec<SocketAddr> = (0..6u16).map(|i| addr(7000 + i)).collect();
    let table = policy
        .genesis(
            addr(7000),
            &active,
            4,
            &[create_request("books", &[("vnodes", "4")])],
        )
        .unwrap();

    let schema = table.catalog().get_by_name("books").expect("schema exists");
    assert_eq!(table.virtual_nodes_in_schema(&schema.id).len(), 4);
    assert_eq!(table.version(), 1, "one update per provisioned schema");
}

// ============================================================
// JOIN / FAIL / REPAIR
// ============================================================

#[test]
fn test_join_appends_and_reuses_vacant_slots() {
    let table = cluster(3);
    let mut policy = RebalancePolicy::new();

    // A brand new host gets a fresh id at the end of the array.
    let update = policy
        .rebalance(&table, &[addr(7010)], &[], &no_stats(), &[])
        .unwrap()
        .expect("a join must stage something");
    let mut grown = table.clone();
    update.apply(&mut grown, None, &mut NullHooks).unwrap();
    assert_eq!(grown.host_id_of(&addr(7010)), Some(3));
}

#[test]
fn test_failed_host_is_vacated_and_sets_repaired() {
    let table = cluster(5);
    let mut policy = RebalancePolicy::new();
    let mut stats = HashMap::new();
    for id in 0..5u32 {
        stats.insert(id, HostStats {
            cpu: 0.1 * id as f64,
            mem: 0.1,
            avg_item_size: 1024,
            vnode_count: id as u64,
        });
    }

    let update = policy
        .rebalance(&table, &[], &[addr(7001)], &stats, &[])
        .unwrap()
        .expect("a failure must stage something");
    let mut repaired = table.clone();
    update.apply(&mut repaired, None, &mut NullHooks).unwrap();

    assert_eq!(repaired.host(1), None, "failed slot is vacated");
    let master = repaired.rep_set(0).unwrap();
    assert!(!master.contains(1), "failed id must be replaced");
    assert_eq!(master.members.len(), 3);
    let unique: BTreeSet<u32> = master.members.iter().copied().collect();
    assert_eq!(unique.len(), 3, "members stay pairwise distinct");
    assert!(
        master.version > 1,
        "membership change bumps the set version"
    );
}

#[test]
fn test_rejoin_at_same_address_reclaims_old_id() {
    let mut table = cluster(5);
    let mut policy = RebalancePolicy::new();

    let update = policy
        .rebalance(&table, &[], &[addr(7004)], &no_stats(), &[])
        .unwrap()
        .expect("failure stages an update");
    update.apply(&mut table, None, &mut NullHooks).unwrap();
    assert_eq!(table.host(4), None);

    // The same address comes back: it must land in slot 4 again.
    let update = policy
        .rebalance(&table, &[addr(7004)], &[], &no_stats(), &[])
        .unwrap()
        .expect("rejoin stages an update");
    let mut rejoined = table.clone();
    update.apply(&mut rejoined, None, &mut NullHooks).unwrap();
    assert_eq!(rejoined.host_id_of(&addr(7004)), Some(4));
}

#[test]
fn test_fail_and_rejoin_in_one_cycle_is_a_noop() {
    let table = cluster(3);
    let mut policy = RebalancePolicy::new();

    let update = policy
        .rebalance(&table, &[addr(7001)], &[addr(7001)], &no_stats(), &[])
        .unwrap();
    assert!(update.is_none(), "rejoin before vacating nets out to nothing");
}

// ============================================================
// SCHEMA PROVISIONING
// ============================================================

#[test]
fn test_create_schema_lays_out_vnodes_round_robin() {
    let table = cluster(9);
    let mut policy = RebalancePolicy::new();

    let update = policy
        .rebalance(
            &table,
            &[],
            &[],
            &no_stats(),
            &[create_request("books", &[("vnodes", "8"), ("rfactor", "3")])],
        )
        .unwrap()
        .expect("schema creation stages an update");
    let mut next = table.clone();
    update.apply(&mut next, None, &mut NullHooks).unwrap();

    let schema = next.catalog().get_by_name("books").expect("registered");
    let vnodes = next.virtual_nodes_in_schema(&schema.id);
    assert_eq!(vnodes.len(), 8);

    // Every boundary resolves, and every referenced set has 3 distinct
    // members of live hosts.
    let mut used_sets = BTreeSet::new();
    for (key, set_id) in &vnodes {
        assert_eq!(next.responsibles_for(key).unwrap().id, *set_id);
        used_sets.insert(*set_id);
        let set = next.rep_set(*set_id).unwrap();
        assert_eq!(set.member_set().len(), 3);
    }
    assert!(used_sets.len() > 1, "vnodes spread across several sets");

    // Copysets of equal size stay pairwise distinct across the whole table.
    let all: Vec<BTreeSet<u32>> = next
        .iter_rep_sets()
        .filter(|s| s.members.len() == 3)
        .map(ReplicationSet::member_set)
        .collect();
    let unique: BTreeSet<BTreeSet<u32>> = all.iter().cloned().collect();
    assert_eq!(unique.len(), all.len());
}

#[test]
fn test_force_master_schema_lands_on_set_zero() {
    let table = cluster(5);
    let mut policy = RebalancePolicy::new();

    let update = policy
        .rebalance(
            &table,
            &[],
            &[],
            &no_stats(),
            &[create_request(
                "settings",
                &[("forceMaster", "true"), ("vnodes", "2")],
            )],
        )
        .unwrap()
        .expect("schema creation stages an update");
    let mut next = table.clone();
    let sets_before = next.rep_sets_len();
    update.apply(&mut next, None, &mut NullHooks).unwrap();

    let schema = next.catalog().get_by_name("settings").unwrap();
    for (_, set_id) in next.virtual_nodes_in_schema(&schema.id) {
        assert_eq!(set_id, 0);
    }
    assert_eq!(next.rep_sets_len(), sets_before, "no new sets created");
}

#[test]
fn test_create_schema_fails_without_enough_hosts() {
    let table = cluster(2);
    let mut policy = RebalancePolicy::new();

    let result = policy.rebalance(
        &table,
        &[],
        &[],
        &no_stats(),
        &[create_request("books", &[])],
    );
    assert!(result.is_err(), "rfactor 3 needs 3 live hosts");
}

#[test]
fn test_drop_schema_tombstones_every_vnode() {
    let table = cluster(6);
    let mut policy = RebalancePolicy::new();

    let update = policy
        .rebalance(
            &table,
            &[],
            &[],
            &no_stats(),
            &[create_request("books", &[("vnodes", "4")])],
        )
        .unwrap()
        .unwrap();
    let mut with_schema = table.clone();
    update.apply(&mut with_schema, None, &mut NullHooks).unwrap();
    let id = with_schema.catalog().get_by_name("books").unwrap().id;

    let update = policy
        .rebalance(
            &with_schema,
            &[],
            &[],
            &no_stats(),
            &[SchemaRequest::Drop { id }],
        )
        .unwrap()
        .expect("drop stages an update");
    let mut dropped = with_schema.clone();
    update.apply(&mut dropped, None, &mut NullHooks).unwrap();

    assert!(dropped.catalog().get(&id).is_none());
    assert_eq!(dropped.virtual_nodes_in_schema(&id).len(), 0);
}

// ============================================================
// VNODE BOUNDARIES
// ============================================================

#[test]
fn test_single_vnode_is_the_bare_schema_id() {
    let id: SchemaId = [0x10, 0x01];
    assert_eq!(vnode_boundaries(&id, 1), vec![Key::new(id.to_vec())]);
}

#[test]
fn test_small_vnode_counts_use_one_byte_suffixes() {
    let id: SchemaId = [0x10, 0x01];
    let bounds = vnode_boundaries(&id, 4);
    let expected: Vec<Key> = [0x00u8, 0x40, 0x80, 0xC0]
        .iter()
        .map(|b| Key::new(vec![0x10, 0x01, *b]))
        .collect();
    assert_eq!(bounds, expected);
}

#[test]
fn test_large_vnode_counts_widen_the_suffix() {
    let id: SchemaId = [0x10, 0x01];
    let bounds = vnode_boundaries(&id, 300);
    assert_eq!(bounds.len(), 300);
    assert!(
        bounds.iter().all(|k| k.len() == 6),
        "300 vnodes need a 4-byte suffix"
    );
    // Evenly spaced, strictly increasing, all inside the schema.
    for pair in bounds.windows(2) {
        assert!(pair[0] < pair[1]);
    }
    assert!(bounds.iter().all(|k| k.starts_with(&id)));
}

// ============================================================
// LOAD PASSES AND ACTION CAP
// ============================================================

#[test]
fn test_load_swaps_stay_inert_while_disabled() {
    let table = cluster(5);
    let mut policy = RebalancePolicy::new();
    let mut stats = HashMap::new();
    // A grossly skewed cluster: if the swap passes were live they would
    // certainly stage something.
    for id in 0..5u32 {
        stats.insert(id, HostStats {
            cpu: if id == 0 { 0.99 } else { 0.01 },
            mem: 0.5,
            avg_item_size: if id == 0 { 1 << 20 } else { 64 },
            vnode_count: if id == 0 { 1000 } else { 1 },
        });
    }

    let update = policy.rebalance(&table, &[], &[], &stats, &[]).unwrap();
    assert!(update.is_none(), "disabled balance passes must stage nothing");
}

#[test]
fn test_quiet_cycle_stages_nothing() {
    let table = cluster(4);
    let mut policy = RebalancePolicy::new();
    assert!(
        policy
            .rebalance(&table, &[], &[], &no_stats(), &[])
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_action_cap_does_not_truncate_provisioning() {
    // A schema whose layout alone exceeds the structural-action cap is
    // still provisioned completely; the cap only gates optional passes.
    let table = cluster(9);
    let mut policy = RebalancePolicy::new();
    let update = policy
        .rebalance(
            &table,
            &[],
            &[],
            &no_stats(),
            &[create_request("wide", &[("vnodes", "16")])],
        )
        .unwrap()
        .unwrap();
    assert!(update.actions.len() > 5);

    let mut next = table.clone();
    update.apply(&mut next, None, &mut NullHooks).unwrap();
    let id = next.catalog().get_by_name("wide").unwrap().id;
    assert_eq!(next.virtual_nodes_in_schema(&id).len(), 16);
}

// ============================================================
// SCHEMA REQUEST PLUMBING
// ============================================================

#[test]
fn test_duplicate_create_is_skipped_not_fatal() {
    let table = cluster(6);
    let mut policy = RebalancePolicy::new();
    let update = policy
        .rebalance(
            &table,
            &[],
            &[],
            &no_stats(),
            &[create_request("books", &[])],
        )
        .unwrap()
        .unwrap();
    let mut next = table.clone();
    update.apply(&mut next, None, &mut NullHooks).unwrap();

    // Creating the same name again stages nothing and returns no error.
    let update = policy
        .rebalance(
            &next,
            &[],
            &[],
            &no_stats(),
            &[create_request("books", &[])],
        )
        .unwrap();
    assert!(update.is_none());
}

#[test]
fn test_explicit_schema_ids_are_honored() {
    let table = cluster(6);
    let mut policy = RebalancePolicy::new();
    let chosen: SchemaId = [0x42, 0x07];
    let update = policy
        .rebalance(
            &table,
            &[],
            &[],
            &no_stats(),
            &[SchemaRequest::Create {
                name: "pinned".to_string(),
                id: Some(chosen),
                meta: BTreeMap::new(),
            }],
        )
        .unwrap()
        .unwrap();
    let mut next = table.clone();
    update.apply(&mut next, None, &mut NullHooks).unwrap();
    assert_eq!(next.catalog().get_by_name("pinned").unwrap().id, chosen);
}

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::bootstrap::client::{BootstrapClient, ClientEvent, ClientPhase};
use crate::bootstrap::fragment::{Part, PartCollector, split_into_parts};
use crate::bootstrap::protocol::{BootMessage, CHUNK_SIZE, decode_message, encode_message};
use crate::bootstrap::server::{BootstrapServer, ServerEvent, ServerPhase};
use crate::bootstrap::{BootOutcome, Effect};
use crate::lut::LookupTable;

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

// ============================================================
// FRAGMENTATION
// ============================================================

fn roundtrip(blob: &[u8], chunk: usize) -> Vec<u8> {
    let mut collector = PartCollector::new();
    for part in split_into_parts(blob, chunk) {
        collector.offer(part);
    }
    assert!(collector.complete());
    collector.reassemble().unwrap()
}

#[test]
fn test_fragmentation_roundtrip() {
    assert_eq!(roundtrip(&[], 16), Vec::<u8>::new());
    assert_eq!(roundtrip(&[7], 16), vec![7]);

    let exactly_one: Vec<u8> = (0..16u8).collect();
    assert_eq!(roundtrip(&exactly_one, 16), exactly_one);

    let several: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    assert_eq!(roundtrip(&several, 16), several);
}

#[test]
fn test_collector_tracks_first_missing_piece() {
    let blob: Vec<u8> = (0..=255u8).cycle().take(100).collect();
    let parts = split_into_parts(&blob, 32);
    assert_eq!(parts.len(), 4);

    let mut collector = PartCollector::new();
    assert_eq!(collector.first_missing_piece(), Some(0));

    // Deliver everything except the second chunk.
    for (i, part) in parts.iter().enumerate() {
        if i != 1 {
            collector.offer(part.clone());
        }
    }
    assert!(!collector.complete());
    assert_eq!(collector.first_missing_piece(), Some(32));
    assert!(collector.reassemble().is_none());

    collector.offer(parts[1].clone());
    assert_eq!(collector.first_missing_piece(), None);
    assert_eq!(collector.reassemble().unwrap(), blob);
}

#[test]
fn test_collector_restarts_on_new_blob() {
    let old = split_into_parts(&[1, 2, 3, 4], 2);
    let new = split_into_parts(&[9, 9], 2);

    let mut collector = PartCollector::new();
    collector.offer(old[0].clone());
    collector.offer(new[0].clone());
    assert!(collector.complete(), "old fragments must be discarded");
    assert_eq!(collector.reassemble().unwrap(), vec![9, 9]);
}

#[test]
fn test_duplicate_parts_are_harmless() {
    let blob: Vec<u8> = (0..50u8).collect();
    let parts = split_into_parts(&blob, 16);
    let mut collector = PartCollector::new();
    for part in parts.iter().chain(parts.iter()) {
        collector.offer(part.clone());
    }
    assert_eq!(collector.reassemble().unwrap(), blob);
}

// ============================================================
// MESSAGE CODEC
// ============================================================

#[test]
fn test_message_codec_roundtrip() {
    let messages = [
        BootMessage::Request { origin: addr(7001) },
        BootMessage::Part(Part {
            offset: 64,
            total_size: 1000,
            data: vec![1, 2, 3],
        }),
        BootMessage::Ready {
            src: addr(7001),
            dst: addr(7000),
        },
        BootMessage::BootUp {
            src: addr(7000),
            dst: addr(7001),
        },
    ];
    for msg in &messages {
        for forwarded in [false, true] {
            let bytes = encode_message(msg, forwarded).unwrap();
            let datagram = decode_message(&bytes).unwrap();
            assert_eq!(&datagram.msg, msg);
            assert_eq!(datagram.forwarded, forwarded);
        }
    }
}

#[test]
fn test_empty_datagram_is_rejected() {
    assert!(decode_message(&[]).is_err());
}

// ============================================================
// SERVER STATE MACHINE
// ============================================================

fn ping(origin: SocketAddr) -> ServerEvent {
    ServerEvent::Request {
        origin,
        forwarded: false,
    }
}

fn server_with_pings(threshold: usize, pingers: &[SocketAddr], t0: Instant) -> BootstrapServer {
    let mut server = BootstrapServer::new(addr(7000), threshold, 4, Vec::new());
    for p in pingers {
        server.handle(ping(*p), t0).unwrap();
    }
    server
}

fn parts_for(effects: &[Effect], to: SocketAddr) -> Vec<Part> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Send {
                to: t,
                msg: BootMessage::Part(p),
            } if *t == to => Some(p.clone()),
            _ => None,
        })
        .collect()
}

fn server_outcome(effects: &[Effect]) -> Option<BootOutcome> {
    effects.iter().find_map(|e| match e {
        Effect::ServerDone(outcome) => Some(outcome.clone()),
        _ => None,
    })
}

#[test]
fn test_quorum_transitions_to_seeding_exactly_once() {
    let t0 = Instant::now();
    let pingers = [addr(7001), addr(7002), addr(7003)];
    let mut server = server_with_pings(3, &pingers, t0);
    assert_eq!(server.phase(), ServerPhase::Collecting);

    let effects = server.handle(ServerEvent::Tick, t0).unwrap();
    assert_eq!(server.phase(), ServerPhase::Seeding);

    // Every pinger gets the full fragment stream; nothing goes to self.
    for p in &pingers {
        assert!(!parts_for(&effects, *p).is_empty());
    }
    assert!(parts_for(&effects, addr(7000)).is_empty());

    // A later tick must not seed again or finish early.
    let t1 = t0 + Duration::from_secs(1);
    let effects = server.handle(ServerEvent::Tick, t1).unwrap();
    assert_eq!(server.phase(), ServerPhase::Seeding);
    assert!(server_outcome(&effects).is_none());
}

#[test]
fn test_below_threshold_keeps_collecting() {
    let t0 = Instant::now();
    let mut server = server_with_pings(4, &[addr(7001), addr(7002)], t0);
    // Two pings plus self is three: still short of four.
    server.handle(ServerEvent::Tick, t0).unwrap();
    assert_eq!(server.phase(), ServerPhase::Collecting);

    // One more ping in the next window tips it over.
    server.handle(ping(addr(7003)), t0).unwrap();
    server.handle(ServerEvent::Tick, t0).unwrap();
    assert_eq!(server.phase(), ServerPhase::Seeding);
}

#[test]
fn test_done_only_after_every_seed_is_ready() {
    let t0 = Instant::now();
    let pingers = [addr(7001), addr(7002), addr(7003)];
    let mut server = server_with_pings(3, &pingers, t0);
    server.handle(ServerEvent::Tick, t0).unwrap();

    let t1 = t0 + Duration::from_secs(1);
    let effects = server
        .handle(ServerEvent::Ready { src: addr(7001) }, t1)
        .unwrap();
    assert!(server_outcome(&effects).is_none());
    let effects = server
        .handle(ServerEvent::Ready { src: addr(7002) }, t1)
        .unwrap();
    assert!(server_outcome(&effects).is_none());
    assert_eq!(server.phase(), ServerPhase::Seeding);

    let effects = server
        .handle(ServerEvent::Ready { src: addr(7003) }, t1)
        .unwrap();
    assert_eq!(server.phase(), ServerPhase::Done);
    let outcome = server_outcome(&effects).expect("outcome must be emitted");
    assert!(outcome.failed.is_empty());
    assert!(outcome.joined.is_empty());

    // Everyone gets the boot-up signal, and the timer stops.
    for p in &pingers {
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Send { to, msg: BootMessage::BootUp { .. } } if to == p
        )));
    }
    assert!(effects.iter().any(|e| matches!(e, Effect::StopTimer)));
}

#[test]
fn test_silent_seed_host_is_dropped_and_reported_failed() {
    let t0 = Instant::now();
    let pingers = [addr(7001), addr(7002), addr(7003)];
    let mut server = server_with_pings(3, &pingers, t0);
    server.handle(ServerEvent::Tick, t0).unwrap();

    // Two hosts keep announcing readiness; the third goes silent. While its
    // last ping is still recent, the server keeps waiting for it.
    let t1 = t0 + Duration::from_secs(2);
    server
        .handle(ServerEvent::Ready { src: addr(7001) }, t1)
        .unwrap();
    let effects = server
        .handle(ServerEvent::Ready { src: addr(7002) }, t1)
        .unwrap();
    assert_eq!(server.phase(), ServerPhase::Seeding);
    assert!(server_outcome(&effects).is_none());

    // Much later only the ready hosts are still in touch; the silent seed
    // ages out of the active set and is reported failed.
    let t2 = t0 + Duration::from_secs(30);
    let mut outcome = None;
    for src in [addr(7001), addr(7002)] {
        let effects = server.handle(ServerEvent::Ready { src }, t2).unwrap();
        if let Some(o) = server_outcome(&effects) {
            outcome = Some(o);
        }
    }

    assert_eq!(server.phase(), ServerPhase::Done);
    let outcome = outcome.expect("server must reach done");
    assert_eq!(outcome.failed, vec![addr(7003)]);
}

#[test]
fn test_renewed_ping_during_seeding_resends_stream() {
    let t0 = Instant::now();
    let mut server = server_with_pings(3, &[addr(7001), addr(7002), addr(7003)], t0);
    server.handle(ServerEvent::Tick, t0).unwrap();

    let effects = server.handle(ping(addr(7002)), t0).unwrap();
    assert!(
        !parts_for(&effects, addr(7002)).is_empty(),
        "lost fragments are covered by re-streaming on ping"
    );
}

#[test]
fn test_late_joiner_is_reported() {
    let t0 = Instant::now();
    let mut server = server_with_pings(3, &[addr(7001), addr(7002), addr(7003)], t0);
    server.handle(ServerEvent::Tick, t0).unwrap();

    // A stranger pings during seeding.
    let t1 = t0 + Duration::from_secs(1);
    server.handle(ping(addr(7050)), t1).unwrap();
    for p in [addr(7001), addr(7002)] {
        server.handle(ServerEvent::Ready { src: p }, t1).unwrap();
    }
    let effects = server
        .handle(ServerEvent::Ready { src: addr(7003) }, t1)
        .unwrap();

    let outcome = server_outcome(&effects).unwrap();
    assert_eq!(outcome.joined, vec![addr(7050)]);
    // The late joiner is told the cluster is up too.
    assert!(effects.iter().any(|e| matches!(
        e,
        Effect::Send { to, msg: BootMessage::BootUp { .. } } if *to == addr(7050)
    )));
}

#[test]
fn test_done_server_answers_stragglers() {
    let t0 = Instant::now();
    let mut server = server_with_pings(3, &[addr(7001), addr(7002), addr(7003)], t0);
    server.handle(ServerEvent::Tick, t0).unwrap();
    for p in [addr(7001), addr(7002), addr(7003)] {
        server.handle(ServerEvent::Ready { src: p }, t0).unwrap();
    }
    assert_eq!(server.phase(), ServerPhase::Done);

    let effects = server.handle(ping(addr(7004)), t0).unwrap();
    assert!(effects.iter().any(|e| matches!(
        e,
        Effect::Send { to, msg: BootMessage::BootUp { .. } } if *to == addr(7004)
    )));
}

// ============================================================
// CLIENT STATE MACHINE
// ============================================================

fn snapshot_parts() -> (LookupTable, Vec<Part>) {
    let policy = crate::placement::RebalancePolicy::new();
    let active: Vec<SocketAddr> = (0..3u16).map(|i| addr(7000 + i)).collect();
    let table = policy.genesis(addr(7000), &active, 4, &[]).unwrap();
    let parts = split_into_parts(&table.encode_snapshot(), CHUNK_SIZE);
    (table, parts)
}

fn client_done(effects: &[Effect]) -> Option<LookupTable> {
    effects.iter().find_map(|e| match e {
        Effect::ClientDone(table) => Some(table.clone()),
        _ => None,
    })
}

#[test]
fn test_client_requests_collects_acks_and_finishes() {
    let (table, parts) = snapshot_parts();
    let mut client = BootstrapClient::new(addr(7001), addr(7000));

    let effects = client.handle(ClientEvent::Tick);
    assert!(matches!(
        effects.as_slice(),
        [Effect::Send {
            msg: BootMessage::Request { .. },
            ..
        }]
    ));

    let mut last = Vec::new();
    for part in parts {
        last = client.handle(ClientEvent::Part(part));
    }
    assert_eq!(client.phase(), ClientPhase::Ready);
    assert!(matches!(
        last.as_slice(),
        [Effect::Send {
            msg: BootMessage::Ready { .. },
            ..
        }]
    ));

    // Until boot-up, the client keeps announcing readiness.
    let effects = client.handle(ClientEvent::Tick);
    assert!(matches!(
        effects.as_slice(),
        [Effect::Send {
            msg: BootMessage::Ready { .. },
            ..
        }]
    ));

    let effects = client.handle(ClientEvent::BootUp);
    assert_eq!(client.phase(), ClientPhase::Finished);
    assert_eq!(client_done(&effects), Some(table));
    assert!(effects.iter().any(|e| matches!(e, Effect::StopTimer)));
}

#[test]
fn test_client_tolerates_boot_up_before_table() {
    let (table, parts) = snapshot_parts();
    let mut client = BootstrapClient::new(addr(7001), addr(7000));

    // Boot-up races ahead of the fragment stream.
    assert!(client.handle(ClientEvent::BootUp).is_empty());
    assert_eq!(client.phase(), ClientPhase::Waiting);

    let mut last = Vec::new();
    for part in parts {
        last = client.handle(ClientEvent::Part(part));
    }
    // The outcome is emitted immediately, without another boot-up.
    assert_eq!(client.phase(), ClientPhase::Finished);
    assert_eq!(client_done(&last), Some(table));
    assert!(last.iter().any(|e| matches!(
        e,
        Effect::Send {
            msg: BootMessage::Ready { .. },
            ..
        }
    )));
}

#[test]
fn test_client_recollects_after_corrupt_snapshot() {
    let (table, parts) = snapshot_parts();
    let mut client = BootstrapClient::new(addr(7001), addr(7000));

    // A corrupted stream decodes to garbage and is thrown away.
    let mut corrupt = parts.clone();
    let len = corrupt[0].data.len();
    corrupt[0].data = vec![0xFF; len];
    for part in corrupt {
        client.handle(ClientEvent::Part(part));
    }
    assert_eq!(client.phase(), ClientPhase::Waiting);

    // A clean retransmission still succeeds.
    for part in parts {
        client.handle(ClientEvent::Part(part));
    }
    assert_eq!(client.phase(), ClientPhase::Ready);
    let _ = table;
}

#[test]
fn test_server_and_client_agree_on_the_table() {
    let t0 = Instant::now();
    let clients = [addr(7001), addr(7002), addr(7003)];
    let mut server = server_with_pings(3, &clients, t0);
    let effects = server.handle(ServerEvent::Tick, t0).unwrap();

    let mut client = BootstrapClient::new(addr(7001), addr(7000));
    let mut client_table = None;
    for part in parts_for(&effects, addr(7001)) {
        for effect in client.handle(ClientEvent::Part(part)) {
            if let Effect::ClientDone(t) = effect {
                client_table = Some(t);
            }
        }
    }
    let effects = client.handle(ClientEvent::BootUp);
    if client_table.is_none() {
        client_table = client_done(&effects);
    }

    let mut outcome = None;
    for c in clients {
        let effects = server.handle(ServerEvent::Ready { src: c }, t0).unwrap();
        if let Some(o) = server_outcome(&effects) {
            outcome = Some(o);
        }
    }
    let outcome = outcome.expect("server must be done");

    assert_eq!(client_table.expect("client must finish"), outcome.table);
}

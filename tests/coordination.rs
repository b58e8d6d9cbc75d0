//! Integration tests for hole-punch coordination between in-memory hosts.
//!
//! Each test builds a small [`MemoryNetwork`], wires a [`HolePunchService`]
//! onto the hosts that need one and checks the resulting connection tables.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test coordination -- --nocapture

use std::sync::{Arc, Once};
use std::time::Duration;

use holepunch::{
    AddressObserver, BoxedStream, HolePunchConfig, HolePunchError, HolePunchMessage,
    HolePunchService, Host, HostConfig, HostError, MemoryHost, MemoryNetwork, MessageKind,
    ObservedAddrs, PERMANENT_ADDR_TTL, PROTOCOL_ID, read_expected, stream_handler, write_message,
};
use multiaddr::Multiaddr;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Initialize tracing for tests.
/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_LATENCY: Duration = Duration::from_millis(25);

type Service = HolePunchService<MemoryHost, Arc<ObservedAddrs>>;

fn addr(s: &str) -> Multiaddr {
    s.parse().expect("valid multiaddr")
}

/// Host `n` behind a NAT: private listen address, public external address.
fn nat_host(net: &MemoryNetwork, n: u8) -> MemoryHost {
    net.add_host(
        HostConfig::behind_nat(
            vec![addr(&format!("/ip4/192.168.{n}.10/tcp/4001"))],
            addr(&format!("/ip4/203.0.113.{n}/tcp/4{n:03}0")),
        )
        .with_dial_latency(DIAL_LATENCY),
    )
}

/// Host `n` reachable on a loopback address.
fn open_host(net: &MemoryNetwork, n: u8) -> MemoryHost {
    net.add_host(
        HostConfig::public(vec![addr(&format!("/ip4/127.0.0.{n}/tcp/4001"))])
            .with_dial_latency(DIAL_LATENCY),
    )
}

fn service(host: &MemoryHost, config: HolePunchConfig) -> Service {
    HolePunchService::new(host.clone(), host.observed(), config)
}

fn lan_config() -> HolePunchConfig {
    HolePunchConfig::default().with_allow_private_addrs(true)
}

/// Poll `check` until it holds or the test timeout passes.
async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < TEST_TIMEOUT, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Fast paths
// ============================================================================

#[tokio::test]
async fn existing_direct_connection_skips_coordination() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = open_host(&net, 1);
    let b = open_host(&net, 2);
    let svc_a = service(&a, lan_config());
    let _svc_b = service(&b, lan_config());
    let pb = b.local_peer_id();

    let conn = a.connect(pb, &b.listen_addrs()).await.expect("direct connect");
    assert!(conn.is_direct());

    timeout(TEST_TIMEOUT, svc_a.hole_punch(pb))
        .await
        .expect("hole punch timed out")
        .expect("hole punch failed");

    assert_eq!(a.streams_opened(PROTOCOL_ID), 0, "no coordination stream expected");
    assert_eq!(a.conns_to_peer(&pb).len(), 1);
}

#[tokio::test]
async fn direct_dial_works_without_protocol_handler() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = open_host(&net, 1);
    let b = open_host(&net, 2);
    let svc_a = service(&a, lan_config());
    let (pa, pb) = (a.local_peer_id(), b.local_peer_id());

    // B runs no hole-punch service at all.
    a.peerstore().add_addrs(pb, &b.listen_addrs(), PERMANENT_ADDR_TTL);

    timeout(TEST_TIMEOUT, svc_a.hole_punch(pb))
        .await
        .expect("hole punch timed out")
        .expect("direct dial should have succeeded");

    assert_eq!(a.conns_to_peer(&pb).len(), 1);
    assert_eq!(b.conns_to_peer(&pa).len(), 1);
    assert_eq!(a.streams_opened(PROTOCOL_ID), 0);
}

#[tokio::test]
async fn directly_dialable_hosts_end_with_one_direct_connection() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = open_host(&net, 1);
    let b = open_host(&net, 2);
    let svc_a = service(&a, lan_config());
    let _svc_b = service(&b, lan_config());
    let (pa, pb) = (a.local_peer_id(), b.local_peer_id());

    a.connect_relayed(pb).await.expect("relay connect");

    timeout(TEST_TIMEOUT, svc_a.hole_punch(pb))
        .await
        .expect("hole punch timed out")
        .expect("hole punch failed");

    assert_eq!(a.direct_conns_to(&pb).len(), 1);
    assert_eq!(b.direct_conns_to(&pa).len(), 1);
}

// ============================================================================
// Full coordination
// ============================================================================

#[tokio::test]
async fn coordination_without_direct_dial_shortcut() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = open_host(&net, 1);
    let b = open_host(&net, 2);
    let config = lan_config().with_direct_dial_timeout(Duration::ZERO);
    let svc_a = service(&a, config.clone());
    let svc_b = service(&b, config);
    let (pa, pb) = (a.local_peer_id(), b.local_peer_id());

    a.connect_relayed(pb).await.expect("relay connect");

    timeout(TEST_TIMEOUT, svc_a.hole_punch(pb))
        .await
        .expect("hole punch timed out")
        .expect("hole punch failed");

    assert_eq!(a.streams_opened(PROTOCOL_ID), 1);
    assert_eq!(a.direct_conns_to(&pb).len(), 1);
    assert_eq!(b.direct_conns_to(&pa).len(), 1);

    eventually("responder outcome", || svc_b.last_result(&pa).is_some()).await;
    assert_eq!(svc_b.last_result(&pa), Some(Ok(())));
    assert!(svc_b.handler_errors().is_empty());
}

#[tokio::test]
async fn hole_punch_through_nats_creates_one_direct_connection() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = nat_host(&net, 1);
    let b = nat_host(&net, 2);
    let svc_a = service(&a, HolePunchConfig::default());
    let svc_b = service(&b, HolePunchConfig::default());
    let (pa, pb) = (a.local_peer_id(), b.local_peer_id());

    a.connect_relayed(pb).await.expect("relay connect");

    // Neither NAT admits an unsolicited dial.
    assert!(
        a.dial(pb, addr("/ip4/203.0.113.2/tcp/40020")).await.is_err(),
        "plain dial must not traverse the NAT"
    );

    timeout(TEST_TIMEOUT, svc_a.hole_punch(pb))
        .await
        .expect("hole punch timed out")
        .expect("hole punch failed");

    assert_eq!(a.streams_opened(PROTOCOL_ID), 1);
    assert_eq!(a.direct_conns_to(&pb).len(), 1);
    assert_eq!(b.direct_conns_to(&pa).len(), 1);

    // The relayed connection is still there alongside the direct one.
    assert_eq!(a.conns_to_peer(&pb).iter().filter(|c| c.relayed).count(), 1);

    eventually("responder outcome", || svc_b.last_result(&pa).is_some()).await;
    assert!(svc_b.handler_errors().is_empty());
}

#[tokio::test]
async fn concurrent_hole_punches_share_one_run() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = nat_host(&net, 1);
    let b = nat_host(&net, 2);
    let svc_a = service(&a, HolePunchConfig::default());
    let _svc_b = service(&b, HolePunchConfig::default());
    let pb = b.local_peer_id();

    a.connect_relayed(pb).await.expect("relay connect");

    let (first, second) = timeout(
        TEST_TIMEOUT,
        async { tokio::join!(svc_a.hole_punch(pb), svc_a.hole_punch(pb)) },
    )
    .await
    .expect("hole punches timed out");

    assert_eq!(first, second, "both callers observe the same outcome");
    assert!(first.is_ok());
    assert_eq!(a.streams_opened(PROTOCOL_ID), 1, "exactly one protocol run");
    assert_eq!(svc_a.last_result(&pb), Some(Ok(())));
    assert!(!svc_a.is_active(&pb));
}

#[tokio::test]
async fn candidate_addresses_are_exchanged() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = nat_host(&net, 1);
    let b = nat_host(&net, 2);
    let svc_a = service(&a, HolePunchConfig::default());
    let _svc_b = service(&b, HolePunchConfig::default());
    let (pa, pb) = (a.local_peer_id(), b.local_peer_id());

    a.connect_relayed(pb).await.expect("relay connect");

    let x = addr("/ip4/1.2.3.4/tcp/1234");
    let y = addr("/ip4/5.6.7.8/tcp/5678");
    a.observed().replace(vec![x.clone()]);
    b.observed().replace(vec![y.clone()]);
    assert_eq!(a.observed().observed_addrs(), vec![x.clone()]);

    // Nothing routes to X or Y, so the dials fail; the exchange still happens.
    let _ = timeout(TEST_TIMEOUT, svc_a.hole_punch(pb))
        .await
        .expect("hole punch timed out");

    eventually("A to learn Y", || a.peerstore().addrs(&pb).contains(&y)).await;
    eventually("B to learn X", || b.peerstore().addrs(&pa).contains(&x)).await;
}

#[tokio::test]
async fn dial_race_past_the_deadline_reports_a_timeout() {
    init_tracing();
    let net = MemoryNetwork::new();
    let slow = |n: u8| {
        net.add_host(
            HostConfig::public(vec![addr(&format!("/ip4/127.0.0.{n}/tcp/1"))])
                .with_dial_latency(Duration::from_secs(2)),
        )
    };
    let a = slow(1);
    let b = slow(2);
    let config = lan_config()
        .with_hole_punch_timeout(Duration::from_millis(200))
        .with_direct_dial_timeout(Duration::ZERO);
    let svc_a = service(&a, config.clone());
    let _svc_b = service(&b, config);
    let pb = b.local_peer_id();

    a.connect_relayed(pb).await.expect("relay connect");

    let start = Instant::now();
    let err = timeout(TEST_TIMEOUT, svc_a.hole_punch(pb))
        .await
        .expect("hole punch timed out")
        .expect_err("dials slower than the deadline cannot succeed");

    assert!(err.is_timeout(), "unexpected error: {err}");
    let msg = err.to_string();
    assert!(msg.contains("i/o deadline reached"), "unexpected error: {msg}");
    assert!(msg.contains("/ip4/127.0.0.2/tcp/1"), "address missing from: {msg}");
    assert!(start.elapsed() < Duration::from_secs(2), "deadline was not enforced");
    assert!(a.direct_conns_to(&pb).is_empty());
}

// ============================================================================
// Synchronization timing
// ============================================================================

const REPLY_DELAY: Duration = Duration::from_millis(100);

#[tokio::test(start_paused = true)]
async fn sync_follows_the_reply_by_half_the_rtt() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = open_host(&net, 1);
    let b = open_host(&net, 2);
    let svc_a = service(&a, lan_config().with_direct_dial_timeout(Duration::ZERO));
    let pb = b.local_peer_id();

    // B answers by hand, holding its CONNECT reply back by a known amount.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let b_addrs = b.listen_addrs();
    b.set_stream_handler(
        PROTOCOL_ID,
        stream_handler(move |_peer, mut stream: BoxedStream| {
            let tx = tx.clone();
            let b_addrs = b_addrs.clone();
            async move {
                if read_expected(&mut stream, MessageKind::Connect).await.is_err() {
                    return;
                }
                tokio::time::sleep(REPLY_DELAY).await;
                if write_message(&mut stream, &HolePunchMessage::connect(b_addrs))
                    .await
                    .is_err()
                {
                    return;
                }
                let replied_at = Instant::now();
                if read_expected(&mut stream, MessageKind::Sync).await.is_ok() {
                    let _ = tx.send((replied_at, Instant::now()));
                }
            }
        }),
    );

    a.connect_relayed(pb).await.expect("relay connect");

    timeout(TEST_TIMEOUT, svc_a.hole_punch(pb))
        .await
        .expect("hole punch timed out")
        .expect("hole punch failed");

    let (replied_at, synced_at) = rx.recv().await.expect("SYNC never arrived");
    let gap = synced_at - replied_at;
    assert!(
        gap >= REPLY_DELAY / 2 - Duration::from_millis(5)
            && gap <= REPLY_DELAY / 2 + Duration::from_millis(5),
        "SYNC followed the reply after {gap:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn responder_dials_as_soon_as_sync_arrives() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = open_host(&net, 1);
    let b = open_host(&net, 2);
    let svc_b = service(&b, lan_config());
    let (pa, pb) = (a.local_peer_id(), b.local_peer_id());

    a.connect_relayed(pb).await.expect("relay connect");

    // A drives the initiator side by hand and never dials.
    let mut stream = a.open_stream(pb, PROTOCOL_ID).await.expect("open stream");
    write_message(&mut stream, &HolePunchMessage::connect(a.listen_addrs()))
        .await
        .expect("write CONNECT");
    read_expected(&mut stream, MessageKind::Connect)
        .await
        .expect("CONNECT reply");
    write_message(&mut stream, &HolePunchMessage::sync())
        .await
        .expect("write SYNC");
    let synced_at = Instant::now();

    while b.direct_conns_to(&pa).is_empty() {
        assert!(synced_at.elapsed() < TEST_TIMEOUT, "responder never dialed");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let dialed_after = synced_at.elapsed();
    assert!(
        dialed_after >= DIAL_LATENCY && dialed_after <= DIAL_LATENCY + Duration::from_millis(5),
        "responder connected {dialed_after:?} after SYNC"
    );

    eventually("responder outcome", || svc_b.last_result(&pa).is_some()).await;
    assert_eq!(svc_b.last_result(&pa), Some(Ok(())));
    drop(stream);
}

// ============================================================================
// Service lifecycle
// ============================================================================

#[tokio::test]
async fn initiator_without_public_addresses_fails_early() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = nat_host(&net, 1);
    let b = nat_host(&net, 2);
    let svc_a = service(&a, HolePunchConfig::default());
    let _svc_b = service(&b, HolePunchConfig::default());
    let pb = b.local_peer_id();

    a.connect_relayed(pb).await.expect("relay connect");
    a.observed().clear();

    let err = svc_a.hole_punch(pb).await.unwrap_err();
    assert_eq!(err, HolePunchError::NoLocalAddrs);
    assert_eq!(a.streams_opened(PROTOCOL_ID), 0);
}

#[tokio::test]
async fn closed_service_stops_serving_and_initiating() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = nat_host(&net, 1);
    let b = nat_host(&net, 2);
    let svc_a = service(&a, HolePunchConfig::default());
    let svc_b = service(&b, HolePunchConfig::default());
    let (pa, pb) = (a.local_peer_id(), b.local_peer_id());

    a.connect_relayed(pb).await.expect("relay connect");
    svc_b.close();
    assert!(svc_b.is_closed());

    let err = svc_a.hole_punch(pb).await.unwrap_err();
    assert_eq!(
        err,
        HolePunchError::OpenStream(HostError::ProtocolNotSupported(PROTOCOL_ID.to_string()))
    );
    assert_eq!(svc_b.hole_punch(pa).await, Err(HolePunchError::Closed));
}

use anyhow::{Context, Result};
use clap::Parser;
use multiaddr::Multiaddr;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use holepunch::{
    HolePunchConfig, HolePunchService, Host, HostConfig, MemoryHost, MemoryNetwork, PeerId,
};

/// Runs a coordinated hole punch between two in-memory hosts that start out
/// connected only through a relay.
#[derive(Parser, Debug)]
#[command(name = "holepunch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Budget for the whole coordination run, in milliseconds.
    #[arg(short, long, default_value = "10000")]
    timeout_ms: u64,

    /// Latency of every direct dial, in milliseconds.
    #[arg(short = 'l', long, default_value = "25")]
    dial_latency_ms: u64,

    /// Put both hosts on public addresses instead of behind NATs.
    #[arg(long)]
    no_nat: bool,

    /// Offer and dial private-range addresses.
    #[arg(long)]
    allow_private: bool,

    /// Skip the plain direct dial tried before coordinating.
    #[arg(long)]
    skip_direct_dial: bool,
}

fn parse_addr(s: &str) -> Result<Multiaddr> {
    s.parse().with_context(|| format!("invalid multiaddr {s}"))
}

fn host_config(args: &Args, local: &str, external: &str) -> Result<HostConfig> {
    let latency = Duration::from_millis(args.dial_latency_ms);
    let config = if args.no_nat {
        HostConfig::public(vec![parse_addr(external)?])
    } else {
        HostConfig::behind_nat(vec![parse_addr(local)?], parse_addr(external)?)
    };
    Ok(config.with_dial_latency(latency))
}

fn log_connections(label: &str, host: &MemoryHost, peer: &PeerId) {
    for conn in host.conns_to_peer(peer) {
        info!(
            host = label,
            conn_id = conn.id,
            direction = ?conn.direction,
            relayed = conn.relayed,
            remote_addr = %conn.remote_addr,
            "connection"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let network = MemoryNetwork::new();
    let alice = network.add_host(host_config(
        &args,
        "/ip4/192.168.1.10/udp/4001/quic-v1",
        "/ip4/203.0.113.10/udp/41000/quic-v1",
    )?);
    let bob = network.add_host(host_config(
        &args,
        "/ip4/10.0.0.20/udp/4001/quic-v1",
        "/ip4/198.51.100.20/udp/52000/quic-v1",
    )?);
    info!(alice = %alice.local_peer_id(), bob = %bob.local_peer_id(), "hosts created");

    let mut config = HolePunchConfig::default()
        .with_hole_punch_timeout(Duration::from_millis(args.timeout_ms))
        .with_allow_private_addrs(args.allow_private);
    if args.skip_direct_dial {
        config = config.with_direct_dial_timeout(Duration::ZERO);
    }

    let alice_svc = HolePunchService::new(alice.clone(), alice.observed(), config.clone());
    let bob_svc = HolePunchService::new(bob.clone(), bob.observed(), config);

    alice
        .connect_relayed(bob.local_peer_id())
        .await
        .context("relay connection failed")?;
    log_connections("alice", &alice, &bob.local_peer_id());

    let started = Instant::now();
    match alice_svc.hole_punch(bob.local_peer_id()).await {
        Ok(()) => info!(elapsed_ms = started.elapsed().as_millis() as u64, "hole punch succeeded"),
        Err(e) => warn!(error = %e, "hole punch failed, staying on the relay"),
    }

    // The responder may still be finishing its side of the race.
    tokio::time::sleep(Duration::from_millis(args.dial_latency_ms)).await;

    log_connections("alice", &alice, &bob.local_peer_id());
    log_connections("bob", &bob, &alice.local_peer_id());
    for entry in bob_svc.handler_errors() {
        warn!(error = %entry, "responder error");
    }

    alice_svc.close();
    bob_svc.close();
    Ok(())
}

//! # In-Memory Network
//!
//! [`MemoryNetwork`] hosts any number of [`MemoryHost`]s in one process. It is
//! the [`Host`] implementation used by the integration tests and the demo
//! binary.
//!
//! ## Model
//!
//! - **Relayed connections** are always available between registered hosts
//!   through [`relay_circuit_addr`]. Streams over them work; they are never
//!   direct.
//! - **Direct dials** resolve the dialed address to a host and take
//!   `dial_latency` to complete.
//! - **NAT**: a host configured with an external address admits an inbound
//!   direct dial only if it has itself sent an outbound dial toward the
//!   dialer within `nat_mapping_window`. An unsolicited dial is refused.
//! - **Simultaneous open**: both views of a connection are created under one
//!   lock, so crossing dials leave exactly one direct connection per side.
//! - **Identify**: every new connection adds each side's listen addresses to
//!   the other's peerstore and records each side's externally visible address
//!   in its [`ObservedAddrs`].
//! - **Streams** are `tokio::io::duplex` pipes; the remote handler runs on its
//!   own task.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multiaddr::{Multiaddr, Protocol};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::addrs::is_relay_addr;
use crate::error::HostError;
use crate::identify::ObservedAddrs;
use crate::identity::{Keypair, PeerId};
use crate::peerstore::{CONNECTED_ADDR_TTL, PeerStore};
use crate::protocols::{BoxedStream, ConnectionInfo, Direction, Host, StreamHandler};

// ============================================================================
// Constants
// ============================================================================

/// How long an outbound dial keeps a NAT mapping open for inbound traffic.
pub const DEFAULT_NAT_MAPPING_WINDOW: Duration = Duration::from_secs(30);

/// Latency of a direct dial when none is configured.
pub const DEFAULT_DIAL_LATENCY: Duration = Duration::from_millis(10);

/// In-flight bytes per direction on a memory stream.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Address of the shared relay circuit every memory host can reach.
pub fn relay_circuit_addr() -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::Ip4(Ipv4Addr::new(198, 51, 100, 1)))
        .with(Protocol::Tcp(4001))
        .with(Protocol::P2pCircuit)
}

// ============================================================================
// Host configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub listen_addrs: Vec<Multiaddr>,
    /// External address of the NAT in front of this host, if any.
    pub nat_external_addr: Option<Multiaddr>,
    pub dial_latency: Duration,
    pub nat_mapping_window: Duration,
}

impl HostConfig {
    /// A host reachable on its listen addresses.
    pub fn public(listen_addrs: Vec<Multiaddr>) -> Self {
        Self {
            listen_addrs,
            nat_external_addr: None,
            dial_latency: DEFAULT_DIAL_LATENCY,
            nat_mapping_window: DEFAULT_NAT_MAPPING_WINDOW,
        }
    }

    /// A host listening on local addresses behind a NAT with `external_addr`.
    pub fn behind_nat(listen_addrs: Vec<Multiaddr>, external_addr: Multiaddr) -> Self {
        Self {
            nat_external_addr: Some(external_addr),
            ..Self::public(listen_addrs)
        }
    }

    pub fn with_dial_latency(mut self, latency: Duration) -> Self {
        self.dial_latency = latency;
        self
    }

    pub fn with_nat_mapping_window(mut self, window: Duration) -> Self {
        self.nat_mapping_window = window;
        self
    }

    pub fn is_behind_nat(&self) -> bool {
        self.nat_external_addr.is_some()
    }

    /// The address remote peers see this host's connections coming from.
    fn visible_addr(&self) -> Option<Multiaddr> {
        self.nat_external_addr
            .clone()
            .or_else(|| self.listen_addrs.first().cloned())
    }
}

// ============================================================================
// Shared network state
// ============================================================================

struct HostEntry {
    config: HostConfig,
    handlers: HashMap<String, StreamHandler>,
    conns: Vec<ConnectionInfo>,
    /// Outbound dial attempts toward a peer, by time of the last attempt.
    nat_mappings: HashMap<PeerId, Instant>,
    streams_opened: HashMap<String, usize>,
    peerstore: Arc<PeerStore>,
    observed: Arc<ObservedAddrs>,
}

impl HostEntry {
    fn direct_conn_to(&self, peer: &PeerId) -> Option<&ConnectionInfo> {
        self.conns
            .iter()
            .find(|c| &c.remote_peer == peer && c.is_direct())
    }

    fn admits(&self, from: &PeerId, now: Instant) -> bool {
        if !self.config.is_behind_nat() {
            return true;
        }
        self.nat_mappings
            .get(from)
            .is_some_and(|opened| now.duration_since(*opened) <= self.config.nat_mapping_window)
    }
}

struct NetState {
    hosts: HashMap<PeerId, HostEntry>,
    routes: HashMap<Multiaddr, PeerId>,
    next_conn_id: u64,
}

impl NetState {
    /// Create both views of a new connection and run the identify exchange.
    fn link(
        &mut self,
        dialer: PeerId,
        target: PeerId,
        dialed_addr: Multiaddr,
        relayed: bool,
    ) -> Result<ConnectionInfo, HostError> {
        let (dialer_listen, dialer_visible) = {
            let entry = self.hosts.get(&dialer).ok_or(HostError::Closed)?;
            (entry.config.listen_addrs.clone(), entry.config.visible_addr())
        };
        let (target_listen, target_visible) = {
            let entry = self
                .hosts
                .get(&target)
                .ok_or_else(|| HostError::DialFailed("peer not found".into()))?;
            (entry.config.listen_addrs.clone(), entry.config.visible_addr())
        };

        let id = self.next_conn_id;
        self.next_conn_id += 1;

        let outbound = ConnectionInfo {
            id,
            remote_peer: target,
            remote_addr: dialed_addr.clone(),
            direction: Direction::Outbound,
            relayed,
        };
        let inbound_addr = if relayed {
            dialed_addr
        } else {
            dialer_visible.clone().unwrap_or(dialed_addr)
        };
        let inbound = ConnectionInfo {
            id,
            remote_peer: dialer,
            remote_addr: inbound_addr,
            direction: Direction::Inbound,
            relayed,
        };

        if let Some(entry) = self.hosts.get_mut(&dialer) {
            entry.conns.push(outbound.clone());
            entry.peerstore.add_addrs(target, &target_listen, CONNECTED_ADDR_TTL);
            if let Some(addr) = dialer_visible {
                entry.observed.record(addr);
            }
        }
        if let Some(entry) = self.hosts.get_mut(&target) {
            entry.conns.push(inbound);
            entry.peerstore.add_addrs(dialer, &dialer_listen, CONNECTED_ADDR_TTL);
            if let Some(addr) = target_visible {
                entry.observed.record(addr);
            }
        }

        Ok(outbound)
    }
}

// ============================================================================
// Network
// ============================================================================

/// A set of in-process hosts sharing one routing table.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("hosts", &self.host_count())
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState {
                hosts: HashMap::new(),
                routes: HashMap::new(),
                next_conn_id: 1,
            })),
        }
    }

    /// Register a host with a freshly generated identity.
    pub fn add_host(&self, config: HostConfig) -> MemoryHost {
        self.add_host_with_keypair(&Keypair::generate(), config)
    }

    pub fn add_host_with_keypair(&self, keypair: &Keypair, config: HostConfig) -> MemoryHost {
        let peer = keypair.peer_id();
        let peerstore = Arc::new(PeerStore::new());
        let observed = Arc::new(ObservedAddrs::new());
        let dial_latency = config.dial_latency;

        let mut state = self.state.lock();
        for addr in config.listen_addrs.iter().chain(config.nat_external_addr.iter()) {
            state.routes.insert(addr.clone(), peer);
        }
        debug!(
            peer = ?peer,
            listen = ?config.listen_addrs,
            nat = config.is_behind_nat(),
            "memory host registered"
        );
        state.hosts.insert(
            peer,
            HostEntry {
                config,
                handlers: HashMap::new(),
                conns: Vec::new(),
                nat_mappings: HashMap::new(),
                streams_opened: HashMap::new(),
                peerstore: Arc::clone(&peerstore),
                observed: Arc::clone(&observed),
            },
        );

        MemoryHost {
            state: Arc::clone(&self.state),
            peer,
            dial_latency,
            peerstore,
            observed,
        }
    }

    pub fn host_count(&self) -> usize {
        self.state.lock().hosts.len()
    }
}

// ============================================================================
// Host handle
// ============================================================================

/// Handle to one host on a [`MemoryNetwork`]; cheap to clone.
#[derive(Clone)]
pub struct MemoryHost {
    state: Arc<Mutex<NetState>>,
    peer: PeerId,
    dial_latency: Duration,
    peerstore: Arc<PeerStore>,
    observed: Arc<ObservedAddrs>,
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHost")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl MemoryHost {
    /// This host's observed-address book, fed by the identify exchange.
    pub fn observed(&self) -> Arc<ObservedAddrs> {
        Arc::clone(&self.observed)
    }

    /// Connect to `peer` through the shared relay.
    pub async fn connect_relayed(&self, peer: PeerId) -> Result<ConnectionInfo, HostError> {
        self.connect(peer, &[relay_circuit_addr()]).await
    }

    /// Number of outbound streams opened on `protocol`.
    pub fn streams_opened(&self, protocol: &str) -> usize {
        self.state
            .lock()
            .hosts
            .get(&self.peer)
            .and_then(|h| h.streams_opened.get(protocol).copied())
            .unwrap_or(0)
    }

    pub fn direct_conns_to(&self, peer: &PeerId) -> Vec<ConnectionInfo> {
        self.conns_to_peer(peer)
            .into_iter()
            .filter(ConnectionInfo::is_direct)
            .collect()
    }

    fn open_relayed(&self, peer: PeerId, addr: Multiaddr) -> Result<ConnectionInfo, HostError> {
        let mut state = self.state.lock();
        if !state.hosts.contains_key(&peer) {
            return Err(HostError::DialFailed("relay has no reservation for peer".into()));
        }
        let conn = state.link(self.peer, peer, addr, true)?;
        debug!(peer = ?peer, conn_id = conn.id, "relayed connection established");
        Ok(conn)
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn local_peer_id(&self) -> PeerId {
        self.peer
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.state
            .lock()
            .hosts
            .get(&self.peer)
            .map(|h| h.config.listen_addrs.clone())
            .unwrap_or_default()
    }

    async fn dial(&self, peer: PeerId, addr: Multiaddr) -> Result<ConnectionInfo, HostError> {
        if peer == self.peer {
            return Err(HostError::DialFailed("cannot dial self".into()));
        }
        if is_relay_addr(&addr) {
            return Err(HostError::DialFailed("relay address is not directly dialable".into()));
        }

        {
            let mut state = self.state.lock();
            let me = state.hosts.get_mut(&self.peer).ok_or(HostError::Closed)?;
            if let Some(existing) = me.direct_conn_to(&peer) {
                return Ok(existing.clone());
            }
            // The outbound packet opens our NAT mapping toward the peer.
            me.nat_mappings.insert(peer, Instant::now());
        }
        trace!(peer = ?peer, addr = %addr, "dialing");

        tokio::time::sleep(self.dial_latency).await;

        let mut state = self.state.lock();
        if let Some(existing) = state
            .hosts
            .get(&self.peer)
            .and_then(|h| h.direct_conn_to(&peer))
        {
            trace!(peer = ?peer, conn_id = existing.id, "simultaneous open, reusing connection");
            return Ok(existing.clone());
        }

        let target = state
            .routes
            .get(&addr)
            .copied()
            .ok_or_else(|| HostError::DialFailed(format!("no route to {addr}")))?;
        if target != peer {
            return Err(HostError::DialFailed("peer id mismatch".into()));
        }
        let admitted = state
            .hosts
            .get(&peer)
            .is_some_and(|h| h.admits(&self.peer, Instant::now()));
        if !admitted {
            return Err(HostError::DialFailed("connection refused by NAT".into()));
        }

        let conn = state.link(self.peer, peer, addr, false)?;
        debug!(peer = ?peer, addr = %conn.remote_addr, conn_id = conn.id, "direct connection established");
        Ok(conn)
    }

    async fn connect(&self, peer: PeerId, addrs: &[Multiaddr]) -> Result<ConnectionInfo, HostError> {
        let existing = self.conns_to_peer(&peer);
        if let Some(conn) = existing
            .iter()
            .find(|c| c.is_direct())
            .or_else(|| existing.first())
        {
            return Ok(conn.clone());
        }

        let addrs = if addrs.is_empty() {
            self.peerstore.addrs(&peer)
        } else {
            addrs.to_vec()
        };

        let mut last_err = HostError::DialFailed("no addresses".into());
        for addr in addrs {
            let result = if is_relay_addr(&addr) {
                self.open_relayed(peer, addr)
            } else {
                self.dial(peer, addr).await
            };
            match result {
                Ok(conn) => return Ok(conn),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<BoxedStream, HostError> {
        let handler = {
            let mut state = self.state.lock();
            let connected = state
                .hosts
                .get(&self.peer)
                .ok_or(HostError::Closed)?
                .conns
                .iter()
                .any(|c| c.remote_peer == peer);
            if !connected {
                return Err(HostError::NotConnected);
            }
            let handler = state
                .hosts
                .get(&peer)
                .ok_or(HostError::NotConnected)?
                .handlers
                .get(protocol)
                .cloned()
                .ok_or_else(|| HostError::ProtocolNotSupported(protocol.to_string()))?;
            if let Some(me) = state.hosts.get_mut(&self.peer) {
                *me.streams_opened.entry(protocol.to_string()).or_default() += 1;
            }
            handler
        };

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        trace!(peer = ?peer, protocol, "stream opened");
        tokio::spawn(handler(self.peer, Box::new(remote)));
        Ok(Box::new(local))
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        if let Some(me) = self.state.lock().hosts.get_mut(&self.peer) {
            me.handlers.insert(protocol.to_string(), handler);
        }
    }

    fn remove_stream_handler(&self, protocol: &str) {
        if let Some(me) = self.state.lock().hosts.get_mut(&self.peer) {
            me.handlers.remove(protocol);
        }
    }

    fn conns_to_peer(&self, peer: &PeerId) -> Vec<ConnectionInfo> {
        self.state
            .lock()
            .hosts
            .get(&self.peer)
            .map(|h| {
                h.conns
                    .iter()
                    .filter(|c| &c.remote_peer == peer)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn peerstore(&self) -> &PeerStore {
        &self.peerstore
    }
}

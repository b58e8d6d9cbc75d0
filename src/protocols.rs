//! Collaborator interfaces the coordinator depends on.
//!
//! The hole-punch service never touches a concrete network stack. It talks
//! to the host through these traits:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`Host`] | dialing, stream opening, handler registration, connection table, peerstore |
//! | [`AddressObserver`] | this host's externally observed addresses (identify) |
//!
//! [`crate::memory`] provides in-process implementations of both.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use multiaddr::Multiaddr;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::HostError;
use crate::identity::PeerId;
use crate::peerstore::PeerStore;

/// A negotiated, bidirectional protocol stream.
pub trait ProtocolStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProtocolStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn ProtocolStream>;

/// Handler invoked for every inbound stream on a registered protocol.
/// Receives the remote peer and the stream.
pub type StreamHandler = Arc<dyn Fn(PeerId, BoxedStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`StreamHandler`].
pub fn stream_handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(PeerId, BoxedStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |peer: PeerId, stream: BoxedStream| -> BoxFuture<'static, ()> {
        Box::pin(f(peer, stream))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Snapshot of one connection in the host's connection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub remote_peer: PeerId,
    pub remote_addr: Multiaddr,
    pub direction: Direction,
    /// Routed through a relay rather than directly between the peers.
    pub relayed: bool,
}

impl ConnectionInfo {
    pub fn is_direct(&self) -> bool {
        !self.relayed
    }
}

/// Host / network stack operations.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// Addresses this host listens on.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// A single outbound direct connection attempt to `peer` at `addr`.
    ///
    /// Returns the existing connection if a direct one was established
    /// concurrently (simultaneous open).
    async fn dial(&self, peer: PeerId, addr: Multiaddr) -> Result<ConnectionInfo, HostError>;

    /// Connect to `peer` using `addrs`, or peerstore addresses when empty.
    async fn connect(&self, peer: PeerId, addrs: &[Multiaddr]) -> Result<ConnectionInfo, HostError>;

    /// Open a stream over any existing connection to `peer`.
    ///
    /// Fails with [`HostError::ProtocolNotSupported`] when the peer has no
    /// handler registered for `protocol`.
    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<BoxedStream, HostError>;

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    fn remove_stream_handler(&self, protocol: &str);

    fn conns_to_peer(&self, peer: &PeerId) -> Vec<ConnectionInfo>;

    fn peerstore(&self) -> &PeerStore;
}

/// Address-observation (identify) service.
pub trait AddressObserver: Send + Sync + 'static {
    /// Addresses other peers have reported seeing us at.
    fn observed_addrs(&self) -> Vec<Multiaddr>;
}

impl<A: AddressObserver + ?Sized> AddressObserver for Arc<A> {
    fn observed_addrs(&self) -> Vec<Multiaddr> {
        (**self).observed_addrs()
    }
}

//! # Peer Address Book
//!
//! Per-peer address records with TTL expiry. Written concurrently by the
//! address-observation exchange and by completed hole punches, read when
//! building direct-dial candidate lists.
//!
//! ## Bounds
//!
//! - At most [`MAX_PEERS`] peers (least recently used evicted)
//! - At most [`MAX_ADDRS_PER_PEER`] addresses per peer (soonest-expiring evicted)

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use multiaddr::Multiaddr;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::identity::PeerId;

/// Addresses learned in passing (e.g. from a third party).
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

/// Addresses of a peer we were connected to recently.
pub const RECENTLY_CONNECTED_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Addresses of a peer we are connected to, or just exchanged during a hole punch.
pub const CONNECTED_ADDR_TTL: Duration = Duration::from_secs(60 * 60);

/// Addresses that never expire.
pub const PERMANENT_ADDR_TTL: Duration = Duration::MAX;

/// Maximum number of peers tracked.
/// SECURITY: bounds the book under address spam from many identities.
pub const MAX_PEERS: usize = 10_000;

/// Maximum addresses kept per peer.
pub const MAX_ADDRS_PER_PEER: usize = 32;

#[derive(Debug, Clone)]
struct AddrRecord {
    addr: Multiaddr,
    /// `None` never expires.
    expires_at: Option<Instant>,
}

impl AddrRecord {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

fn expiry(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

pub struct PeerStore {
    book: Mutex<LruCache<PeerId, Vec<AddrRecord>>>,
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PeerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStore")
            .field("peers", &self.book.lock().len())
            .finish()
    }
}

impl PeerStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PEERS)
    }

    pub fn with_capacity(max_peers: usize) -> Self {
        let cap = NonZeroUsize::new(max_peers.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            book: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Add addresses, extending the TTL of ones already known.
    pub fn add_addrs(&self, peer: PeerId, addrs: &[Multiaddr], ttl: Duration) {
        if addrs.is_empty() || ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let new_expiry = expiry(now, ttl);

        let mut book = self.book.lock();
        let records = book.get_or_insert_mut(peer, Vec::new);
        records.retain(|r| !r.is_expired(now));

        for addr in addrs {
            if let Some(existing) = records.iter_mut().find(|r| &r.addr == addr) {
                existing.expires_at = match (existing.expires_at, new_expiry) {
                    (None, _) | (_, None) => None,
                    (Some(a), Some(b)) => Some(a.max(b)),
                };
                continue;
            }
            if records.len() >= MAX_ADDRS_PER_PEER {
                evict_soonest_expiring(records);
            }
            records.push(AddrRecord {
                addr: addr.clone(),
                expires_at: new_expiry,
            });
        }
    }

    /// Overwrite the TTL of the given addresses; a zero TTL removes them.
    pub fn set_addrs(&self, peer: PeerId, addrs: &[Multiaddr], ttl: Duration) {
        let now = Instant::now();
        let new_expiry = expiry(now, ttl);

        let mut book = self.book.lock();
        let records = book.get_or_insert_mut(peer, Vec::new);
        for addr in addrs {
            records.retain(|r| &r.addr != addr);
            if ttl.is_zero() {
                continue;
            }
            if records.len() >= MAX_ADDRS_PER_PEER {
                evict_soonest_expiring(records);
            }
            records.push(AddrRecord {
                addr: addr.clone(),
                expires_at: new_expiry,
            });
        }
        if records.is_empty() {
            book.pop(&peer);
        }
    }

    /// Live addresses for `peer`, in insertion order.
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        let mut book = self.book.lock();
        let Some(records) = book.get_mut(peer) else {
            return Vec::new();
        };
        records.retain(|r| !r.is_expired(now));
        records.iter().map(|r| r.addr.clone()).collect()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.book.lock().iter().map(|(peer, _)| *peer).collect()
    }
}

fn evict_soonest_expiring(records: &mut Vec<AddrRecord>) {
    let victim = records
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.expires_at.map(|t| (i, t)))
        .min_by_key(|(_, t)| *t)
        .map(|(i, _)| i)
        .unwrap_or(0);
    records.remove(victim);
}

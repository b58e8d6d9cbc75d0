//! # Attempt Tracker
//!
//! Enforces at most one active hole-punch attempt per peer.
//!
//! - An initiator that finds a run already in flight joins it and receives a
//!   clone of that run's outcome.
//! - A responder that finds a run already in flight is refused outright.
//! - A [`ClaimGuard`] dropped without [`ClaimGuard::release`] publishes
//!   [`HolePunchError::Abandoned`], so joined callers never hang.
//!
//! The lock is held only for claim and release.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

use crate::error::HolePunchError;
use crate::identity::PeerId;

/// Outcome of one coordination run, shared with every joined caller.
pub type AttemptOutcome = Result<(), HolePunchError>;

/// Number of peers whose most recent outcome is remembered.
pub const MAX_REMEMBERED_OUTCOMES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

struct InFlight {
    id: u64,
    role: Role,
    started_at: Instant,
    done: watch::Sender<Option<AttemptOutcome>>,
}

struct TrackerState {
    in_flight: HashMap<PeerId, InFlight>,
    last_results: LruCache<PeerId, AttemptOutcome>,
    next_id: u64,
}

impl TrackerState {
    fn insert(&mut self, peer: PeerId, role: Role) -> (u64, Instant) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let started_at = Instant::now();
        let (done, _) = watch::channel(None);
        self.in_flight.insert(
            peer,
            InFlight {
                id,
                role,
                started_at,
                done,
            },
        );
        (id, started_at)
    }
}

/// Per-peer attempt slots, cheap to clone.
#[derive(Clone)]
pub struct AttemptTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl Default for AttemptTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AttemptTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptTracker")
            .field("active", &self.active_count())
            .finish()
    }
}

pub enum Claim {
    /// The caller runs the attempt and must release the guard.
    Owner(ClaimGuard),
    /// Another run is in flight; wait for its outcome.
    Joined(AttemptWaiter),
}

impl AttemptTracker {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_REMEMBERED_OUTCOMES).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                in_flight: HashMap::new(),
                last_results: LruCache::new(cap),
                next_id: 0,
            })),
        }
    }

    /// Claim the slot for an initiator run, or join the run already in flight.
    pub fn try_claim(&self, peer: PeerId) -> Claim {
        let mut state = self.state.lock();
        if let Some(flight) = state.in_flight.get(&peer) {
            trace!(peer = ?peer, role = ?flight.role, "joining in-flight attempt");
            return Claim::Joined(AttemptWaiter {
                peer,
                done: flight.done.subscribe(),
            });
        }
        let (id, started_at) = state.insert(peer, Role::Initiator);
        Claim::Owner(self.guard(peer, id, Role::Initiator, started_at))
    }

    /// Claim the slot for a responder run. `None` when any attempt is active.
    pub fn try_claim_responder(&self, peer: PeerId) -> Option<ClaimGuard> {
        let mut state = self.state.lock();
        if state.in_flight.contains_key(&peer) {
            return None;
        }
        let (id, started_at) = state.insert(peer, Role::Responder);
        Some(self.guard(peer, id, Role::Responder, started_at))
    }

    pub fn is_active(&self, peer: &PeerId) -> bool {
        self.state.lock().in_flight.contains_key(peer)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Outcome of the most recently finished attempt with `peer`.
    pub fn last_result(&self, peer: &PeerId) -> Option<AttemptOutcome> {
        self.state.lock().last_results.get(peer).cloned()
    }

    fn guard(&self, peer: PeerId, id: u64, role: Role, started_at: Instant) -> ClaimGuard {
        ClaimGuard {
            state: Arc::clone(&self.state),
            peer,
            id,
            role,
            started_at,
            released: false,
        }
    }
}

/// Exclusive ownership of a peer's attempt slot.
pub struct ClaimGuard {
    state: Arc<Mutex<TrackerState>>,
    peer: PeerId,
    id: u64,
    role: Role,
    started_at: Instant,
    released: bool,
}

impl ClaimGuard {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Publish the outcome to joined callers and free the slot.
    pub fn release(mut self, outcome: AttemptOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: AttemptOutcome) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = self.state.lock();
        state.last_results.put(self.peer, outcome.clone());
        let owned = state
            .in_flight
            .get(&self.peer)
            .is_some_and(|flight| flight.id == self.id);
        if owned && let Some(flight) = state.in_flight.remove(&self.peer) {
            flight.done.send_replace(Some(outcome));
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.released {
            trace!(peer = ?self.peer, "attempt dropped without release");
            self.finish(Err(HolePunchError::Abandoned));
        }
    }
}

/// Handle for a caller that joined an in-flight attempt.
pub struct AttemptWaiter {
    peer: PeerId,
    done: watch::Receiver<Option<AttemptOutcome>>,
}

impl AttemptWaiter {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Resolves with the owning run's outcome.
    pub async fn wait(mut self) -> AttemptOutcome {
        match self.done.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Err(HolePunchError::Abandoned)),
            Err(_) => Err(HolePunchError::Abandoned),
        }
    }
}

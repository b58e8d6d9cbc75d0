//! # Hole-Punch Coordinator
//!
//! [`HolePunchService`] drives both ends of a coordinated hole punch between
//! two peers that already share a relayed connection.
//!
//! ## Initiator
//!
//! ```text
//! Idle -> StreamOpened -> SentConnect -> AwaitingConnectReply -> ComputedRtt
//!      -> SentSyncDelayed -> Dialing -> Succeeded | Failed
//! ```
//!
//! The initiator measures the CONNECT round trip and waits half of it before
//! sending SYNC. SYNC then reaches the responder at about the moment the
//! initiator starts dialing, so both sides' dials cross in the network.
//!
//! ## Responder
//!
//! ```text
//! Idle -> AwaitingConnect -> SentConnectReply -> AwaitingSync -> Dialing
//!      -> Succeeded | Failed
//! ```
//!
//! The responder dials as soon as SYNC arrives. Its failures go to the
//! [`HandlerErrorLog`] and the tracing output; nobody awaits them.
//!
//! ## Deadlines
//!
//! Opening the stream, every read and write, the SYNC delay and the dial
//! race share one deadline, `hole_punch_timeout` after the run started.
//! [`HolePunchService::close`] cancels every running attempt.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use multiaddr::Multiaddr;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::addrs::{AddressFilter, is_relay_addr};
use crate::dialer::race_dial;
use crate::error::HolePunchError;
use crate::identity::PeerId;
use crate::messages::{HolePunchMessage, MessageKind, PROTOCOL_ID, read_expected, write_message};
use crate::peerstore::CONNECTED_ADDR_TTL;
use crate::protocols::{AddressObserver, BoxedStream, Host, stream_handler};
use crate::rtt::RttTimer;
use crate::tracker::{AttemptOutcome, AttemptTracker, Claim, Role};

// ============================================================================
// Configuration
// ============================================================================

/// Budget for one complete coordination run, messages and dials included.
pub const DEFAULT_HOLE_PUNCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for the direct dial tried before any coordination.
pub const DEFAULT_DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Responder failures retained for inspection.
pub const DEFAULT_HANDLER_ERROR_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct HolePunchConfig {
    pub hole_punch_timeout: Duration,
    /// Offer and dial private-range addresses (same-LAN and test setups).
    pub allow_private_addrs: bool,
    /// Zero disables the direct dial tried before coordinating.
    pub direct_dial_timeout: Duration,
    pub handler_error_capacity: usize,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            hole_punch_timeout: DEFAULT_HOLE_PUNCH_TIMEOUT,
            allow_private_addrs: false,
            direct_dial_timeout: DEFAULT_DIRECT_DIAL_TIMEOUT,
            handler_error_capacity: DEFAULT_HANDLER_ERROR_CAPACITY,
        }
    }
}

impl HolePunchConfig {
    pub fn with_hole_punch_timeout(mut self, timeout: Duration) -> Self {
        self.hole_punch_timeout = timeout;
        self
    }

    pub fn with_allow_private_addrs(mut self, allow: bool) -> Self {
        self.allow_private_addrs = allow;
        self
    }

    pub fn with_direct_dial_timeout(mut self, timeout: Duration) -> Self {
        self.direct_dial_timeout = timeout;
        self
    }

    pub fn with_handler_error_capacity(mut self, capacity: usize) -> Self {
        self.handler_error_capacity = capacity;
        self
    }

    pub fn address_filter(&self) -> AddressFilter {
        AddressFilter::new(self.allow_private_addrs)
    }
}

// ============================================================================
// Responder error log
// ============================================================================

/// One failed responder run.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub peer: PeerId,
    pub error: HolePunchError,
    pub at: Instant,
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.peer.short(), self.error)
    }
}

/// Bounded log of responder failures; the oldest entry is dropped when full.
#[derive(Debug)]
pub struct HandlerErrorLog {
    capacity: usize,
    entries: Mutex<VecDeque<HandlerError>>,
}

impl HandlerErrorLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, peer: PeerId, error: HolePunchError) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(HandlerError {
            peer,
            error,
            at: Instant::now(),
        });
    }

    pub fn snapshot(&self) -> Vec<HandlerError> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ============================================================================
// Attempts and states
// ============================================================================

/// One coordination run, owned by the task executing it.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub peer: PeerId,
    pub role: Role,
    pub deadline: Instant,
    /// Local candidates offered in our CONNECT.
    pub candidate_addrs: Vec<Multiaddr>,
    pub started_at: Instant,
}

impl Attempt {
    fn new(peer: PeerId, role: Role, timeout: Duration, candidate_addrs: Vec<Multiaddr>) -> Self {
        let started_at = Instant::now();
        Self {
            peer,
            role,
            deadline: started_at + timeout,
            candidate_addrs,
            started_at,
        }
    }

    /// Bound `fut` by the attempt deadline.
    async fn within<F: Future>(&self, phase: &'static str, fut: F) -> Result<F::Output, HolePunchError> {
        tokio::time::timeout_at(self.deadline, fut)
            .await
            .map_err(|_| HolePunchError::DeadlineReached(phase))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    Idle,
    StreamOpened,
    SentConnect,
    AwaitingConnectReply,
    ComputedRtt,
    SentSyncDelayed,
    Dialing,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    AwaitingConnect,
    SentConnectReply,
    AwaitingSync,
    Dialing,
    Succeeded,
    Failed,
}

fn advance<S: Copy + std::fmt::Debug>(peer: &PeerId, state: &mut S, next: S) {
    trace!(peer = ?peer, from = ?*state, to = ?next, "hole punch state");
    *state = next;
}

// ============================================================================
// Service
// ============================================================================

struct ServiceInner<H, A> {
    host: H,
    observer: A,
    config: HolePunchConfig,
    filter: AddressFilter,
    tracker: AttemptTracker,
    errors: HandlerErrorLog,
    cancel: CancellationToken,
}

/// Hole-punch coordinator bound to one host. Cheap to clone.
pub struct HolePunchService<H, A> {
    inner: Arc<ServiceInner<H, A>>,
}

impl<H, A> Clone for HolePunchService<H, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H, A> std::fmt::Debug for HolePunchService<H, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HolePunchService")
            .field("config", &self.inner.config)
            .field("tracker", &self.inner.tracker)
            .field("handler_errors", &self.inner.errors.len())
            .finish()
    }
}

impl<H, A> HolePunchService<H, A>
where
    H: Host + Clone,
    A: AddressObserver,
{
    /// Create the service and register the responder stream handler.
    pub fn new(host: H, observer: A, config: HolePunchConfig) -> Self {
        let inner = Arc::new(ServiceInner {
            filter: config.address_filter(),
            errors: HandlerErrorLog::new(config.handler_error_capacity),
            tracker: AttemptTracker::new(),
            cancel: CancellationToken::new(),
            host,
            observer,
            config,
        });

        // Weak: the host owns the handler, the handler must not own the host.
        let weak: Weak<ServiceInner<H, A>> = Arc::downgrade(&inner);
        inner.host.set_stream_handler(
            PROTOCOL_ID,
            stream_handler(move |peer, stream| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_inbound(peer, stream).await;
                    }
                }
            }),
        );
        debug!(
            peer = ?inner.host.local_peer_id(),
            timeout_ms = inner.config.hole_punch_timeout.as_millis() as u64,
            "hole punch service started"
        );

        Self { inner }
    }

    pub fn host(&self) -> &H {
        &self.inner.host
    }

    pub fn config(&self) -> &HolePunchConfig {
        &self.inner.config
    }

    /// Establish a direct connection to `peer`, coordinating over the
    /// existing relayed connection when a plain dial is not enough.
    ///
    /// A caller that arrives while an attempt with `peer` is in flight waits
    /// for it and receives the same outcome.
    ///
    /// Having no local candidates fails with `NoLocalAddrs` before the stream
    /// is opened, so it takes precedence over "protocol not supported".
    pub async fn hole_punch(&self, peer: PeerId) -> Result<(), HolePunchError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(HolePunchError::Closed);
        }
        if inner.host.conns_to_peer(&peer).iter().any(|c| c.is_direct()) {
            debug!(peer = ?peer, "already directly connected");
            return Ok(());
        }

        let guard = match inner.tracker.try_claim(peer) {
            Claim::Owner(guard) => guard,
            Claim::Joined(waiter) => {
                debug!(peer = ?peer, "hole punch already in flight, waiting for outcome");
                return waiter.wait().await;
            }
        };

        let cancel = inner.cancel.child_token();
        let outcome: AttemptOutcome = tokio::select! {
            _ = cancel.cancelled() => Err(HolePunchError::Closed),
            result = inner.initiate(peer, &cancel) => result,
        };

        match &outcome {
            Ok(()) => info!(
                peer = ?peer,
                elapsed_ms = guard.started_at().elapsed().as_millis() as u64,
                "hole punch succeeded"
            ),
            Err(e) => debug!(peer = ?peer, error = %e, "hole punch failed"),
        }
        guard.release(outcome.clone());
        outcome
    }

    /// Snapshot of recorded responder failures, oldest first.
    pub fn handler_errors(&self) -> Vec<HandlerError> {
        self.inner.errors.snapshot()
    }

    /// Outcome of the most recent attempt with `peer`, in either role.
    pub fn last_result(&self, peer: &PeerId) -> Option<AttemptOutcome> {
        self.inner.tracker.last_result(peer)
    }

    pub fn is_active(&self, peer: &PeerId) -> bool {
        self.inner.tracker.is_active(peer)
    }

    /// Cancel running attempts and stop accepting inbound ones.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.host.remove_stream_handler(PROTOCOL_ID);
        debug!(peer = ?self.inner.host.local_peer_id(), "hole punch service closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl<H, A> ServiceInner<H, A>
where
    H: Host + Clone,
    A: AddressObserver,
{
    /// Listen and observed addresses we can offer a peer.
    fn local_candidates(&self) -> Vec<Multiaddr> {
        let listen = self.host.listen_addrs();
        let observed = self.observer.observed_addrs();
        self.filter.filter_candidates(listen.iter().chain(observed.iter()))
    }

    /// Store a peer's offered addresses, minus relay circuits.
    fn remember_remote_addrs(&self, peer: PeerId, offered: Vec<Multiaddr>) -> Vec<Multiaddr> {
        let addrs: Vec<Multiaddr> = offered.into_iter().filter(|a| !is_relay_addr(a)).collect();
        self.host.peerstore().add_addrs(peer, &addrs, CONNECTED_ADDR_TTL);
        addrs
    }

    /// Plain direct dial to addresses already in the peerstore.
    async fn try_direct_dial(&self, peer: PeerId, cancel: &CancellationToken) -> bool {
        if self.config.direct_dial_timeout.is_zero() {
            return false;
        }
        let known = self.host.peerstore().addrs(&peer);
        let candidates = self.filter.filter_candidates(&known);
        if candidates.is_empty() {
            return false;
        }

        let deadline = Instant::now() + self.config.direct_dial_timeout;
        match race_dial(&self.host, peer, &candidates, deadline, cancel).await {
            Ok(conn) => {
                debug!(peer = ?peer, addr = %conn.remote_addr, "direct dial succeeded, no hole punch needed");
                true
            }
            Err(e) => {
                debug!(peer = ?peer, error = %e, "direct dial failed, coordinating hole punch");
                false
            }
        }
    }

    async fn initiate(&self, peer: PeerId, cancel: &CancellationToken) -> AttemptOutcome {
        if self.try_direct_dial(peer, cancel).await {
            return Ok(());
        }

        let local_addrs = self.local_candidates();
        if local_addrs.is_empty() {
            return Err(HolePunchError::NoLocalAddrs);
        }
        let attempt = Attempt::new(peer, Role::Initiator, self.config.hole_punch_timeout, local_addrs);

        let mut state = InitiatorState::Idle;
        let result = self.run_initiator(&attempt, &mut state, cancel).await;
        let last = if result.is_ok() {
            InitiatorState::Succeeded
        } else {
            InitiatorState::Failed
        };
        advance(&peer, &mut state, last);
        result
    }

    async fn run_initiator(
        &self,
        attempt: &Attempt,
        state: &mut InitiatorState,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let peer = attempt.peer;

        let mut stream = attempt
            .within("opening stream", self.host.open_stream(peer, PROTOCOL_ID))
            .await?
            .map_err(HolePunchError::OpenStream)?;
        advance(&peer, state, InitiatorState::StreamOpened);

        let connect = HolePunchMessage::connect(attempt.candidate_addrs.clone());
        let timer = RttTimer::start();
        attempt
            .within("sending CONNECT", write_message(&mut stream, &connect))
            .await?
            .map_err(|e| HolePunchError::Write {
                kind: "CONNECT",
                reason: e.to_string(),
            })?;
        advance(&peer, state, InitiatorState::SentConnect);

        advance(&peer, state, InitiatorState::AwaitingConnectReply);
        let reply = attempt
            .within("waiting for CONNECT", read_expected(&mut stream, MessageKind::Connect))
            .await?
            .map_err(HolePunchError::from_connect_read)?;
        let rtt = timer.stop();
        advance(&peer, state, InitiatorState::ComputedRtt);

        let remote_addrs = self.remember_remote_addrs(peer, reply.observed_addrs);
        debug!(
            peer = ?peer,
            rtt_ms = rtt.rtt().as_millis() as u64,
            remote_addrs = remote_addrs.len(),
            "received CONNECT reply"
        );

        attempt
            .within("delaying SYNC", tokio::time::sleep(rtt.sync_delay()))
            .await?;
        attempt
            .within("sending SYNC", write_message(&mut stream, &HolePunchMessage::sync()))
            .await?
            .map_err(|e| HolePunchError::Write {
                kind: "SYNC",
                reason: e.to_string(),
            })?;
        advance(&peer, state, InitiatorState::SentSyncDelayed);

        // Message phase is over.
        let _ = stream.shutdown().await;
        drop(stream);

        advance(&peer, state, InitiatorState::Dialing);
        let candidates = self.filter.filter_candidates(&remote_addrs);
        race_dial(&self.host, peer, &candidates, attempt.deadline, cancel).await?;
        Ok(())
    }

    async fn handle_inbound(&self, peer: PeerId, stream: BoxedStream) {
        let Some(guard) = self.tracker.try_claim_responder(peer) else {
            warn!(peer = ?peer, "hole punch already in progress");
            self.errors.push(peer, HolePunchError::AlreadyInProgress);
            return;
        };

        let cancel = self.cancel.child_token();
        let mut state = ResponderState::Idle;
        let outcome: AttemptOutcome = tokio::select! {
            _ = cancel.cancelled() => Err(HolePunchError::Closed),
            result = self.run_responder(peer, stream, &mut state, &cancel) => result,
        };

        match &outcome {
            Ok(()) => {
                advance(&peer, &mut state, ResponderState::Succeeded);
                info!(
                    peer = ?peer,
                    elapsed_ms = guard.started_at().elapsed().as_millis() as u64,
                    "hole punch succeeded (responder)"
                );
            }
            Err(e) => {
                advance(&peer, &mut state, ResponderState::Failed);
                warn!(peer = ?peer, error = %e, "inbound hole punch failed");
                self.errors.push(peer, e.clone());
            }
        }
        guard.release(outcome);
    }

    async fn run_responder(
        &self,
        peer: PeerId,
        mut stream: BoxedStream,
        state: &mut ResponderState,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let mut attempt = Attempt::new(peer, Role::Responder, self.config.hole_punch_timeout, Vec::new());

        advance(&peer, state, ResponderState::AwaitingConnect);
        let connect = attempt
            .within("waiting for CONNECT", read_expected(&mut stream, MessageKind::Connect))
            .await?
            .map_err(HolePunchError::from_connect_read)?;
        let remote_addrs = self.remember_remote_addrs(peer, connect.observed_addrs);

        attempt.candidate_addrs = self.local_candidates();
        if attempt.candidate_addrs.is_empty() {
            return Err(HolePunchError::NoLocalAddrs);
        }
        let reply = HolePunchMessage::connect(attempt.candidate_addrs.clone());
        attempt
            .within("sending CONNECT", write_message(&mut stream, &reply))
            .await?
            .map_err(|e| HolePunchError::Write {
                kind: "CONNECT",
                reason: e.to_string(),
            })?;
        advance(&peer, state, ResponderState::SentConnectReply);

        advance(&peer, state, ResponderState::AwaitingSync);
        attempt
            .within("waiting for SYNC", read_expected(&mut stream, MessageKind::Sync))
            .await?
            .map_err(HolePunchError::from_sync_read)?;
        drop(stream);

        advance(&peer, state, ResponderState::Dialing);
        debug!(peer = ?peer, remote_addrs = remote_addrs.len(), "SYNC received, dialing");
        let candidates = self.filter.filter_candidates(&remote_addrs);
        race_dial(&self.host, peer, &candidates, attempt.deadline, cancel).await?;
        Ok(())
    }
}

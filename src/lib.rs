//! # Holepunch - Relay-Assisted Direct Connection Upgrade
//!
//! Two peers that can only reach each other through a relay coordinate a
//! synchronized "hole punch": both dial each other's public addresses at the
//! same moment so that their NATs each see outbound traffic and let the other
//! side's packets in. If it fails, the relayed connection stays in use.
//!
//! ## Protocol
//!
//! ```text
//! initiator                         responder
//!     | --- CONNECT(addrs_i) -------->  |
//!     | <-------- CONNECT(addrs_r) ---  |   rtt measured here
//!     |   (sleep rtt / 2)               |
//!     | --- SYNC -------------------->  |
//!     | dial addrs_r                    | dial addrs_i
//! ```
//!
//! ## Architecture
//!
//! - The coordinator depends on the network only through the [`Host`] and
//!   [`AddressObserver`] traits
//! - One attempt per peer at a time; a second local caller shares the
//!   outcome of the first
//! - Every wait is bounded by one per-run deadline, and the service-wide
//!   cancellation token tears everything down on [`HolePunchService::close`]
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `service` | Coordinator: initiator entry point, responder handler, configuration |
//! | `messages` | CONNECT / SYNC wire codec |
//! | `addrs` | Candidate address filtering |
//! | `rtt` | Round-trip measurement and SYNC delay |
//! | `dialer` | Direct-dial race across candidate addresses |
//! | `tracker` | Per-peer attempt deduplication |
//! | `protocols` | `Host` and `AddressObserver` collaborator traits |
//! | `peerstore` | TTL-bounded peer address book |
//! | `identify` | Observed-address bookkeeping |
//! | `identity` | Ed25519 keypairs and peer ids |
//! | `memory` | In-process network implementing `Host` with a NAT model |
//! | `error` | Error types |

mod addrs;
mod dialer;
mod error;
mod identify;
mod identity;
mod memory;
mod messages;
mod peerstore;
mod protocols;
mod rtt;
mod service;
mod tracker;

pub use addrs::{AddressFilter, is_private_addr, is_relay_addr};
pub use dialer::race_dial;
pub use error::{DialError, HolePunchError, HostError};
pub use identify::{MAX_OBSERVED_ADDRS, ObservedAddrs};
pub use identity::{Keypair, PeerId};
pub use memory::{HostConfig, MemoryHost, MemoryNetwork, relay_circuit_addr};
pub use messages::{
    CodecError, HolePunchMessage, MAX_MESSAGE_SIZE, MessageKind, PROTOCOL_ID, read_expected,
    read_message, write_message,
};
pub use peerstore::{
    CONNECTED_ADDR_TTL, PERMANENT_ADDR_TTL, PeerStore, RECENTLY_CONNECTED_ADDR_TTL, TEMP_ADDR_TTL,
};
pub use protocols::{
    AddressObserver, BoxedStream, ConnectionInfo, Direction, Host, ProtocolStream, StreamHandler,
    stream_handler,
};
pub use rtt::{RttSample, RttTimer};
pub use service::{
    Attempt, DEFAULT_HOLE_PUNCH_TIMEOUT, HandlerError, HandlerErrorLog, HolePunchConfig,
    HolePunchService, InitiatorState, ResponderState,
};
pub use tracker::{AttemptOutcome, AttemptTracker, Claim, ClaimGuard, Role};

//! Error types for hole-punch coordination.
//!
//! Every error here is `Clone`: a single attempt's outcome is handed to every
//! caller that joined the attempt through the tracker.

use multiaddr::Multiaddr;
use thiserror::Error;

use crate::messages::CodecError;

/// Errors surfaced by the [`Host`](crate::protocols::Host) collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The remote peer has no handler for the requested protocol.
    #[error("protocol not supported: {0}")]
    ProtocolNotSupported(String),

    /// No connection (relayed or direct) exists to the peer.
    #[error("no connection to peer")]
    NotConnected,

    /// A single outbound dial failed.
    #[error("dial failed: {0}")]
    DialFailed(String),

    /// The host has been shut down.
    #[error("host closed")]
    Closed,
}

/// Aggregated failure of a direct-dial race.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("no candidate addresses")]
    NoCandidates,

    /// Every candidate failed before the deadline.
    #[error("all dials failed: {}", format_failures(.0))]
    AllFailed(Vec<(Multiaddr, String)>),

    /// The deadline passed with no connection; pending candidates are listed
    /// as timed out.
    #[error("i/o deadline reached while dialing: {}", format_failures(.0))]
    DeadlineReached(Vec<(Multiaddr, String)>),

    #[error("dial cancelled")]
    Cancelled,
}

impl DialError {
    /// Per-address failure reasons, empty for non-aggregated variants.
    pub fn failures(&self) -> &[(Multiaddr, String)] {
        match self {
            DialError::AllFailed(failures) | DialError::DeadlineReached(failures) => failures,
            _ => &[],
        }
    }
}

fn format_failures(failures: &[(Multiaddr, String)]) -> String {
    failures
        .iter()
        .map(|(addr, reason)| format!("{addr}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of a failed coordination run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HolePunchError {
    #[error("failed to open hole punch stream: {0}")]
    OpenStream(HostError),

    /// Malformed frame or wrong message kind where CONNECT was due.
    #[error("expected CONNECT message, got {0}")]
    ExpectedConnect(String),

    /// Malformed frame or wrong message kind where SYNC was due.
    #[error("expected SYNC message, got {0}")]
    ExpectedSync(String),

    #[error("failed to read CONNECT message: {0}")]
    ReadConnect(String),

    #[error("failed to read SYNC message: {0}")]
    ReadSync(String),

    #[error("failed to write {kind} message: {reason}")]
    Write { kind: &'static str, reason: String },

    #[error("i/o deadline reached while {0}")]
    DeadlineReached(&'static str),

    #[error("direct dial failed: {0}")]
    Dial(#[from] DialError),

    #[error("no public addresses to offer")]
    NoLocalAddrs,

    #[error("hole punch already in progress with peer")]
    AlreadyInProgress,

    #[error("hole punch attempt abandoned")]
    Abandoned,

    #[error("hole punch service closed")]
    Closed,
}

impl HolePunchError {
    /// Maps a codec failure on the CONNECT read into the protocol taxonomy.
    pub(crate) fn from_connect_read(err: CodecError) -> Self {
        match err {
            CodecError::Io(reason) => HolePunchError::ReadConnect(reason),
            other => HolePunchError::ExpectedConnect(other.to_string()),
        }
    }

    pub(crate) fn from_sync_read(err: CodecError) -> Self {
        match err {
            CodecError::Io(reason) => HolePunchError::ReadSync(reason),
            other => HolePunchError::ExpectedSync(other.to_string()),
        }
    }

    /// Protocol violations abort the run and are never retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            HolePunchError::ExpectedConnect(_) | HolePunchError::ExpectedSync(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            HolePunchError::DeadlineReached(_) | HolePunchError::Dial(DialError::DeadlineReached(_))
        )
    }
}

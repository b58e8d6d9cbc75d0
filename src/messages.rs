//! # Hole-Punch Wire Messages
//!
//! Two message kinds travel on the hole-punch stream:
//!
//! | Kind | Wire value | Payload |
//! |------|------------|---------|
//! | `CONNECT` | 1 | the sender's candidate addresses |
//! | `SYNC` | 2 | none |
//!
//! ## Framing
//!
//! Each message is a `u32` big-endian length prefix followed by a bincode
//! record `{ kind: u32, observed_addrs: Vec<Vec<u8>> }`. Address entries are
//! multiaddr byte encodings.
//!
//! ## Security Limits
//!
//! - Frames larger than [`MAX_MESSAGE_SIZE`] are rejected before the body is read
//! - Deserialization uses bounded bincode options
//! - Unknown kinds and undecodable addresses are protocol violations

use bincode::Options;
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Stream protocol identifier negotiated for hole-punch coordination.
pub const PROTOCOL_ID: &str = "/libp2p/holepunch/1.0.0";

/// Maximum encoded frame size (4 KiB).
/// SECURITY: a CONNECT carries a handful of addresses; anything larger is abuse.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024;

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

const KIND_CONNECT: u32 = 1;
const KIND_SYNC: u32 = 2;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .with_fixint_encoding()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Transport-level failure: reset, EOF, broken pipe.
    #[error("i/o error: {0}")]
    Io(String),

    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A well-formed message of a kind the reader did not expect.
    #[error("{0} message")]
    Unexpected(MessageKind),
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::Io(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Connect,
    Sync,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Connect => "CONNECT",
            MessageKind::Sync => "SYNC",
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            MessageKind::Connect => KIND_CONNECT,
            MessageKind::Sync => KIND_SYNC,
        }
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            KIND_CONNECT => Ok(MessageKind::Connect),
            KIND_SYNC => Ok(MessageKind::Sync),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    kind: u32,
    observed_addrs: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HolePunchMessage {
    pub kind: MessageKind,
    /// Candidate addresses; always empty for SYNC.
    pub observed_addrs: Vec<Multiaddr>,
}

impl HolePunchMessage {
    pub fn connect(observed_addrs: Vec<Multiaddr>) -> Self {
        Self {
            kind: MessageKind::Connect,
            observed_addrs,
        }
    }

    pub fn sync() -> Self {
        Self {
            kind: MessageKind::Sync,
            observed_addrs: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let observed_addrs = match self.kind {
            MessageKind::Connect => self.observed_addrs.iter().map(|a| a.to_vec()).collect(),
            MessageKind::Sync => Vec::new(),
        };
        let frame = WireFrame {
            kind: self.kind.to_wire(),
            observed_addrs,
        };
        let bytes = bincode_options()
            .serialize(&frame)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let frame: WireFrame = bincode_options()
            .deserialize(bytes)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let kind = MessageKind::try_from(frame.kind)?;

        // SYNC never carries addresses; extra entries from a sloppy peer are dropped.
        let observed_addrs = match kind {
            MessageKind::Connect => frame
                .observed_addrs
                .into_iter()
                .map(|raw| {
                    Multiaddr::try_from(raw)
                        .map_err(|e| CodecError::Malformed(format!("invalid address: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?,
            MessageKind::Sync => Vec::new(),
        };

        Ok(Self {
            kind,
            observed_addrs,
        })
    }
}

/// Write one length-delimited message and flush.
pub async fn write_message<W>(writer: &mut W, message: &HolePunchMessage) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = message.encode()?;
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-delimited message.
pub async fn read_message<R>(reader: &mut R) -> Result<HolePunchMessage, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    HolePunchMessage::decode(&body)
}

/// Read one message and require it to be of `expected` kind.
pub async fn read_expected<R>(
    reader: &mut R,
    expected: MessageKind,
) -> Result<HolePunchMessage, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let message = read_message(reader).await?;
    if message.kind != expected {
        return Err(CodecError::Unexpected(message.kind));
    }
    Ok(message)
}

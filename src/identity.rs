//! # Peer Identity
//!
//! - [`Keypair`]: Ed25519 signing keypair owned by a host
//! - [`PeerId`]: 32-byte public key naming a peer on the network
//!
//! A peer id is the raw Ed25519 public key. It is self-certifying and cheap to
//! copy, which is what the attempt tracker and the peerstore key on.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.public_key_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id().to_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short hex prefix used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Whether the id is a valid Ed25519 point (and not trivially all-zero).
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypairs_yield_distinct_peer_ids() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.peer_id(), kp2.peer_id());
        assert!(kp1.peer_id().is_valid());
    }

    #[test]
    fn keypair_reconstruction_preserves_peer_id() {
        let kp = Keypair::generate();
        let secret = kp.signing_key.to_bytes();

        let restored = Keypair::from_secret_key_bytes(&secret);
        assert_eq!(restored.peer_id(), kp.peer_id());
    }

    #[test]
    fn hex_roundtrip() {
        let id = Keypair::generate().peer_id();
        let parsed = PeerId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 16);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex("zz").is_err());
    }

    #[test]
    fn all_zero_id_is_invalid() {
        assert!(!PeerId::from_bytes([0u8; 32]).is_valid());
    }
}

//! Long-lived asymmetric identity for a peer.
//!
//! Grounded on the teacher's `iroh.rs::load_or_create_secret_key`: a
//! persisted secret key, hex-encoded on disk, generated once and reused so
//! the peer ID is stable across restarts. Here the keypair is Ed25519
//! (signing identity) and the derived peer ID is a base58-encoded content
//! address of the public key, independent of the iroh transport key (which
//! iroh manages on its own for QUIC).

use std::path::Path;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{GoopError, GoopResult};

/// A peer's stable identity: a signing keypair plus the peer ID derived
/// from its public half.
pub struct Identity {
    signing_key: SigningKey,
    peer_id: PeerId,
}

/// Content-addressed peer identifier: `"goop1" + base58(sha256(pubkey))`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PeerId(pub String);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerId {
    pub fn from_public_key(vk: &VerifyingKey) -> Self {
        let digest = Sha256::digest(vk.as_bytes());
        PeerId(format!("goop1{}", bs58::encode(digest).into_string()))
    }

    /// peer_id ≤ 256 chars per spec.md §3 PresenceMessage validation.
    pub fn validate_len(s: &str) -> GoopResult<()> {
        if s.len() > 256 {
            return Err(GoopError::Validation("peer_id exceeds 256 chars".into()));
        }
        Ok(())
    }
}

impl Identity {
    /// Load the identity at `path`, creating a new keypair and persisting
    /// it if the file doesn't exist yet.
    pub fn load_or_create(path: &Path) -> GoopResult<Self> {
        let signing_key = if path.exists() {
            let hex_str = std::fs::read_to_string(path)?;
            let bytes = hex::decode(hex_str.trim())
                .map_err(|e| GoopError::Fatal(format!("invalid identity key at {}: {e}", path.display())))?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| GoopError::Fatal("identity key is not 32 bytes".into()))?;
            SigningKey::from_bytes(&arr)
        } else {
            let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, hex::encode(signing_key.to_bytes()))?;
            tracing::info!(path = %path.display(), "generated new peer identity");
            signing_key
        };
        let peer_id = PeerId::from_public_key(&signing_key.verifying_key());
        Ok(Self { signing_key, peer_id })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, msg: &[u8]) -> ed25519_dalek::Signature {
        self.signing_key.sign(msg)
    }

    pub fn verify(vk: &VerifyingKey, msg: &[u8], sig: &ed25519_dalek::Signature) -> bool {
        vk.verify(msg, sig).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let a = Identity::load_or_create(&path).unwrap();
        let b = Identity::load_or_create(&path).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn peer_id_is_stable_function_of_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let id = Identity::load_or_create(&dir.path().join("identity.key")).unwrap();
        let expected = PeerId::from_public_key(&id.verifying_key());
        assert_eq!(id.peer_id(), &expected);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let id = Identity::load_or_create(&dir.path().join("identity.key")).unwrap();
        let msg = b"hello goop";
        let sig = id.sign(msg);
        assert!(Identity::verify(&id.verifying_key(), msg, &sig));
        assert!(!Identity::verify(&id.verifying_key(), b"tampered", &sig));
    }
}

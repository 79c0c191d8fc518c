//! Peer identity and crypto: ephemeral peer ids, long-lived keys, fingerprints,
//! session keys, payload encryption and packet signatures.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::protocol::KeyExchange;

/// Length of an Ed25519 signature on the wire.
pub const SIGNATURE_SIZE: usize = 64;

const NONCE_SIZE: usize = 12;

/// Ephemeral, session-scoped peer id (8 bytes). Regenerated on every app session.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 8]);

impl PeerId {
    /// Recipient sentinel for broadcast packets.
    pub const BROADCAST: PeerId = PeerId([0xFF; 8]);

    pub fn random() -> Self {
        let mut id = [0u8; 8];
        OsRng.fill_bytes(&mut id);
        // Never hand out the sentinel as a real id.
        if id == [0xFF; 8] {
            id[0] = 0;
        }
        PeerId(id)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Parse the 16-character hex form produced by `Display`.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(PeerId(arr))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Persistent identity across sessions: hex SHA-256 of a peer's long-lived public keys.
/// Favorites and the blocked list are keyed by fingerprint, never by `PeerId`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_keys(agreement_key: &[u8; 32], signing_key: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(agreement_key);
        hasher.update(signing_key);
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Fingerprint(s)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Fingerprint(s.to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local identity: X25519 agreement key, Ed25519 signing key and this session's peer id.
/// Keep secrets private; expose only public halves, fingerprint and peer id.
pub struct Identity {
    agreement: StaticSecret,
    agreement_public: [u8; 32],
    signing: SigningKey,
    peer_id: PeerId,
}

impl Identity {
    /// Generate fresh long-lived keys and a fresh ephemeral peer id.
    pub fn generate() -> Self {
        let agreement = StaticSecret::random_from_rng(OsRng);
        let agreement_public = X25519PublicKey::from(&agreement).to_bytes();
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            agreement,
            agreement_public,
            signing,
            peer_id: PeerId::random(),
        }
    }

    /// Restore long-lived keys from [`Identity::secret_bytes`]. The peer id is always fresh.
    pub fn from_secret_bytes(bytes: &[u8; 64]) -> Self {
        let mut agreement_bytes = [0u8; 32];
        agreement_bytes.copy_from_slice(&bytes[..32]);
        let mut signing_bytes = [0u8; 32];
        signing_bytes.copy_from_slice(&bytes[32..]);
        let agreement = StaticSecret::from(agreement_bytes);
        let agreement_public = X25519PublicKey::from(&agreement).to_bytes();
        Self {
            agreement,
            agreement_public,
            signing: SigningKey::from_bytes(&signing_bytes),
            peer_id: PeerId::random(),
        }
    }

    /// Agreement secret followed by signing secret, for the key store.
    pub fn secret_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.agreement.to_bytes());
        out[32..].copy_from_slice(&self.signing.to_bytes());
        out
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn agreement_public(&self) -> &[u8; 32] {
        &self.agreement_public
    }

    pub fn verifying_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_keys(&self.agreement_public, &self.verifying_key())
    }

    /// Key-exchange payload advertising this identity's public keys.
    pub fn key_exchange(&self) -> KeyExchange {
        KeyExchange {
            agreement_key: self.agreement_public,
            signing_key: self.verifying_key(),
        }
    }

    /// Shared secret with another peer's agreement key. Used to derive the session key.
    pub fn shared_secret(&self, other_public: &[u8; 32]) -> [u8; 32] {
        let other = X25519PublicKey::from(*other_public);
        self.agreement.diffie_hellman(&other).to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

/// Derive a 32-byte session key from a shared secret.
/// Pairwise: each pair of peers has its own session key.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"hopchat-session-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Verify an Ed25519 signature against a peer's verifying key.
pub fn verify_signature(verifying_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(verifying_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_SIZE]>::try_from(signature) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    key.verify(message, &sig).is_ok()
}

/// ChaCha20-Poly1305 with a random nonce. Output: 12-byte nonce || ciphertext.
pub fn encrypt_payload(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt_payload`]. Fails on a wrong key or any tampering.
pub fn decrypt_payload(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::Decrypt);
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let nonce = chacha20poly1305::Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("key derivation failed: {0}")]
    Derivation(String),
}

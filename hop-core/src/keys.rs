//! Per-peer key material learned from key exchanges.

use std::collections::{HashMap, VecDeque};

use crate::dedup::DedupCache;
use crate::identity::{self, CryptoError, Fingerprint, Identity, PeerId};
use crate::protocol::KeyExchange;

#[derive(Clone)]
pub struct PeerKeys {
    pub session_key: [u8; 32],
    pub signing_key: [u8; 32],
    pub fingerprint: Fingerprint,
}

/// Session keys and verifying keys by ephemeral peer id. Survives link drops so private
/// messages to a briefly-offline peer can still be encrypted and cached; bounded by capacity.
pub struct KeyRing {
    peers: HashMap<PeerId, PeerKeys>,
    order: VecDeque<PeerId>,
    capacity: usize,
    /// Peers whose signature failure has already been logged.
    logged_failures: DedupCache<PeerId>,
}

impl KeyRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            logged_failures: DedupCache::new(capacity.max(1), u64::MAX),
        }
    }

    /// Record a key exchange. Returns `false` if these exact keys were already known.
    pub fn on_key_exchange(&mut self, local: &Identity, peer: PeerId, exchange: &KeyExchange) -> bool {
        let fingerprint = Fingerprint::from_keys(&exchange.agreement_key, &exchange.signing_key);
        if self.peers.get(&peer).is_some_and(|k| k.fingerprint == fingerprint) {
            return false;
        }
        let shared = local.shared_secret(&exchange.agreement_key);
        let keys = PeerKeys {
            session_key: identity::derive_session_key(&shared),
            signing_key: exchange.signing_key,
            fingerprint,
        };
        if self.peers.insert(peer, keys).is_none() {
            self.order.push_back(peer);
            while self.order.len() > self.capacity {
                if let Some(old) = self.order.pop_front() {
                    self.peers.remove(&old);
                }
            }
        }
        true
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerKeys> {
        self.peers.get(peer)
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn fingerprint(&self, peer: &PeerId) -> Option<&Fingerprint> {
        self.peers.get(peer).map(|k| &k.fingerprint)
    }

    pub fn peers_with_sessions(&self) -> Vec<PeerId> {
        self.order.iter().copied().collect()
    }

    pub fn encrypt_for(&self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let keys = self.peers.get(peer).ok_or(CryptoError::Key)?;
        identity::encrypt_payload(&keys.session_key, plaintext)
    }

    pub fn decrypt_from(&self, peer: &PeerId, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let keys = self.peers.get(peer).ok_or(CryptoError::Key)?;
        identity::decrypt_payload(&keys.session_key, ciphertext)
    }

    /// `Some(valid)` when the sender's verifying key is known, `None` otherwise.
    pub fn verify(&self, peer: &PeerId, message: &[u8], signature: &[u8]) -> Option<bool> {
        self.peers
            .get(peer)
            .map(|k| identity::verify_signature(&k.signing_key, message, signature))
    }

    /// Returns `true` the first time a signature failure is reported for `peer`.
    pub fn note_signature_failure(&mut self, peer: PeerId) -> bool {
        self.logged_failures.check_and_insert(peer, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_same_session() {
        let a = Identity::generate();
        let b = Identity::generate();
        let mut ring_a = KeyRing::new(8);
        let mut ring_b = KeyRing::new(8);
        assert!(ring_a.on_key_exchange(&a, b.peer_id(), &b.key_exchange()));
        assert!(!ring_a.on_key_exchange(&a, b.peer_id(), &b.key_exchange()));
        ring_b.on_key_exchange(&b, a.peer_id(), &a.key_exchange());

        let ct = ring_a.encrypt_for(&b.peer_id(), b"psst").unwrap();
        assert_eq!(ring_b.decrypt_from(&a.peer_id(), &ct).unwrap(), b"psst");
        assert_eq!(ring_a.fingerprint(&b.peer_id()), Some(&b.fingerprint()));
    }

    #[test]
    fn verify_unknown_peer_is_none() {
        let a = Identity::generate();
        let ring = KeyRing::new(8);
        let sig = a.sign(b"x");
        assert_eq!(ring.verify(&a.peer_id(), b"x", &sig), None);
    }

    #[test]
    fn capacity_evicts_oldest_peer() {
        let local = Identity::generate();
        let mut ring = KeyRing::new(2);
        let peers: Vec<Identity> = (0..3).map(|_| Identity::generate()).collect();
        for p in &peers {
            ring.on_key_exchange(&local, p.peer_id(), &p.key_exchange());
        }
        assert!(!ring.has_session(&peers[0].peer_id()));
        assert!(ring.has_session(&peers[2].peer_id()));
    }

    #[test]
    fn signature_failure_logged_once() {
        let mut ring = KeyRing::new(2);
        let peer = PeerId::random();
        assert!(ring.note_signature_failure(peer));
        assert!(!ring.note_signature_failure(peer));
    }
}

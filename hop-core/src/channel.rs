//! Channels: password-derived symmetric keys, publishable key commitments, and the local
//! channel table (creator, protection, retention).

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::identity::{self, CryptoError, PeerId};
use crate::protocol::{ChannelAnnounce, ChannelRetention};

/// Argon2id cost parameters for channel keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ChannelKdf {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for ChannelKdf {
    fn default() -> Self {
        Self {
            memory_kib: 4096,
            iterations: 3,
        }
    }
}

/// Deterministic per-channel salt, so every member derives the same key from the same password.
fn channel_salt(channel: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(b"hopchat-channel");
    hasher.update(channel.as_bytes());
    let digest = hasher.finalize();
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&digest[..16]);
    salt
}

/// Derive the channel key from a password with Argon2id.
pub fn derive_channel_key(
    channel: &str,
    password: &str,
    kdf: ChannelKdf,
) -> Result<[u8; 32], CryptoError> {
    let params = argon2::Params::new(kdf.memory_kib, kdf.iterations, 1, Some(32))
        .map_err(|e| CryptoError::Derivation(e.to_string()))?;
    let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut key = [0u8; 32];
    argon
        .hash_password_into(password.as_bytes(), &channel_salt(channel), &mut key)
        .map_err(|e| CryptoError::Derivation(e.to_string()))?;
    Ok(key)
}

/// Channels tracked when no capacity is given.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One-way commitment to a channel key, safe to broadcast.
pub fn key_commitment(key: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(key))
}

#[derive(Clone, Default)]
pub struct Channel {
    pub name: String,
    pub joined: bool,
    pub password: Option<String>,
    key: Option<[u8; 32]>,
    pub creator: Option<PeerId>,
    pub key_commitment: Option<String>,
    pub is_protected: bool,
    pub retention_enabled: bool,
}

impl Channel {
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }
}

// Password and key never reach logs.
impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("joined", &self.joined)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("creator", &self.creator)
            .field("key_commitment", &self.key_commitment)
            .field("is_protected", &self.is_protected)
            .field("retention_enabled", &self.retention_enabled)
            .finish()
    }
}

/// Outcome of entering a password for a protected channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unlock {
    /// Key matches the published commitment (or none was published); key stored.
    Accepted,
    /// Derived key does not match the published commitment; nothing stored.
    WrongPassword,
}

/// Local channel table. Announcements for channels we never joined create entries too, so the
/// table is capped: past `capacity`, the oldest channel we have not joined is forgotten.
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
    order: VecDeque<String>,
    capacity: usize,
    kdf: ChannelKdf,
}

impl ChannelRegistry {
    pub fn new(kdf: ChannelKdf) -> Self {
        Self::with_capacity(kdf, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(kdf: ChannelKdf, capacity: usize) -> Self {
        Self {
            channels: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            kdf,
        }
    }

    fn entry(&mut self, name: &str) -> &mut Channel {
        if !self.channels.contains_key(name) {
            self.make_room();
            self.order.push_back(name.to_string());
        }
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Channel {
                name: name.to_string(),
                ..Channel::default()
            })
    }

    fn make_room(&mut self) {
        while self.channels.len() >= self.capacity {
            let Some(pos) = self
                .order
                .iter()
                .position(|n| self.channels.get(n).map_or(true, |c| !c.joined))
            else {
                return;
            };
            if let Some(name) = self.order.remove(pos) {
                tracing::debug!(channel = %name, "channel table full, oldest unjoined channel forgotten");
                self.channels.remove(&name);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn join(&mut self, name: &str) {
        self.entry(name).joined = true;
    }

    pub fn is_joined(&self, name: &str) -> bool {
        self.channels.get(name).is_some_and(|c| c.joined)
    }

    pub fn joined_channels(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .channels
            .values()
            .filter(|c| c.joined)
            .map(|c| c.name.clone())
            .collect();
        out.sort();
        out
    }

    /// Forget a channel entirely, including its key.
    pub fn leave(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.channels.remove(name).is_some()
    }

    /// Protect `name` with `password` as its creator. Returns the announcement to broadcast.
    pub fn set_password(
        &mut self,
        name: &str,
        password: &str,
        creator: PeerId,
    ) -> Result<ChannelAnnounce, CryptoError> {
        let key = derive_channel_key(name, password, self.kdf)?;
        let commitment = key_commitment(&key);
        let channel = self.entry(name);
        channel.joined = true;
        channel.password = Some(password.to_string());
        channel.key = Some(key);
        channel.creator = Some(creator);
        channel.key_commitment = Some(commitment.clone());
        channel.is_protected = true;
        Ok(ChannelAnnounce {
            channel: name.to_string(),
            is_protected: true,
            creator_id: Some(creator),
            key_commitment: Some(commitment),
        })
    }

    /// Drop protection as creator. Returns the announcement to broadcast.
    pub fn remove_password(&mut self, name: &str, creator: PeerId) -> ChannelAnnounce {
        let channel = self.entry(name);
        channel.password = None;
        channel.key = None;
        channel.key_commitment = None;
        channel.is_protected = false;
        channel.creator = Some(creator);
        ChannelAnnounce {
            channel: name.to_string(),
            is_protected: false,
            creator_id: Some(creator),
            key_commitment: None,
        }
    }

    /// Enter a password for a channel. Checked against the published commitment if one is known.
    pub fn unlock(&mut self, name: &str, password: &str) -> Result<Unlock, CryptoError> {
        let key = derive_channel_key(name, password, self.kdf)?;
        let commitment = key_commitment(&key);
        let channel = self.entry(name);
        if let Some(expected) = &channel.key_commitment {
            if *expected != commitment {
                return Ok(Unlock::WrongPassword);
            }
        }
        channel.joined = true;
        channel.password = Some(password.to_string());
        channel.key = Some(key);
        channel.is_protected = true;
        Ok(Unlock::Accepted)
    }

    /// Apply a received announcement. A changed commitment invalidates a stale local key.
    pub fn on_announce(&mut self, announce: &ChannelAnnounce) {
        let channel = self.entry(&announce.channel);
        channel.is_protected = announce.is_protected;
        if announce.creator_id.is_some() {
            channel.creator = announce.creator_id;
        }
        channel.key_commitment = announce.key_commitment.clone();
        let stale = match (&channel.key, &announce.key_commitment) {
            (Some(key), Some(expected)) => key_commitment(key) != *expected,
            (Some(_), None) => !announce.is_protected,
            _ => false,
        };
        if stale {
            channel.key = None;
            channel.password = None;
        }
    }

    pub fn set_retention(&mut self, name: &str, enabled: bool, creator: PeerId) -> ChannelRetention {
        let channel = self.entry(name);
        channel.retention_enabled = enabled;
        channel.creator.get_or_insert(creator);
        ChannelRetention {
            channel: name.to_string(),
            enabled,
            creator_id: Some(creator),
        }
    }

    pub fn on_retention(&mut self, retention: &ChannelRetention) {
        let channel = self.entry(&retention.channel);
        channel.retention_enabled = retention.enabled;
        if retention.creator_id.is_some() {
            channel.creator = retention.creator_id;
        }
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.channels.get(name).is_some_and(|c| c.is_protected)
    }

    pub fn encrypt(&self, name: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .channels
            .get(name)
            .and_then(|c| c.key)
            .ok_or(CryptoError::Key)?;
        identity::encrypt_payload(&key, plaintext)
    }

    pub fn decrypt(&self, name: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .channels
            .get(name)
            .and_then(|c| c.key)
            .ok_or(CryptoError::Key)?;
        identity::decrypt_payload(&key, ciphertext)
    }
}

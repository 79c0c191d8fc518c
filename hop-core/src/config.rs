//! Engine tunables. Every field has a default, so a partial TOML table is enough.

use serde::Deserialize;

use crate::channel::ChannelKdf;
use crate::protocol::MAX_TTL;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    /// Largest frame the transport accepts; bigger packets are fragmented.
    pub max_frame_len: usize,
    pub max_ttl: u8,
    pub relay_jitter_min_ms: u64,
    pub relay_jitter_max_ms: u64,
    /// Silence after which a peer is dropped from the active set.
    pub peer_stale_after_ms: u64,
    pub fragment_timeout_ms: u64,
    pub max_reassembly_sessions: usize,
    /// Bytes held across all unfinished fragment transfers.
    pub max_reassembly_bytes: usize,
    /// Peers tracked at once; the least recently heard is forgotten first.
    pub max_peers: usize,
    /// Channels tracked at once. Joined channels are never forgotten.
    pub max_channels: usize,
    pub seen_cache_capacity: usize,
    pub seen_cache_horizon_ms: u64,
    pub sent_cache_capacity: usize,
    pub sent_cache_horizon_ms: u64,
    pub regular_cache_capacity: usize,
    pub favorite_cache_capacity: usize,
    pub regular_cache_horizon_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_delivery_retries: u32,
    pub cover_traffic: bool,
    pub cover_traffic_interval_ms: u64,
    pub kdf_memory_kib: u32,
    pub kdf_iterations: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 512,
            max_ttl: MAX_TTL,
            relay_jitter_min_ms: 10,
            relay_jitter_max_ms: 100,
            peer_stale_after_ms: 180_000,
            fragment_timeout_ms: 30_000,
            max_reassembly_sessions: 128,
            max_reassembly_bytes: 1 << 20,
            max_peers: 512,
            max_channels: 256,
            seen_cache_capacity: 1000,
            seen_cache_horizon_ms: 600_000,
            sent_cache_capacity: 100,
            sent_cache_horizon_ms: 5_000,
            regular_cache_capacity: 100,
            favorite_cache_capacity: 1000,
            regular_cache_horizon_ms: 12 * 60 * 60 * 1000,
            ack_timeout_ms: 30_000,
            max_delivery_retries: 3,
            cover_traffic: false,
            cover_traffic_interval_ms: 30_000,
            kdf_memory_kib: 4096,
            kdf_iterations: 3,
        }
    }
}

impl MeshConfig {
    pub fn kdf(&self) -> ChannelKdf {
        ChannelKdf {
            memory_kib: self.kdf_memory_kib,
            iterations: self.kdf_iterations,
        }
    }

    /// Hop budget actually used: never above the protocol maximum.
    pub fn effective_ttl(&self) -> u8 {
        self.max_ttl.min(MAX_TTL)
    }
}

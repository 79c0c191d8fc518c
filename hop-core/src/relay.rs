//! Flood router: dedup, local-delivery decision, ttl-bounded relay and send jitter.
//! Loop prevention is the seen cache alone; no path is tracked.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dedup::{SeenCache, SentCache};
use crate::identity::PeerId;
use crate::protocol::{MessageId, Packet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Our own packet echoed back by a neighbour.
    Own,
    /// Message id already seen.
    Duplicate,
    /// First sighting.
    Accept {
        deliver: bool,
        /// Next-hop copy with ttl decremented, if the packet should be forwarded.
        relay: Option<Packet>,
    },
}

pub struct Router {
    local: PeerId,
    seen: SeenCache,
    sent: SentCache,
    jitter_min_ms: u64,
    jitter_max_ms: u64,
    rng: StdRng,
}

impl Router {
    pub fn new(
        local: PeerId,
        seen: SeenCache,
        sent: SentCache,
        jitter_min_ms: u64,
        jitter_max_ms: u64,
        seed: Option<u64>,
    ) -> Self {
        Self {
            local,
            seen,
            sent,
            jitter_min_ms: jitter_min_ms.min(jitter_max_ms),
            jitter_max_ms,
            rng: seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Decide what to do with an inbound packet. The dedup check and insert are one step.
    pub fn route(&mut self, packet: &Packet, now_ms: u64) -> Route {
        if packet.sender_id == self.local {
            return Route::Own;
        }
        if !self.seen.check_and_insert(packet.message_id(), now_ms) {
            return Route::Duplicate;
        }
        let for_us = packet.is_addressed_to(self.local);
        let deliver = for_us || packet.is_broadcast();
        let relay = if for_us { None } else { packet.relayed() };
        Route::Accept { deliver, relay }
    }

    /// Record an id we originated so echoes are not treated as new.
    pub fn mark_seen(&mut self, id: MessageId, now_ms: u64) {
        self.seen.check_and_insert(id, now_ms);
    }

    /// `false` if the same frame went to the same target within the send-cache window.
    pub fn admit_send(&mut self, id: MessageId, target: Option<PeerId>, now_ms: u64) -> bool {
        self.sent.check_and_insert((id, target), now_ms)
    }

    /// Random relay delay in milliseconds.
    pub fn jitter_ms(&mut self) -> u64 {
        if self.jitter_max_ms == 0 {
            return 0;
        }
        self.rng.gen_range(self.jitter_min_ms..=self.jitter_max_ms)
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn evict(&mut self, now_ms: u64) {
        self.seen.evict(now_ms);
        self.sent.evict(now_ms);
    }
}

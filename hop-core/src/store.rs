//! Store-and-forward cache: packets held for peers that are not reachable right now,
//! replayed once per peer session when they (re)connect or (re)announce.
//!
//! Two tiers. The favorite tier is capped by count only. The regular tier is capped by
//! count and also drops anything older than its horizon.

use std::collections::{HashSet, VecDeque};

use crate::identity::{Fingerprint, PeerId};
use crate::protocol::{MessageId, Packet};

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub packet: Packet,
    /// When the entry was stored (ms).
    pub timestamp: u64,
    pub message_id: MessageId,
    pub is_for_favorite: bool,
    /// `None` for broadcasts.
    pub recipient: Option<PeerId>,
    pub recipient_fingerprint: Option<Fingerprint>,
    /// Id of the chat message inside, when this node originated it.
    pub message_ref: Option<String>,
    /// Peer sessions this entry was already replayed to.
    replayed_to: HashSet<PeerId>,
}

impl StoredMessage {
    fn destined_for(&self, peer: PeerId, fingerprint: Option<&Fingerprint>) -> bool {
        match self.recipient {
            None => self.packet.sender_id != peer,
            Some(recipient) => {
                recipient == peer
                    || (fingerprint.is_some() && self.recipient_fingerprint.as_ref() == fingerprint)
            }
        }
    }
}

pub struct StoreForward {
    favorites: VecDeque<StoredMessage>,
    regular: VecDeque<StoredMessage>,
    ids: HashSet<MessageId>,
    favorite_capacity: usize,
    regular_capacity: usize,
    regular_horizon_ms: u64,
}

impl StoreForward {
    pub fn new(favorite_capacity: usize, regular_capacity: usize, regular_horizon_ms: u64) -> Self {
        Self {
            favorites: VecDeque::new(),
            regular: VecDeque::new(),
            ids: HashSet::new(),
            favorite_capacity: favorite_capacity.max(1),
            regular_capacity: regular_capacity.max(1),
            regular_horizon_ms,
        }
    }

    /// Retain `packet` for `recipient` (`None` = broadcast). A full tier drops its oldest entry.
    /// Returns `false` if the same message is already stored.
    pub fn store(
        &mut self,
        packet: Packet,
        recipient: Option<PeerId>,
        recipient_fingerprint: Option<Fingerprint>,
        is_for_favorite: bool,
        message_ref: Option<String>,
        now_ms: u64,
    ) -> bool {
        let message_id = packet.message_id();
        if !self.ids.insert(message_id) {
            return false;
        }
        let entry = StoredMessage {
            packet,
            timestamp: now_ms,
            message_id,
            is_for_favorite,
            recipient,
            recipient_fingerprint,
            message_ref,
            replayed_to: HashSet::new(),
        };
        let (tier, capacity) = if is_for_favorite {
            (&mut self.favorites, self.favorite_capacity)
        } else {
            (&mut self.regular, self.regular_capacity)
        };
        while tier.len() >= capacity {
            if let Some(old) = tier.pop_front() {
                self.ids.remove(&old.message_id);
            }
        }
        tier.push_back(entry);
        true
    }

    /// Drop regular-tier entries past the horizon. Returns how many were dropped.
    pub fn evict_expired(&mut self, now_ms: u64) -> usize {
        let mut dropped = 0;
        while let Some(front) = self.regular.front() {
            if now_ms.saturating_sub(front.timestamp) < self.regular_horizon_ms {
                break;
            }
            if let Some(old) = self.regular.pop_front() {
                self.ids.remove(&old.message_id);
                dropped += 1;
            }
        }
        dropped
    }

    /// Entries for `peer` not yet replayed to this peer session, oldest first. Each is
    /// marked as replayed; addressed entries are removed once handed out.
    pub fn replay_for(
        &mut self,
        peer: PeerId,
        fingerprint: Option<&Fingerprint>,
        now_ms: u64,
    ) -> Vec<StoredMessage> {
        self.evict_expired(now_ms);
        let mut out = Vec::new();
        for tier in [&mut self.favorites, &mut self.regular] {
            for entry in tier.iter_mut() {
                if entry.destined_for(peer, fingerprint) && entry.replayed_to.insert(peer) {
                    out.push(entry.clone());
                }
            }
            tier.retain(|e| e.recipient.is_none() || !e.replayed_to.contains(&peer));
        }
        let ids = &mut self.ids;
        for entry in &out {
            if entry.recipient.is_some() {
                ids.remove(&entry.message_id);
            }
        }
        out
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.ids.contains(message_id)
    }

    pub fn favorite_len(&self) -> usize {
        self.favorites.len()
    }

    pub fn regular_len(&self) -> usize {
        self.regular.len()
    }

    pub fn len(&self) -> usize {
        self.favorites.len() + self.regular.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

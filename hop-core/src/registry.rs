//! Peer registry: session-scoped peer records keyed by ephemeral id, and a separate
//! fingerprint-keyed table for favorites and blocking. The two are linked by lookup only.
//!
//! The session table holds at most `capacity` peers. When a new peer would exceed it, the
//! least recently heard peer without a direct link is forgotten.

use std::collections::{HashMap, HashSet};

use crate::identity::{Fingerprint, PeerId};

/// Session-scoped state for one ephemeral peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub nickname: Option<String>,
    pub rssi: Option<i16>,
    pub last_seen_ms: u64,
    /// Heard from recently (announce or traffic).
    pub active: bool,
    /// Has a direct transport link to us.
    pub connected: bool,
}

pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerRecord>,
    fingerprints: HashMap<PeerId, Fingerprint>,
    favorites: HashSet<Fingerprint>,
    blocked: HashSet<Fingerprint>,
    stale_after_ms: u64,
    capacity: usize,
}

impl PeerRegistry {
    pub fn new(stale_after_ms: u64, capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            fingerprints: HashMap::new(),
            favorites: HashSet::new(),
            blocked: HashSet::new(),
            stale_after_ms,
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, peer: PeerId, now_ms: u64) -> &mut PeerRecord {
        if !self.peers.contains_key(&peer) && self.peers.len() >= self.capacity {
            self.forget_least_recent();
        }
        self.peers.entry(peer).or_insert_with(|| PeerRecord {
            nickname: None,
            rssi: None,
            last_seen_ms: now_ms,
            active: false,
            connected: false,
        })
    }

    /// Any traffic from `peer`: refresh last-seen. Returns `true` if the peer became active.
    pub fn touch(&mut self, peer: PeerId, now_ms: u64) -> bool {
        let rec = self.record(peer, now_ms);
        rec.last_seen_ms = now_ms;
        let became_active = !rec.active;
        rec.active = true;
        became_active
    }

    /// Announce from `peer`. Returns `true` the first time the peer is announced this session.
    pub fn on_announce(&mut self, peer: PeerId, nickname: String, now_ms: u64) -> bool {
        let rec = self.record(peer, now_ms);
        let first = rec.nickname.is_none();
        rec.nickname = Some(nickname);
        rec.last_seen_ms = now_ms;
        rec.active = true;
        first
    }

    pub fn set_connected(&mut self, peer: PeerId, connected: bool, now_ms: u64) {
        let rec = self.record(peer, now_ms);
        rec.connected = connected;
        if connected {
            rec.active = true;
            rec.last_seen_ms = now_ms;
        }
    }

    /// Signal strength for a known peer. Readings for unknown ids are ignored.
    pub fn update_rssi(&mut self, peer: PeerId, rssi: i16) {
        if let Some(rec) = self.peers.get_mut(&peer) {
            rec.rssi = Some(rssi);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    pub fn nickname(&self, peer: &PeerId) -> Option<&str> {
        self.peers.get(peer).and_then(|r| r.nickname.as_deref())
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|r| r.connected)
    }

    pub fn is_active(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|r| r.active)
    }

    /// Active peers, sorted for stable presentation.
    pub fn active_peers(&self) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, r)| r.active)
            .map(|(p, _)| *p)
            .collect();
        out.sort();
        out
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, r)| r.connected)
            .map(|(p, _)| *p)
            .collect();
        out.sort();
        out
    }

    /// Remove peers silent for longer than the inactivity window. Returns the removed ids
    /// that were active, with their last known nickname.
    pub fn evict_stale(&mut self, now_ms: u64) -> Vec<(PeerId, Option<String>)> {
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.last_seen_ms) > self.stale_after_ms)
            .map(|(p, _)| *p)
            .collect();
        let mut departed = Vec::new();
        for peer in stale {
            let nickname = self.peers.get(&peer).and_then(|r| r.nickname.clone());
            if self.remove(peer) {
                departed.push((peer, nickname));
            }
        }
        departed
    }

    fn forget_least_recent(&mut self) {
        let oldest = self
            .peers
            .iter()
            .filter(|(_, r)| !r.connected)
            .min_by_key(|(_, r)| r.last_seen_ms)
            .map(|(p, _)| *p);
        if let Some(peer) = oldest {
            tracing::debug!(%peer, "peer table full, least recent peer forgotten");
            self.remove(peer);
        }
    }

    /// Clear session-scoped state for `peer`. Favorites and blocked fingerprints are untouched.
    /// Returns `true` if the peer was active.
    pub fn remove(&mut self, peer: PeerId) -> bool {
        let was_active = self.peers.remove(&peer).is_some_and(|r| r.active);
        self.fingerprints.remove(&peer);
        was_active
    }

    /// Tie a known peer to its identity. Ignored for ids with no session record.
    pub fn link_fingerprint(&mut self, peer: PeerId, fingerprint: Fingerprint) {
        if self.peers.contains_key(&peer) {
            self.fingerprints.insert(peer, fingerprint);
        }
    }

    pub fn fingerprint(&self, peer: &PeerId) -> Option<&Fingerprint> {
        self.fingerprints.get(peer)
    }

    /// Current ephemeral id for a fingerprint, if that identity is present this session.
    pub fn peer_for_fingerprint(&self, fingerprint: &Fingerprint) -> Option<PeerId> {
        self.fingerprints
            .iter()
            .find(|(_, f)| *f == fingerprint)
            .map(|(p, _)| *p)
    }

    pub fn set_favorite(&mut self, fingerprint: Fingerprint, favorite: bool) {
        if favorite {
            self.favorites.insert(fingerprint);
        } else {
            self.favorites.remove(&fingerprint);
        }
    }

    pub fn is_favorite_fingerprint(&self, fingerprint: &Fingerprint) -> bool {
        self.favorites.contains(fingerprint)
    }

    pub fn is_favorite(&self, peer: &PeerId) -> bool {
        self.fingerprint(peer)
            .is_some_and(|f| self.favorites.contains(f))
    }

    pub fn set_blocked(&mut self, fingerprint: Fingerprint, blocked: bool) {
        if blocked {
            self.blocked.insert(fingerprint);
        } else {
            self.blocked.remove(&fingerprint);
        }
    }

    pub fn is_blocked(&self, peer: &PeerId) -> bool {
        self.fingerprint(peer).is_some_and(|f| self.blocked.contains(f))
    }

    pub fn is_blocked_fingerprint(&self, fingerprint: &Fingerprint) -> bool {
        self.blocked.contains(fingerprint)
    }

    pub fn favorites(&self) -> impl Iterator<Item = &Fingerprint> {
        self.favorites.iter()
    }

    pub fn blocked(&self) -> impl Iterator<Item = &Fingerprint> {
        self.blocked.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_marks_active_once() {
        let mut reg = PeerRegistry::new(1_000, 64);
        let peer = PeerId::random();
        assert!(reg.on_announce(peer, "bob".into(), 0));
        assert!(!reg.on_announce(peer, "bobby".into(), 10));
        assert_eq!(reg.nickname(&peer), Some("bobby"));
        assert_eq!(reg.active_peers(), vec![peer]);
    }

    #[test]
    fn stale_peer_removed_after_window() {
        let mut reg = PeerRegistry::new(1_000, 64);
        let peer = PeerId::random();
        reg.touch(peer, 0);
        reg.update_rssi(peer, -60);
        assert_eq!(reg.get(&peer).and_then(|r| r.rssi), Some(-60));
        assert!(reg.evict_stale(1_000).is_empty());
        reg.touch(peer, 500);
        assert!(reg.evict_stale(1_400).is_empty());
        assert_eq!(reg.evict_stale(1_501), vec![(peer, None)]);
        assert!(reg.get(&peer).is_none());
    }

    #[test]
    fn removal_keeps_persistent_records() {
        let mut reg = PeerRegistry::new(1_000, 64);
        let peer = PeerId::random();
        let fp = Fingerprint::from("abc");
        reg.touch(peer, 0);
        reg.link_fingerprint(peer, fp.clone());
        reg.set_favorite(fp.clone(), true);
        reg.set_blocked(fp.clone(), true);
        assert!(reg.is_favorite(&peer));
        assert!(reg.is_blocked(&peer));

        assert!(reg.remove(peer));
        assert!(reg.fingerprint(&peer).is_none());
        assert!(reg.is_favorite_fingerprint(&fp));

        // Same identity returns under a new ephemeral id.
        let new_id = PeerId::random();
        reg.touch(new_id, 10);
        reg.link_fingerprint(new_id, fp.clone());
        assert!(reg.is_favorite(&new_id));
        assert!(reg.is_blocked(&new_id));
        assert_eq!(reg.peer_for_fingerprint(&fp), Some(new_id));
    }

    #[test]
    fn connected_is_tracked_separately() {
        let mut reg = PeerRegistry::new(1_000, 64);
        let direct = PeerId::random();
        let remote = PeerId::random();
        reg.set_connected(direct, true, 0);
        reg.touch(remote, 0);
        assert_eq!(reg.connected_peers(), vec![direct]);
        assert!(reg.is_active(&remote));
        reg.set_connected(direct, false, 1);
        assert!(!reg.is_connected(&direct));
    }

    #[test]
    fn full_table_forgets_least_recent_unlinked_peer() {
        let mut reg = PeerRegistry::new(60_000, 3);
        let direct = PeerId::random();
        reg.set_connected(direct, true, 0);
        let quiet = PeerId::random();
        reg.touch(quiet, 1);
        reg.link_fingerprint(quiet, Fingerprint::from("quiet"));
        let recent = PeerId::random();
        reg.touch(recent, 2);

        let newcomer = PeerId::random();
        reg.touch(newcomer, 3);
        assert_eq!(reg.len(), 3);
        assert!(reg.get(&quiet).is_none());
        assert!(reg.fingerprint(&quiet).is_none());
        assert!(reg.is_connected(&direct));
        assert!(reg.is_active(&recent));

        for t in 4..500 {
            reg.touch(PeerId::random(), t);
        }
        assert_eq!(reg.len(), 3);
        assert!(reg.is_connected(&direct));
    }

    #[test]
    fn unknown_ids_leave_no_records() {
        let mut reg = PeerRegistry::new(1_000, 64);
        let stranger = PeerId::random();
        reg.update_rssi(stranger, -70);
        reg.link_fingerprint(stranger, Fingerprint::from("x"));
        assert!(reg.is_empty());
        assert!(reg.fingerprint(&stranger).is_none());
    }
}

//! Fragmentation: split an oversized frame into frame-sized fragment packets and
//! reassemble them, with bounded buffers that expire when a transfer is abandoned.

use std::collections::HashMap;

use rand::RngCore;

use crate::dedup::DedupCache;
use crate::identity::PeerId;
use crate::protocol::{MessageType, Packet};
use crate::wire::{self, FrameEncodeError};

/// `session_id 8 | index u16 | total u16 | original_type u8`
pub const FRAGMENT_HEADER_SIZE: usize = 13;

/// Upper bound on fragments per transfer; anything larger is refused on both ends.
pub const MAX_FRAGMENTS: u16 = 1024;

/// Completed sessions remembered so late duplicates are ignored.
const COMPLETED_MEMORY: usize = 256;

/// Fragment-session id, unique per sender.
pub type SessionId = [u8; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub session_id: SessionId,
    pub index: u16,
    pub total: u16,
    pub original_type: MessageType,
}

impl FragmentHeader {
    pub fn encode(&self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
        out.extend_from_slice(&self.session_id);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.push(self.original_type.as_u8());
        out.extend_from_slice(chunk);
        out
    }

    /// Parse a fragment payload into header and chunk.
    pub fn decode(payload: &[u8]) -> Result<(FragmentHeader, &[u8]), FragmentError> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(FragmentError::Malformed);
        }
        let mut session_id = [0u8; 8];
        session_id.copy_from_slice(&payload[..8]);
        let index = u16::from_be_bytes([payload[8], payload[9]]);
        let total = u16::from_be_bytes([payload[10], payload[11]]);
        let original_type = MessageType::from_u8(payload[12]).ok_or(FragmentError::Malformed)?;
        if total == 0 || total > MAX_FRAGMENTS || index >= total {
            return Err(FragmentError::Malformed);
        }
        Ok((
            FragmentHeader {
                session_id,
                index,
                total,
                original_type,
            },
            &payload[FRAGMENT_HEADER_SIZE..],
        ))
    }
}

/// Fragment packet type by position: first, middle, last.
fn fragment_type(index: u16, total: u16) -> MessageType {
    if index == 0 {
        MessageType::FragmentStart
    } else if index + 1 == total {
        MessageType::FragmentEnd
    } else {
        MessageType::FragmentContinue
    }
}

/// Split `packet` into fragment packets if its encoded frame exceeds `max_frame_len`.
/// Returns the packet itself when it already fits. The fragmented bytes are the whole encoded
/// frame, so the reassembled packet keeps its signature.
pub fn split_packet(packet: &Packet, max_frame_len: usize) -> Result<Vec<Packet>, FragmentError> {
    let encoded = wire::encode_packet(packet)?;
    if encoded.len() <= max_frame_len {
        return Ok(vec![packet.clone()]);
    }
    // Fragments are unsigned and carry the recipient, if any.
    let overhead = wire::HEADER_SIZE + 16 + FRAGMENT_HEADER_SIZE;
    let chunk_size = max_frame_len.saturating_sub(overhead);
    if chunk_size == 0 {
        return Err(FragmentError::FrameBudget(max_frame_len));
    }
    let total = encoded.len().div_ceil(chunk_size);
    let total = u16::try_from(total)
        .ok()
        .filter(|t| *t <= MAX_FRAGMENTS)
        .ok_or(FragmentError::TooManyFragments(total))?;
    let mut session_id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut session_id);

    let fragments = encoded
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, chunk)| {
            let header = FragmentHeader {
                session_id,
                index: i as u16,
                total,
                original_type: packet.message_type,
            };
            Packet::new(
                fragment_type(i as u16, total),
                packet.sender_id,
                packet.recipient_id,
                packet.timestamp,
                header.encode(chunk),
                packet.ttl,
            )
        })
        .collect();
    Ok(fragments)
}

struct ReassemblyBuffer {
    total: u16,
    original_type: MessageType,
    chunks: HashMap<u16, Vec<u8>>,
    bytes: usize,
    last_activity_ms: u64,
}

impl ReassemblyBuffer {
    fn is_complete(&self) -> bool {
        self.chunks.len() == self.total as usize
    }

    fn reassemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for i in 0..self.total {
            if let Some(chunk) = self.chunks.get(&i) {
                out.extend_from_slice(chunk);
            }
        }
        out
    }
}

/// Result of feeding one fragment.
#[derive(Debug, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// All fragments arrived. The packet carries the ttl of the fragment that completed it,
    /// since hops are counted on fragments.
    Complete(Packet),
    /// Buffered; waiting for more.
    Pending,
    /// Duplicate of a finished session, or dropped for exceeding limits.
    Ignored,
}

/// Reassembly buffers keyed by `(sender, session_id)`. Buffers are discarded on completion,
/// after `timeout_ms` of inactivity, or when the sender disconnects.
///
/// Memory is bounded three ways: at most `max_sessions` buffers, no chunk longer than
/// `max_chunk_len` (so a session holds at most `total * max_chunk_len` bytes), and
/// `max_buffered_bytes` across all sessions, past which the least recently active session
/// is dropped.
pub struct Reassembler {
    sessions: HashMap<(PeerId, SessionId), ReassemblyBuffer>,
    completed: DedupCache<(PeerId, SessionId)>,
    timeout_ms: u64,
    max_sessions: usize,
    max_chunk_len: usize,
    max_buffered_bytes: usize,
    buffered: usize,
}

impl Reassembler {
    pub fn new(
        timeout_ms: u64,
        max_sessions: usize,
        max_chunk_len: usize,
        max_buffered_bytes: usize,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            completed: DedupCache::new(COMPLETED_MEMORY, timeout_ms.saturating_mul(4)),
            timeout_ms,
            max_sessions: max_sessions.max(1),
            max_chunk_len,
            max_buffered_bytes,
            buffered: 0,
        }
    }

    /// Feed one fragment packet. A completed payload that fails to decode as a packet is
    /// dropped, never surfaced.
    pub fn accept(&mut self, fragment: &Packet, now_ms: u64) -> FragmentOutcome {
        let Ok((header, chunk)) = FragmentHeader::decode(&fragment.payload) else {
            tracing::trace!(sender = %fragment.sender_id, "malformed fragment dropped");
            return FragmentOutcome::Ignored;
        };
        if chunk.len() > self.max_chunk_len {
            tracing::debug!(
                sender = %fragment.sender_id,
                len = chunk.len(),
                "oversized fragment dropped"
            );
            return FragmentOutcome::Ignored;
        }
        let key = (fragment.sender_id, header.session_id);
        if self.completed.contains(&key) {
            return FragmentOutcome::Ignored;
        }
        if !self.sessions.contains_key(&key) && self.sessions.len() >= self.max_sessions {
            self.evict_oldest(None);
        }
        let buffer = self.sessions.entry(key).or_insert_with(|| ReassemblyBuffer {
            total: header.total,
            original_type: header.original_type,
            chunks: HashMap::new(),
            bytes: 0,
            last_activity_ms: now_ms,
        });
        if buffer.total != header.total || buffer.original_type != header.original_type {
            tracing::debug!(sender = %fragment.sender_id, "inconsistent fragment session discarded");
            self.remove(&key);
            return FragmentOutcome::Ignored;
        }
        buffer.last_activity_ms = now_ms;
        if buffer.chunks.contains_key(&header.index) {
            return FragmentOutcome::Pending;
        }
        buffer.chunks.insert(header.index, chunk.to_vec());
        buffer.bytes += chunk.len();
        self.buffered += chunk.len();
        if !buffer.is_complete() {
            return self.enforce_budget(key);
        }
        let bytes = buffer.reassemble();
        self.remove(&key);
        self.completed.check_and_insert(key, now_ms);
        match wire::decode_packet(&bytes) {
            Ok(mut packet) if packet.message_type == header.original_type => {
                packet.ttl = fragment.ttl;
                FragmentOutcome::Complete(packet)
            }
            _ => {
                tracing::debug!(sender = %fragment.sender_id, "reassembled frame invalid, dropped");
                FragmentOutcome::Ignored
            }
        }
    }

    /// Discard buffers idle past the timeout. Returns how many were dropped.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let before = self.sessions.len();
        let timeout = self.timeout_ms;
        self.sessions
            .retain(|_, b| now_ms.saturating_sub(b.last_activity_ms) < timeout);
        self.completed.evict(now_ms);
        self.recount();
        before - self.sessions.len()
    }

    /// Discard every in-progress buffer from `sender`.
    pub fn drop_sender(&mut self, sender: PeerId) {
        self.sessions.retain(|(s, _), _| *s != sender);
        self.recount();
    }

    pub fn pending_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Bytes held across all in-progress buffers.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Drop the least recently active sessions until the byte budget holds again. `current`
    /// goes last; if it alone is over budget it is dropped too.
    fn enforce_budget(&mut self, current: (PeerId, SessionId)) -> FragmentOutcome {
        while self.buffered > self.max_buffered_bytes {
            if !self.evict_oldest(Some(current)) {
                tracing::debug!(sender = %current.0, "fragment session over byte budget dropped");
                self.remove(&current);
                return FragmentOutcome::Ignored;
            }
        }
        FragmentOutcome::Pending
    }

    fn evict_oldest(&mut self, keep: Option<(PeerId, SessionId)>) -> bool {
        let oldest = self
            .sessions
            .iter()
            .filter(|(k, _)| Some(**k) != keep)
            .min_by_key(|(_, b)| b.last_activity_ms)
            .map(|(k, _)| *k);
        match oldest {
            Some(key) => {
                self.remove(&key);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, key: &(PeerId, SessionId)) {
        if let Some(buffer) = self.sessions.remove(key) {
            self.buffered = self.buffered.saturating_sub(buffer.bytes);
        }
    }

    fn recount(&mut self) {
        self.buffered = self.sessions.values().map(|b| b.bytes).sum();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FragmentError {
    #[error("malformed fragment payload")]
    Malformed,
    #[error("frame budget {0} too small to carry fragments")]
    FrameBudget(usize),
    #[error("payload needs {0} fragments")]
    TooManyFragments(usize),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_packet(len: usize) -> Packet {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut p = Packet::new(
            MessageType::Message,
            PeerId::from_bytes([7; 8]),
            Some(PeerId::from_bytes([9; 8])),
            1234,
            payload,
            7,
        );
        p.signature = Some(vec![5u8; 64]);
        p
    }

    #[test]
    fn small_packet_not_fragmented() {
        let p = big_packet(10);
        let out = split_packet(&p, 512).unwrap();
        assert_eq!(out, vec![p]);
    }

    #[test]
    fn fragments_fit_budget_and_are_typed() {
        let p = big_packet(2000);
        let frags = split_packet(&p, 200).unwrap();
        assert!(frags.len() > 2);
        for f in &frags {
            assert!(wire::encode_packet(f).unwrap().len() <= 200);
            assert_eq!(f.sender_id, p.sender_id);
            assert_eq!(f.ttl, p.ttl);
        }
        assert_eq!(frags[0].message_type, MessageType::FragmentStart);
        assert_eq!(frags[frags.len() - 1].message_type, MessageType::FragmentEnd);
        assert!(frags[1..frags.len() - 1]
            .iter()
            .all(|f| f.message_type == MessageType::FragmentContinue));
    }

    #[test]
    fn in_order_reassembly_is_byte_identical() {
        let p = big_packet(3000);
        let frags = split_packet(&p, 256).unwrap();
        let mut r = Reassembler::new(30_000, 16, 512, 1 << 20);
        let mut result = None;
        for f in &frags {
            match r.accept(f, 0) {
                FragmentOutcome::Complete(packet) => result = Some(packet),
                FragmentOutcome::Pending => {}
                FragmentOutcome::Ignored => panic!("fragment ignored"),
            }
        }
        assert_eq!(result, Some(p));
        assert_eq!(r.pending_sessions(), 0);
    }

    #[test]
    fn out_of_order_reassembly() {
        let p = big_packet(1500);
        let mut frags = split_packet(&p, 180).unwrap();
        frags.reverse();
        frags.swap(0, 2);
        let mut r = Reassembler::new(30_000, 16, 512, 1 << 20);
        let outcomes: Vec<_> = frags.iter().map(|f| r.accept(f, 5)).collect();
        let (last, rest) = outcomes.split_last().unwrap();
        assert!(rest.iter().all(|o| *o == FragmentOutcome::Pending));
        assert_eq!(*last, FragmentOutcome::Complete(p));
    }

    #[test]
    fn duplicates_after_completion_ignored() {
        let p = big_packet(900);
        let frags = split_packet(&p, 200).unwrap();
        let mut r = Reassembler::new(30_000, 16, 512, 1 << 20);
        for f in &frags {
            r.accept(f, 0);
        }
        assert_eq!(r.accept(&frags[0], 1), FragmentOutcome::Ignored);
        assert_eq!(r.pending_sessions(), 0);
    }

    #[test]
    fn missing_fragment_times_out_without_delivery() {
        let p = big_packet(900);
        let frags = split_packet(&p, 200).unwrap();
        let mut r = Reassembler::new(1_000, 16, 512, 1 << 20);
        for f in &frags[..frags.len() - 1] {
            assert_eq!(r.accept(f, 0), FragmentOutcome::Pending);
        }
        assert_eq!(r.purge_expired(999), 0);
        assert_eq!(r.purge_expired(1_000), 1);
        // The late last fragment starts a fresh, incomplete buffer.
        assert_eq!(r.accept(&frags[frags.len() - 1], 1_001), FragmentOutcome::Pending);
    }

    #[test]
    fn drop_sender_clears_sessions() {
        let p = big_packet(900);
        let frags = split_packet(&p, 200).unwrap();
        let mut r = Reassembler::new(30_000, 16, 512, 1 << 20);
        r.accept(&frags[0], 0);
        assert_eq!(r.pending_sessions(), 1);
        r.drop_sender(p.sender_id);
        assert_eq!(r.pending_sessions(), 0);
    }

    #[test]
    fn session_cap_evicts_oldest() {
        let mut r = Reassembler::new(30_000, 2, 512, 1 << 20);
        for n in 0..3u64 {
            let frags = split_packet(&big_packet(900), 200).unwrap();
            r.accept(&frags[0], n);
        }
        assert_eq!(r.pending_sessions(), 2);
    }

    #[test]
    fn chunk_longer_than_a_frame_is_refused() {
        let p = big_packet(3000);
        let frags = split_packet(&p, 1_000).unwrap();
        let mut r = Reassembler::new(30_000, 16, 256, 1 << 20);
        assert_eq!(r.accept(&frags[0], 0), FragmentOutcome::Ignored);
        assert_eq!(r.pending_sessions(), 0);
        assert_eq!(r.buffered_bytes(), 0);
    }

    #[test]
    fn byte_budget_evicts_least_recent_session() {
        let mut r = Reassembler::new(30_000, 16, 256, 400);
        let first = split_packet(&big_packet(900), 200).unwrap();
        let second = split_packet(&big_packet(900), 200).unwrap();
        assert_eq!(r.accept(&first[0], 0), FragmentOutcome::Pending);
        assert_eq!(r.accept(&first[1], 1), FragmentOutcome::Pending);
        assert_eq!(r.pending_sessions(), 1);
        assert_eq!(r.accept(&second[0], 2), FragmentOutcome::Pending);
        assert_eq!(r.pending_sessions(), 1);
        assert!(r.buffered_bytes() <= 400);
        // The evicted session starts over instead of completing.
        for f in &first[2..] {
            assert_ne!(r.accept(f, 3), FragmentOutcome::Complete(big_packet(900)));
        }
        assert!(r.buffered_bytes() <= 400);
    }

    #[test]
    fn reassembled_packet_keeps_hops_taken_by_fragments() {
        let p = big_packet(900);
        let mut frags = split_packet(&p, 200).unwrap();
        for f in frags.iter_mut() {
            f.ttl = 5;
        }
        let mut r = Reassembler::new(30_000, 16, 512, 1 << 20);
        let mut whole = None;
        for f in &frags {
            if let FragmentOutcome::Complete(packet) = r.accept(f, 0) {
                whole = Some(packet);
            }
        }
        let whole = whole.unwrap();
        assert_eq!(whole.ttl, 5);
        assert_eq!(whole.message_id(), p.message_id());
    }

    #[test]
    fn malformed_header_rejected() {
        assert!(FragmentHeader::decode(&[0u8; 5]).is_err());
        let header = FragmentHeader {
            session_id: [1; 8],
            index: 3,
            total: 3,
            original_type: MessageType::Message,
        };
        assert!(FragmentHeader::decode(&header.encode(b"x")).is_err());
    }

    #[test]
    fn tiny_budget_is_an_error() {
        assert!(matches!(
            split_packet(&big_packet(900), 20),
            Err(FragmentError::FrameBudget(20))
        ));
    }
}

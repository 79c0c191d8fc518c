//! Host-driven API: MeshCore receives link events and user operations, returns actions.
//!
//! Nothing in here performs I/O or sleeps. Frames to send, delays to apply and delegate
//! notifications all come back as [`Action`]s for the host to carry out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelRegistry, Unlock};
use crate::clock::Clock;
use crate::config::MeshConfig;
use crate::dedup::{DedupCache, SeenCache, SentCache};
use crate::delivery::{DeliveryStatus, DeliveryTracker, Due, Expected};
use crate::fragment::{self, FragmentError, FragmentHeader, FragmentOutcome, Reassembler, SessionId};
use crate::identity::{self, CryptoError, Fingerprint, Identity, PeerId};
use crate::keys::KeyRing;
use crate::padding;
use crate::protocol::{
    decode_payload, encode_payload, Announce, ChannelAnnounce, ChannelRetention, ChatMessage,
    DeliveryAck, DeliveryStatusRequest, KeyExchange, Leave, MessageType, Packet, PayloadError,
    ReadReceipt,
};
use crate::registry::PeerRegistry;
use crate::relay::{Route, Router};
use crate::wire::{self, FrameEncodeError};

/// Content prefix marking dummy traffic. Receivers drop it after decryption.
const COVER_PREFIX: &str = "\u{0}cover\u{0}";

/// Acks we sent, kept to answer delivery-status requests.
const SENT_ACKS_CAPACITY: usize = 100;

/// Peers whose keys are remembered across link drops.
const KEY_RING_CAPACITY: usize = 256;

/// Recently fragmented packets, so a failed fragment can be kept as its whole message.
const FRAGMENTED_CAPACITY: usize = 64;

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send one frame on the direct link to `peer` after `delay_ms`.
    Send {
        peer: PeerId,
        frame: Vec<u8>,
        delay_ms: u64,
    },
    /// Send one frame on every link after `delay_ms`.
    Broadcast { frame: Vec<u8>, delay_ms: u64 },
    /// Notify the delegate. Fire and forget.
    Event(MeshEvent),
    /// Drop sends still scheduled for `peer`; its link is gone.
    CancelPending(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub nickname: Option<String>,
    pub rssi: Option<i16>,
    pub connected: bool,
    pub fingerprint: Option<Fingerprint>,
    pub is_favorite: bool,
}

/// Delegate notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    MessageReceived(ChatMessage),
    PeerConnected {
        peer: PeerId,
        nickname: String,
    },
    PeerDisconnected {
        peer: PeerId,
        nickname: Option<String>,
    },
    PeerListUpdated(Vec<PeerInfo>),
    ChannelLeave {
        channel: String,
        peer: PeerId,
    },
    ChannelAnnounced(ChannelAnnounce),
    ChannelRetention(ChannelRetention),
    DeliveryAck(DeliveryAck),
    ReadReceipt(ReadReceipt),
    DeliveryStatusUpdated {
        message_id: String,
        status: DeliveryStatus,
    },
}

/// Main coordinator. Host passes events; core returns actions.
pub struct MeshCore {
    config: MeshConfig,
    identity: Identity,
    clock: Arc<dyn Clock>,
    nickname: String,
    registry: PeerRegistry,
    keys: KeyRing,
    channels: ChannelRegistry,
    router: Router,
    reassembler: Reassembler,
    store: crate::store::StoreForward,
    tracker: DeliveryTracker,
    /// Chat message ids already surfaced, so retried sends are shown once.
    delivered: DedupCache<String>,
    sent_acks: HashMap<String, DeliveryAck>,
    sent_ack_order: VecDeque<String>,
    fragmented: HashMap<(PeerId, SessionId), Packet>,
    fragmented_order: VecDeque<(PeerId, SessionId)>,
    last_announce_ms: u64,
    last_cover_ms: u64,
}

impl MeshCore {
    pub fn new(
        config: MeshConfig,
        identity: Identity,
        nickname: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::build(config, identity, nickname.into(), clock, None)
    }

    /// Same as [`MeshCore::new`] with a fixed seed for jitter and cover-traffic choices.
    pub fn with_seed(
        config: MeshConfig,
        identity: Identity,
        nickname: impl Into<String>,
        clock: Arc<dyn Clock>,
        seed: u64,
    ) -> Self {
        Self::build(config, identity, nickname.into(), clock, Some(seed))
    }

    fn build(
        config: MeshConfig,
        identity: Identity,
        nickname: String,
        clock: Arc<dyn Clock>,
        seed: Option<u64>,
    ) -> Self {
        let now = clock.now_ms();
        let router = Router::new(
            identity.peer_id(),
            SeenCache::new(config.seen_cache_capacity, config.seen_cache_horizon_ms),
            SentCache::new(config.sent_cache_capacity, config.sent_cache_horizon_ms),
            config.relay_jitter_min_ms,
            config.relay_jitter_max_ms,
            seed,
        );
        Self {
            registry: PeerRegistry::new(config.peer_stale_after_ms, config.max_peers),
            keys: KeyRing::new(KEY_RING_CAPACITY),
            channels: ChannelRegistry::with_capacity(config.kdf(), config.max_channels),
            router,
            reassembler: Reassembler::new(
                config.fragment_timeout_ms,
                config.max_reassembly_sessions,
                config.max_frame_len,
                config.max_reassembly_bytes,
            ),
            store: crate::store::StoreForward::new(
                config.favorite_cache_capacity,
                config.regular_cache_capacity,
                config.regular_cache_horizon_ms,
            ),
            tracker: DeliveryTracker::new(config.ack_timeout_ms, config.max_delivery_retries),
            delivered: DedupCache::new(config.seen_cache_capacity, config.seen_cache_horizon_ms),
            sent_acks: HashMap::new(),
            sent_ack_order: VecDeque::new(),
            fragmented: HashMap::new(),
            fragmented_order: VecDeque::new(),
            last_announce_ms: now,
            last_cover_ms: now,
            config,
            identity,
            clock,
            nickname,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn delivery_status(&self, message_id: &str) -> Option<&DeliveryStatus> {
        self.tracker.status(message_id)
    }

    pub fn stored_messages(&self) -> usize {
        self.store.len()
    }

    /// Persistent identity of `peer`, if its keys are known.
    pub fn fingerprint_of(&self, peer: &PeerId) -> Option<Fingerprint> {
        self.registry
            .fingerprint(peer)
            .or_else(|| self.keys.fingerprint(peer))
            .cloned()
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.keys.has_session(peer)
    }

    /// Change our nickname and announce it.
    pub fn set_nickname(&mut self, nickname: impl Into<String>) -> Vec<Action> {
        self.nickname = nickname.into();
        let now = self.clock.now_ms();
        self.announce_to(None, now)
    }

    // ---- link events ----

    /// A direct link came up. Sends our keys and announce, then anything stored for the peer.
    pub fn on_link_connected(&mut self, peer: PeerId) -> Vec<Action> {
        let now = self.clock.now_ms();
        self.registry.set_connected(peer, true, now);
        info!(%peer, "link up");
        let mut actions = self.key_exchange_to(Some(peer), now);
        actions.extend(self.announce_to(Some(peer), now));
        actions.extend(self.replay_stored(peer, now));
        actions.push(self.peer_list_event());
        actions
    }

    /// A direct link went away. Session state for the peer is dropped; stored messages stay.
    pub fn on_link_disconnected(&mut self, peer: PeerId) -> Vec<Action> {
        let now = self.clock.now_ms();
        self.registry.set_connected(peer, false, now);
        info!(%peer, "link down");
        let mut actions = Vec::new();
        self.forget_peer(peer, &mut actions);
        actions
    }

    pub fn on_rssi(&mut self, peer: PeerId, rssi: i16) {
        self.registry.update_rssi(peer, rssi);
    }

    /// The host could not deliver `frame` to `peer`. Chat messages are kept for replay.
    pub fn on_send_failed(&mut self, peer: PeerId, frame: &[u8]) {
        self.retain_failed(Some(peer), frame);
    }

    /// A broadcast of `frame` failed. Chat messages are kept for replay to every peer.
    pub fn on_broadcast_failed(&mut self, frame: &[u8]) {
        self.retain_failed(None, frame);
    }

    /// Keep the chat message behind a failed frame. A fragment stands for the whole packet it
    /// was cut from; the first failed fragment of a transfer stores it, the rest are no-ops.
    fn retain_failed(&mut self, link: Option<PeerId>, frame: &[u8]) {
        let now = self.clock.now_ms();
        let Ok(packet) = wire::decode_packet(frame) else {
            return;
        };
        let packet = if packet.message_type.is_fragment() {
            match self.take_fragmented(&packet) {
                Some(whole) => whole,
                None => {
                    trace!(?link, "failed fragment has no pending whole packet");
                    return;
                }
            }
        } else {
            packet
        };
        if packet.message_type != MessageType::Message {
            trace!(?link, kind = ?packet.message_type, "failed send not retained");
            return;
        }
        let recipient = packet.recipient_id.filter(|r| !r.is_broadcast());
        let fingerprint = recipient.and_then(|r| self.fingerprint_of(&r));
        let favorite = fingerprint
            .as_ref()
            .is_some_and(|f| self.registry.is_favorite_fingerprint(f));
        let id = packet.message_id();
        if self
            .store
            .store(packet, recipient, fingerprint, favorite, None, now)
        {
            warn!(?link, %id, "send failed; message kept for store-and-forward");
        }
    }

    fn remember_fragmented(&mut self, first: &Packet, whole: &Packet) {
        let Ok((header, _)) = FragmentHeader::decode(&first.payload) else {
            return;
        };
        let key = (first.sender_id, header.session_id);
        if self.fragmented_order.len() >= FRAGMENTED_CAPACITY {
            if let Some(old) = self.fragmented_order.pop_front() {
                self.fragmented.remove(&old);
            }
        }
        self.fragmented_order.push_back(key);
        self.fragmented.insert(key, whole.clone());
    }

    fn take_fragmented(&mut self, fragment: &Packet) -> Option<Packet> {
        let (header, _) = FragmentHeader::decode(&fragment.payload).ok()?;
        let key = (fragment.sender_id, header.session_id);
        let whole = self.fragmented.remove(&key)?;
        self.fragmented_order.retain(|k| *k != key);
        Some(whole)
    }

    /// One frame from the direct link to `from`. Undecodable frames are dropped silently.
    pub fn on_frame_received(&mut self, from: PeerId, bytes: &[u8]) -> Vec<Action> {
        let now = self.clock.now_ms();
        let packet = match wire::decode_packet(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(%from, error = %e, "undecodable frame dropped");
                return Vec::new();
            }
        };
        let mut actions = Vec::new();
        if from != self.peer_id() && self.registry.touch(from, now) {
            actions.push(self.peer_list_event());
        }
        self.handle_packet(packet, from, now, &mut actions);
        actions
    }

    // ---- user operations ----

    /// Public message, optionally in a channel. Protected channels are encrypted with the
    /// channel key. Returns the local copy of the message.
    pub fn send_message(
        &mut self,
        content: &str,
        mentions: Vec<String>,
        channel: Option<&str>,
    ) -> Result<(ChatMessage, Vec<Action>), CoreError> {
        let now = self.clock.now_ms();
        let mut message = ChatMessage::new(
            self.nickname.clone(),
            self.peer_id(),
            content.to_string(),
            now,
            false,
        );
        if !mentions.is_empty() {
            message.mentions = Some(mentions);
        }
        message.channel = channel.map(str::to_string);
        if message.channel.is_some() {
            let total = self.registry.active_peers().len();
            self.tracker.track(&message, Expected::Many { total });
        }
        let actions = self.dispatch_broadcast(&message, now)?;
        message.delivery_status = self.tracker.status(&message.id).cloned();
        Ok((message, actions))
    }

    /// End-to-end encrypted message to one peer. Cached if the peer is not reachable.
    pub fn send_private_message(
        &mut self,
        content: &str,
        recipient: PeerId,
        recipient_nickname: &str,
    ) -> Result<(ChatMessage, Vec<Action>), CoreError> {
        if !self.keys.has_session(&recipient) {
            return Err(CoreError::NoSessionKey(recipient));
        }
        let now = self.clock.now_ms();
        let mut message = ChatMessage::new(
            self.nickname.clone(),
            self.peer_id(),
            content.to_string(),
            now,
            true,
        );
        message.recipient_nickname = Some(recipient_nickname.to_string());
        self.tracker.track(&message, Expected::Single(recipient));
        let actions = self.dispatch_private(&message, recipient, now)?;
        message.delivery_status = self.tracker.status(&message.id).cloned();
        Ok((message, actions))
    }

    /// Tell the sender of `message` that it was read.
    pub fn send_read_receipt(&mut self, message: &ChatMessage) -> Vec<Action> {
        let Some(sender) = message.sender_peer_id else {
            return Vec::new();
        };
        let now = self.clock.now_ms();
        let receipt = ReadReceipt {
            original_message_id: message.id.clone(),
            receipt_id: uuid::Uuid::new_v4().to_string(),
            reader_id: self.peer_id(),
            reader_nickname: self.nickname.clone(),
            timestamp: now,
        };
        self.send_addressed(MessageType::ReadReceipt, &receipt, sender, now)
    }

    /// Ask `peer` to repeat its ack for `message_id`.
    pub fn request_delivery_status(&mut self, message_id: &str, peer: PeerId) -> Vec<Action> {
        let now = self.clock.now_ms();
        let request = DeliveryStatusRequest {
            message_id: message_id.to_string(),
        };
        self.send_addressed(MessageType::DeliveryStatusRequest, &request, peer, now)
    }

    /// Join a channel, unlocking it if a password is given.
    pub fn join_channel(&mut self, name: &str, password: Option<&str>) -> Result<(), CoreError> {
        let Some(password) = password else {
            self.channels.join(name);
            return Ok(());
        };
        match self.channels.unlock(name, password)? {
            Unlock::Accepted => Ok(()),
            Unlock::WrongPassword => Err(CoreError::WrongPassword(name.to_string())),
        }
    }

    /// Protect a channel we created (or that has no creator yet) and announce its commitment.
    pub fn set_channel_password(
        &mut self,
        name: &str,
        password: &str,
    ) -> Result<Vec<Action>, CoreError> {
        self.ensure_creator(name)?;
        let now = self.clock.now_ms();
        let announce = self.channels.set_password(name, password, self.peer_id())?;
        Ok(self.send_payload(MessageType::ChannelAnnounce, None, &announce, None, now))
    }

    pub fn remove_channel_password(&mut self, name: &str) -> Result<Vec<Action>, CoreError> {
        self.ensure_creator(name)?;
        let now = self.clock.now_ms();
        let announce = self.channels.remove_password(name, self.peer_id());
        Ok(self.send_payload(MessageType::ChannelAnnounce, None, &announce, None, now))
    }

    pub fn set_channel_retention(
        &mut self,
        name: &str,
        enabled: bool,
    ) -> Result<Vec<Action>, CoreError> {
        self.ensure_creator(name)?;
        let now = self.clock.now_ms();
        let retention = self.channels.set_retention(name, enabled, self.peer_id());
        Ok(self.send_payload(MessageType::ChannelRetention, None, &retention, None, now))
    }

    /// Forget a channel and tell the mesh.
    pub fn leave_channel(&mut self, name: &str) -> Vec<Action> {
        let now = self.clock.now_ms();
        self.channels.leave(name);
        let leave = Leave {
            channel: Some(name.to_string()),
        };
        self.send_payload(MessageType::Leave, None, &leave, None, now)
    }

    /// Announce that we are leaving the mesh.
    pub fn leave_mesh(&mut self) -> Vec<Action> {
        let now = self.clock.now_ms();
        self.send_payload(MessageType::Leave, None, &Leave { channel: None }, None, now)
    }

    pub fn set_favorite(&mut self, fingerprint: Fingerprint, favorite: bool) -> Vec<Action> {
        self.registry.set_favorite(fingerprint, favorite);
        vec![self.peer_list_event()]
    }

    pub fn set_blocked(&mut self, fingerprint: Fingerprint, blocked: bool) -> Vec<Action> {
        self.registry.set_blocked(fingerprint, blocked);
        vec![self.peer_list_event()]
    }

    pub fn is_favorite(&self, peer: &PeerId) -> bool {
        self.fingerprint_of(peer)
            .is_some_and(|f| self.registry.is_favorite_fingerprint(&f))
    }

    pub fn is_blocked(&self, peer: &PeerId) -> bool {
        self.fingerprint_of(peer)
            .is_some_and(|f| self.registry.is_blocked_fingerprint(&f))
    }

    /// Active peers with presentation details.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.registry
            .active_peers()
            .into_iter()
            .map(|peer| {
                let record = self.registry.get(&peer);
                let fingerprint = self.fingerprint_of(&peer);
                PeerInfo {
                    peer_id: peer,
                    nickname: record.and_then(|r| r.nickname.clone()),
                    rssi: record.and_then(|r| r.rssi),
                    connected: record.is_some_and(|r| r.connected),
                    is_favorite: fingerprint
                        .as_ref()
                        .is_some_and(|f| self.registry.is_favorite_fingerprint(f)),
                    fingerprint,
                }
            })
            .collect()
    }

    /// Periodic housekeeping: stale peers, expired buffers and caches, ack retries,
    /// presence announces and cover traffic.
    pub fn tick(&mut self) -> Vec<Action> {
        let now = self.clock.now_ms();
        let mut actions = Vec::new();

        let stale = self.registry.evict_stale(now);
        for (peer, nickname) in &stale {
            info!(peer = %peer, "peer went stale");
            self.reassembler.drop_sender(*peer);
            self.tracker.cancel_for_peer(*peer);
            actions.push(Action::CancelPending(*peer));
            actions.push(Action::Event(MeshEvent::PeerDisconnected {
                peer: *peer,
                nickname: nickname.clone(),
            }));
        }
        if !stale.is_empty() {
            actions.push(self.peer_list_event());
        }

        let expired = self.reassembler.purge_expired(now);
        if expired > 0 {
            debug!(expired, "abandoned fragment sessions dropped");
        }
        self.store.evict_expired(now);
        self.router.evict(now);
        self.delivered.evict(now);

        for due in self.tracker.poll(now) {
            match due {
                Due::Resend {
                    message,
                    recipient,
                    attempt,
                } => {
                    debug!(id = %message.id, attempt, "resending unacknowledged message");
                    let result = match recipient {
                        Some(peer) => self.dispatch_private(&message, peer, now),
                        None => self.dispatch_broadcast(&message, now),
                    };
                    match result {
                        Ok(resent) => actions.extend(resent),
                        Err(e) => warn!(id = %message.id, error = %e, "resend failed"),
                    }
                }
                Due::Finished { message_id, status } => {
                    info!(id = %message_id, ?status, "delivery finished");
                    actions.push(Action::Event(MeshEvent::DeliveryStatusUpdated {
                        message_id,
                        status,
                    }));
                }
            }
        }

        let announce_every = (self.config.peer_stale_after_ms / 3).max(1);
        if now.saturating_sub(self.last_announce_ms) >= announce_every {
            self.last_announce_ms = now;
            if !self.registry.connected_peers().is_empty() {
                actions.extend(self.announce_to(None, now));
            }
        }

        if self.config.cover_traffic
            && now.saturating_sub(self.last_cover_ms) >= self.config.cover_traffic_interval_ms
        {
            self.last_cover_ms = now;
            actions.extend(self.cover_traffic(now));
        }
        actions
    }

    // ---- inbound ----

    fn handle_packet(&mut self, packet: Packet, from: PeerId, now: u64, actions: &mut Vec<Action>) {
        let (deliver, relay) = match self.router.route(&packet, now) {
            Route::Own => return,
            Route::Duplicate => {
                trace!(id = %packet.message_id(), "duplicate dropped");
                return;
            }
            Route::Accept { deliver, relay } => (deliver, relay),
        };
        let sender = packet.sender_id;
        if sender != from && self.registry.touch(sender, now) {
            actions.push(self.peer_list_event());
        }
        let authentic = self.check_signature(&packet);

        if let Some(next) = relay {
            self.keep_for_offline(&next, now);
            let delay_ms = self.router.jitter_ms();
            match self.transmit(&next, None, delay_ms, now) {
                Ok(sent) => actions.extend(sent),
                Err(e) => debug!(error = %e, "relay dropped"),
            }
        }

        if !deliver || !authentic {
            return;
        }
        if self.is_blocked(&sender) {
            debug!(%sender, "packet from blocked peer not delivered");
            return;
        }
        if packet.message_type.is_fragment() {
            if let FragmentOutcome::Complete(whole) = self.reassembler.accept(&packet, now) {
                let fresh = matches!(
                    self.router.route(&whole, now),
                    Route::Accept { deliver: true, .. }
                );
                if fresh && self.check_signature(&whole) {
                    self.deliver(whole, from, now, actions);
                }
            }
            return;
        }
        self.deliver(packet, from, now, actions);
    }

    /// Relays cache private messages for recipients nobody has heard from.
    fn keep_for_offline(&mut self, packet: &Packet, now: u64) {
        if packet.message_type != MessageType::Message {
            return;
        }
        let Some(recipient) = packet.recipient_id.filter(|r| !r.is_broadcast()) else {
            return;
        };
        if self.registry.is_active(&recipient) {
            return;
        }
        let fingerprint = self.fingerprint_of(&recipient);
        let favorite = fingerprint
            .as_ref()
            .is_some_and(|f| self.registry.is_favorite_fingerprint(f));
        self.store.store(
            packet.clone(),
            Some(recipient),
            fingerprint,
            favorite,
            None,
            now,
        );
    }

    /// Checks the signature when the sender's verifying key is known. Failures are logged
    /// once per peer.
    fn check_signature(&mut self, packet: &Packet) -> bool {
        if packet.message_type.is_fragment() {
            return true;
        }
        let key = if packet.message_type == MessageType::KeyExchange {
            decode_payload::<KeyExchange>(&packet.payload)
                .ok()
                .map(|kx| kx.signing_key)
        } else {
            self.keys.get(&packet.sender_id).map(|k| k.signing_key)
        };
        let Some(key) = key else {
            return true;
        };
        let valid = match &packet.signature {
            Some(signature) => wire::signing_bytes(packet)
                .map(|bytes| identity::verify_signature(&key, &bytes, signature))
                .unwrap_or(false),
            None => false,
        };
        if !valid && self.keys.note_signature_failure(packet.sender_id) {
            warn!(
                peer = %packet.sender_id,
                kind = ?packet.message_type,
                "signature verification failed; relaying without delivery"
            );
        }
        valid
    }

    fn deliver(&mut self, packet: Packet, from: PeerId, now: u64, actions: &mut Vec<Action>) {
        let sender = packet.sender_id;
        let for_us = packet.is_addressed_to(self.peer_id());
        match packet.message_type {
            MessageType::Announce => {
                if let Some(announce) = decode::<Announce>(&packet) {
                    self.on_announce(sender, announce, now, actions);
                }
            }
            MessageType::KeyExchange => {
                if let Some(exchange) = decode::<KeyExchange>(&packet) {
                    self.on_key_exchange(sender, exchange, now, actions);
                }
            }
            MessageType::Leave => {
                if let Some(leave) = decode::<Leave>(&packet) {
                    match leave.channel {
                        Some(channel) => actions.push(Action::Event(MeshEvent::ChannelLeave {
                            channel,
                            peer: sender,
                        })),
                        None => self.forget_peer(sender, actions),
                    }
                }
            }
            MessageType::Message => self.on_message(&packet, from, now, actions),
            MessageType::ChannelAnnounce => {
                if let Some(announce) = decode::<ChannelAnnounce>(&packet) {
                    self.channels.on_announce(&announce);
                    actions.push(Action::Event(MeshEvent::ChannelAnnounced(announce)));
                }
            }
            MessageType::ChannelRetention => {
                if let Some(retention) = decode::<ChannelRetention>(&packet) {
                    self.channels.on_retention(&retention);
                    actions.push(Action::Event(MeshEvent::ChannelRetention(retention)));
                }
            }
            MessageType::DeliveryAck if for_us => {
                if let Some(ack) = decode::<DeliveryAck>(&packet) {
                    let status = self.tracker.on_ack(&ack);
                    let message_id = ack.original_message_id.clone();
                    actions.push(Action::Event(MeshEvent::DeliveryAck(ack)));
                    if let Some(status) = status {
                        actions.push(status_event(message_id, status));
                    }
                }
            }
            MessageType::ReadReceipt if for_us => {
                if let Some(receipt) = decode::<ReadReceipt>(&packet) {
                    let status = self.tracker.on_read_receipt(&receipt);
                    let message_id = receipt.original_message_id.clone();
                    actions.push(Action::Event(MeshEvent::ReadReceipt(receipt)));
                    if let Some(status) = status {
                        actions.push(status_event(message_id, status));
                    }
                }
            }
            MessageType::DeliveryStatusRequest if for_us => {
                if let Some(request) = decode::<DeliveryStatusRequest>(&packet) {
                    if let Some(ack) = self.sent_acks.get(&request.message_id).cloned() {
                        actions.extend(self.send_addressed(
                            MessageType::DeliveryAck,
                            &ack,
                            sender,
                            now,
                        ));
                    }
                }
            }
            MessageType::DeliveryAck
            | MessageType::ReadReceipt
            | MessageType::DeliveryStatusRequest => {}
            MessageType::FragmentStart
            | MessageType::FragmentContinue
            | MessageType::FragmentEnd => {
                trace!(%sender, "nested fragment ignored");
            }
        }
    }

    fn on_announce(&mut self, peer: PeerId, announce: Announce, now: u64, actions: &mut Vec<Action>) {
        if !self.registry.on_announce(peer, announce.nickname.clone(), now) {
            return;
        }
        info!(%peer, nickname = %announce.nickname, "peer announced");
        actions.push(Action::Event(MeshEvent::PeerConnected {
            peer,
            nickname: announce.nickname,
        }));
        actions.push(self.peer_list_event());
        actions.extend(self.replay_stored(peer, now));
    }

    fn on_key_exchange(
        &mut self,
        peer: PeerId,
        exchange: KeyExchange,
        now: u64,
        actions: &mut Vec<Action>,
    ) {
        let fingerprint = Fingerprint::from_keys(&exchange.agreement_key, &exchange.signing_key);
        self.registry.link_fingerprint(peer, fingerprint);
        if !self.keys.on_key_exchange(&self.identity, peer, &exchange) {
            return;
        }
        debug!(%peer, "session key established");
        actions.extend(self.key_exchange_to(None, now));
        actions.extend(self.replay_stored(peer, now));
        actions.push(self.peer_list_event());
    }

    fn on_message(&mut self, packet: &Packet, from: PeerId, now: u64, actions: &mut Vec<Action>) {
        let sender = packet.sender_id;
        let private = packet.is_addressed_to(self.peer_id());
        let opened = if private {
            self.open_private(sender, &packet.payload)
        } else {
            decode_payload::<ChatMessage>(&packet.payload).map_err(CoreError::from)
        };
        let mut message = match opened {
            Ok(message) => message,
            Err(e) => {
                debug!(%sender, error = %e, "message not readable");
                return;
            }
        };
        if message.content.starts_with(COVER_PREFIX) {
            trace!(%sender, "cover traffic dropped");
            return;
        }
        message.sender_peer_id = Some(sender);
        message.is_private = private;
        message.is_relay = from != sender;
        message.delivery_status = None;
        let wants_ack = private || message.channel.is_some();

        if !self.delivered.check_and_insert(message.id.clone(), now) {
            // Retry of something already shown: acknowledge again, show nothing.
            if wants_ack {
                actions.extend(self.resend_ack(&message.id, sender, packet.ttl, now));
            }
            return;
        }
        if !private {
            self.open_channel_message(&mut message);
        }
        if wants_ack {
            actions.extend(self.send_ack(&message.id, sender, packet.ttl, now));
        }
        actions.push(Action::Event(MeshEvent::MessageReceived(message)));
    }

    fn open_private(&self, sender: PeerId, ciphertext: &[u8]) -> Result<ChatMessage, CoreError> {
        let padded = self.keys.decrypt_from(&sender, ciphertext)?;
        let plaintext = padding::unpad(&padded).ok_or(CoreError::Padding)?;
        Ok(decode_payload(plaintext)?)
    }

    /// Decrypt a protected channel message in place. Left marked encrypted on failure so the
    /// delegate can try.
    fn open_channel_message(&self, message: &mut ChatMessage) {
        let opened = match (&message.channel, &message.encrypted_content) {
            (Some(channel), Some(ciphertext)) => self
                .channels
                .decrypt(channel, ciphertext)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok()),
            _ => return,
        };
        match opened {
            Some(content) => {
                message.content = content;
                message.encrypted_content = None;
                message.is_encrypted = false;
            }
            None => {
                message.is_encrypted = true;
                debug!(channel = ?message.channel, "channel message left encrypted");
            }
        }
    }

    fn send_ack(&mut self, message_id: &str, to: PeerId, ttl: u8, now: u64) -> Vec<Action> {
        let ack = DeliveryAck {
            original_message_id: message_id.to_string(),
            ack_id: uuid::Uuid::new_v4().to_string(),
            recipient_id: self.peer_id(),
            recipient_nickname: self.nickname.clone(),
            timestamp: now,
            hop_count: self.config.effective_ttl().saturating_sub(ttl),
        };
        while self.sent_ack_order.len() >= SENT_ACKS_CAPACITY {
            if let Some(old) = self.sent_ack_order.pop_front() {
                self.sent_acks.remove(&old);
            }
        }
        self.sent_ack_order.push_back(message_id.to_string());
        self.sent_acks.insert(message_id.to_string(), ack.clone());
        self.send_addressed(MessageType::DeliveryAck, &ack, to, now)
    }

    fn resend_ack(&mut self, message_id: &str, to: PeerId, ttl: u8, now: u64) -> Vec<Action> {
        match self.sent_acks.get(message_id).cloned() {
            Some(ack) => self.send_addressed(MessageType::DeliveryAck, &ack, to, now),
            None => self.send_ack(message_id, to, ttl, now),
        }
    }

    fn forget_peer(&mut self, peer: PeerId, actions: &mut Vec<Action>) {
        let nickname = self.registry.nickname(&peer).map(str::to_string);
        let was_active = self.registry.remove(peer);
        self.reassembler.drop_sender(peer);
        let cancelled = self.tracker.cancel_for_peer(peer);
        if cancelled > 0 {
            debug!(%peer, cancelled, "delivery retries cancelled");
        }
        actions.push(Action::CancelPending(peer));
        if was_active {
            info!(%peer, "peer left");
            actions.push(Action::Event(MeshEvent::PeerDisconnected { peer, nickname }));
            actions.push(self.peer_list_event());
        }
    }

    // ---- outbound ----

    fn dispatch_broadcast(
        &mut self,
        message: &ChatMessage,
        now: u64,
    ) -> Result<Vec<Action>, CoreError> {
        let mut outgoing = message.clone();
        outgoing.delivery_status = None;
        if let Some(channel) = &message.channel {
            if self.channels.is_protected(channel) {
                outgoing.encrypted_content =
                    Some(self.channels.encrypt(channel, message.content.as_bytes())?);
                outgoing.is_encrypted = true;
                outgoing.content.clear();
            }
        }
        let payload = encode_payload(&outgoing)?;
        let packet = self.packet(MessageType::Message, None, payload, now);
        if self.registry.connected_peers().is_empty() {
            let packet = self.sign(packet)?;
            self.router.mark_seen(packet.message_id(), now);
            self.store
                .store(packet, None, None, false, Some(message.id.clone()), now);
            debug!(id = %message.id, "no links; message kept for later peers");
            return Ok(Vec::new());
        }
        let mut actions = self.originate(packet, None, now)?;
        if let Some(status) = self.tracker.mark_sent(&message.id, now) {
            actions.push(status_event(message.id.clone(), status));
        }
        Ok(actions)
    }

    fn dispatch_private(
        &mut self,
        message: &ChatMessage,
        recipient: PeerId,
        now: u64,
    ) -> Result<Vec<Action>, CoreError> {
        let mut outgoing = message.clone();
        outgoing.delivery_status = None;
        let plaintext = encode_payload(&outgoing)?;
        let ciphertext = self.keys.encrypt_for(&recipient, &padding::pad(&plaintext))?;
        let packet = self.packet(MessageType::Message, Some(recipient), ciphertext, now);

        let reachable =
            self.registry.is_active(&recipient) && !self.registry.connected_peers().is_empty();
        if !reachable {
            let packet = self.sign(packet)?;
            self.router.mark_seen(packet.message_id(), now);
            let fingerprint = self.fingerprint_of(&recipient);
            let favorite = fingerprint
                .as_ref()
                .is_some_and(|f| self.registry.is_favorite_fingerprint(f));
            self.store.store(
                packet,
                Some(recipient),
                fingerprint,
                favorite,
                Some(message.id.clone()),
                now,
            );
            debug!(%recipient, favorite, "recipient offline; message cached");
            return Ok(Vec::new());
        }
        let link = self.link_for(recipient);
        let mut actions = self.originate(packet, link, now)?;
        if let Some(status) = self.tracker.mark_sent(&message.id, now) {
            actions.push(status_event(message.id.clone(), status));
        }
        Ok(actions)
    }

    /// Send everything stored for `peer`, each entry at most once per peer session.
    fn replay_stored(&mut self, peer: PeerId, now: u64) -> Vec<Action> {
        let fingerprint = self.fingerprint_of(&peer);
        let entries = self.store.replay_for(peer, fingerprint.as_ref(), now);
        if entries.is_empty() {
            return Vec::new();
        }
        debug!(%peer, count = entries.len(), "replaying stored messages");
        let link = self.link_for(peer);
        let mut actions = Vec::new();
        for entry in entries {
            let readdress = entry.packet.sender_id == self.peer_id()
                && entry.recipient.is_some()
                && entry.recipient != Some(peer);
            let result = if readdress {
                // Same identity under a new ephemeral id: address and sign afresh.
                let packet = self.packet(
                    entry.packet.message_type,
                    Some(peer),
                    entry.packet.payload.clone(),
                    now,
                );
                self.originate(packet, link, now)
            } else {
                self.transmit(&entry.packet, link, 0, now)
            };
            match result {
                Ok(sent) => actions.extend(sent),
                Err(e) => {
                    warn!(%peer, error = %e, "stored message not replayed");
                    continue;
                }
            }
            if let Some(id) = &entry.message_ref {
                if let Some(status) = self.tracker.mark_sent(id, now) {
                    actions.push(status_event(id.clone(), status));
                }
            }
        }
        actions
    }

    fn cover_traffic(&mut self, now: u64) -> Vec<Action> {
        let candidates: Vec<PeerId> = self
            .registry
            .active_peers()
            .into_iter()
            .filter(|p| self.keys.has_session(p))
            .collect();
        let Some(&peer) = candidates.choose(self.router.rng()) else {
            return Vec::new();
        };
        let len = self.router.rng().gen_range(8..64);
        let filler: String = self
            .router
            .rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect();
        let message = ChatMessage::new(
            self.nickname.clone(),
            self.peer_id(),
            format!("{COVER_PREFIX}{filler}"),
            now,
            true,
        );
        trace!(%peer, "cover traffic");
        self.dispatch_private(&message, peer, now)
            .unwrap_or_else(|e| {
                debug!(error = %e, "cover traffic not sent");
                Vec::new()
            })
    }

    fn announce_to(&mut self, link: Option<PeerId>, now: u64) -> Vec<Action> {
        let announce = Announce {
            nickname: self.nickname.clone(),
        };
        self.send_payload(MessageType::Announce, None, &announce, link, now)
    }

    fn key_exchange_to(&mut self, link: Option<PeerId>, now: u64) -> Vec<Action> {
        let exchange = self.identity.key_exchange();
        self.send_payload(MessageType::KeyExchange, None, &exchange, link, now)
    }

    fn send_addressed<T: Serialize>(
        &mut self,
        kind: MessageType,
        value: &T,
        to: PeerId,
        now: u64,
    ) -> Vec<Action> {
        let link = self.link_for(to);
        self.send_payload(kind, Some(to), value, link, now)
    }

    fn send_payload<T: Serialize>(
        &mut self,
        kind: MessageType,
        recipient: Option<PeerId>,
        value: &T,
        link: Option<PeerId>,
        now: u64,
    ) -> Vec<Action> {
        let result = encode_payload(value)
            .map_err(CoreError::from)
            .and_then(|payload| {
                let packet = self.packet(kind, recipient, payload, now);
                self.originate(packet, link, now)
            });
        result.unwrap_or_else(|e| {
            warn!(?kind, error = %e, "outbound packet dropped");
            Vec::new()
        })
    }

    fn packet(
        &self,
        kind: MessageType,
        recipient: Option<PeerId>,
        payload: Vec<u8>,
        now: u64,
    ) -> Packet {
        Packet::new(
            kind,
            self.peer_id(),
            recipient,
            now,
            payload,
            self.config.effective_ttl(),
        )
    }

    fn sign(&self, mut packet: Packet) -> Result<Packet, CoreError> {
        let bytes = wire::signing_bytes(&packet)?;
        packet.signature = Some(self.identity.sign(&bytes).to_vec());
        Ok(packet)
    }

    /// Sign, remember as seen, and transmit a packet we originate.
    fn originate(
        &mut self,
        packet: Packet,
        link: Option<PeerId>,
        now: u64,
    ) -> Result<Vec<Action>, CoreError> {
        let packet = self.sign(packet)?;
        self.router.mark_seen(packet.message_id(), now);
        self.transmit(&packet, link, 0, now)
    }

    /// Encode (fragmenting if needed) and emit send actions. Suppressed if the same frame
    /// already went to the same target within the send window.
    fn transmit(
        &mut self,
        packet: &Packet,
        link: Option<PeerId>,
        delay_ms: u64,
        now: u64,
    ) -> Result<Vec<Action>, CoreError> {
        if !self.router.admit_send(packet.message_id(), link, now) {
            trace!(id = %packet.message_id(), "recently sent; skipped");
            return Ok(Vec::new());
        }
        let parts = fragment::split_packet(packet, self.config.max_frame_len)?;
        if parts.len() > 1 {
            self.remember_fragmented(&parts[0], packet);
        }
        let mut actions = Vec::with_capacity(parts.len());
        for part in &parts {
            let frame = wire::encode_packet(part)?;
            actions.push(match link {
                Some(peer) => Action::Send {
                    peer,
                    frame,
                    delay_ms,
                },
                None => Action::Broadcast { frame, delay_ms },
            });
        }
        Ok(actions)
    }

    fn link_for(&self, peer: PeerId) -> Option<PeerId> {
        self.registry.is_connected(&peer).then_some(peer)
    }

    fn ensure_creator(&self, name: &str) -> Result<(), CoreError> {
        match self.channels.get(name).and_then(|c| c.creator) {
            Some(creator) if creator != self.peer_id() => {
                Err(CoreError::NotChannelCreator(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn peer_list_event(&self) -> Action {
        Action::Event(MeshEvent::PeerListUpdated(self.peers()))
    }
}

fn status_event(message_id: String, status: DeliveryStatus) -> Action {
    Action::Event(MeshEvent::DeliveryStatusUpdated { message_id, status })
}

fn decode<T: DeserializeOwned>(packet: &Packet) -> Option<T> {
    match decode_payload(&packet.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(sender = %packet.sender_id, kind = ?packet.message_type, error = %e, "bad payload");
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("no session key for peer {0}")]
    NoSessionKey(PeerId),
    #[error("wrong password for channel {0}")]
    WrongPassword(String),
    #[error("only the creator can change channel {0}")]
    NotChannelCreator(String),
    #[error("malformed padding")]
    Padding,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Fragment(#[from] FragmentError),
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::clock::ManualClock;

    /// Nodes wired by in-memory links; frames are delivered immediately, delays ignored.
    struct Mesh {
        clock: Arc<ManualClock>,
        nodes: Vec<MeshCore>,
        links: HashSet<(usize, usize)>,
        events: Vec<Vec<MeshEvent>>,
        /// Every frame on the air: (from, to, frame).
        air: Vec<(usize, usize, Vec<u8>)>,
    }

    fn test_config() -> MeshConfig {
        MeshConfig {
            kdf_memory_kib: 64,
            kdf_iterations: 1,
            ..MeshConfig::default()
        }
    }

    impl Mesh {
        fn new(names: &[&str], config: MeshConfig) -> Self {
            let clock = Arc::new(ManualClock::new(1_000_000));
            let nodes = names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    MeshCore::with_seed(
                        config.clone(),
                        Identity::generate(),
                        *name,
                        clock.clone(),
                        i as u64,
                    )
                })
                .collect();
            Self {
                clock,
                nodes,
                links: HashSet::new(),
                events: vec![Vec::new(); names.len()],
                air: Vec::new(),
            }
        }

        fn id(&self, i: usize) -> PeerId {
            self.nodes[i].peer_id()
        }

        fn index(&self, peer: PeerId) -> Option<usize> {
            self.nodes.iter().position(|n| n.peer_id() == peer)
        }

        fn link(&mut self, a: usize, b: usize) {
            self.clock.advance(1);
            self.links.insert((a, b));
            self.links.insert((b, a));
            let (ida, idb) = (self.id(a), self.id(b));
            let out = self.nodes[a].on_link_connected(idb);
            self.run(a, out);
            let out = self.nodes[b].on_link_connected(ida);
            self.run(b, out);
        }

        fn unlink(&mut self, a: usize, b: usize) {
            self.links.remove(&(a, b));
            self.links.remove(&(b, a));
            let (ida, idb) = (self.id(a), self.id(b));
            let out = self.nodes[a].on_link_disconnected(idb);
            self.run(a, out);
            let out = self.nodes[b].on_link_disconnected(ida);
            self.run(b, out);
        }

        fn run(&mut self, origin: usize, actions: Vec<Action>) {
            let mut queue: VecDeque<(usize, Action)> =
                actions.into_iter().map(|a| (origin, a)).collect();
            while let Some((from, action)) = queue.pop_front() {
                let (targets, frame) = match action {
                    Action::Send { peer, frame, .. } => {
                        let targets = self
                            .index(peer)
                            .filter(|to| self.links.contains(&(from, *to)))
                            .into_iter()
                            .collect::<Vec<_>>();
                        (targets, frame)
                    }
                    Action::Broadcast { frame, .. } => {
                        let targets = (0..self.nodes.len())
                            .filter(|to| self.links.contains(&(from, *to)))
                            .collect::<Vec<_>>();
                        (targets, frame)
                    }
                    Action::Event(event) => {
                        self.events[from].push(event);
                        continue;
                    }
                    Action::CancelPending(_) => continue,
                };
                let sender = self.id(from);
                for to in targets {
                    self.air.push((from, to, frame.clone()));
                    let out = self.nodes[to].on_frame_received(sender, &frame);
                    queue.extend(out.into_iter().map(|a| (to, a)));
                }
            }
        }

        fn received(&self, i: usize) -> Vec<&ChatMessage> {
            self.events[i]
                .iter()
                .filter_map(|e| match e {
                    MeshEvent::MessageReceived(m) => Some(m),
                    _ => None,
                })
                .collect()
        }

        fn statuses(&self, i: usize, message_id: &str) -> Vec<&DeliveryStatus> {
            self.events[i]
                .iter()
                .filter_map(|e| match e {
                    MeshEvent::DeliveryStatusUpdated { message_id: id, status } if id == message_id => {
                        Some(status)
                    }
                    _ => None,
                })
                .collect()
        }
    }

    fn frames_of(actions: &[Action]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { frame, .. } | Action::Broadcast { frame, .. } => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    fn deliveries(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::Event(MeshEvent::MessageReceived(_))))
            .count()
    }

    #[test]
    fn relay_through_intermediate_decrements_ttl_once() {
        // a - c - b in a line.
        let mut mesh = Mesh::new(&["alice", "bob", "carol"], test_config());
        mesh.link(0, 2);
        mesh.link(2, 1);
        let bob = mesh.id(1);
        assert!(mesh.nodes[0].has_session(&bob));

        let (sent, actions) = mesh.nodes[0]
            .send_private_message("hi", bob, "bob")
            .unwrap();
        mesh.air.clear();
        mesh.run(0, actions);

        let msg_frames: Vec<(usize, usize, Packet)> = mesh
            .air
            .iter()
            .filter_map(|(f, t, frame)| {
                let p = wire::decode_packet(frame).ok()?;
                (p.message_type == MessageType::Message).then_some((*f, *t, p))
            })
            .collect();
        let a_to_c = msg_frames.iter().find(|(f, t, _)| (*f, *t) == (0, 2)).unwrap();
        let c_to_b = msg_frames.iter().find(|(f, t, _)| (*f, *t) == (2, 1)).unwrap();
        assert_eq!(a_to_c.2.ttl, 7);
        assert_eq!(c_to_b.2.ttl, 6);
        assert_eq!(a_to_c.2.message_id(), c_to_b.2.message_id());
        assert!(msg_frames.iter().all(|(f, _, _)| *f != 1), "recipient must not relay");

        let got = mesh.received(1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].content, "hi");
        assert!(got[0].is_private && got[0].is_relay);
        assert!(mesh.received(2).is_empty());
        assert!(matches!(
            mesh.statuses(0, &sent.id).last(),
            Some(DeliveryStatus::Delivered { to, .. }) if to == "bob"
        ));
    }

    #[test]
    fn two_paths_deliver_once() {
        let mut mesh = Mesh::new(&["alice", "bob", "carol"], test_config());
        mesh.link(0, 1);
        mesh.link(1, 2);
        mesh.link(0, 2);
        let (_, actions) = mesh.nodes[0].send_message("hello", vec![], None).unwrap();
        mesh.run(0, actions);
        assert_eq!(mesh.received(1).len(), 1);
        assert_eq!(mesh.received(2).len(), 1);
        assert!(mesh.received(0).is_empty());
    }

    #[test]
    fn same_frame_twice_is_one_delivery() {
        let mut mesh = Mesh::new(&["alice", "bob"], test_config());
        mesh.link(0, 1);
        let (_, actions) = mesh.nodes[0].send_message("once", vec![], None).unwrap();
        let frame = frames_of(&actions).remove(0);
        let alice = mesh.id(0);
        let first = mesh.nodes[1].on_frame_received(alice, &frame);
        let second = mesh.nodes[1].on_frame_received(alice, &frame);
        assert_eq!(deliveries(&first), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn offline_recipient_gets_cached_message_once() {
        let mut mesh = Mesh::new(&["alice", "bob"], test_config());
        mesh.link(0, 1);
        mesh.unlink(0, 1);
        let bob = mesh.id(1);

        let (sent, actions) = mesh.nodes[0]
            .send_private_message("are you there", bob, "bob")
            .unwrap();
        assert!(frames_of(&actions).is_empty());
        assert_eq!(sent.delivery_status, Some(DeliveryStatus::Sending));
        assert_eq!(mesh.nodes[0].stored_messages(), 1);

        mesh.clock.advance(60 * 60 * 1000);
        mesh.link(0, 1);
        let got = mesh
            .received(1)
            .iter()
            .filter(|m| m.content == "are you there")
            .count();
        assert_eq!(got, 1);
        assert_eq!(mesh.nodes[0].stored_messages(), 0);
        assert!(matches!(
            mesh.nodes[0].delivery_status(&sent.id),
            Some(DeliveryStatus::Delivered { .. })
        ));

        mesh.unlink(0, 1);
        mesh.link(0, 1);
        assert_eq!(mesh.received(1).len(), 1);
    }

    #[test]
    fn failed_send_is_replayed_on_reconnect() {
        let mut mesh = Mesh::new(&["alice", "bob"], test_config());
        mesh.link(0, 1);
        let bob = mesh.id(1);
        let (_, actions) = mesh.nodes[0]
            .send_private_message("lost in the air", bob, "bob")
            .unwrap();
        for frame in frames_of(&actions) {
            mesh.nodes[0].on_send_failed(bob, &frame);
        }
        assert_eq!(mesh.nodes[0].stored_messages(), 1);
        mesh.unlink(0, 1);
        mesh.clock.advance(10_000);
        mesh.link(0, 1);
        assert_eq!(mesh.received(1).len(), 1);
        assert_eq!(mesh.received(1)[0].content, "lost in the air");
    }

    #[test]
    fn failed_fragmented_broadcast_is_kept_whole() {
        let config = MeshConfig {
            max_frame_len: 160,
            ..test_config()
        };
        let mut mesh = Mesh::new(&["alice", "bob"], config);
        mesh.link(0, 1);
        let content = "y".repeat(600);
        let (_, actions) = mesh.nodes[0].send_message(&content, vec![], None).unwrap();
        let frames = frames_of(&actions);
        assert!(frames.len() > 1);
        for frame in &frames {
            mesh.nodes[0].on_broadcast_failed(frame);
        }
        assert_eq!(mesh.nodes[0].stored_messages(), 1);
        assert!(mesh.received(1).is_empty());

        mesh.unlink(0, 1);
        mesh.clock.advance(10_000);
        mesh.link(0, 1);
        let got = mesh.received(1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].content, content);
    }

    #[test]
    fn failed_unfragmented_broadcast_is_replayed() {
        let mut mesh = Mesh::new(&["alice", "bob"], test_config());
        mesh.link(0, 1);
        let (_, actions) = mesh.nodes[0].send_message("to everyone", vec![], None).unwrap();
        for frame in frames_of(&actions) {
            mesh.nodes[0].on_broadcast_failed(&frame);
        }
        assert_eq!(mesh.nodes[0].stored_messages(), 1);
        mesh.unlink(0, 1);
        mesh.link(0, 1);
        assert_eq!(mesh.received(1).len(), 1);
        assert_eq!(mesh.received(1)[0].content, "to everyone");
    }

    #[test]
    fn bad_signature_is_relayed_but_not_delivered() {
        let mut mesh = Mesh::new(&["alice", "bob", "carol"], test_config());
        mesh.link(0, 1);
        mesh.link(1, 2);
        let (_, actions) = mesh.nodes[0].send_message("forged?", vec![], None).unwrap();
        let mut packet = wire::decode_packet(&frames_of(&actions)[0]).unwrap();
        packet.signature = Some(vec![0u8; 64]);
        let forged = wire::encode_packet(&packet).unwrap();

        let alice = mesh.id(0);
        let out = mesh.nodes[1].on_frame_received(alice, &forged);
        assert!(!out
            .iter()
            .any(|a| matches!(a, Action::Event(MeshEvent::MessageReceived(_)))));
        let relayed: Vec<Packet> = frames_of(&out)
            .iter()
            .filter_map(|f| wire::decode_packet(f).ok())
            .filter(|p| p.message_id() == packet.message_id())
            .collect();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].ttl, packet.ttl - 1);
    }

    #[test]
    fn blocked_sender_is_not_delivered() {
        let mut mesh = Mesh::new(&["alice", "bob"], test_config());
        mesh.link(0, 1);
        let alice_fp = mesh.nodes[0].fingerprint();
        mesh.nodes[1].set_blocked(alice_fp, true);
        let (_, actions) = mesh.nodes[0].send_message("let me in", vec![], None).unwrap();
        mesh.run(0, actions);
        assert!(mesh.received(1).is_empty());
    }

    #[test]
    fn protected_channel_readable_only_with_password() {
        let mut mesh = Mesh::new(&["alice", "bob", "carol"], test_config());
        mesh.link(0, 1);
        mesh.link(0, 2);
        mesh.nodes[0].join_channel("#ops", None).unwrap();
        let actions = mesh.nodes[0].set_channel_password("#ops", "secret123").unwrap();
        mesh.run(0, actions);

        mesh.nodes[1].join_channel("#ops", Some("secret123")).unwrap();
        assert!(matches!(
            mesh.nodes[2].join_channel("#ops", Some("hunter2")),
            Err(CoreError::WrongPassword(_))
        ));

        let (sent, actions) = mesh.nodes[0]
            .send_message("meet at dawn", vec![], Some("#ops"))
            .unwrap();
        mesh.run(0, actions);

        let bob_got = mesh.received(1);
        assert_eq!(bob_got[0].content, "meet at dawn");
        assert!(!bob_got[0].is_encrypted);
        let carol_got = mesh.received(2);
        assert!(carol_got[0].is_encrypted);
        assert!(carol_got[0].content.is_empty());

        // Both members acked.
        assert!(matches!(
            mesh.statuses(0, &sent.id).last(),
            Some(DeliveryStatus::Delivered { .. })
        ));
    }

    #[test]
    fn oversized_message_fragments_and_reassembles() {
        let config = MeshConfig {
            max_frame_len: 160,
            ..test_config()
        };
        let mut mesh = Mesh::new(&["alice", "bob", "carol"], config);
        mesh.link(0, 1);
        mesh.link(1, 2);
        let content: String = "abcdefghij".repeat(60);
        let (_, actions) = mesh.nodes[0].send_message(&content, vec![], None).unwrap();
        assert!(frames_of(&actions).len() > 1);
        assert!(frames_of(&actions).iter().all(|f| f.len() <= 160));
        mesh.run(0, actions);
        assert_eq!(mesh.received(1).len(), 1);
        assert_eq!(mesh.received(1)[0].content, content);
        // Carol gets it through bob's relayed fragments.
        assert_eq!(mesh.received(2).len(), 1);
        assert_eq!(mesh.received(2)[0].content, content);
    }

    #[test]
    fn missing_fragment_never_delivers() {
        let config = MeshConfig {
            max_frame_len: 160,
            ..test_config()
        };
        let mut mesh = Mesh::new(&["alice", "bob"], config);
        mesh.link(0, 1);
        let content = "x".repeat(500);
        let (_, actions) = mesh.nodes[0].send_message(&content, vec![], None).unwrap();
        let frames = frames_of(&actions);
        let alice = mesh.id(0);
        for frame in frames.iter().skip(1) {
            let out = mesh.nodes[1].on_frame_received(alice, frame);
            mesh.run(1, out);
        }
        mesh.clock.advance(31_000);
        let out = mesh.nodes[1].tick();
        mesh.run(1, out);
        let out = mesh.nodes[1].on_frame_received(alice, &frames[0]);
        mesh.run(1, out);
        assert!(mesh.received(1).is_empty());
    }

    #[test]
    fn retries_back_off_then_fail() {
        let config = MeshConfig {
            ack_timeout_ms: 1_000,
            max_delivery_retries: 2,
            ..test_config()
        };
        let mut mesh = Mesh::new(&["alice", "bob"], config);
        mesh.link(0, 1);
        let bob = mesh.id(1);
        // Frames are never handed over, so no ack comes back.
        let (sent, _) = mesh.nodes[0]
            .send_private_message("echo?", bob, "bob")
            .unwrap();

        mesh.clock.advance(1_000);
        assert!(!frames_of(&mesh.nodes[0].tick()).is_empty());
        mesh.clock.advance(1_000);
        assert!(frames_of(&mesh.nodes[0].tick()).is_empty());
        mesh.clock.advance(1_000);
        assert!(!frames_of(&mesh.nodes[0].tick()).is_empty());
        mesh.clock.advance(4_000);
        let out = mesh.nodes[0].tick();
        assert!(out.iter().any(|a| matches!(
            a,
            Action::Event(MeshEvent::DeliveryStatusUpdated {
                status: DeliveryStatus::Failed { .. },
                ..
            })
        )));
        assert!(matches!(
            mesh.nodes[0].delivery_status(&sent.id),
            Some(DeliveryStatus::Failed { .. })
        ));
        mesh.clock.advance(10_000);
        assert!(frames_of(&mesh.nodes[0].tick()).is_empty());
    }

    #[test]
    fn silent_peer_goes_stale() {
        let mut mesh = Mesh::new(&["alice", "bob"], test_config());
        mesh.link(0, 1);
        let bob = mesh.id(1);
        assert_eq!(mesh.nodes[0].peers().len(), 1);
        mesh.clock.advance(180_001);
        let out = mesh.nodes[0].tick();
        assert!(out.contains(&Action::CancelPending(bob)));
        assert!(out.iter().any(|a| matches!(
            a,
            Action::Event(MeshEvent::PeerDisconnected { peer, nickname: Some(n) }) if *peer == bob && n == "bob"
        )));
        assert!(mesh.nodes[0].peers().is_empty());
        // The session record goes; keys stay, and the identity still resolves through them.
        assert!(mesh.nodes[0].has_session(&bob));
        assert_eq!(
            mesh.nodes[0].fingerprint_of(&bob),
            Some(mesh.nodes[1].fingerprint())
        );
    }

    #[test]
    fn cover_traffic_is_never_shown() {
        let config = MeshConfig {
            cover_traffic: true,
            cover_traffic_interval_ms: 1_000,
            ..test_config()
        };
        let mut mesh = Mesh::new(&["alice", "bob"], config);
        mesh.link(0, 1);
        mesh.clock.advance(1_000);
        let out = mesh.nodes[0].tick();
        assert!(!frames_of(&out).is_empty());
        mesh.run(0, out);
        assert!(mesh.received(1).is_empty());
        assert!(!mesh.events[0]
            .iter()
            .any(|e| matches!(e, MeshEvent::DeliveryAck(_))));
    }

    #[test]
    fn read_receipt_and_status_request() {
        let mut mesh = Mesh::new(&["alice", "bob"], test_config());
        mesh.link(0, 1);
        let bob = mesh.id(1);
        let (sent, actions) = mesh.nodes[0].send_private_message("ping", bob, "bob").unwrap();
        mesh.run(0, actions);
        let got = mesh.received(1)[0].clone();

        mesh.clock.advance(10);
        let actions = mesh.nodes[0].request_delivery_status(&sent.id, bob);
        mesh.run(0, actions);
        let acks = mesh.events[0]
            .iter()
            .filter(|e| matches!(e, MeshEvent::DeliveryAck(a) if a.original_message_id == sent.id))
            .count();
        assert_eq!(acks, 2);

        let actions = mesh.nodes[1].send_read_receipt(&got);
        mesh.run(1, actions);
        // Delivered is terminal: the receipt is reported but the status stays.
        assert!(mesh.events[0].iter().any(|e| matches!(
            e,
            MeshEvent::ReadReceipt(r) if r.original_message_id == sent.id && r.reader_nickname == "bob"
        )));
        assert!(matches!(
            mesh.nodes[0].delivery_status(&sent.id),
            Some(DeliveryStatus::Delivered { to, .. }) if to == "bob"
        ));
    }

    #[test]
    fn ack_counts_hops_taken_by_fragments() {
        // a - c - b in a line, with a frame budget that forces fragmentation.
        let config = MeshConfig {
            max_frame_len: 160,
            ..test_config()
        };
        let mut mesh = Mesh::new(&["alice", "bob", "carol"], config);
        mesh.link(0, 2);
        mesh.link(2, 1);
        let bob = mesh.id(1);
        assert!(mesh.nodes[0].has_session(&bob));

        let content = "x".repeat(300);
        let (sent, actions) = mesh.nodes[0]
            .send_private_message(&content, bob, "bob")
            .unwrap();
        assert!(frames_of(&actions).len() > 1);
        mesh.run(0, actions);
        assert_eq!(mesh.received(1).len(), 1);
        let ack = mesh.events[0]
            .iter()
            .find_map(|e| match e {
                MeshEvent::DeliveryAck(a) if a.original_message_id == sent.id => Some(a),
                _ => None,
            })
            .unwrap();
        assert_eq!(ack.hop_count, 1);
    }

    #[test]
    fn unknown_sender_flood_stays_within_peer_cap() {
        let config = MeshConfig {
            max_peers: 16,
            ..test_config()
        };
        let mut mesh = Mesh::new(&["alice", "bob"], config);
        mesh.link(0, 1);
        let bob = mesh.id(1);
        for i in 0..500u64 {
            let payload = encode_payload(&Announce {
                nickname: format!("ghost{i}"),
            })
            .unwrap();
            let packet = Packet::new(
                MessageType::Announce,
                PeerId::random(),
                None,
                1_000_000 + i,
                payload,
                0,
            );
            let frame = wire::encode_packet(&packet).unwrap();
            mesh.clock.advance(1);
            mesh.nodes[0].on_frame_received(bob, &frame);
        }
        let peers = mesh.nodes[0].peers();
        assert!(peers.len() <= 16);
        assert!(peers.iter().any(|p| p.peer_id == bob && p.connected));
    }

    #[test]
    fn private_message_needs_session() {
        let mut mesh = Mesh::new(&["alice"], test_config());
        let stranger = PeerId::random();
        assert!(matches!(
            mesh.nodes[0].send_private_message("hi", stranger, "?"),
            Err(CoreError::NoSessionKey(p)) if p == stranger
        ));
    }
}

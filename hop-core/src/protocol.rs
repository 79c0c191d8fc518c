//! HopChat wire protocol: packet types, packet frame, message ids and the
//! application payloads carried inside packets.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::delivery::DeliveryStatus;
use crate::identity::PeerId;

/// Current protocol version. Decoding rejects anything else.
pub const PROTOCOL_VERSION: u8 = 1;

/// Hop budget for flood relay.
pub const MAX_TTL: u8 = 7;

/// All packet types with their wire codes (0x01..=0x0C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Announce = 0x01,
    KeyExchange = 0x02,
    Leave = 0x03,
    Message = 0x04,
    FragmentStart = 0x05,
    FragmentContinue = 0x06,
    FragmentEnd = 0x07,
    ChannelAnnounce = 0x08,
    ChannelRetention = 0x09,
    DeliveryAck = 0x0A,
    DeliveryStatusRequest = 0x0B,
    ReadReceipt = 0x0C,
}

impl MessageType {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => MessageType::Announce,
            0x02 => MessageType::KeyExchange,
            0x03 => MessageType::Leave,
            0x04 => MessageType::Message,
            0x05 => MessageType::FragmentStart,
            0x06 => MessageType::FragmentContinue,
            0x07 => MessageType::FragmentEnd,
            0x08 => MessageType::ChannelAnnounce,
            0x09 => MessageType::ChannelRetention,
            0x0A => MessageType::DeliveryAck,
            0x0B => MessageType::DeliveryStatusRequest,
            0x0C => MessageType::ReadReceipt,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_fragment(self) -> bool {
        matches!(
            self,
            MessageType::FragmentStart | MessageType::FragmentContinue | MessageType::FragmentEnd
        )
    }
}

/// One wire frame. Only `ttl` changes after construction, and only via [`Packet::relayed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub message_type: MessageType,
    pub sender_id: PeerId,
    /// `None` and [`PeerId::BROADCAST`] both mean broadcast.
    pub recipient_id: Option<PeerId>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub payload: Vec<u8>,
    pub signature: Option<Vec<u8>>,
    pub ttl: u8,
}

impl Packet {
    pub fn new(
        message_type: MessageType,
        sender_id: PeerId,
        recipient_id: Option<PeerId>,
        timestamp: u64,
        payload: Vec<u8>,
        ttl: u8,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            sender_id,
            recipient_id,
            timestamp,
            payload,
            signature: None,
            ttl,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.map_or(true, |r| r.is_broadcast())
    }

    pub fn is_addressed_to(&self, peer: PeerId) -> bool {
        self.recipient_id == Some(peer)
    }

    /// Content-addressed id used for dedup and loop prevention.
    pub fn message_id(&self) -> MessageId {
        MessageId::compute(self.sender_id, self.timestamp, &self.payload)
    }

    /// Copy for the next hop with ttl decremented by one. `None` once ttl is exhausted.
    pub fn relayed(&self) -> Option<Packet> {
        if self.ttl == 0 {
            return None;
        }
        let mut next = self.clone();
        next.ttl -= 1;
        Some(next)
    }
}

/// 16-byte content-addressed token over sender, timestamp and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub fn compute(sender: PeerId, timestamp: u64, payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"hopchat-msgid-v1");
        hasher.update(sender.as_bytes());
        hasher.update(timestamp.to_be_bytes());
        hasher.update(payload);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        MessageId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Application-level chat message. Held in memory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: u64,
    pub is_relay: bool,
    pub original_sender: Option<String>,
    pub is_private: bool,
    pub recipient_nickname: Option<String>,
    pub sender_peer_id: Option<PeerId>,
    pub mentions: Option<Vec<String>>,
    pub channel: Option<String>,
    pub encrypted_content: Option<Vec<u8>>,
    pub is_encrypted: bool,
    pub delivery_status: Option<DeliveryStatus>,
}

impl ChatMessage {
    /// Build a message with a content-addressed id. Private messages start as `Sending`.
    pub fn new(
        sender: String,
        sender_peer_id: PeerId,
        content: String,
        timestamp: u64,
        is_private: bool,
    ) -> Self {
        let id = MessageId::compute(sender_peer_id, timestamp, content.as_bytes()).to_string();
        Self {
            id,
            sender,
            content,
            timestamp,
            is_relay: false,
            original_sender: None,
            is_private,
            recipient_nickname: None,
            sender_peer_id: Some(sender_peer_id),
            mentions: None,
            channel: None,
            encrypted_content: None,
            is_encrypted: false,
            delivery_status: is_private.then_some(DeliveryStatus::Sending),
        }
    }
}

/// `announce` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub nickname: String,
}

/// `keyExchange` payload: long-lived public keys of the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    pub agreement_key: [u8; 32],
    pub signing_key: [u8; 32],
}

/// `leave` payload. `None` means the peer is leaving the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leave {
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAnnounce {
    pub channel: String,
    pub is_protected: bool,
    pub creator_id: Option<PeerId>,
    pub key_commitment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRetention {
    pub channel: String,
    pub enabled: bool,
    pub creator_id: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub original_message_id: String,
    pub ack_id: String,
    pub recipient_id: PeerId,
    pub recipient_nickname: String,
    pub timestamp: u64,
    pub hop_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub original_message_id: String,
    pub receipt_id: String,
    pub reader_id: PeerId,
    pub reader_nickname: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatusRequest {
    pub message_id: String,
}

/// Encode an application payload (bincode).
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, PayloadError> {
    bincode::serialize(value).map_err(PayloadError)
}

/// Decode an application payload (bincode).
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    bincode::deserialize(bytes).map_err(PayloadError)
}

#[derive(Debug, thiserror::Error)]
#[error("payload codec error: {0}")]
pub struct PayloadError(#[from] bincode::Error);

//! HopChat mesh protocol engine.
//! Host-driven: no I/O; host passes link events and user operations and receives actions.

pub mod channel;
pub mod clock;
pub mod config;
pub mod core;
pub mod dedup;
pub mod delivery;
pub mod fragment;
pub mod identity;
pub mod keys;
pub mod padding;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod store;
pub mod wire;

pub use crate::core::{Action, CoreError, MeshCore, MeshEvent, PeerInfo};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MeshConfig;
pub use delivery::DeliveryStatus;
pub use identity::{Fingerprint, Identity, PeerId};
pub use protocol::{ChatMessage, MessageType, Packet, MAX_TTL, PROTOCOL_VERSION};
pub use wire::{decode_packet, encode_packet, FrameDecodeError, FrameEncodeError};

//! HopChat node: the async Mesh Service around `hop_core`, its collaborators, and a LAN
//! link layer for running a chat daemon without radio hardware.

pub mod config;
pub mod delegate;
pub mod service;
pub mod settings;
pub mod transport;
pub mod udp;

pub use config::NodeConfig;
pub use delegate::MeshDelegate;
pub use service::{Collaborators, MeshService, ServiceError};
pub use settings::{FileSettings, MemorySettings, Settings, SettingsStore};
pub use transport::{MemoryHub, Transport, TransportEvent};
pub use udp::UdpTransport;

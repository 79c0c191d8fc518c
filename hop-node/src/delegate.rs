//! Consumer-facing notifications. Calls are made from a dedicated task, never while the
//! core is locked, so a slow delegate cannot stall the mesh.

use hop_core::protocol::{ChannelAnnounce, ChannelRetention, DeliveryAck, ReadReceipt};
use hop_core::{ChatMessage, DeliveryStatus, Fingerprint, MeshEvent, PeerId, PeerInfo};

#[allow(unused_variables)]
pub trait MeshDelegate: Send + Sync + 'static {
    fn did_receive_message(&self, message: &ChatMessage) {}
    fn did_connect_to_peer(&self, peer: PeerId, nickname: &str) {}
    fn did_disconnect_from_peer(&self, peer: PeerId, nickname: Option<&str>) {}
    fn did_update_peer_list(&self, peers: &[PeerInfo]) {}
    fn did_receive_channel_leave(&self, channel: &str, peer: PeerId) {}
    fn did_receive_channel_announce(&self, announce: &ChannelAnnounce) {}
    fn did_receive_channel_retention(&self, retention: &ChannelRetention) {}
    fn did_receive_delivery_ack(&self, ack: &DeliveryAck) {}
    fn did_receive_read_receipt(&self, receipt: &ReadReceipt) {}
    fn did_update_delivery_status(&self, message_id: &str, status: &DeliveryStatus) {}

    /// Last chance to open a channel message the mesh could not decrypt.
    fn decrypt_channel_message(&self, channel: &str, ciphertext: &[u8]) -> Option<String> {
        None
    }

    /// Whether the consumer considers this identity a favorite.
    fn is_favorite(&self, fingerprint: &Fingerprint) -> bool {
        false
    }
}

/// Delegate that ignores everything.
pub struct NoopDelegate;

impl MeshDelegate for NoopDelegate {}

/// Route one event to the matching delegate call.
pub fn dispatch(delegate: &dyn MeshDelegate, event: MeshEvent) {
    match event {
        MeshEvent::MessageReceived(mut message) => {
            if message.is_encrypted {
                if let (Some(channel), Some(ciphertext)) =
                    (message.channel.as_deref(), message.encrypted_content.as_deref())
                {
                    if let Some(content) = delegate.decrypt_channel_message(channel, ciphertext) {
                        message.content = content;
                        message.encrypted_content = None;
                        message.is_encrypted = false;
                    }
                }
            }
            delegate.did_receive_message(&message);
        }
        MeshEvent::PeerConnected { peer, nickname } => delegate.did_connect_to_peer(peer, &nickname),
        MeshEvent::PeerDisconnected { peer, nickname } => {
            delegate.did_disconnect_from_peer(peer, nickname.as_deref())
        }
        MeshEvent::PeerListUpdated(peers) => delegate.did_update_peer_list(&peers),
        MeshEvent::ChannelLeave { channel, peer } => delegate.did_receive_channel_leave(&channel, peer),
        MeshEvent::ChannelAnnounced(announce) => delegate.did_receive_channel_announce(&announce),
        MeshEvent::ChannelRetention(retention) => delegate.did_receive_channel_retention(&retention),
        MeshEvent::DeliveryAck(ack) => delegate.did_receive_delivery_ack(&ack),
        MeshEvent::ReadReceipt(receipt) => delegate.did_receive_read_receipt(&receipt),
        MeshEvent::DeliveryStatusUpdated { message_id, status } => {
            delegate.did_update_delivery_status(&message_id, &status)
        }
    }
}

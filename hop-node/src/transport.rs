//! Link-layer collaborator: the service hands it frames and reads link events from a queue.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use hop_core::PeerId;
use tokio::sync::mpsc;

/// Something that happened on a link. Every link feeds the same queue, so the service
/// processes them one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Frame { from: PeerId, bytes: Vec<u8> },
    Rssi { peer: PeerId, rssi: i16 },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no link to peer {0}")]
    NotConnected(PeerId),
    #[error("frame of {len} bytes exceeds link limit {limit}")]
    FrameTooLarge { len: usize, limit: usize },
    #[error("link closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Sends never block; a failure is reported so the frame can be kept for later.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, peer: PeerId, frame: &[u8]) -> Result<(), TransportError>;
    fn broadcast(&self, frame: &[u8]) -> Result<(), TransportError>;
    /// Largest frame a link accepts.
    fn max_frame_len(&self) -> usize;
}

#[derive(Default)]
struct HubState {
    queues: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    links: HashSet<(PeerId, PeerId)>,
    failing: HashSet<PeerId>,
}

/// In-process radio: nodes join, links are switched on and off by hand.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    max_frame_len: usize,
}

impl MemoryHub {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            state: Arc::default(),
            max_frame_len,
        }
    }

    /// Register `peer` and return its transport plus its event queue.
    pub fn join(&self, peer: PeerId) -> (MemoryLink, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.queues.insert(peer, tx);
        }
        let link = MemoryLink {
            local: peer,
            hub: self.clone(),
        };
        (link, rx)
    }

    /// Bring up a link; both ends see `Connected`.
    pub fn connect(&self, a: PeerId, b: PeerId) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if !state.links.insert((a, b)) {
            return;
        }
        state.links.insert((b, a));
        notify(&state, a, TransportEvent::Connected(b));
        notify(&state, b, TransportEvent::Connected(a));
    }

    /// Take a link down; both ends see `Disconnected`.
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if !state.links.remove(&(a, b)) {
            return;
        }
        state.links.remove(&(b, a));
        notify(&state, a, TransportEvent::Disconnected(b));
        notify(&state, b, TransportEvent::Disconnected(a));
    }

    /// Make every send from `peer` fail while set.
    pub fn set_failing(&self, peer: PeerId, failing: bool) {
        if let Ok(mut state) = self.state.lock() {
            if failing {
                state.failing.insert(peer);
            } else {
                state.failing.remove(&peer);
            }
        }
    }
}

fn notify(state: &HubState, peer: PeerId, event: TransportEvent) {
    if let Some(queue) = state.queues.get(&peer) {
        let _ = queue.send(event);
    }
}

/// One node's handle on a [`MemoryHub`].
pub struct MemoryLink {
    local: PeerId,
    hub: MemoryHub,
}

impl MemoryLink {
    fn deliver(&self, to: PeerId, frame: &[u8]) -> Result<(), TransportError> {
        let state = self.hub.state.lock().map_err(|_| TransportError::Closed)?;
        if state.failing.contains(&self.local) || !state.links.contains(&(self.local, to)) {
            return Err(TransportError::NotConnected(to));
        }
        let queue = state.queues.get(&to).ok_or(TransportError::NotConnected(to))?;
        queue
            .send(TransportEvent::Frame {
                from: self.local,
                bytes: frame.to_vec(),
            })
            .map_err(|_| TransportError::Closed)
    }

    fn check_len(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.hub.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                limit: self.hub.max_frame_len,
            });
        }
        Ok(())
    }
}

impl Transport for MemoryLink {
    fn send(&self, peer: PeerId, frame: &[u8]) -> Result<(), TransportError> {
        self.check_len(frame)?;
        self.deliver(peer, frame)
    }

    fn broadcast(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.check_len(frame)?;
        let neighbours: Vec<PeerId> = {
            let state = self.hub.state.lock().map_err(|_| TransportError::Closed)?;
            if state.failing.contains(&self.local) {
                return Err(TransportError::Closed);
            }
            state
                .links
                .iter()
                .filter(|(from, _)| *from == self.local)
                .map(|(_, to)| *to)
                .collect()
        };
        for peer in neighbours {
            self.deliver(peer, frame)?;
        }
        Ok(())
    }

    fn max_frame_len(&self) -> usize {
        self.hub.max_frame_len
    }
}

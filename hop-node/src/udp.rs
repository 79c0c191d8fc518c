//! LAN stand-in for the radio: every node shares one UDP multicast group. Hello beacons
//! bring links up, silence takes them down, and frames carry an explicit target.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hop_core::PeerId;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::transport::{Transport, TransportError, TransportEvent};

const ENVELOPE_VERSION: u8 = 1;
const KIND_HELLO: u8 = 0x01;
const KIND_FRAME: u8 = 0x02;
/// version | kind | sender 8 | target 8
const ENVELOPE_HEADER: usize = 18;

const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

type Peers = Arc<Mutex<HashMap<PeerId, Instant>>>;

pub struct UdpTransport {
    local: PeerId,
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    peers: Peers,
    max_frame_len: usize,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpTransport {
    /// Join the group and start beaconing. Link events arrive on the returned queue.
    pub async fn bind(
        local: PeerId,
        group: Ipv4Addr,
        port: u16,
        max_frame_len: usize,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let socket = Arc::new(make_multicast_socket(group, port)?);
        let dest = SocketAddr::V4(SocketAddrV4::new(group, port));
        let peers: Peers = Arc::default();
        let (tx, rx) = mpsc::unbounded_channel();

        let beacon = tokio::spawn(beacon_loop(socket.clone(), local, dest));
        let recv = tokio::spawn(recv_loop(socket.clone(), local, peers.clone(), tx.clone()));
        let timeout = tokio::spawn(peer_timeout_loop(peers.clone(), tx));
        info!(%local, %dest, "udp link layer up");

        let transport = Self {
            local,
            socket,
            dest,
            peers,
            max_frame_len,
            tasks: vec![beacon, recv, timeout],
        };
        Ok((transport, rx))
    }

    fn emit(&self, target: PeerId, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                limit: self.max_frame_len,
            });
        }
        let datagram = envelope(KIND_FRAME, self.local, target, frame);
        self.socket.try_send_to(&datagram, self.dest)?;
        Ok(())
    }
}

impl Transport for UdpTransport {
    fn send(&self, peer: PeerId, frame: &[u8]) -> Result<(), TransportError> {
        let known = self
            .peers
            .lock()
            .map(|p| p.contains_key(&peer))
            .unwrap_or(false);
        if !known {
            return Err(TransportError::NotConnected(peer));
        }
        self.emit(peer, frame)
    }

    fn broadcast(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.emit(PeerId::BROADCAST, frame)
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn make_multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn envelope(kind: u8, sender: PeerId, target: PeerId, frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_HEADER + frame.len());
    out.push(ENVELOPE_VERSION);
    out.push(kind);
    out.extend_from_slice(sender.as_bytes());
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(frame);
    out
}

/// `(kind, sender, target, frame)` or `None` for anything that is not ours.
fn open_envelope(datagram: &[u8]) -> Option<(u8, PeerId, PeerId, &[u8])> {
    if datagram.len() < ENVELOPE_HEADER || datagram[0] != ENVELOPE_VERSION {
        return None;
    }
    let sender = PeerId::from_bytes(datagram[2..10].try_into().ok()?);
    let target = PeerId::from_bytes(datagram[10..18].try_into().ok()?);
    Some((datagram[1], sender, target, &datagram[ENVELOPE_HEADER..]))
}

async fn beacon_loop(socket: Arc<UdpSocket>, local: PeerId, dest: SocketAddr) {
    let hello = envelope(KIND_HELLO, local, PeerId::BROADCAST, &[]);
    loop {
        if let Err(e) = socket.send_to(&hello, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        // Spread beacons so nodes started together do not stay in lockstep.
        let spread = rand::thread_rng().gen_range(0..500);
        tokio::time::sleep(BEACON_INTERVAL + Duration::from_millis(spread)).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    local: PeerId,
    peers: Peers,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "udp receive failed");
                return;
            }
        };
        let Some((kind, sender, target, frame)) = open_envelope(&buf[..n]) else {
            trace!(%from, "foreign datagram ignored");
            continue;
        };
        if sender == local {
            continue;
        }
        let is_new = match peers.lock() {
            Ok(mut p) => p.insert(sender, Instant::now()).is_none(),
            Err(_) => return,
        };
        if is_new {
            debug!(peer = %sender, %from, "link up");
            let _ = events.send(TransportEvent::Connected(sender));
        }
        if kind == KIND_FRAME && (target == local || target.is_broadcast()) {
            let _ = events.send(TransportEvent::Frame {
                from: sender,
                bytes: frame.to_vec(),
            });
        }
    }
}

async fn peer_timeout_loop(peers: Peers, events: mpsc::UnboundedSender<TransportEvent>) {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let now = Instant::now();
        let timed_out: Vec<PeerId> = match peers.lock() {
            Ok(mut p) => {
                let list: Vec<PeerId> = p
                    .iter()
                    .filter(|(_, seen)| now.duration_since(**seen) >= PEER_TIMEOUT)
                    .map(|(id, _)| *id)
                    .collect();
                for id in &list {
                    p.remove(id);
                }
                list
            }
            Err(_) => return,
        };
        for peer in timed_out {
            debug!(%peer, "link timed out");
            let _ = events.send(TransportEvent::Disconnected(peer));
        }
    }
}

//! Mesh Service: the async host around `MeshCore`.
//!
//! One worker drains the link event queue, so inbound frames and link changes are applied
//! to the core one at a time. A second task runs housekeeping on a fixed period. Delayed
//! sends become abortable tasks keyed by target peer, and delegate notifications go through
//! their own queue so the core is never locked while consumer code runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hop_core::clock::{Clock, SystemClock};
use hop_core::{
    Action, ChatMessage, CoreError, DeliveryStatus, Fingerprint, Identity, MeshConfig, MeshCore,
    MeshEvent, PeerId, PeerInfo,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::delegate::{dispatch, MeshDelegate};
use crate::settings::{Settings, SettingsError, SettingsStore};
use crate::transport::{Transport, TransportEvent};

/// Wall-clock milliseconds that advance with the tokio timer, so paused-time tests see
/// timeouts fire.
pub struct TokioClock {
    origin: Instant,
    epoch_ms: u64,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            epoch_ms: SystemClock.now_ms(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as u64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("identity of peer {0} is not known")]
    UnknownPeer(PeerId),
}

/// Everything the service consumes from outside.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub links: mpsc::UnboundedReceiver<TransportEvent>,
    pub settings: Arc<dyn SettingsStore>,
    pub delegate: Arc<dyn MeshDelegate>,
}

type Pending = Arc<std::sync::Mutex<HashMap<Option<PeerId>, Vec<AbortHandle>>>>;

/// Carries out core actions against the transport.
#[derive(Clone)]
struct Outbox {
    core: Arc<Mutex<MeshCore>>,
    transport: Arc<dyn Transport>,
    pending: Pending,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl Outbox {
    async fn execute(&self, actions: Vec<Action>) {
        let mut failed = Vec::new();
        for action in actions {
            match action {
                Action::Send {
                    peer,
                    frame,
                    delay_ms: 0,
                } => {
                    if let Err(e) = self.transport.send(peer, &frame) {
                        warn!(%peer, error = %e, "send failed");
                        failed.push((Some(peer), frame));
                    }
                }
                Action::Broadcast { frame, delay_ms: 0 } => {
                    if let Err(e) = self.transport.broadcast(&frame) {
                        warn!(error = %e, "broadcast failed");
                        failed.push((None, frame));
                    }
                }
                Action::Send {
                    peer,
                    frame,
                    delay_ms,
                } => self.schedule(Some(peer), frame, delay_ms),
                Action::Broadcast { frame, delay_ms } => self.schedule(None, frame, delay_ms),
                Action::Event(event) => {
                    let _ = self.events.send(event);
                }
                Action::CancelPending(peer) => self.cancel(peer),
            }
        }
        if !failed.is_empty() {
            let mut core = self.core.lock().await;
            for (target, frame) in failed {
                match target {
                    Some(peer) => core.on_send_failed(peer, &frame),
                    None => core.on_broadcast_failed(&frame),
                }
            }
        }
    }

    fn schedule(&self, target: Option<PeerId>, frame: Vec<u8>, delay_ms: u64) {
        let outbox = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            outbox.send_now(target, frame).await;
        });
        if let Ok(mut pending) = self.pending.lock() {
            let handles = pending.entry(target).or_default();
            handles.retain(|h| !h.is_finished());
            handles.push(task.abort_handle());
        }
    }

    async fn send_now(&self, target: Option<PeerId>, frame: Vec<u8>) {
        match target {
            Some(peer) => {
                if let Err(e) = self.transport.send(peer, &frame) {
                    warn!(%peer, error = %e, "delayed send failed");
                    self.core.lock().await.on_send_failed(peer, &frame);
                }
            }
            None => {
                if let Err(e) = self.transport.broadcast(&frame) {
                    warn!(error = %e, "delayed broadcast failed");
                    self.core.lock().await.on_broadcast_failed(&frame);
                }
            }
        }
    }

    fn cancel(&self, peer: PeerId) {
        let handles = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&Some(peer)).unwrap_or_default(),
            Err(_) => return,
        };
        let live = handles.iter().filter(|h| !h.is_finished()).count();
        for handle in handles {
            handle.abort();
        }
        if live > 0 {
            debug!(%peer, live, "pending sends cancelled");
        }
    }

    fn cancel_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            for handle in pending.drain().flat_map(|(_, handles)| handles) {
                handle.abort();
            }
        }
    }
}

pub struct MeshService {
    core: Arc<Mutex<MeshCore>>,
    outbox: Outbox,
    settings: Arc<dyn SettingsStore>,
    saved: Mutex<Settings>,
    peer_id: PeerId,
    fingerprint: Fingerprint,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshService {
    /// Build the core from persisted settings and start the inbound, housekeeping and
    /// delegate tasks. Must be called inside a tokio runtime.
    pub async fn start(
        mut config: MeshConfig,
        identity: Identity,
        nickname: String,
        housekeeping: Duration,
        parts: Collaborators,
    ) -> Result<Self, ServiceError> {
        let Collaborators {
            transport,
            links,
            settings,
            delegate,
        } = parts;
        let saved = settings.load()?;
        config.max_frame_len = config.max_frame_len.min(transport.max_frame_len());
        let nickname = saved.nickname.clone().unwrap_or(nickname);
        let peer_id = identity.peer_id();
        let fingerprint = identity.fingerprint();

        let mut core = MeshCore::new(config, identity, nickname, Arc::new(TokioClock::new()));
        let mut startup = Vec::new();
        for fp in saved.favorite_fingerprints() {
            core.set_favorite(fp, true);
        }
        for fp in saved.blocked_fingerprints() {
            core.set_blocked(fp, true);
        }
        for (channel, password) in &saved.channel_passwords {
            if let Err(e) = core.join_channel(channel, Some(password.as_str())) {
                warn!(%channel, error = %e, "saved channel password not applied");
            }
        }
        for channel in &saved.retained_channels {
            match core.set_channel_retention(channel, true) {
                Ok(actions) => startup.extend(actions),
                Err(e) => debug!(%channel, error = %e, "saved retention not applied"),
            }
        }
        info!(peer = %peer_id, nickname = %core.nickname(), "mesh service starting");

        let core = Arc::new(Mutex::new(core));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let outbox = Outbox {
            core: core.clone(),
            transport,
            pending: Arc::default(),
            events: events_tx,
        };
        outbox.execute(startup).await;

        let tasks = vec![
            tokio::spawn(inbound_loop(core.clone(), outbox.clone(), links)),
            tokio::spawn(housekeeping_loop(core.clone(), outbox.clone(), housekeeping)),
            tokio::spawn(delegate_loop(core.clone(), delegate, events_rx)),
        ];
        Ok(Self {
            core,
            outbox,
            settings,
            saved: Mutex::new(saved),
            peer_id,
            fingerprint,
            tasks,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub async fn nickname(&self) -> String {
        self.core.lock().await.nickname().to_string()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.core.lock().await.peers()
    }

    pub async fn joined_channels(&self) -> Vec<String> {
        self.core.lock().await.channels().joined_channels()
    }

    pub async fn delivery_status(&self, message_id: &str) -> Option<DeliveryStatus> {
        self.core.lock().await.delivery_status(message_id).cloned()
    }

    pub async fn send_message(
        &self,
        content: &str,
        mentions: Vec<String>,
        channel: Option<&str>,
    ) -> Result<ChatMessage, ServiceError> {
        let (message, actions) = self
            .core
            .lock()
            .await
            .send_message(content, mentions, channel)?;
        self.outbox.execute(actions).await;
        Ok(message)
    }

    pub async fn send_private_message(
        &self,
        content: &str,
        recipient: PeerId,
    ) -> Result<ChatMessage, ServiceError> {
        let (message, actions) = {
            let mut core = self.core.lock().await;
            let nickname = core
                .peers()
                .into_iter()
                .find(|p| p.peer_id == recipient)
                .and_then(|p| p.nickname)
                .unwrap_or_default();
            core.send_private_message(content, recipient, &nickname)?
        };
        self.outbox.execute(actions).await;
        Ok(message)
    }

    pub async fn send_read_receipt(&self, message: &ChatMessage) {
        let actions = self.core.lock().await.send_read_receipt(message);
        self.outbox.execute(actions).await;
    }

    pub async fn request_delivery_status(&self, message_id: &str, peer: PeerId) {
        let actions = self
            .core
            .lock()
            .await
            .request_delivery_status(message_id, peer);
        self.outbox.execute(actions).await;
    }

    pub async fn set_nickname(&self, nickname: &str) -> Result<(), ServiceError> {
        let actions = self.core.lock().await.set_nickname(nickname);
        self.outbox.execute(actions).await;
        self.persist(|s| s.nickname = Some(nickname.to_string())).await
    }

    pub async fn join_channel(&self, name: &str, password: Option<&str>) -> Result<(), ServiceError> {
        self.core.lock().await.join_channel(name, password)?;
        match password {
            Some(pw) => {
                self.persist(|s| {
                    s.channel_passwords.insert(name.to_string(), pw.to_string());
                })
                .await
            }
            None => Ok(()),
        }
    }

    pub async fn leave_channel(&self, name: &str) -> Result<(), ServiceError> {
        let actions = self.core.lock().await.leave_channel(name);
        self.outbox.execute(actions).await;
        self.persist(|s| {
            s.channel_passwords.remove(name);
            s.set_retained(name, false);
        })
        .await
    }

    pub async fn set_channel_password(&self, name: &str, password: &str) -> Result<(), ServiceError> {
        let actions = self.core.lock().await.set_channel_password(name, password)?;
        self.outbox.execute(actions).await;
        self.persist(|s| {
            s.channel_passwords.insert(name.to_string(), password.to_string());
        })
        .await
    }

    pub async fn remove_channel_password(&self, name: &str) -> Result<(), ServiceError> {
        let actions = self.core.lock().await.remove_channel_password(name)?;
        self.outbox.execute(actions).await;
        self.persist(|s| {
            s.channel_passwords.remove(name);
        })
        .await
    }

    pub async fn set_channel_retention(&self, name: &str, enabled: bool) -> Result<(), ServiceError> {
        let actions = self.core.lock().await.set_channel_retention(name, enabled)?;
        self.outbox.execute(actions).await;
        self.persist(|s| s.set_retained(name, enabled)).await
    }

    pub async fn set_favorite(&self, peer: PeerId, favorite: bool) -> Result<(), ServiceError> {
        let (fingerprint, actions) = {
            let mut core = self.core.lock().await;
            let fingerprint = core
                .fingerprint_of(&peer)
                .ok_or(ServiceError::UnknownPeer(peer))?;
            let actions = core.set_favorite(fingerprint.clone(), favorite);
            (fingerprint, actions)
        };
        self.outbox.execute(actions).await;
        self.persist(|s| s.set_favorite(&fingerprint, favorite)).await
    }

    pub async fn set_blocked(&self, peer: PeerId, blocked: bool) -> Result<(), ServiceError> {
        let (fingerprint, actions) = {
            let mut core = self.core.lock().await;
            let fingerprint = core
                .fingerprint_of(&peer)
                .ok_or(ServiceError::UnknownPeer(peer))?;
            let actions = core.set_blocked(fingerprint.clone(), blocked);
            (fingerprint, actions)
        };
        self.outbox.execute(actions).await;
        self.persist(|s| s.set_blocked(&fingerprint, blocked)).await
    }

    /// Tell the mesh we are leaving, then stop every task and pending send.
    pub async fn shutdown(mut self) {
        let actions = self.core.lock().await.leave_mesh();
        self.outbox.execute(actions).await;
        self.stop();
        info!(peer = %self.peer_id, "mesh service stopped");
    }

    fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.outbox.cancel_all();
    }

    async fn persist(&self, change: impl FnOnce(&mut Settings)) -> Result<(), ServiceError> {
        let mut saved = self.saved.lock().await;
        change(&mut saved);
        self.settings.save(&saved)?;
        Ok(())
    }
}

impl Drop for MeshService {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn inbound_loop(
    core: Arc<Mutex<MeshCore>>,
    outbox: Outbox,
    mut links: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = links.recv().await {
        let actions = {
            let mut core = core.lock().await;
            match event {
                TransportEvent::Connected(peer) => core.on_link_connected(peer),
                TransportEvent::Disconnected(peer) => core.on_link_disconnected(peer),
                TransportEvent::Frame { from, bytes } => core.on_frame_received(from, &bytes),
                TransportEvent::Rssi { peer, rssi } => {
                    core.on_rssi(peer, rssi);
                    Vec::new()
                }
            }
        };
        outbox.execute(actions).await;
    }
    debug!("link event queue closed");
}

async fn housekeeping_loop(core: Arc<Mutex<MeshCore>>, outbox: Outbox, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let actions = core.lock().await.tick();
        outbox.execute(actions).await;
    }
}

async fn delegate_loop(
    core: Arc<Mutex<MeshCore>>,
    delegate: Arc<dyn MeshDelegate>,
    mut events: mpsc::UnboundedReceiver<MeshEvent>,
) {
    while let Some(event) = events.recv().await {
        let connected = match &event {
            MeshEvent::PeerConnected { peer, .. } => Some(*peer),
            _ => None,
        };
        dispatch(delegate.as_ref(), event);
        if let Some(peer) = connected {
            sync_favorite(&core, delegate.as_ref(), peer).await;
        }
    }
}

/// Ask the consumer whether a newly seen identity is a favorite.
async fn sync_favorite(core: &Mutex<MeshCore>, delegate: &dyn MeshDelegate, peer: PeerId) {
    let fingerprint = {
        let core = core.lock().await;
        if core.is_favorite(&peer) {
            return;
        }
        core.fingerprint_of(&peer)
    };
    let Some(fingerprint) = fingerprint else {
        return;
    };
    if delegate.is_favorite(&fingerprint) {
        core.lock().await.set_favorite(fingerprint, true);
    }
}

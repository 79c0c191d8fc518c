// HopChat node: line-oriented mesh chat over the LAN link layer.

use std::sync::Arc;

use anyhow::Context;
use hop_core::{ChatMessage, DeliveryStatus, Identity, PeerId, PeerInfo};
use hop_node::delegate::MeshDelegate;
use hop_node::settings::{FileSettings, MemorySettings, SettingsStore};
use hop_node::{Collaborators, MeshService, NodeConfig, UdpTransport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP: &str = "\
  <text>                  public message
  /c <#channel> <text>    channel message
  /msg <peer-id> <text>   private message
  /join <#channel> [pw]   join (and unlock) a channel
  /leave <#channel>       leave a channel
  /pass <#channel> <pw>   protect a channel you created
  /nick <name>            change nickname
  /fav <peer-id>          toggle favorite
  /block <peer-id>        block a peer
  /peers                  list peers
  /quit                   leave the mesh and exit";

struct Console;

impl MeshDelegate for Console {
    fn did_receive_message(&self, message: &ChatMessage) {
        let place = match (&message.channel, message.is_private) {
            (Some(channel), _) => channel.clone(),
            (None, true) => "private".to_string(),
            (None, false) => "mesh".to_string(),
        };
        if message.is_encrypted {
            println!("[{place}] <{}> (encrypted)", message.sender);
        } else {
            println!("[{place}] <{}> {}", message.sender, message.content);
        }
    }

    fn did_connect_to_peer(&self, peer: PeerId, nickname: &str) {
        println!("* {nickname} ({peer}) joined");
    }

    fn did_disconnect_from_peer(&self, peer: PeerId, nickname: Option<&str>) {
        println!("* {} ({peer}) left", nickname.unwrap_or("?"));
    }

    fn did_receive_channel_leave(&self, channel: &str, peer: PeerId) {
        println!("* {peer} left {channel}");
    }

    fn did_update_delivery_status(&self, message_id: &str, status: &DeliveryStatus) {
        match status {
            DeliveryStatus::Delivered { to, .. } => println!("  ✓ {message_id} delivered to {to}"),
            DeliveryStatus::Read { by, .. } => println!("  ✓✓ {message_id} read by {by}"),
            DeliveryStatus::Failed { reason } => println!("  ✗ {message_id}: {reason}"),
            _ => {}
        }
    }
}

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("hop-node {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hop_node=info,hop_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = hop_node::config::load().context("loading config")?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: NodeConfig) -> anyhow::Result<()> {
    let settings: Arc<dyn SettingsStore> = match &cfg.settings_path {
        Some(path) => Arc::new(FileSettings::new(path)),
        None => Arc::new(MemorySettings::default()),
    };
    let identity = load_identity(settings.as_ref())?;
    let peer_id = identity.peer_id();
    info!(peer = %peer_id, fingerprint = %identity.fingerprint(), "hop-node {}", VERSION);

    let (transport, links) =
        UdpTransport::bind(peer_id, cfg.multicast_group, cfg.port, cfg.mesh.max_frame_len)
            .await
            .context("binding udp link layer")?;
    let service = MeshService::start(
        cfg.mesh.clone(),
        identity,
        cfg.nickname.clone(),
        cfg.housekeeping_interval(),
        Collaborators {
            transport: Arc::new(transport),
            links,
            settings,
            delegate: Arc::new(Console),
        },
    )
    .await?;
    println!("you are {} ({peer_id}); /help for commands", service.nickname().await);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_line(&service, line.trim()).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = shutdown_signal() => break,
        }
    }
    service.shutdown().await;
    Ok(())
}

/// Long-lived keys from the store, or fresh ones saved for next time.
fn load_identity(settings: &dyn SettingsStore) -> anyhow::Result<Identity> {
    let mut saved = settings.load().context("loading settings")?;
    if let Some(identity) = saved.identity() {
        return Ok(identity);
    }
    let identity = Identity::generate();
    saved.set_identity(&identity);
    settings.save(&saved).context("saving identity")?;
    Ok(identity)
}

/// Returns `false` when the user asked to quit.
async fn handle_line(service: &MeshService, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    if !line.starts_with('/') {
        report(service.send_message(line, mentions(line), None).await.map(|_| ()));
        return true;
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "/quit" => return false,
        "/help" => println!("{HELP}"),
        "/peers" => print_peers(&service.peers().await),
        "/c" => match rest.split_once(' ') {
            Some((channel, text)) => report(
                service
                    .send_message(text, mentions(text), Some(channel))
                    .await
                    .map(|_| ()),
            ),
            None => println!("usage: /c <#channel> <text>"),
        },
        "/msg" => match rest.split_once(' ').and_then(|(p, t)| Some((PeerId::from_hex(p)?, t))) {
            Some((peer, text)) => report(service.send_private_message(text, peer).await.map(|_| ())),
            None => println!("usage: /msg <peer-id> <text>"),
        },
        "/join" => {
            let mut parts = rest.split_whitespace();
            match parts.next() {
                Some(channel) => report(service.join_channel(channel, parts.next()).await),
                None => println!("usage: /join <#channel> [password]"),
            }
        }
        "/leave" => report(service.leave_channel(rest).await),
        "/pass" => match rest.split_once(' ') {
            Some((channel, pw)) => report(service.set_channel_password(channel, pw.trim()).await),
            None => println!("usage: /pass <#channel> <password>"),
        },
        "/nick" if !rest.is_empty() => report(service.set_nickname(rest).await),
        "/fav" | "/block" => match PeerId::from_hex(rest) {
            Some(peer) if command == "/fav" => {
                let current = service
                    .peers()
                    .await
                    .iter()
                    .any(|p| p.peer_id == peer && p.is_favorite);
                report(service.set_favorite(peer, !current).await)
            }
            Some(peer) => report(service.set_blocked(peer, true).await),
            None => println!("usage: {command} <peer-id>"),
        },
        _ => println!("unknown command; /help"),
    }
    true
}

fn mentions(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter_map(|w| w.strip_prefix('@'))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn report<E: std::fmt::Display>(result: Result<(), E>) {
    if let Err(e) = result {
        println!("! {e}");
    }
}

fn print_peers(peers: &[PeerInfo]) {
    if peers.is_empty() {
        println!("no peers");
    }
    for p in peers {
        println!(
            "{} {:<16} {}{}{}",
            p.peer_id,
            p.nickname.as_deref().unwrap_or("?"),
            if p.connected { "direct" } else { "via mesh" },
            if p.is_favorite { " ★" } else { "" },
            p.rssi.map(|r| format!(" {r} dBm")).unwrap_or_default(),
        );
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

//! Succinct integration test harness.
//!
//! Everything runs in-process: an on-disk record store for the team leader,
//! the message queue over it, and a relay served on 127.0.0.1:0. Each test
//! works in its own temporary directory.

use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use succinct_core::{ChatMessage, PeerId, Team, TeamEvent, TeamMember};
use succinct_relay::{app, RelayState};
use succinct_services::{
    FileStore, Fragment, MessageQueue, Reassembler, RecordStore, RelayClient, SendStatus,
    Transport,
};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const EPOCH: i64 = 1_700_000_000_000;
pub const TEAM: PeerId = PeerId::from_bytes([0x7e; 4]);
pub const LEADER: PeerId = PeerId::from_bytes([0x01; 4]);

/// Fresh directory for one test.
pub fn temp_root(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "succinct-it-{}-{}",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Open (or reopen) the leader's store under `root`.
pub fn open_store(root: &std::path::Path) -> Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> =
        Arc::new(FileStore::open(root.join("store"), TEAM).context("failed to open store")?);
    Ok(store)
}

/// A store holding the team record and the leader's identity.
pub fn team_store(root: &std::path::Path) -> Result<Arc<dyn RecordStore>> {
    let store = open_store(root)?;
    store.append_record(
        TEAM,
        &Team {
            epoch: EPOCH,
            id: Some(TEAM),
            leader: LEADER,
            name: "field crew".into(),
        },
    )?;
    add_member(&store, LEADER, "leader")?;
    Ok(store)
}

pub fn add_member(store: &Arc<dyn RecordStore>, peer: PeerId, name: &str) -> Result<()> {
    store.append_record(
        peer,
        &TeamMember {
            employee_id: format!("emp-{name}"),
            name: name.into(),
        },
    )?;
    Ok(())
}

pub fn chat(store: &Arc<dyn RecordStore>, peer: PeerId, offset_ms: i64, text: &str) -> Result<()> {
    store.append_record(
        peer,
        &ChatMessage {
            time: EPOCH + offset_ms,
            message: text.into(),
        },
    )?;
    Ok(())
}

pub fn open_queue(
    root: &std::path::Path,
    store: &Arc<dyn RecordStore>,
    transports: Vec<Box<dyn Transport>>,
) -> Result<MessageQueue> {
    MessageQueue::open(store.clone(), &root.join("scratch"), LEADER, transports)?
        .context("leader did not get a queue")
}

/// Serve a relay on an ephemeral loopback port.
pub async fn spawn_relay() -> Result<(RelayState, RelayClient)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = RelayState::new();
    let router = app(state.clone());
    tokio::spawn(async move { axum::serve(listener, router).await });
    Ok((state, RelayClient::new(format!("http://{addr}"))))
}

/// A transport that is never reachable, so only the relay drains the log.
pub struct Offline;

impl Transport for Offline {
    fn name(&self) -> &str {
        "offline"
    }

    fn mtu(&self) -> u32 {
        200
    }

    fn check_available(&mut self) -> SendStatus {
        SendStatus::Unavailable
    }

    fn try_send(&mut self, _fragment: &Fragment) -> SendStatus {
        SendStatus::Unavailable
    }

    fn done(&mut self) {}
}

/// One datagram per fragment to a loopback socket.
pub struct LoopbackGateway {
    socket: UdpSocket,
    target: std::net::SocketAddr,
    mtu: u32,
}

impl LoopbackGateway {
    pub fn new(target: std::net::SocketAddr, mtu: u32) -> Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind("127.0.0.1:0")?,
            target,
            mtu,
        })
    }
}

impl Transport for LoopbackGateway {
    fn name(&self) -> &str {
        "loopback"
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn check_available(&mut self) -> SendStatus {
        SendStatus::Success
    }

    fn try_send(&mut self, fragment: &Fragment) -> SendStatus {
        match self.socket.send_to(&fragment.bytes, self.target) {
            Ok(_) => SendStatus::Success,
            Err(e) => SendStatus::Failed(e.to_string()),
        }
    }

    fn done(&mut self) {}
}

/// Decode fragments received in order.
pub fn decode_all<'a>(fragments: impl IntoIterator<Item = &'a [u8]>) -> Result<Vec<TeamEvent>> {
    let mut rx = Reassembler::new();
    let mut events = Vec::new();
    for fragment in fragments {
        for (kind, body) in rx.push(fragment)? {
            events.push(TeamEvent::decode(kind, &body, EPOCH)?);
        }
    }
    Ok(events)
}

pub fn chats(events: &[TeamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            TeamEvent::Chat { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

mod gateway;
mod recovery;
mod relay;

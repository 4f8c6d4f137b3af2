//! The queue worker.
//!
//! Everything that touches the message queue or the liveness tracker's
//! timers runs on this one task. Other tasks talk to it through
//! [`Command`]s. Two deadlines drive it: the debounced send pass and the
//! heartbeat alarm.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use succinct_core::heartbeat::{HeartbeatMessage, HeartbeatPacket};
use succinct_core::{PeerId, Team};
use succinct_services::liveness::SETTLE_DELAY;
use succinct_services::{
    Alarm, IpInterface, LivenessTracker, MessageQueue, RecordStore, RelayClient, Stream,
};

use crate::network::heartbeat::{flush_outbound, send_heartbeats};

#[derive(Debug)]
pub enum Command {
    /// Something may be ready to send.
    Wake,
    /// A local record changed; the store digest must be re-announced.
    StoreChanged,
    Packet {
        from: SocketAddr,
        packet: HeartbeatPacket,
    },
    InterfaceUp(IpInterface),
    InterfaceDown(String),
}

pub struct Worker {
    pub store: Option<Arc<dyn RecordStore>>,
    pub team: Option<Team>,
    pub queue: Option<MessageQueue>,
    pub relay: Option<RelayClient>,
    pub tracker: Arc<LivenessTracker>,
    pub socket: Arc<UdpSocket>,
    pub port: u16,
    pub heartbeat: Duration,
    pub debounce: Duration,
    pub commands: mpsc::Receiver<Command>,
    pub shutdown: broadcast::Receiver<()>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Worker {
    pub async fn run(mut self) -> Result<()> {
        let mut wake_at: Option<Instant> = None;
        let mut alarm_at: Option<Instant> = None;
        tracing::info!(
            leader = self.queue.is_some(),
            relay = self.relay.as_ref().map(|r| r.base_url().to_owned()),
            "queue worker starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("queue worker shutting down");
                    return Ok(());
                }

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    self.handle(command, &mut wake_at, &mut alarm_at).await;
                }

                _ = sleep_until(wake_at) => {
                    wake_at = None;
                    self.send_pass().await?;
                }

                _ = sleep_until(alarm_at) => {
                    alarm_at = None;
                    if self.tracker.has_interfaces() {
                        self.heartbeat().await;
                        alarm_at = Some(Instant::now() + self.heartbeat);
                    }
                }
            }
        }
    }

    async fn handle(
        &mut self,
        command: Command,
        wake_at: &mut Option<Instant>,
        alarm_at: &mut Option<Instant>,
    ) {
        let now = std::time::Instant::now();
        match command {
            Command::Wake => {
                // Rapid wakes collapse into one pass after the debounce.
                *wake_at = Some(Instant::now() + self.debounce);
            }
            Command::StoreChanged => {
                self.apply(Alarm::In(SETTLE_DELAY), alarm_at);
                *wake_at = Some(Instant::now() + self.debounce);
            }
            Command::Packet { from, packet } => {
                let heard = self.tracker.process_packet(from, &packet, now);
                if heard.new_peer {
                    tracing::info!(peer = %packet.sender, %from, "peer discovered");
                    self.apply(Alarm::In(SETTLE_DELAY), alarm_at);
                }
                if let Some(state) = &heard.store_state {
                    tracing::trace!(peer = %packet.sender, team = %state.team_id, "store state heard");
                }
                self.answer_team_requests(&packet, &heard.team_requests).await;
            }
            Command::InterfaceUp(interface) => {
                tracing::info!(
                    name = %interface.name,
                    address = %interface.address,
                    prefix_len = interface.prefix_len,
                    "interface up"
                );
                let alarm = self.tracker.add_interface(interface);
                self.apply(alarm, alarm_at);
                // A gateway may have become reachable.
                *wake_at = Some(Instant::now() + self.debounce);
            }
            Command::InterfaceDown(name) => {
                tracing::info!(%name, "interface down");
                let (alarm, evicted) = self.tracker.remove_interface(&name, now);
                self.apply(alarm, alarm_at);
                if !evicted.is_empty() {
                    tracing::info!(peers = evicted.len(), "peers lost with interface");
                }
            }
        }
    }

    fn apply(&self, alarm: Alarm, alarm_at: &mut Option<Instant>) {
        match alarm {
            Alarm::In(delay) if self.tracker.has_interfaces() => {
                *alarm_at = Some(Instant::now() + delay);
            }
            Alarm::In(_) | Alarm::Cancel => *alarm_at = None,
            Alarm::Unchanged => {}
        }
    }

    async fn answer_team_requests(&mut self, packet: &HeartbeatPacket, requests: &[PeerId]) {
        let Some(team) = &self.team else {
            return;
        };
        let mut queued = false;
        for id in requests {
            if team.id.as_ref() == Some(id) {
                queued |= self
                    .tracker
                    .queue_for(&packet.sender, HeartbeatMessage::Team(team.clone()));
            }
        }
        if queued {
            tracing::debug!(peer = %packet.sender, team = %team.name, "answering team request");
            flush_outbound(&self.socket, &self.tracker).await;
        }
    }

    async fn heartbeat(&mut self) {
        let now = std::time::Instant::now();
        let evicted = self.tracker.trim_dead(now);
        if !evicted.is_empty() {
            tracing::info!(peers = ?evicted, "stale peers evicted");
        }
        let state = self.store.as_ref().and_then(|store| store.state());
        send_heartbeats(&self.socket, &self.tracker, state.as_ref(), self.port, now).await;
    }

    async fn send_pass(&mut self) -> Result<()> {
        let Some(queue) = self.queue.as_mut() else {
            return Ok(());
        };
        if queue.watch_members().context("member watch failed")? {
            tracing::debug!("new members enrolled");
        }
        queue
            .wake(self.relay.as_ref())
            .await
            .context("send pass failed")?;
        Ok(())
    }
}

/// Forward local record changes to the worker. Fragment appends are the
/// worker's own output and are not forwarded.
pub async fn store_watch_loop(
    store: Arc<dyn RecordStore>,
    commands: mpsc::Sender<Command>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut changes = store.subscribe();
    loop {
        let command = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            change = changes.recv() => match change {
                Ok(key) if key.stream == Stream::Fragment => continue,
                Ok(key) => {
                    tracing::trace!(owner = %key.owner, stream = ?key.stream, "record appended");
                    Command::StoreChanged
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "store notifications lagged");
                    Command::StoreChanged
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        };
        if commands.send(command).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use succinct_core::ChatMessage;
    use succinct_services::{FileStore, Fragment, LogKey, SendStatus, Transport};

    use super::*;

    const EPOCH: i64 = 1_700_000_000_000;
    const ME: PeerId = PeerId::from_bytes([0x01; 4]);
    const TEAM: PeerId = PeerId::from_bytes([0x7e; 4]);

    fn temp_dir(tag: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "succinctd-worker-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn team_store() -> Arc<dyn RecordStore> {
        let store: Arc<dyn RecordStore> =
            Arc::new(FileStore::open(temp_dir("store"), TEAM).unwrap());
        store
            .append_record(
                TEAM,
                &Team {
                    epoch: EPOCH,
                    id: Some(TEAM),
                    leader: ME,
                    name: "crew".into(),
                },
            )
            .unwrap();
        store
    }

    fn wlan(name: &str, third_octet: u8) -> IpInterface {
        IpInterface {
            name: name.into(),
            address: Ipv4Addr::new(10, 0, third_octet, 2),
            broadcast: Ipv4Addr::new(10, 0, third_octet, 255),
            prefix_len: 24,
        }
    }

    /// Never ready; counts how often a send pass asked.
    struct Stalled(Arc<AtomicUsize>);

    impl Transport for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        fn mtu(&self) -> u32 {
            200
        }

        fn check_available(&mut self) -> SendStatus {
            self.0.fetch_add(1, Ordering::SeqCst);
            SendStatus::Unavailable
        }

        fn try_send(&mut self, _fragment: &Fragment) -> SendStatus {
            SendStatus::Unavailable
        }

        fn done(&mut self) {}
    }

    async fn worker(
        store: Option<Arc<dyn RecordStore>>,
        queue: Option<MessageQueue>,
    ) -> (Worker, mpsc::Sender<Command>, broadcast::Sender<()>) {
        let (command_tx, commands) = mpsc::channel(16);
        let (shutdown_tx, shutdown) = broadcast::channel(1);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let worker = Worker {
            store,
            team: None,
            queue,
            relay: None,
            tracker: Arc::new(LivenessTracker::new(ME, Duration::from_secs(15))),
            socket: Arc::new(socket),
            port: 0,
            heartbeat: Duration::from_secs(1),
            debounce: Duration::from_millis(100),
            commands,
            shutdown,
        };
        (worker, command_tx, shutdown_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_wakes_collapse_into_one_pass() {
        let store = team_store();
        let checks = Arc::new(AtomicUsize::new(0));
        let queue = MessageQueue::open(
            store.clone(),
            &temp_dir("scratch"),
            ME,
            vec![Box::new(Stalled(checks.clone()))],
        )
        .unwrap()
        .unwrap();
        let (worker, commands, _shutdown) = worker(Some(store), Some(queue)).await;
        let task = tokio::spawn(worker.run());

        for _ in 0..5 {
            commands.send(Command::Wake).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(checks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(checks.load(Ordering::SeqCst), 1);

        // a later wake gets its own pass
        commands.send(Command::Wake).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(checks.load(Ordering::SeqCst), 2);

        drop(commands);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_alarm_follows_interfaces() {
        let (mut worker, _commands, _shutdown) = worker(None, None).await;
        let (mut wake_at, mut alarm_at) = (None, None);

        worker
            .handle(Command::StoreChanged, &mut wake_at, &mut alarm_at)
            .await;
        assert_eq!(alarm_at, None, "no alarm without an interface");

        worker
            .handle(Command::InterfaceUp(wlan("wlan0", 1)), &mut wake_at, &mut alarm_at)
            .await;
        assert_eq!(alarm_at, Some(Instant::now() + SETTLE_DELAY));
        assert_eq!(wake_at, Some(Instant::now() + worker.debounce));

        worker
            .handle(Command::InterfaceUp(wlan("wlan1", 2)), &mut wake_at, &mut alarm_at)
            .await;
        let rescheduled = alarm_at;
        assert!(rescheduled.is_some());

        worker
            .handle(Command::InterfaceDown("wlan0".into()), &mut wake_at, &mut alarm_at)
            .await;
        assert_eq!(alarm_at, rescheduled, "one interface is still up");

        worker
            .handle(Command::InterfaceDown("wlan1".into()), &mut wake_at, &mut alarm_at)
            .await;
        assert_eq!(alarm_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn store_watch_ignores_fragment_appends() {
        let store = team_store();
        let (commands, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown) = broadcast::channel(1);
        let task = tokio::spawn(store_watch_loop(store.clone(), commands, shutdown));
        // let the loop subscribe
        tokio::time::sleep(Duration::from_millis(1)).await;

        let fragments = LogKey::new(TEAM, Stream::Fragment);
        store.append(&fragments, b"sealed fragment").unwrap();
        store
            .append_record(
                ME,
                &ChatMessage {
                    time: EPOCH + 1,
                    message: "hello".into(),
                },
            )
            .unwrap();
        store.append(&fragments, b"another fragment").unwrap();
        store.append(&fragments, b"and another").unwrap();

        let first = rx.recv().await;
        assert!(matches!(first, Some(Command::StoreChanged)));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(rx.try_recv().is_err(), "fragment appends are not forwarded");

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}

//! succinctd — Succinct store-and-forward daemon.
//!
//! Usage:
//!   succinctd [run]
//!   succinctd create-team <team_name> <employee_id> <member_name>
//!   succinctd join-team <team_id> <employee_id> <member_name>

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use succinct_core::config::SuccinctConfig;
use succinct_core::{PeerId, Team, TeamMember};
use succinct_services::{LivenessTracker, MessageQueue, RelayClient, Transport, Waker};

mod network;
mod team;
mod udp_transport;
mod worker;

use network::{interfaces, listener};
use udp_transport::UdpGateway;
use worker::{Command, Worker};

fn member_args(args: &[String]) -> Result<(&str, TeamMember)> {
    let [first, employee_id, name] = args else {
        bail!("expected <name|team_id> <employee_id> <member_name>");
    };
    Ok((
        first.as_str(),
        TeamMember {
            employee_id: employee_id.clone(),
            name: name.clone(),
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = SuccinctConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SuccinctConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SuccinctConfig::default()
    });

    let me = PeerId::load_or_generate(&config.identity.peer_id_path)
        .context("failed to load peer id")?;
    let root = config.storage.root.clone();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("create-team") => {
            let (name, member) = member_args(&args[1..])?;
            let team = team::create_team(&root, me, name, member)?;
            if let Some(id) = team.id {
                println!("{id}");
            }
            return Ok(());
        }
        Some("join-team") => {
            let (id, member) = member_args(&args[1..])?;
            let id: PeerId = id.parse().context("invalid team id")?;
            team::join_team(&root, me, id, member)?;
            return Ok(());
        }
        Some("run") | None => {}
        Some(other) => bail!("unknown command {other:?}; expected run, create-team or join-team"),
    }

    tracing::info!(peer = %me, storage = %root.display(), "succinctd starting");
    run(config, me).await
}

async fn run(config: SuccinctConfig, me: PeerId) -> Result<()> {
    let root = config.storage.root.clone();
    let port = config.network.port;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let (command_tx, command_rx) = mpsc::channel::<Command>(256);

    // Liveness
    let tracker = {
        let wake = command_tx.clone();
        Arc::new(
            LivenessTracker::new(me, Duration::from_millis(config.network.stale_after_ms))
                .on_evict(move |peer| {
                    tracing::debug!(%peer, "peer evicted");
                    let _ = wake.try_send(Command::Wake);
                }),
        )
    };

    let socket = Arc::new(
        UdpSocket::from_std(network::bind_heartbeat_socket(port)?)
            .context("failed to register heartbeat socket")?,
    );

    // Team and queue
    let (store, team, queue) = match team::current_team(&root)? {
        None => {
            tracing::info!("not in a team; heartbeats only");
            (None, None, None)
        }
        Some(team_id) => {
            let store = team::open_store(&root, team_id)
                .with_context(|| format!("failed to open store for team {team_id}"))?;
            let team = store.last_record::<Team>(team_id)?;
            let waker = {
                let wake = command_tx.clone();
                Waker::new(move || {
                    let _ = wake.try_send(Command::Wake);
                })
            };
            let transports = config
                .transports
                .iter()
                .map(|t| {
                    UdpGateway::from_config(t, tracker.clone(), waker.clone())
                        .map(|g| Box::new(g) as Box<dyn Transport>)
                })
                .collect::<Result<Vec<_>>>()?;
            let queue = MessageQueue::open(
                store.clone(),
                &team::team_dir(&root, &team_id),
                me,
                transports,
            )
            .context("failed to start message queue")?;
            tracing::info!(team = %team_id, leader = queue.is_some(), "team loaded");
            (Some(store), team, queue)
        }
    };

    let relay = config.relay.base_url.as_deref().map(RelayClient::new);

    // Tasks
    let listener_task = tokio::spawn(listener::listener_loop(
        socket.clone(),
        port,
        command_tx.clone(),
        shutdown_tx.subscribe(),
    ));

    let interface_task = tokio::spawn(interfaces::watch_loop(
        Duration::from_millis(config.network.interface_poll_ms),
        config.network.wireless_only,
        command_tx.clone(),
        shutdown_tx.subscribe(),
    ));

    let store_task = store.clone().map(|store| {
        tokio::spawn(worker::store_watch_loop(
            store,
            command_tx.clone(),
            shutdown_tx.subscribe(),
        ))
    });

    let worker_task = tokio::spawn(
        Worker {
            store,
            team,
            queue,
            relay,
            tracker,
            socket,
            port,
            heartbeat: Duration::from_millis(config.network.heartbeat_ms),
            debounce: Duration::from_millis(config.queue.debounce_ms),
            commands: command_rx,
            shutdown: shutdown_tx.subscribe(),
        }
        .run(),
    );

    // First pass picks up whatever is already stored.
    command_tx.send(Command::Wake).await.ok();

    let store_task = async move {
        match store_task {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = listener_task       => tracing::error!("listener exited: {:?}", r),
        r = interface_task      => tracing::error!("interface watcher exited: {:?}", r),
        r = store_task          => tracing::error!("store watcher exited: {:?}", r),
        r = worker_task         => {
            r.context("queue worker panicked")??;
            tracing::error!("queue worker exited");
        }
    }

    Ok(())
}

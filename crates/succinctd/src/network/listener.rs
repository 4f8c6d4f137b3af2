use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use succinct_core::heartbeat::{HeartbeatPacket, HEARTBEAT_MTU};

use crate::worker::Command;

/// Receive heartbeats and forward them to the worker.
///
/// Datagrams from any source port other than the heartbeat port are not
/// heartbeats and are dropped.
pub async fn listener_loop(
    socket: Arc<UdpSocket>,
    port: u16,
    commands: mpsc::Sender<Command>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; HEARTBEAT_MTU * 2];
    tracing::info!(port, "heartbeat listener starting");

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(error = %e, "heartbeat recv_from failed");
                    continue;
                }
            },
        };

        if from.port() != port {
            tracing::trace!(%from, "ignoring datagram from foreign port");
            continue;
        }

        let packet = match HeartbeatPacket::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(%from, error = %e, "undecodable heartbeat");
                continue;
            }
        };

        if commands.send(Command::Packet { from, packet }).await.is_err() {
            return Ok(());
        }
    }
}

use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::UdpSocket;

use succinct_core::heartbeat::HeartbeatPacket;
use succinct_core::StoreState;
use succinct_services::LivenessTracker;

async fn send(socket: &UdpSocket, addr: SocketAddr, packet: &HeartbeatPacket) {
    if let Err(e) = socket.send_to(&packet.encode(), addr).await {
        tracing::warn!(%addr, error = %e, "heartbeat send failed");
    }
}

/// One heartbeat round: the broadcast summary on every interface, then
/// unicasts to peers not yet hearing our broadcasts, then anything queued.
pub async fn send_heartbeats(
    socket: &UdpSocket,
    tracker: &LivenessTracker,
    state: Option<&StoreState>,
    port: u16,
    now: Instant,
) {
    let packet = tracker.broadcast_packet(state, now);
    for addr in tracker.broadcast_addresses(port) {
        send(socket, addr, &packet).await;
    }

    let unicasts = tracker.unicast_packets(state, now);
    if !unicasts.is_empty() {
        tracing::debug!(peers = unicasts.len(), "sending unicast heartbeats");
    }
    for (addr, packet) in unicasts {
        send(socket, addr, &packet).await;
    }

    flush_outbound(socket, tracker).await;
}

/// Send every peer's queued messages.
pub async fn flush_outbound(socket: &UdpSocket, tracker: &LivenessTracker) {
    for (addr, packet) in tracker.take_outbound() {
        send(socket, addr, &packet).await;
    }
}

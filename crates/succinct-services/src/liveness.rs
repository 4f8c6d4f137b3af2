//! Peer and link liveness.
//!
//! Every heartbeat received creates or refreshes a link: one per
//! (peer, source address). A link is alive while either its broadcast or
//! its unicast channel has been heard within the staleness window; a peer is
//! alive while it has at least one live link.
//!
//! Shared between the UDP listener and the heartbeat timer, keyed on PeerId.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use succinct_core::heartbeat::{
    HeartbeatMessage, HeartbeatPacket, LinkAck, HEARTBEAT_MTU, LINK_ACK_LEN,
};
use succinct_core::id::PEER_ID_LEN;
use succinct_core::{PeerId, StoreState, Team};

/// Delay before the first heartbeat after something changed, giving the
/// kernel time to finish bringing an interface up.
pub const SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Frame header plus Header body.
const HEADER_FRAME_LEN: usize = 3 + PEER_ID_LEN + 1;
const FRAME_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpInterface {
    pub name: String,
    pub address: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub prefix_len: u8,
}

impl IpInterface {
    /// Whether `addr` is on this interface's subnet.
    pub fn contains(&self, addr: &Ipv4Addr) -> bool {
        let mask = match self.prefix_len {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n.min(32))),
        };
        u32::from(self.address) & mask == u32::from(*addr) & mask
    }
}

/// What to do with the heartbeat timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
    In(Duration),
    Cancel,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct PeerLink {
    pub interface: String,
    pub addr: SocketAddr,
    pub last_heard_broadcast: Option<Instant>,
    pub last_heard_unicast: Option<Instant>,
    /// What the peer last told us it hears from us over this link.
    pub acked_broadcast: bool,
    pub acked_unicast: bool,
    pub last_ack_time: Option<Instant>,
}

impl PeerLink {
    fn new(interface: String, addr: SocketAddr) -> Self {
        Self {
            interface,
            addr,
            last_heard_broadcast: None,
            last_heard_unicast: None,
            acked_broadcast: false,
            acked_unicast: false,
            last_ack_time: None,
        }
    }

    pub fn heard_broadcast(&self, now: Instant, stale_after: Duration) -> bool {
        recent(self.last_heard_broadcast, now, stale_after)
    }

    pub fn heard_unicast(&self, now: Instant, stale_after: Duration) -> bool {
        recent(self.last_heard_unicast, now, stale_after)
    }

    pub fn is_dead(&self, now: Instant, stale_after: Duration) -> bool {
        !self.heard_broadcast(now, stale_after) && !self.heard_unicast(now, stale_after)
    }

    /// The peer recently confirmed it receives our broadcasts on this link.
    pub fn they_acked_broadcast(&self, now: Instant, stale_after: Duration) -> bool {
        self.acked_broadcast && recent(self.last_ack_time, now, stale_after)
    }

    fn last_heard(&self) -> Option<Instant> {
        self.last_heard_broadcast.max(self.last_heard_unicast)
    }
}

fn recent(at: Option<Instant>, now: Instant, stale_after: Duration) -> bool {
    at.is_some_and(|t| now.saturating_duration_since(t) < stale_after)
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub links: HashMap<SocketAddr, PeerLink>,
    /// Messages waiting for the next unicast to this peer.
    outbound: Vec<HeartbeatMessage>,
}

impl Peer {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            links: HashMap::new(),
            outbound: Vec::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.links.is_empty()
    }

    /// The most recently heard link.
    fn best_link(&self) -> Option<&PeerLink> {
        self.links.values().max_by_key(|l| l.last_heard())
    }

    fn queue(&mut self, message: HeartbeatMessage) {
        if !self.outbound.contains(&message) {
            self.outbound.push(message);
        }
    }
}

/// Side effects of one received heartbeat the caller must act on.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Heard {
    pub new_peer: bool,
    /// Teams the sender asked us to describe.
    pub team_requests: Vec<PeerId>,
    pub store_state: Option<StoreState>,
}

type EvictHook = Box<dyn Fn(&PeerId) + Send + Sync>;

pub struct LivenessTracker {
    me: PeerId,
    stale_after: Duration,
    interfaces: DashMap<String, IpInterface>,
    peers: DashMap<PeerId, Peer>,
    known_teams: DashMap<PeerId, Team>,
    on_evict: Option<EvictHook>,
}

impl LivenessTracker {
    pub fn new(me: PeerId, stale_after: Duration) -> Self {
        Self {
            me,
            stale_after,
            interfaces: DashMap::new(),
            peers: DashMap::new(),
            known_teams: DashMap::new(),
            on_evict: None,
        }
    }

    /// Called with every evicted peer.
    pub fn on_evict(mut self, hook: impl Fn(&PeerId) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Box::new(hook));
        self
    }

    pub fn me(&self) -> PeerId {
        self.me
    }

    // ── Interfaces ────────────────────────────────────────────────────────────

    pub fn add_interface(&self, interface: IpInterface) -> Alarm {
        if self.interfaces.get(&interface.name).as_deref() == Some(&interface) {
            return Alarm::Unchanged;
        }
        tracing::info!(
            interface = %interface.name,
            address = %interface.address,
            prefix = interface.prefix_len,
            "interface up"
        );
        self.interfaces.insert(interface.name.clone(), interface);
        Alarm::In(SETTLE_DELAY)
    }

    /// Drop an interface and every link that ran over it. Returns the timer
    /// change and any peers evicted as a result.
    pub fn remove_interface(&self, name: &str, now: Instant) -> (Alarm, Vec<PeerId>) {
        if self.interfaces.remove(name).is_none() {
            return (Alarm::Unchanged, Vec::new());
        }
        tracing::info!(interface = name, "interface down");
        let alarm = if self.interfaces.is_empty() {
            Alarm::Cancel
        } else {
            Alarm::Unchanged
        };
        (alarm, self.trim_dead(now))
    }

    pub fn has_interfaces(&self) -> bool {
        !self.interfaces.is_empty()
    }

    pub fn interface_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.interfaces.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Local interface whose subnet holds `addr`.
    pub fn interface_for(&self, addr: &Ipv4Addr) -> Option<String> {
        self.interfaces
            .iter()
            .find(|e| e.value().contains(addr))
            .map(|e| e.key().clone())
    }

    pub fn broadcast_addresses(&self, port: u16) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .interfaces
            .iter()
            .map(|e| SocketAddr::V4(SocketAddrV4::new(e.value().broadcast, port)))
            .collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    // ── Receive ───────────────────────────────────────────────────────────────

    pub fn process_packet(&self, from: SocketAddr, packet: &HeartbeatPacket, now: Instant) -> Heard {
        let mut heard = Heard::default();
        if packet.sender == self.me {
            return heard;
        }
        let SocketAddr::V4(v4) = from else {
            tracing::debug!(%from, "ignoring non-IPv4 heartbeat");
            return heard;
        };
        let Some(interface) = self.interface_for(v4.ip()) else {
            tracing::debug!(%from, "heartbeat from outside every local subnet");
            return heard;
        };

        let mut peer = self.peers.entry(packet.sender).or_insert_with(|| {
            heard.new_peer = true;
            tracing::info!(peer = %packet.sender, %from, "new peer");
            Peer::new(packet.sender)
        });
        let link = peer.links.entry(from).or_insert_with(|| {
            tracing::debug!(peer = %packet.sender, %from, "new peer link");
            PeerLink::new(interface, from)
        });
        if packet.unicast {
            link.last_heard_unicast = Some(now);
        } else {
            link.last_heard_broadcast = Some(now);
        }

        for message in &packet.messages {
            match message {
                HeartbeatMessage::Ack(links) => {
                    for ack in links.iter().filter(|a| a.peer_id == self.me) {
                        link.last_ack_time = Some(now);
                        link.acked_unicast = ack.unicast;
                        link.acked_broadcast = ack.broadcast;
                    }
                }
                HeartbeatMessage::StoreState(state) => {
                    heard.store_state = Some(state.clone());
                }
                HeartbeatMessage::Team(team) => {
                    if let Some(id) = team.id {
                        tracing::debug!(team = %id, name = %team.name, "team announced");
                        self.known_teams.insert(id, team.clone());
                    }
                }
                HeartbeatMessage::RequestTeam(id) => heard.team_requests.push(*id),
            }
        }

        if let Some(state) = &heard.store_state {
            if !self.known_teams.contains_key(&state.team_id) {
                tracing::debug!(team = %state.team_id, peer = %packet.sender, "asking about unknown team");
                peer.queue(HeartbeatMessage::RequestTeam(state.team_id));
            }
        }
        heard
    }

    // ── Eviction ──────────────────────────────────────────────────────────────

    /// Drop dead links and links on vanished interfaces, then every peer left
    /// without a link. Returns the evicted peers.
    pub fn trim_dead(&self, now: Instant) -> Vec<PeerId> {
        for mut peer in self.peers.iter_mut() {
            let id = peer.id;
            peer.links.retain(|addr, link| {
                let keep = self.interfaces.contains_key(&link.interface)
                    && !link.is_dead(now, self.stale_after);
                if !keep {
                    tracing::debug!(peer = %id, %addr, "dead peer link");
                }
                keep
            });
        }

        let dead: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| !p.is_alive())
            .map(|p| p.id)
            .collect();
        for id in &dead {
            self.peers.remove(id);
            tracing::info!(peer = %id, "peer evicted");
            if let Some(hook) = &self.on_evict {
                hook(id);
            }
        }
        dead
    }

    // ── Send ──────────────────────────────────────────────────────────────────

    fn ack(&self, peer: &Peer, link: &PeerLink, now: Instant) -> LinkAck {
        LinkAck {
            peer_id: peer.id,
            unicast: link.heard_unicast(now, self.stale_after),
            broadcast: link.heard_broadcast(now, self.stale_after),
        }
    }

    /// The heartbeat sent to every broadcast address: one ack entry per
    /// tracked link, as many as fit in a datagram.
    pub fn broadcast_packet(&self, state: Option<&StoreState>, now: Instant) -> HeartbeatPacket {
        let mut packet = HeartbeatPacket::new(self.me, false);

        let state_len = state.map_or(0, |s| FRAME_LEN + PEER_ID_LEN + s.root_hash.len());
        let room = HEARTBEAT_MTU.saturating_sub(HEADER_FRAME_LEN + FRAME_LEN + state_len);
        let mut acks = Vec::new();
        for peer in self.peers.iter() {
            for link in peer.links.values() {
                acks.push(self.ack(&peer, link, now));
            }
        }
        if acks.len() * LINK_ACK_LEN > room {
            tracing::debug!(links = acks.len(), "ack summary truncated");
            acks.truncate(room / LINK_ACK_LEN);
        }
        if !acks.is_empty() {
            packet.messages.push(HeartbeatMessage::Ack(acks));
        }
        if let Some(state) = state {
            packet.messages.push(HeartbeatMessage::StoreState(state.clone()));
        }
        packet
    }

    /// Unicast heartbeats for peers that have not confirmed hearing our
    /// broadcasts on any link, sent over their most recently heard link.
    pub fn unicast_packets(
        &self,
        state: Option<&StoreState>,
        now: Instant,
    ) -> Vec<(SocketAddr, HeartbeatPacket)> {
        let mut out = Vec::new();
        for peer in self.peers.iter() {
            if peer
                .links
                .values()
                .any(|l| l.they_acked_broadcast(now, self.stale_after))
            {
                continue;
            }
            let Some(link) = peer.best_link() else {
                continue;
            };
            let mut packet = HeartbeatPacket::new(self.me, true);
            packet
                .messages
                .push(HeartbeatMessage::Ack(vec![self.ack(&peer, link, now)]));
            if let Some(state) = state {
                packet.messages.push(HeartbeatMessage::StoreState(state.clone()));
            }
            out.push((link.addr, packet));
        }
        out
    }

    /// Queue a message for the peer's next unicast. False if the peer is
    /// not tracked.
    pub fn queue_for(&self, peer: &PeerId, message: HeartbeatMessage) -> bool {
        match self.peers.get_mut(peer) {
            Some(mut p) => {
                p.queue(message);
                true
            }
            None => false,
        }
    }

    /// Drain every peer's outbound queue into one unicast packet each.
    pub fn take_outbound(&self) -> Vec<(SocketAddr, HeartbeatPacket)> {
        let mut out = Vec::new();
        for mut peer in self.peers.iter_mut() {
            if peer.outbound.is_empty() {
                continue;
            }
            let Some(addr) = peer.best_link().map(|l| l.addr) else {
                continue;
            };
            let mut packet = HeartbeatPacket::new(self.me, true);
            packet.messages = std::mem::take(&mut peer.outbound);
            out.push((addr, packet));
        }
        out
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.iter().map(|p| p.id).collect();
        ids.sort();
        ids
    }

    pub fn peer(&self, id: &PeerId) -> Option<Peer> {
        self.peers.get(id).map(|p| p.clone())
    }

    pub fn is_alive(&self, id: &PeerId) -> bool {
        self.peers.get(id).is_some_and(|p| p.is_alive())
    }

    pub fn known_teams(&self) -> Vec<Team> {
        self.known_teams.iter().map(|e| e.value().clone()).collect()
    }

    pub fn remember_team(&self, team: Team) {
        if let Some(id) = team.id {
            self.known_teams.insert(id, team);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const STALE: Duration = Duration::from_secs(15);

    fn me() -> PeerId {
        PeerId::from_bytes([1; 4])
    }

    fn them() -> PeerId {
        PeerId::from_bytes([2; 4])
    }

    fn wlan() -> IpInterface {
        IpInterface {
            name: "wlan0".into(),
            address: Ipv4Addr::new(192, 168, 4, 10),
            broadcast: Ipv4Addr::new(192, 168, 4, 255),
            prefix_len: 24,
        }
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([192, 168, 4, last], 4043))
    }

    fn tracker() -> LivenessTracker {
        let t = LivenessTracker::new(me(), STALE);
        t.add_interface(wlan());
        t
    }

    fn state() -> StoreState {
        StoreState {
            team_id: PeerId::from_bytes([9; 4]),
            root_hash: vec![7; 32],
        }
    }

    #[test]
    fn subnet_membership() {
        let i = wlan();
        assert!(i.contains(&Ipv4Addr::new(192, 168, 4, 200)));
        assert!(!i.contains(&Ipv4Addr::new(192, 168, 5, 1)));
    }

    #[test]
    fn interface_changes_reschedule() {
        let t = LivenessTracker::new(me(), STALE);
        assert_eq!(t.add_interface(wlan()), Alarm::In(SETTLE_DELAY));
        assert_eq!(t.add_interface(wlan()), Alarm::Unchanged);
        let (alarm, evicted) = t.remove_interface("wlan0", Instant::now());
        assert_eq!(alarm, Alarm::Cancel);
        assert!(evicted.is_empty());
        assert!(!t.has_interfaces());
    }

    #[test]
    fn first_packet_creates_peer_and_link() {
        let t = tracker();
        let now = Instant::now();
        let heard = t.process_packet(addr(20), &HeartbeatPacket::new(them(), false), now);
        assert!(heard.new_peer);
        let again = t.process_packet(addr(20), &HeartbeatPacket::new(them(), true), now);
        assert!(!again.new_peer);

        let peer = t.peer(&them()).unwrap();
        let link = &peer.links[&addr(20)];
        assert!(link.heard_broadcast(now, STALE));
        assert!(link.heard_unicast(now, STALE));
    }

    #[test]
    fn own_and_foreign_packets_are_ignored() {
        let t = tracker();
        let now = Instant::now();
        t.process_packet(addr(10), &HeartbeatPacket::new(me(), false), now);
        t.process_packet(
            SocketAddr::from(([10, 0, 0, 1], 4043)),
            &HeartbeatPacket::new(them(), false),
            now,
        );
        assert!(t.peer_ids().is_empty());
    }

    #[test]
    fn acks_addressed_to_me_update_the_link() {
        let t = tracker();
        let now = Instant::now();
        let mut packet = HeartbeatPacket::new(them(), false);
        packet.messages.push(HeartbeatMessage::Ack(vec![
            LinkAck {
                peer_id: PeerId::from_bytes([3; 4]),
                unicast: true,
                broadcast: false,
            },
            LinkAck {
                peer_id: me(),
                unicast: false,
                broadcast: true,
            },
        ]));
        t.process_packet(addr(20), &packet, now);

        let link = t.peer(&them()).unwrap().links[&addr(20)].clone();
        assert!(link.acked_broadcast);
        assert!(!link.acked_unicast);
        assert!(link.they_acked_broadcast(now, STALE));
        assert!(!link.they_acked_broadcast(now + STALE, STALE));
    }

    #[test]
    fn dead_links_and_peers_are_evicted() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        let t = LivenessTracker::new(me(), STALE).on_evict(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        t.add_interface(wlan());

        let start = Instant::now();
        t.process_packet(addr(20), &HeartbeatPacket::new(them(), false), start);
        t.process_packet(addr(21), &HeartbeatPacket::new(them(), true), start + Duration::from_secs(10));

        // first link stale, second still fresh
        assert!(t.trim_dead(start + Duration::from_secs(16)).is_empty());
        assert_eq!(t.peer(&them()).unwrap().links.len(), 1);

        let evicted = t.trim_dead(start + Duration::from_secs(26));
        assert_eq!(evicted, vec![them()]);
        assert!(!t.is_alive(&them()));
        assert_eq!(evictions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn removing_the_interface_evicts_its_peers() {
        let t = tracker();
        let now = Instant::now();
        t.process_packet(addr(20), &HeartbeatPacket::new(them(), false), now);
        let (_, evicted) = t.remove_interface("wlan0", now);
        assert_eq!(evicted, vec![them()]);
    }

    #[test]
    fn broadcast_packet_acks_every_link() {
        let t = tracker();
        let now = Instant::now();
        t.process_packet(addr(20), &HeartbeatPacket::new(them(), false), now);
        let packet = t.broadcast_packet(Some(&state()), now);

        assert!(!packet.unicast);
        assert_eq!(
            packet.ack_for(&them()),
            Some(LinkAck {
                peer_id: them(),
                unicast: false,
                broadcast: true,
            })
        );
        assert!(packet
            .messages
            .contains(&HeartbeatMessage::StoreState(state())));
        assert_eq!(t.broadcast_addresses(4043), vec![SocketAddr::from(([192, 168, 4, 255], 4043))]);
    }

    #[test]
    fn broadcast_packet_fits_the_datagram_limit() {
        let t = tracker();
        let now = Instant::now();
        for n in 0..400u16 {
            let id = PeerId::from_bytes([0x10, (n >> 8) as u8, n as u8, 0]);
            t.process_packet(addr(20), &HeartbeatPacket::new(id, false), now);
        }
        let encoded = t.broadcast_packet(Some(&state()), now).encode();
        assert!(encoded.len() <= HEARTBEAT_MTU);
    }

    #[test]
    fn unicast_until_broadcast_is_acked() {
        let t = tracker();
        let now = Instant::now();
        t.process_packet(addr(20), &HeartbeatPacket::new(them(), false), now);
        let unicasts = t.unicast_packets(None, now);
        assert_eq!(unicasts.len(), 1);
        assert_eq!(unicasts[0].0, addr(20));
        assert!(unicasts[0].1.unicast);

        let mut acked = HeartbeatPacket::new(them(), false);
        acked.messages.push(HeartbeatMessage::Ack(vec![LinkAck {
            peer_id: me(),
            unicast: false,
            broadcast: true,
        }]));
        t.process_packet(addr(20), &acked, now);
        assert!(t.unicast_packets(None, now).is_empty());
    }

    #[test]
    fn unknown_team_state_queues_a_request() {
        let t = tracker();
        let now = Instant::now();
        let mut packet = HeartbeatPacket::new(them(), false);
        packet.messages.push(HeartbeatMessage::StoreState(state()));
        let heard = t.process_packet(addr(20), &packet, now);
        assert_eq!(heard.store_state, Some(state()));
        // repeated state does not queue twice
        t.process_packet(addr(20), &packet, now);

        let outbound = t.take_outbound();
        assert_eq!(outbound.len(), 1);
        assert_eq!(
            outbound[0].1.messages,
            vec![HeartbeatMessage::RequestTeam(state().team_id)]
        );
        assert!(t.take_outbound().is_empty());

        t.remember_team(Team {
            epoch: 1,
            id: Some(state().team_id),
            leader: them(),
            name: "crew".into(),
        });
        t.process_packet(addr(20), &packet, now);
        assert!(t.take_outbound().is_empty());
        assert_eq!(t.known_teams().len(), 1);
    }
}

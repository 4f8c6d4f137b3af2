//! Heartbeat packet format.
//!
//! One UDP datagram per heartbeat:
//!
//! ```text
//! Header{ peer_id, unicast } | Ack? | StoreState? | ...
//! ```
//!
//! Every message is framed `[type: u8][len: u16 BE][body]`, so receivers
//! can skip message types they do not understand.

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::codec::{BodyReader, BodyWriter};
use crate::id::{PeerId, PEER_ID_LEN};
use crate::team::{StoreState, Team};
use crate::wire::WireError;

/// UDP port heartbeats are sent from and to.
pub const HEARTBEAT_PORT: u16 = 4043;

/// Default heartbeat interval in milliseconds.
pub const HEARTBEAT_MS: u64 = 5000;

/// Largest heartbeat datagram built or accepted.
pub const HEARTBEAT_MTU: usize = 1400;

const TYPE_HEADER: u8 = 0;
const TYPE_ACK: u8 = 1;
const TYPE_STORE_STATE: u8 = 2;
const TYPE_TEAM: u8 = 3;
const TYPE_REQUEST_TEAM: u8 = 4;

// ── Fixed-layout bodies ───────────────────────────────────────────────────────

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct Frame {
    kind: u8,
    length: U16<BigEndian>,
}

assert_eq_size!(Frame, [u8; 3]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct HeaderBody {
    peer_id: [u8; PEER_ID_LEN],
    unicast: u8,
}

assert_eq_size!(HeaderBody, [u8; 5]);

/// One entry of an Ack message: what the sender has heard from `peer_id`
/// over the link the packet travels on.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct LinkAckEntry {
    peer_id: [u8; PEER_ID_LEN],
    /// bit 0: unicast heard, bit 1: broadcast heard
    flags: u8,
}

/// Encoded size of one ack entry.
pub const LINK_ACK_LEN: usize = 5;

assert_eq_size!(LinkAckEntry, [u8; LINK_ACK_LEN]);

const FLAG_UNICAST: u8 = 0x01;
const FLAG_BROADCAST: u8 = 0x02;

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAck {
    pub peer_id: PeerId,
    pub unicast: bool,
    pub broadcast: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatMessage {
    Ack(Vec<LinkAck>),
    StoreState(StoreState),
    /// Announcement of a team the sender knows about. `team.id` is always set.
    Team(Team),
    RequestTeam(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPacket {
    pub sender: PeerId,
    pub unicast: bool,
    pub messages: Vec<HeartbeatMessage>,
}

impl HeartbeatPacket {
    pub fn new(sender: PeerId, unicast: bool) -> Self {
        Self {
            sender,
            unicast,
            messages: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEARTBEAT_MTU);
        let header = HeaderBody {
            peer_id: *self.sender.as_bytes(),
            unicast: u8::from(self.unicast),
        };
        put_frame(&mut buf, TYPE_HEADER, header.as_bytes());

        for message in &self.messages {
            match message {
                HeartbeatMessage::Ack(links) => {
                    let mut body = Vec::with_capacity(links.len() * LINK_ACK_LEN);
                    for link in links {
                        let mut flags = 0;
                        if link.unicast {
                            flags |= FLAG_UNICAST;
                        }
                        if link.broadcast {
                            flags |= FLAG_BROADCAST;
                        }
                        let entry = LinkAckEntry {
                            peer_id: *link.peer_id.as_bytes(),
                            flags,
                        };
                        body.extend_from_slice(entry.as_bytes());
                    }
                    put_frame(&mut buf, TYPE_ACK, &body);
                }
                HeartbeatMessage::StoreState(state) => {
                    let mut body = Vec::with_capacity(PEER_ID_LEN + state.root_hash.len());
                    body.extend_from_slice(state.team_id.as_bytes());
                    body.extend_from_slice(&state.root_hash);
                    put_frame(&mut buf, TYPE_STORE_STATE, &body);
                }
                HeartbeatMessage::Team(team) => {
                    let Some(id) = team.id else { continue };
                    let mut w = BodyWriter::new();
                    w.put_raw_long(team.epoch)
                        .put_bytes(id.as_bytes())
                        .put_bytes(team.leader.as_bytes())
                        .put_string(&team.name);
                    put_frame(&mut buf, TYPE_TEAM, &w.finish());
                }
                HeartbeatMessage::RequestTeam(team) => {
                    put_frame(&mut buf, TYPE_REQUEST_TEAM, team.as_bytes());
                }
            }
        }
        buf.to_vec()
    }

    /// Parse a datagram. The first message must be a header; anything after
    /// a truncated frame is ignored, unknown message types are skipped.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let mut rest = datagram;
        let (kind, body) = next_frame(&mut rest)?.ok_or(WireError::MissingHeader)?;
        if kind != TYPE_HEADER {
            return Err(WireError::MissingHeader);
        }
        let header = HeaderBody::read_from_prefix(body).ok_or(WireError::Truncated {
            needed: 5,
            got: body.len(),
        })?;

        let mut packet = HeartbeatPacket::new(PeerId::from_bytes(header.peer_id), header.unicast != 0);

        while let Ok(Some((kind, body))) = next_frame(&mut rest) {
            match parse_message(kind, body) {
                Ok(message) => packet.messages.push(message),
                Err(WireError::UnknownHeartbeatType(_)) => continue,
                Err(_) => break,
            }
        }
        Ok(packet)
    }

    /// The ack entries addressed to `me`, if any.
    pub fn ack_for(&self, me: &PeerId) -> Option<LinkAck> {
        self.messages.iter().find_map(|m| match m {
            HeartbeatMessage::Ack(links) => links.iter().find(|l| l.peer_id == *me).copied(),
            _ => None,
        })
    }
}

fn put_frame(buf: &mut BytesMut, kind: u8, body: &[u8]) {
    let frame = Frame {
        kind,
        length: U16::new(body.len() as u16),
    };
    buf.put_slice(frame.as_bytes());
    buf.put_slice(body);
}

fn next_frame<'a>(rest: &mut &'a [u8]) -> Result<Option<(u8, &'a [u8])>, WireError> {
    if rest.is_empty() {
        return Ok(None);
    }
    let frame = Frame::read_from_prefix(rest).ok_or(WireError::Truncated {
        needed: 3,
        got: rest.len(),
    })?;
    let len = frame.length.get() as usize;
    let body = rest.get(3..3 + len).ok_or(WireError::Truncated {
        needed: 3 + len,
        got: rest.len(),
    })?;
    *rest = &rest[3 + len..];
    Ok(Some((frame.kind, body)))
}

fn parse_message(kind: u8, body: &[u8]) -> Result<HeartbeatMessage, WireError> {
    match kind {
        TYPE_ACK => {
            let links = body
                .chunks_exact(LINK_ACK_LEN)
                .filter_map(LinkAckEntry::read_from)
                .map(|e| LinkAck {
                    peer_id: PeerId::from_bytes(e.peer_id),
                    unicast: e.flags & FLAG_UNICAST != 0,
                    broadcast: e.flags & FLAG_BROADCAST != 0,
                })
                .collect();
            Ok(HeartbeatMessage::Ack(links))
        }
        TYPE_STORE_STATE => {
            let team_id = PeerId::from_slice(body).ok_or(WireError::Truncated {
                needed: PEER_ID_LEN,
                got: body.len(),
            })?;
            Ok(HeartbeatMessage::StoreState(StoreState {
                team_id,
                root_hash: body[PEER_ID_LEN..].to_vec(),
            }))
        }
        TYPE_TEAM => {
            let mut r = BodyReader::new(body);
            let epoch = r.get_raw_long()?;
            let mut id = [0u8; PEER_ID_LEN];
            let mut leader = [0u8; PEER_ID_LEN];
            for b in id.iter_mut().chain(leader.iter_mut()) {
                *b = r.get_byte()?;
            }
            Ok(HeartbeatMessage::Team(Team {
                epoch,
                id: Some(PeerId::from_bytes(id)),
                leader: PeerId::from_bytes(leader),
                name: r.get_string()?,
            }))
        }
        TYPE_REQUEST_TEAM => {
            let team = PeerId::from_slice(body).ok_or(WireError::Truncated {
                needed: PEER_ID_LEN,
                got: body.len(),
            })?;
            Ok(HeartbeatMessage::RequestTeam(team))
        }
        other => Err(WireError::UnknownHeartbeatType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> PeerId {
        PeerId::from_bytes([b; 4])
    }

    #[test]
    fn header_comes_first_on_the_wire() {
        let bytes = HeartbeatPacket::new(id(7), true).encode();
        assert_eq!(bytes, vec![0, 0, 5, 7, 7, 7, 7, 1]);
    }

    #[test]
    fn decode_recovers_acks_and_state() {
        let mut packet = HeartbeatPacket::new(id(1), false);
        packet.messages.push(HeartbeatMessage::Ack(vec![
            LinkAck {
                peer_id: id(2),
                unicast: false,
                broadcast: true,
            },
            LinkAck {
                peer_id: id(3),
                unicast: true,
                broadcast: true,
            },
        ]));
        packet.messages.push(HeartbeatMessage::StoreState(StoreState {
            team_id: id(9),
            root_hash: vec![0xab; 32],
        }));

        let back = HeartbeatPacket::decode(&packet.encode()).unwrap();
        assert_eq!(back, packet);

        let mine = back.ack_for(&id(3)).unwrap();
        assert!(mine.unicast && mine.broadcast);
        assert!(back.ack_for(&id(4)).is_none());
    }

    #[test]
    fn unknown_message_types_are_skipped() {
        let mut bytes = HeartbeatPacket::new(id(1), false).encode();
        bytes.extend_from_slice(&[0x7f, 0, 2, 0xaa, 0xbb]);
        bytes.extend_from_slice(&[TYPE_REQUEST_TEAM, 0, 4, 5, 5, 5, 5]);

        let packet = HeartbeatPacket::decode(&bytes).unwrap();
        assert_eq!(packet.messages, vec![HeartbeatMessage::RequestTeam(id(5))]);
    }

    #[test]
    fn missing_header_is_rejected() {
        let bytes = [TYPE_ACK, 0, 0];
        assert_eq!(
            HeartbeatPacket::decode(&bytes).unwrap_err(),
            WireError::MissingHeader
        );
        assert_eq!(
            HeartbeatPacket::decode(&[]).unwrap_err(),
            WireError::MissingHeader
        );
    }

    #[test]
    fn truncated_trailer_keeps_earlier_messages() {
        let mut packet = HeartbeatPacket::new(id(1), false);
        packet.messages.push(HeartbeatMessage::RequestTeam(id(8)));
        let mut bytes = packet.encode();
        bytes.extend_from_slice(&[TYPE_ACK, 0, 10, 1]);

        let back = HeartbeatPacket::decode(&bytes).unwrap();
        assert_eq!(back.messages, vec![HeartbeatMessage::RequestTeam(id(8))]);
    }
}

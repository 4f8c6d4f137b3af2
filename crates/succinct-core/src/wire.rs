//! Fragment wire format.
//!
//! A fragment is what every transport carries:
//!
//! ```text
//! [team id: 4][seq: u32 BE][hint: u8][message pieces ...]
//! ```
//!
//! A message piece that starts a logical message carries a 3-byte header
//! (`type`, `u16 BE total length`); continuation pieces carry none. The hint
//! is 0 when the fragment starts with a message header, otherwise the length
//! of the leading continuation piece plus one, capped at 255.
//!
//! Every size here is part of the protocol. Changing anything is a breaking
//! change for receivers and relays.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::id::{PeerId, PEER_ID_LEN};

// ── Fragment Header ──────────────────────────────────────────────────────────

/// Leading bytes of every sealed fragment.
///
/// Wire size: 9 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FragmentHeader {
    /// Team the fragment stream belongs to.
    pub team: [u8; PEER_ID_LEN],

    /// Monotonic, gapless sequence number within the team.
    pub seq: U32<BigEndian>,

    /// First-piece-length hint used by receivers to resynchronise.
    pub hint: u8,
}

assert_eq_size!(FragmentHeader, [u8; 9]);

impl FragmentHeader {
    pub fn new(team: PeerId, seq: u32, hint: u8) -> Self {
        Self {
            team: *team.as_bytes(),
            seq: U32::new(seq),
            hint,
        }
    }

    /// Parse the header from the front of a fragment.
    pub fn parse(fragment: &[u8]) -> Result<Self, WireError> {
        Self::read_from_prefix(fragment).ok_or(WireError::Truncated {
            needed: FRAGMENT_HEADER_LEN,
            got: fragment.len(),
        })
    }

    pub fn team_id(&self) -> PeerId {
        PeerId::from_bytes(self.team)
    }

    pub fn seq(&self) -> u32 {
        self.seq.get()
    }
}

/// Header written at the start of every logical message.
///
/// Wire size: 3 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct MessageHeader {
    pub kind: u8,
    pub length: U16<BigEndian>,
}

assert_eq_size!(MessageHeader, [u8; 3]);

// ── Message Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    CreateTeam = 0,
    DestroyTeam = 1,
    Enroll = 2,
    Leave = 3,
    Location = 4,
    Message = 5,
    Form = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::CreateTeam),
            1 => Ok(MessageType::DestroyTeam),
            2 => Ok(MessageType::Enroll),
            3 => Ok(MessageType::Leave),
            4 => Ok(MessageType::Location),
            5 => Ok(MessageType::Message),
            6 => Ok(MessageType::Form),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

pub const FRAGMENT_HEADER_LEN: usize = 9;

/// Offset of the hint byte within a fragment.
pub const HINT_OFFSET: usize = PEER_ID_LEN + 4;

pub const MESSAGE_HEADER_LEN: usize = 3;

/// Largest piece that may be written without sealing the fragment after it.
pub const MAX_UNCUT_PIECE: usize = 254;

/// Largest hint value. Also means "the leading continuation may fill the fragment".
pub const MAX_HINT: u8 = 255;

/// Largest message body the 16-bit length field can describe.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

/// Effective MTUs are rounded down to a multiple of this.
pub const MTU_GRANULARITY: u32 = 50;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("unknown heartbeat message type: {0}")]
    UnknownHeartbeatType(u8),

    #[error("message length {0} exceeds maximum {}", MAX_MESSAGE_LEN)]
    MessageTooLarge(usize),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("varint overflows 64 bits")]
    VarintOverflow,

    #[error("heartbeat packet does not start with a header")]
    MissingHeader,
}

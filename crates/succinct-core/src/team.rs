//! Team records: the append-only events the queue forwards.
//!
//! Times are milliseconds since the Unix epoch. On the wire they are sent
//! relative to `Team::epoch` to keep them small.

use serde::{Deserialize, Serialize};

use crate::id::PeerId;

/// Team creation or destruction. `id == None` marks the team as destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    /// Logical creation time; base for every time delta sent for this team.
    pub epoch: i64,
    pub id: Option<PeerId>,
    pub leader: PeerId,
    pub name: String,
}

impl Team {
    pub fn is_destroyed(&self) -> bool {
        self.id.is_none()
    }
}

/// One enrollment or leave event. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub peer_id: PeerId,
    pub time: i64,
    pub enroll: bool,
}

/// Identity a member publishes about themselves. The last record wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub employee_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub time: i64,
    pub message: String,
}

/// A completed form, already compressed by the form codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSubmission {
    pub time: i64,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub time: i64,
    /// Micro-degrees.
    pub latitude: i32,
    /// Micro-degrees.
    pub longitude: i32,
    /// Metres.
    pub accuracy: u16,
}

/// Opaque digest of a team's whole record store. Forwarded, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    pub team_id: PeerId,
    pub root_hash: Vec<u8>,
}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

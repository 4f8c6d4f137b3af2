//! succinct-core — shared identifiers, team records, wire format and config.
//! All other succinct crates depend on this one.

pub mod codec;
pub mod config;
pub mod heartbeat;
pub mod id;
pub mod message;
pub mod team;
pub mod wire;

pub use id::PeerId;
pub use message::TeamEvent;
pub use team::{
    ChatMessage, FormSubmission, LocationUpdate, Membership, StoreState, Team, TeamMember,
};
pub use wire::{MessageType, WireError};

//! Team events as carried inside the fragment stream.
//!
//! Members are addressed by roster position rather than by `PeerId`, which
//! caps addressable members at 256 per team.

use crate::codec::{BodyReader, BodyWriter};
use crate::wire::{MessageType, WireError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeamEvent {
    CreateTeam {
        epoch: i64,
        name: String,
    },
    DestroyTeam {
        epoch: i64,
    },
    Enroll {
        position: u8,
        time: i64,
        employee_id: String,
        name: String,
    },
    Leave {
        position: u8,
        time: i64,
    },
    Location {
        position: u8,
        time: i64,
        latitude: i32,
        longitude: i32,
        accuracy: u16,
    },
    Chat {
        position: u8,
        time: i64,
        message: String,
    },
    Form {
        position: u8,
        time: i64,
        body: Vec<u8>,
    },
}

impl TeamEvent {
    pub fn message_type(&self) -> MessageType {
        match self {
            TeamEvent::CreateTeam { .. } => MessageType::CreateTeam,
            TeamEvent::DestroyTeam { .. } => MessageType::DestroyTeam,
            TeamEvent::Enroll { .. } => MessageType::Enroll,
            TeamEvent::Leave { .. } => MessageType::Leave,
            TeamEvent::Location { .. } => MessageType::Location,
            TeamEvent::Chat { .. } => MessageType::Message,
            TeamEvent::Form { .. } => MessageType::Form,
        }
    }

    /// Serialise the body. Times are written relative to `epoch`.
    pub fn encode(&self, epoch: i64) -> Vec<u8> {
        let mut w = BodyWriter::new();
        match self {
            TeamEvent::CreateTeam { epoch: e, name } => {
                w.put_raw_long(*e).put_string(name);
            }
            TeamEvent::DestroyTeam { epoch: e } => {
                w.put_raw_long(*e);
            }
            TeamEvent::Enroll {
                position,
                time,
                employee_id,
                name,
            } => {
                w.put_byte(*position)
                    .put_time(*time, epoch)
                    .put_string(employee_id)
                    .put_string(name);
            }
            TeamEvent::Leave { position, time } => {
                w.put_byte(*position).put_time(*time, epoch);
            }
            TeamEvent::Location {
                position,
                time,
                latitude,
                longitude,
                accuracy,
            } => {
                w.put_byte(*position)
                    .put_time(*time, epoch)
                    .put_i32(*latitude)
                    .put_i32(*longitude)
                    .put_u16(*accuracy);
            }
            TeamEvent::Chat {
                position,
                time,
                message,
            } => {
                w.put_byte(*position)
                    .put_time(*time, epoch)
                    .put_string(message);
            }
            TeamEvent::Form {
                position,
                time,
                body,
            } => {
                w.put_byte(*position).put_time(*time, epoch).put_bytes(body);
            }
        }
        w.finish()
    }

    pub fn decode(kind: MessageType, body: &[u8], epoch: i64) -> Result<Self, WireError> {
        let mut r = BodyReader::new(body);
        let event = match kind {
            MessageType::CreateTeam => TeamEvent::CreateTeam {
                epoch: r.get_raw_long()?,
                name: r.get_string()?,
            },
            MessageType::DestroyTeam => TeamEvent::DestroyTeam {
                epoch: r.get_raw_long()?,
            },
            MessageType::Enroll => TeamEvent::Enroll {
                position: r.get_byte()?,
                time: r.get_time(epoch)?,
                employee_id: r.get_string()?,
                name: r.get_string()?,
            },
            MessageType::Leave => TeamEvent::Leave {
                position: r.get_byte()?,
                time: r.get_time(epoch)?,
            },
            MessageType::Location => TeamEvent::Location {
                position: r.get_byte()?,
                time: r.get_time(epoch)?,
                latitude: r.get_i32()?,
                longitude: r.get_i32()?,
                accuracy: r.get_u16()?,
            },
            MessageType::Message => TeamEvent::Chat {
                position: r.get_byte()?,
                time: r.get_time(epoch)?,
                message: r.get_string()?,
            },
            MessageType::Form => TeamEvent::Form {
                position: r.get_byte()?,
                time: r.get_time(epoch)?,
                body: r.rest(),
            },
        };
        Ok(event)
    }
}

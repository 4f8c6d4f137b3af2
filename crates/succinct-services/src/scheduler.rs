//! Source scheduler.
//!
//! Pulls pending records out of the team's logs in priority order and packs
//! them into the assembler:
//!
//! 1. team state (create / destroy)
//! 2. membership (enroll / leave)
//! 3. chat
//! 4. forms
//! 5. location
//!
//! A class is drained before any lower class is visited: whenever a class
//! packs something the pass starts again from team state.
//!
//! Each source keeps a `"sent"` mark per log. The mark is committed only
//! after the record has been handed to the assembler, so a crash in between
//! resends it. Records too large to frame are skipped with a warning.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use succinct_core::wire::MAX_MESSAGE_LEN;
use succinct_core::{
    ChatMessage, FormSubmission, LocationUpdate, Membership, PeerId, Team, TeamEvent, TeamMember,
};

use crate::assembler::FragmentAssembler;
use crate::fragment_log::FragmentLog;
use crate::queue::QueueError;
use crate::roster::Roster;
use crate::store::{LogCursor, LogKey, Record, RecordStore, StoreError, Stream};

/// Records handed to the assembler.
pub const SENT: &str = "sent";
/// Member identities already turned into an enrollment.
pub const ENROLLED: &str = "enrolled";

type Encode = fn(&[u8], u8) -> Result<TeamEvent, StoreError>;

/// One per-member stream. Visited round-robin, one record per member.
struct Source {
    stream: Stream,
    cursors: HashMap<PeerId, Box<dyn LogCursor>>,
    encode: Encode,
}

impl Source {
    fn new(stream: Stream, encode: Encode) -> Self {
        Self {
            stream,
            cursors: HashMap::new(),
            encode,
        }
    }

    fn cursor(
        &mut self,
        store: &dyn RecordStore,
        peer: PeerId,
    ) -> Result<&mut Box<dyn LogCursor>, StoreError> {
        match self.cursors.entry(peer) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let cursor = store.open_cursor(&LogKey::new(peer, self.stream), SENT)?;
                Ok(e.insert(cursor))
            }
        }
    }

    fn has_pending(&mut self, store: &dyn RecordStore, roster: &Roster) -> Result<bool, StoreError> {
        for (peer, _) in eligible(roster) {
            let cursor = self.cursor(store, peer)?;
            if pending(cursor.as_mut())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn visit(
        &mut self,
        store: &dyn RecordStore,
        roster: &Roster,
        epoch: i64,
        asm: &mut FragmentAssembler,
        log: &mut FragmentLog,
    ) -> Result<bool, QueueError> {
        let encode = self.encode;
        let stream = self.stream;
        let mut advanced = false;
        for (peer, position) in eligible(roster) {
            let cursor = self.cursor(store, peer)?;
            cursor.reset(SENT)?;
            if !cursor.next()? {
                continue;
            }
            match cursor.read().map(|record| encode(record, position)) {
                Some(Ok(event)) => {
                    pack(&event, epoch, asm, log)?;
                }
                Some(Err(e)) => {
                    tracing::warn!(peer = %peer, stream = stream.name(), error = %e, "skipping unreadable record");
                }
                None => continue,
            }
            advanced = true;
            cursor.next()?;
            cursor.commit_mark()?;
        }
        Ok(advanced)
    }
}

/// Hand `event` to the assembler unless its body cannot be framed. Returns
/// whether it was packed.
fn pack(
    event: &TeamEvent,
    epoch: i64,
    asm: &mut FragmentAssembler,
    log: &mut FragmentLog,
) -> Result<bool, QueueError> {
    let body = event.encode(epoch);
    if body.len() > MAX_MESSAGE_LEN {
        tracing::warn!(kind = ?event.message_type(), bytes = body.len(), "skipping oversized record");
        return Ok(false);
    }
    asm.append(event.message_type(), &body, log)?;
    Ok(true)
}

/// Active members with an addressable position, in roster order.
fn eligible(roster: &Roster) -> Vec<(PeerId, u8)> {
    roster
        .members()
        .iter()
        .filter(|peer| roster.is_active(peer))
        .filter_map(|peer| roster.addressable_position(peer).map(|p| (*peer, p)))
        .collect()
}

fn pending(cursor: &mut dyn LogCursor) -> Result<bool, StoreError> {
    cursor.reset(SENT)?;
    let found = cursor.next()?;
    cursor.reset(SENT)?;
    Ok(found)
}

fn chat_event(record: &[u8], position: u8) -> Result<TeamEvent, StoreError> {
    let chat = ChatMessage::from_record(record)?;
    Ok(TeamEvent::Chat {
        position,
        time: chat.time,
        message: chat.message,
    })
}

fn form_event(record: &[u8], position: u8) -> Result<TeamEvent, StoreError> {
    let form = FormSubmission::from_record(record)?;
    Ok(TeamEvent::Form {
        position,
        time: form.time,
        body: form.body,
    })
}

fn location_event(record: &[u8], position: u8) -> Result<TeamEvent, StoreError> {
    let loc = LocationUpdate::from_record(record)?;
    Ok(TeamEvent::Location {
        position,
        time: loc.time,
        latitude: loc.latitude,
        longitude: loc.longitude,
        accuracy: loc.accuracy,
    })
}

pub struct SourceScheduler {
    store: Arc<dyn RecordStore>,
    /// Base for every time delta sent for this team.
    epoch: i64,
    roster: Roster,
    team: Box<dyn LogCursor>,
    membership: Box<dyn LogCursor>,
    /// Chat, forms, location; in priority order.
    sources: Vec<Source>,
    identities: HashMap<PeerId, Box<dyn LogCursor>>,
}

impl SourceScheduler {
    pub fn open(store: Arc<dyn RecordStore>, epoch: i64) -> Result<Self, StoreError> {
        let team_id = store.team_id();
        let team = store.cursor_for::<Team>(team_id, SENT)?;
        let membership = store.cursor_for::<Membership>(team_id, SENT)?;
        let roster = Roster::open(store.clone())?;
        Ok(Self {
            store,
            epoch,
            roster,
            team,
            membership,
            sources: vec![
                Source::new(Stream::Chat, chat_event),
                Source::new(Stream::Form, form_event),
                Source::new(Stream::Location, location_event),
            ],
            identities: HashMap::new(),
        })
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut Roster {
        &mut self.roster
    }

    /// Whether any source has a record past its mark.
    pub fn has_pending(&mut self) -> Result<bool, StoreError> {
        self.roster.refresh()?;
        if pending(self.team.as_mut())? || pending(self.membership.as_mut())? {
            return Ok(true);
        }
        for source in &mut self.sources {
            if source.has_pending(self.store.as_ref(), &self.roster)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Pack pending records until a fragment is sealed. When every source is
    /// dry the open fragment is sealed early. Returns whether any fragment
    /// was sealed.
    ///
    /// Sources report progress whenever their mark moved, skipped records
    /// included, so a lower class never runs while a higher one has work.
    pub fn next_message(
        &mut self,
        asm: &mut FragmentAssembler,
        log: &mut FragmentLog,
    ) -> Result<bool, QueueError> {
        let before = log.next_seq();
        self.roster.refresh()?;
        'pass: while log.next_seq() == before {
            if self.team_state(asm, log)? || self.member_enrollments(asm, log)? {
                continue;
            }
            for source in &mut self.sources {
                if source.visit(self.store.as_ref(), &self.roster, self.epoch, asm, log)? {
                    continue 'pass;
                }
            }
            asm.seal(log)?;
            break;
        }
        Ok(log.next_seq() != before)
    }

    fn team_state(
        &mut self,
        asm: &mut FragmentAssembler,
        log: &mut FragmentLog,
    ) -> Result<bool, QueueError> {
        let cursor = self.team.as_mut();
        cursor.reset(SENT)?;
        cursor.next()?;
        let mut advanced = false;
        while let Some(team) = cursor.record::<Team>()? {
            let event = match team.id {
                Some(_) => TeamEvent::CreateTeam {
                    epoch: team.epoch,
                    name: team.name,
                },
                None => TeamEvent::DestroyTeam { epoch: team.epoch },
            };
            pack(&event, self.epoch, asm, log)?;
            advanced = true;
            cursor.next()?;
            cursor.commit_mark()?;
        }
        Ok(advanced)
    }

    fn member_enrollments(
        &mut self,
        asm: &mut FragmentAssembler,
        log: &mut FragmentLog,
    ) -> Result<bool, QueueError> {
        let cursor = self.membership.as_mut();
        cursor.reset(SENT)?;
        cursor.next()?;
        let mut advanced = false;
        while let Some(m) = cursor.record::<Membership>()? {
            let Some(position) = self.roster.addressable_position(&m.peer_id) else {
                tracing::debug!(peer = %m.peer_id, "member not addressable, skipping");
                cursor.next()?;
                cursor.commit_mark()?;
                continue;
            };
            let event = if m.enroll {
                let Some(member) = self.store.last_record::<TeamMember>(m.peer_id)? else {
                    // identity not yet known; the mark stays on this record
                    break;
                };
                TeamEvent::Enroll {
                    position,
                    time: m.time,
                    employee_id: member.employee_id,
                    name: member.name,
                }
            } else {
                TeamEvent::Leave {
                    position,
                    time: m.time,
                }
            };
            pack(&event, self.epoch, asm, log)?;
            advanced = true;
            cursor.next()?;
            cursor.commit_mark()?;
        }
        Ok(advanced)
    }

    /// Enroll every peer whose first identity record has appeared. Returns
    /// whether anyone was enrolled.
    pub fn watch_members(&mut self) -> Result<bool, StoreError> {
        let mut enrolled = false;
        for peer in self.store.owners(Stream::TeamMember) {
            let cursor = match self.identities.entry(peer) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert(self.store.cursor_for::<TeamMember>(peer, ENROLLED)?),
            };
            cursor.reset(ENROLLED)?;
            if cursor.offset() != 0 || !cursor.next()? {
                continue;
            }
            if !self.roster.is_active(&peer) {
                self.roster.enroll(peer)?;
                enrolled = true;
            }
            cursor.next()?;
            cursor.commit_mark()?;
        }
        Ok(enrolled)
    }
}

//! Team membership list.
//!
//! A member's roster position is its index in first-enrollment order. It is
//! the compact address chat and form messages carry instead of a PeerId.

use std::collections::HashMap;
use std::sync::Arc;

use succinct_core::team::now_millis;
use succinct_core::{Membership, PeerId, TeamMember};

use crate::store::{LogCursor, LogKey, RecordStore, StoreError, Stream};

/// Members beyond this position cannot be addressed in a message body.
pub const MAX_POSITION: usize = 255;

pub struct Roster {
    store: Arc<dyn RecordStore>,
    team_id: PeerId,
    /// Membership log, read incrementally; never commits a mark.
    cursor: Box<dyn LogCursor>,
    order: Vec<PeerId>,
    positions: HashMap<PeerId, usize>,
    active: HashMap<PeerId, bool>,
}

impl Roster {
    pub fn open(store: Arc<dyn RecordStore>) -> Result<Self, StoreError> {
        let team_id = store.team_id();
        let cursor = store.open_cursor(&LogKey::new(team_id, Stream::Membership), "roster")?;
        let mut roster = Self {
            store,
            team_id,
            cursor,
            order: Vec::new(),
            positions: HashMap::new(),
            active: HashMap::new(),
        };
        roster.cursor.seek_start();
        roster.refresh()?;
        Ok(roster)
    }

    /// Pick up membership records appended since the last refresh.
    pub fn refresh(&mut self) -> Result<(), StoreError> {
        while self.cursor.next()? {
            let Some(m) = self.cursor.record::<Membership>()? else {
                break;
            };
            if !self.positions.contains_key(&m.peer_id) {
                self.positions.insert(m.peer_id, self.order.len());
                self.order.push(m.peer_id);
            }
            self.active.insert(m.peer_id, m.enroll);
        }
        Ok(())
    }

    pub fn enroll(&mut self, peer: PeerId) -> Result<(), StoreError> {
        self.record(peer, true)
    }

    pub fn leave(&mut self, peer: PeerId) -> Result<(), StoreError> {
        self.record(peer, false)
    }

    fn record(&mut self, peer: PeerId, enroll: bool) -> Result<(), StoreError> {
        let membership = Membership {
            peer_id: peer,
            time: now_millis(),
            enroll,
        };
        self.store.append_record(self.team_id, &membership)?;
        tracing::info!(peer = %peer, enroll, "membership changed");
        self.refresh()
    }

    pub fn position(&self, peer: &PeerId) -> Option<usize> {
        self.positions.get(peer).copied()
    }

    /// Position if it fits in a message body.
    pub fn addressable_position(&self, peer: &PeerId) -> Option<u8> {
        self.position(peer)
            .filter(|p| *p <= MAX_POSITION)
            .map(|p| p as u8)
    }

    /// Enrolled and not since left.
    pub fn is_active(&self, peer: &PeerId) -> bool {
        self.active.get(peer).copied().unwrap_or(false)
    }

    /// Every peer ever enrolled, in position order.
    pub fn members(&self) -> &[PeerId] {
        &self.order
    }

    /// The member's current published identity.
    pub fn team_member(&self, peer: &PeerId) -> Result<Option<TeamMember>, StoreError> {
        self.store.last_record::<TeamMember>(*peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::tests::temp_store;

    fn id(b: u8) -> PeerId {
        PeerId::from_bytes([b; 4])
    }

    #[test]
    fn positions_follow_first_enrollment() {
        let store: Arc<dyn RecordStore> = Arc::new(temp_store());
        let mut roster = Roster::open(store.clone()).unwrap();
        roster.enroll(id(3)).unwrap();
        roster.enroll(id(1)).unwrap();
        roster.leave(id(3)).unwrap();
        roster.enroll(id(3)).unwrap();

        assert_eq!(roster.position(&id(3)), Some(0));
        assert_eq!(roster.position(&id(1)), Some(1));
        assert_eq!(roster.members(), &[id(3), id(1)]);
        assert!(roster.is_active(&id(3)));
        assert!(roster.position(&id(9)).is_none());

        // a second reader rebuilds the same view from the log
        let other = Roster::open(store).unwrap();
        assert_eq!(other.members(), roster.members());
    }

    #[test]
    fn leave_deactivates_but_keeps_position() {
        let store: Arc<dyn RecordStore> = Arc::new(temp_store());
        let mut roster = Roster::open(store).unwrap();
        roster.enroll(id(1)).unwrap();
        roster.leave(id(1)).unwrap();
        assert!(!roster.is_active(&id(1)));
        assert_eq!(roster.position(&id(1)), Some(0));
    }

    #[test]
    fn team_member_is_last_record() {
        let store: Arc<dyn RecordStore> = Arc::new(temp_store());
        let roster = Roster::open(store.clone()).unwrap();
        assert!(roster.team_member(&id(1)).unwrap().is_none());
        for name in ["old", "new"] {
            store
                .append_record(
                    id(1),
                    &TeamMember {
                        employee_id: "e1".into(),
                        name: name.into(),
                    },
                )
                .unwrap();
        }
        assert_eq!(roster.team_member(&id(1)).unwrap().unwrap().name, "new");
    }
}

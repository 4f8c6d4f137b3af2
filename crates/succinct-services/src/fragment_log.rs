//! Sealed fragments, in sequence order.

use std::sync::Arc;

use bytes::Bytes;
use succinct_core::wire::FragmentHeader;
use succinct_core::{PeerId, WireError};

use crate::store::{LogCursor, LogKey, Record, RecordStore, StoreError, Stream};

/// Position the local transports have handed off.
pub const SENDING: &str = "sending";
/// Position the HTTP relay has confirmed.
pub const HTTP_ACKED: &str = "http_acked";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub seq: u32,
    /// The whole fragment including its header.
    pub bytes: Bytes,
}

impl Fragment {
    pub fn parse(bytes: impl Into<Bytes>) -> Result<Self, WireError> {
        let bytes = bytes.into();
        let header = FragmentHeader::parse(&bytes)?;
        Ok(Self {
            seq: header.seq(),
            bytes,
        })
    }

    pub fn team_id(&self) -> PeerId {
        PeerId::from_slice(&self.bytes).unwrap_or(PeerId::from_bytes([0; 4]))
    }
}

impl Record for Fragment {
    const STREAM: Stream = Stream::Fragment;

    fn to_record(&self) -> Result<Vec<u8>, StoreError> {
        Ok(self.bytes.to_vec())
    }

    fn from_record(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(Fragment::parse(Bytes::copy_from_slice(bytes))?)
    }
}

/// The team's fragment stream plus the cursor both drain paths share.
pub struct FragmentLog {
    key: LogKey,
    store: Arc<dyn RecordStore>,
    cursor: Box<dyn LogCursor>,
    /// Sequence the next sealed fragment must carry.
    next_seq: u32,
}

impl FragmentLog {
    pub fn open(store: Arc<dyn RecordStore>) -> Result<Self, StoreError> {
        let key = LogKey::new(store.team_id(), Stream::Fragment);
        let next_seq = match store.read_last(&key)? {
            Some(bytes) => Fragment::from_record(&bytes)?.seq + 1,
            None => 0,
        };
        let cursor = store.open_cursor(&key, SENDING)?;
        Ok(Self {
            key,
            store,
            cursor,
            next_seq,
        })
    }

    pub fn append(&mut self, fragment: &Fragment) -> Result<(), StoreError> {
        self.store.append(&self.key, &fragment.to_record()?)?;
        self.next_seq = fragment.seq + 1;
        tracing::debug!(seq = fragment.seq, bytes = fragment.bytes.len(), "fragment sealed");
        Ok(())
    }

    /// One past the last sealed sequence; 0 while the log is empty.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn last_seq(&self) -> Option<u32> {
        self.next_seq.checked_sub(1)
    }

    pub fn cursor(&mut self) -> &mut dyn LogCursor {
        self.cursor.as_mut()
    }

    /// Fragment under the cursor.
    pub fn current(&self) -> Result<Option<Fragment>, StoreError> {
        self.cursor.record::<Fragment>()
    }

    /// Position a mark would record right now.
    pub fn offset(&self) -> u64 {
        self.cursor.offset()
    }

    /// Whether anything after `mark` is unsent. Leaves the cursor at `mark`.
    pub fn has_after(&mut self, mark: &str) -> Result<bool, StoreError> {
        self.cursor.reset(mark)?;
        let found = self.cursor.next()?;
        self.cursor.reset(mark)?;
        Ok(found)
    }
}

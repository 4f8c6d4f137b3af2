//! Record log abstraction.
//!
//! Every stream of team events lives in an append-only log keyed by
//! `(owner, stream)`. Consumers walk a log with a cursor and persist how far
//! they got under a named mark; there is no random access by index.

use std::fmt;
use std::path::PathBuf;

use succinct_core::{
    ChatMessage, FormSubmission, LocationUpdate, Membership, PeerId, StoreState, Team, TeamMember,
    WireError,
};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stream {
    /// Owned by the team id.
    Team,
    /// Owned by the team id.
    Membership,
    /// Owned by the member it describes.
    TeamMember,
    /// Owned by the team id.
    Fragment,
    Chat,
    Form,
    Location,
}

impl Stream {
    pub const ALL: [Stream; 7] = [
        Stream::Team,
        Stream::Membership,
        Stream::TeamMember,
        Stream::Fragment,
        Stream::Chat,
        Stream::Form,
        Stream::Location,
    ];

    /// Directory name on disk.
    pub fn name(&self) -> &'static str {
        match self {
            Stream::Team => "team",
            Stream::Membership => "membership",
            Stream::TeamMember => "team_member",
            Stream::Fragment => "fragment",
            Stream::Chat => "chat",
            Stream::Form => "form",
            Stream::Location => "location",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogKey {
    pub owner: PeerId,
    pub stream: Stream,
}

impl LogKey {
    pub fn new(owner: PeerId, stream: Stream) -> Self {
        Self { owner, stream }
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream.name(), self.owner)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt log {path} at offset {offset}")]
    Corrupt { path: PathBuf, offset: u64 },

    #[error("failed to decode record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed record: {0}")]
    Wire(#[from] WireError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// A typed value stored in one log stream.
pub trait Record: Sized {
    const STREAM: Stream;

    fn to_record(&self) -> Result<Vec<u8>, StoreError>;
    fn from_record(bytes: &[u8]) -> Result<Self, StoreError>;
}

macro_rules! json_record {
    ($($ty:ty => $stream:expr),* $(,)?) => {
        $(
            impl Record for $ty {
                const STREAM: Stream = $stream;

                fn to_record(&self) -> Result<Vec<u8>, StoreError> {
                    Ok(serde_json::to_vec(self)?)
                }

                fn from_record(bytes: &[u8]) -> Result<Self, StoreError> {
                    Ok(serde_json::from_slice(bytes)?)
                }
            }
        )*
    };
}

json_record! {
    Team => Stream::Team,
    Membership => Stream::Membership,
    TeamMember => Stream::TeamMember,
    ChatMessage => Stream::Chat,
    FormSubmission => Stream::Form,
    LocationUpdate => Stream::Location,
}

// ── Cursors ───────────────────────────────────────────────────────────────────

/// Position in one log.
///
/// A cursor either holds a current record or sits in the gap between two
/// records. `reset`, `seek_start` and `seek_end` leave it in a gap; `next`
/// and `prev` load a record. Stepping off either end leaves the cursor in the
/// gap at that end and returns false.
pub trait LogCursor: Send {
    fn next(&mut self) -> Result<bool, StoreError>;
    fn prev(&mut self) -> Result<bool, StoreError>;
    fn seek_start(&mut self);
    fn seek_end(&mut self) -> Result<(), StoreError>;

    /// The current record, if one is loaded.
    fn read(&self) -> Option<&[u8]>;

    /// Move to the gap recorded under `mark`, or the start if never set.
    fn reset(&mut self, mark: &str) -> Result<(), StoreError>;

    /// Persist the position under the mark this cursor was opened with.
    fn commit_mark(&mut self) -> Result<(), StoreError>;

    /// Persist the position under another mark.
    fn commit_mark_as(&mut self, mark: &str) -> Result<(), StoreError>;

    /// Byte offset a mark would record: the current record's start, or the gap.
    fn offset(&self) -> u64;

    /// Committed offset of `mark`, 0 if never set.
    fn marked(&self, mark: &str) -> u64;
}

impl dyn LogCursor + '_ {
    /// Decode the current record.
    pub fn record<R: Record>(&self) -> Result<Option<R>, StoreError> {
        self.read().map(R::from_record).transpose()
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

pub trait RecordStore: Send + Sync {
    /// Team this store belongs to.
    fn team_id(&self) -> PeerId;

    fn append(&self, key: &LogKey, record: &[u8]) -> Result<(), StoreError>;

    /// Open a cursor positioned at `mark`. `commit_mark` will write `mark`.
    fn open_cursor(&self, key: &LogKey, mark: &str) -> Result<Box<dyn LogCursor>, StoreError>;

    fn read_last(&self, key: &LogKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Peers that own a log of `stream`, in id order.
    fn owners(&self, stream: Stream) -> Vec<PeerId>;

    /// Digest of every log, `None` while the store is empty.
    fn state(&self) -> Option<StoreState>;

    /// Notified with the key of every append.
    fn subscribe(&self) -> broadcast::Receiver<LogKey>;
}

impl dyn RecordStore + '_ {
    pub fn append_record<R: Record>(&self, owner: PeerId, record: &R) -> Result<(), StoreError> {
        self.append(&LogKey::new(owner, R::STREAM), &record.to_record()?)
    }

    pub fn last_record<R: Record>(&self, owner: PeerId) -> Result<Option<R>, StoreError> {
        self.read_last(&LogKey::new(owner, R::STREAM))?
            .map(|bytes| R::from_record(&bytes))
            .transpose()
    }

    pub fn cursor_for<R: Record>(
        &self,
        owner: PeerId,
        mark: &str,
    ) -> Result<Box<dyn LogCursor>, StoreError> {
        self.open_cursor(&LogKey::new(owner, R::STREAM), mark)
    }
}

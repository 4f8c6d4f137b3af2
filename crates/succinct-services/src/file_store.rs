//! File-backed record store.
//!
//! One append-only file per log:
//!   {root}/{stream}/{owner_hex}.log
//!
//! Records are framed `[u32 len][bytes][u32 len]` so a cursor can step in
//! either direction. Marks for a log live next to it in `{owner_hex}.marks`
//! (JSON, replaced atomically). The store digest is a blake3 hash chain per
//! log, folded over every log in key order.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use succinct_core::{PeerId, StoreState};
use tokio::sync::broadcast;

use crate::store::{LogCursor, LogKey, RecordStore, StoreError, Stream};

const FRAME_OVERHEAD: u64 = 8;

struct Inner {
    root: PathBuf,
    team_id: PeerId,
    /// Committed marks per log, mirrored on disk.
    marks: DashMap<LogKey, HashMap<String, u64>>,
    /// Running hash chain per log.
    digests: DashMap<LogKey, [u8; 32]>,
    notify: broadcast::Sender<LogKey>,
}

#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

impl FileStore {
    /// Open (or create) the store for `team_id` rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, team_id: PeerId) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;

        let (notify, _) = broadcast::channel(256);
        let store = Self {
            inner: Arc::new(Inner {
                root,
                team_id,
                marks: DashMap::new(),
                digests: DashMap::new(),
                notify,
            }),
        };

        for stream in Stream::ALL {
            for owner in store.owners(stream) {
                let key = LogKey::new(owner, stream);
                store.load_marks(&key)?;
                store.rebuild_digest(&key)?;
            }
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn load_marks(&self, key: &LogKey) -> Result<(), StoreError> {
        let path = self.inner.marks_path(key);
        if !path.exists() {
            return Ok(());
        }
        let text = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        let marks: HashMap<String, u64> = serde_json::from_slice(&text)?;
        self.inner.marks.insert(*key, marks);
        Ok(())
    }

    fn rebuild_digest(&self, key: &LogKey) -> Result<(), StoreError> {
        let path = self.inner.log_path(key);
        let len = file_len(&path)?;
        let mut digest = [0u8; 32];
        let mut offset = 0;
        while offset < len {
            let record = read_forward(&path, offset, len)?;
            digest = chain(&digest, &record);
            offset += FRAME_OVERHEAD + record.len() as u64;
        }
        self.inner.digests.insert(*key, digest);
        Ok(())
    }
}

impl Inner {
    fn log_path(&self, key: &LogKey) -> PathBuf {
        self.root
            .join(key.stream.name())
            .join(format!("{}.log", key.owner))
    }

    fn marks_path(&self, key: &LogKey) -> PathBuf {
        self.root
            .join(key.stream.name())
            .join(format!("{}.marks", key.owner))
    }

    fn mark(&self, key: &LogKey, name: &str) -> u64 {
        self.marks
            .get(key)
            .and_then(|m| m.get(name).copied())
            .unwrap_or(0)
    }

    fn set_mark(&self, key: &LogKey, name: &str, offset: u64) -> Result<(), StoreError> {
        let snapshot = {
            let mut marks = self.marks.entry(*key).or_default();
            if marks.get(name) == Some(&offset) {
                return Ok(());
            }
            marks.insert(name.to_owned(), offset);
            serde_json::to_vec(&*marks)?
        };

        // Atomic write: tmp file → rename
        let path = self.marks_path(key);
        let tmp_path = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        {
            let mut file = fs::File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
            file.write_all(&snapshot)
                .map_err(|e| StoreError::io(&tmp_path, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| StoreError::io(&path, e))?;
        tracing::trace!(log = %key, mark = name, offset, "mark committed");
        Ok(())
    }
}

impl RecordStore for FileStore {
    fn team_id(&self) -> PeerId {
        self.inner.team_id
    }

    fn append(&self, key: &LogKey, record: &[u8]) -> Result<(), StoreError> {
        let path = self.inner.log_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let len = (record.len() as u32).to_be_bytes();
        let mut frame = Vec::with_capacity(record.len() + FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&len);
        frame.extend_from_slice(record);
        frame.extend_from_slice(&len);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(&frame).map_err(|e| StoreError::io(&path, e))?;
        file.sync_data().map_err(|e| StoreError::io(&path, e))?;

        {
            let mut digest = self.inner.digests.entry(*key).or_insert([0u8; 32]);
            let next = chain(&digest, record);
            *digest = next;
        }

        tracing::trace!(log = %key, bytes = record.len(), "record appended");
        let _ = self.inner.notify.send(*key);
        Ok(())
    }

    fn open_cursor(&self, key: &LogKey, mark: &str) -> Result<Box<dyn LogCursor>, StoreError> {
        let mut cursor = FileCursor {
            inner: self.inner.clone(),
            key: *key,
            path: self.inner.log_path(key),
            mark: mark.to_owned(),
            gap: 0,
            current: None,
        };
        cursor.reset(mark)?;
        Ok(Box::new(cursor))
    }

    fn read_last(&self, key: &LogKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.inner.log_path(key);
        let len = file_len(&path)?;
        if len == 0 {
            return Ok(None);
        }
        read_backward(&path, len).map(|(_, record)| Some(record))
    }

    fn owners(&self, stream: Stream) -> Vec<PeerId> {
        let dir = self.inner.root.join(stream.name());
        let mut owners: Vec<PeerId> = fs::read_dir(&dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                name.strip_suffix(".log")?.parse().ok()
            })
            .collect();
        owners.sort();
        owners
    }

    fn state(&self) -> Option<StoreState> {
        if self.inner.digests.is_empty() {
            return None;
        }
        let mut logs: Vec<(LogKey, [u8; 32])> = self
            .inner
            .digests
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        logs.sort();

        let mut hasher = blake3::Hasher::new();
        for (key, digest) in &logs {
            hasher.update(key.stream.name().as_bytes());
            hasher.update(key.owner.as_bytes());
            hasher.update(digest);
        }
        Some(StoreState {
            team_id: self.inner.team_id,
            root_hash: hasher.finalize().as_bytes().to_vec(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<LogKey> {
        self.inner.notify.subscribe()
    }
}

// ── Cursor ────────────────────────────────────────────────────────────────────

struct FileCursor {
    inner: Arc<Inner>,
    key: LogKey,
    path: PathBuf,
    mark: String,
    /// Gap offset, meaningful while `current` is None.
    gap: u64,
    /// Start offset and body of the loaded record.
    current: Option<(u64, Vec<u8>)>,
}

impl FileCursor {
    fn end_of_current(&self) -> u64 {
        match &self.current {
            Some((start, record)) => start + FRAME_OVERHEAD + record.len() as u64,
            None => self.gap,
        }
    }
}

impl LogCursor for FileCursor {
    fn next(&mut self) -> Result<bool, StoreError> {
        let pos = self.end_of_current();
        let len = file_len(&self.path)?;
        if pos + FRAME_OVERHEAD > len {
            self.current = None;
            self.gap = pos;
            return Ok(false);
        }
        let record = read_forward(&self.path, pos, len)?;
        self.current = Some((pos, record));
        Ok(true)
    }

    fn prev(&mut self) -> Result<bool, StoreError> {
        let end = match &self.current {
            Some((start, _)) => *start,
            None => self.gap,
        };
        if end < FRAME_OVERHEAD {
            self.current = None;
            self.gap = 0;
            return Ok(false);
        }
        let (start, record) = read_backward(&self.path, end)?;
        self.current = Some((start, record));
        Ok(true)
    }

    fn seek_start(&mut self) {
        self.current = None;
        self.gap = 0;
    }

    fn seek_end(&mut self) -> Result<(), StoreError> {
        self.current = None;
        self.gap = file_len(&self.path)?;
        Ok(())
    }

    fn read(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, record)| record.as_slice())
    }

    fn reset(&mut self, mark: &str) -> Result<(), StoreError> {
        let offset = self.inner.mark(&self.key, mark);
        if offset > file_len(&self.path)? {
            return Err(StoreError::Corrupt {
                path: self.path.clone(),
                offset,
            });
        }
        self.current = None;
        self.gap = offset;
        Ok(())
    }

    fn commit_mark(&mut self) -> Result<(), StoreError> {
        let mark = self.mark.clone();
        self.commit_mark_as(&mark)
    }

    fn commit_mark_as(&mut self, mark: &str) -> Result<(), StoreError> {
        self.inner.set_mark(&self.key, mark, self.offset())
    }

    fn offset(&self) -> u64 {
        match &self.current {
            Some((start, _)) => *start,
            None => self.gap,
        }
    }

    fn marked(&self, mark: &str) -> u64 {
        self.inner.mark(&self.key, mark)
    }
}

// ── Frame I/O ─────────────────────────────────────────────────────────────────

fn file_len(path: &Path) -> Result<u64, StoreError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn read_u32_at(file: &fs::File, path: &Path, offset: u64) -> Result<u32, StoreError> {
    let mut buf = [0u8; 4];
    file.read_exact_at(&mut buf, offset)
        .map_err(|e| StoreError::io(path, e))?;
    Ok(u32::from_be_bytes(buf))
}

/// Read the record whose frame starts at `offset`.
fn read_forward(path: &Path, offset: u64, file_len: u64) -> Result<Vec<u8>, StoreError> {
    let file = fs::File::open(path).map_err(|e| StoreError::io(path, e))?;
    let len = read_u32_at(&file, path, offset)? as u64;
    if offset + FRAME_OVERHEAD + len > file_len {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            offset,
        });
    }
    let mut record = vec![0u8; len as usize];
    file.read_exact_at(&mut record, offset + 4)
        .map_err(|e| StoreError::io(path, e))?;
    Ok(record)
}

/// Read the record whose frame ends at `end`. Returns its start offset.
fn read_backward(path: &Path, end: u64) -> Result<(u64, Vec<u8>), StoreError> {
    if end < FRAME_OVERHEAD {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            offset: end,
        });
    }
    let file = fs::File::open(path).map_err(|e| StoreError::io(path, e))?;
    let len = read_u32_at(&file, path, end - 4)? as u64;
    let start = end.checked_sub(FRAME_OVERHEAD + len).ok_or(StoreError::Corrupt {
        path: path.to_path_buf(),
        offset: end,
    })?;
    let mut record = vec![0u8; len as usize];
    file.read_exact_at(&mut record, start + 4)
        .map_err(|e| StoreError::io(path, e))?;
    Ok((start, record))
}

fn chain(prev: &[u8; 32], record: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev);
    hasher.update(record);
    *hasher.finalize().as_bytes()
}

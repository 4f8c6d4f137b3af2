//! Fragment assembler.
//!
//! Packs tagged messages into MTU-sized fragments. The fragment being built
//! lives in a memory-mapped scratch file so a restart picks up where the last
//! process stopped:
//!
//! ```text
//! [position: u32 BE][team: 4][seq: u32 BE][hint: u8][pieces ...]
//! ```
//!
//! `position` is the absolute end of the last complete message, or 0 when no
//! fragment is open. It is only advanced once a message has been written in
//! full, so a crash mid-message drops that message from the open fragment.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::MmapMut;
use succinct_core::wire::{
    FragmentHeader, MessageHeader, FRAGMENT_HEADER_LEN, HINT_OFFSET, MAX_HINT, MAX_MESSAGE_LEN,
    MAX_UNCUT_PIECE, MESSAGE_HEADER_LEN,
};
use succinct_core::{MessageType, PeerId};
use zerocopy::byteorder::U16;
use zerocopy::AsBytes;

use crate::fragment_log::{Fragment, FragmentLog};
use crate::queue::QueueError;

/// Name of the scratch file inside the team's storage root.
pub const SCRATCH_FILE: &str = "partial_fragment";

const POSITION_LEN: usize = 4;

pub struct FragmentAssembler {
    path: PathBuf,
    team_id: PeerId,
    mtu: usize,
    map: MmapMut,
    /// Bytes of the open fragment, header included. 0 = no fragment open.
    len: usize,
    next_seq: u32,
}

impl FragmentAssembler {
    /// Map the scratch file and recover any fragment left open by a crash.
    /// `sealed_next` is the sequence the fragment log expects next.
    pub fn open(
        path: impl Into<PathBuf>,
        team_id: PeerId,
        mtu: usize,
        sealed_next: u32,
    ) -> Result<Self, QueueError> {
        let path = path.into();
        let scratch = |source| QueueError::Scratch {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(scratch)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(scratch)?;
        let fresh = file.metadata().map_err(scratch)?.len() == 0;
        file.set_len((POSITION_LEN + mtu) as u64).map_err(scratch)?;

        // Safety: the scratch file is private to this process and never
        // truncated while mapped.
        let map = unsafe { MmapMut::map_mut(&file).map_err(scratch)? };

        let mut assembler = Self {
            path,
            team_id,
            mtu,
            map,
            len: 0,
            next_seq: sealed_next,
        };
        if fresh {
            assembler.publish(0);
        } else {
            assembler.recover(sealed_next)?;
        }
        Ok(assembler)
    }

    fn recover(&mut self, sealed_next: u32) -> Result<(), QueueError> {
        let position = self.stored_position() as usize;
        if position == 0 {
            tracing::debug!(next_seq = self.next_seq, "clean fragment scratch");
            return Ok(());
        }
        let min = POSITION_LEN + FRAGMENT_HEADER_LEN;
        let max = POSITION_LEN + self.mtu;
        if position < min || position > max {
            return Err(QueueError::CorruptScratch {
                path: self.path.clone(),
                position: position as u32,
                max,
            });
        }

        let header = FragmentHeader::parse(&self.map[POSITION_LEN..])?;
        let seq = header.seq();
        if header.team_id() != self.team_id || seq < sealed_next {
            // sealed before the crash, or left over from another team
            tracing::info!(seq, sealed_next, "discarding stale fragment scratch");
            self.publish(0);
            return Ok(());
        }

        self.len = position - POSITION_LEN;
        self.next_seq = seq + 1;
        tracing::info!(seq, bytes = self.len, "recovered open fragment");
        Ok(())
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Sequence the next fragment begun will carry.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn remaining(&self) -> usize {
        self.mtu - self.len
    }

    fn stored_position(&self) -> u32 {
        let mut raw = [0u8; POSITION_LEN];
        raw.copy_from_slice(&self.map[..POSITION_LEN]);
        u32::from_be_bytes(raw)
    }

    fn publish(&mut self, position: usize) {
        self.map[..POSITION_LEN].copy_from_slice(&(position as u32).to_be_bytes());
    }

    fn write(&mut self, bytes: &[u8]) {
        let at = POSITION_LEN + self.len;
        self.map[at..at + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    fn begin_fragment(&mut self) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.len = 0;
        let header = FragmentHeader::new(self.team_id, seq, 0);
        self.write(header.as_bytes());
        tracing::trace!(seq, "begin fragment");
    }

    fn set_hint(&mut self, hint: u8) {
        self.map[POSITION_LEN + HINT_OFFSET] = hint;
    }

    /// Pack one message, sealing fragments into `log` as they fill.
    pub fn append(
        &mut self,
        kind: MessageType,
        body: &[u8],
        log: &mut FragmentLog,
    ) -> Result<(), QueueError> {
        if body.len() > MAX_MESSAGE_LEN {
            return Err(QueueError::MessageTooLarge(body.len()));
        }

        if !self.is_empty() && self.remaining() < MESSAGE_HEADER_LEN {
            self.seal(log)?;
        }

        let mut header_pending = true;
        let mut offset = 0;
        while header_pending || offset < body.len() {
            if self.is_empty() {
                self.begin_fragment();
                if !header_pending {
                    let cont = (body.len() - offset).min(self.remaining());
                    self.set_hint((cont + 1).min(MAX_HINT as usize) as u8);
                }
            }

            if header_pending {
                let header = MessageHeader {
                    kind: kind.into(),
                    length: U16::new(body.len() as u16),
                };
                self.write(header.as_bytes());
                header_pending = false;
            }

            let piece = (body.len() - offset).min(self.remaining());
            self.write(&body[offset..offset + piece]);
            offset += piece;

            if offset == body.len() {
                self.publish(POSITION_LEN + self.len);
                self.map.flush_async().map_err(|e| self.scratch_error(e))?;
            }

            if piece > MAX_UNCUT_PIECE || self.remaining() < MESSAGE_HEADER_LEN {
                self.seal(log)?;
            }
        }
        tracing::trace!(?kind, bytes = body.len(), seq = self.next_seq.saturating_sub(1), "message packed");
        Ok(())
    }

    /// Seal the open fragment, if any. Returns whether one was sealed.
    pub fn seal(&mut self, log: &mut FragmentLog) -> Result<bool, QueueError> {
        if self.is_empty() {
            return Ok(false);
        }
        let bytes = Bytes::copy_from_slice(&self.map[POSITION_LEN..POSITION_LEN + self.len]);
        let fragment = Fragment::parse(bytes)?;
        log.append(&fragment)?;

        self.len = 0;
        self.publish(0);
        self.map.flush().map_err(|e| self.scratch_error(e))?;
        Ok(true)
    }

    fn scratch_error(&self, source: std::io::Error) -> QueueError {
        QueueError::Scratch {
            path: self.path.clone(),
            source,
        }
    }

    pub fn scratch_path(&self) -> &Path {
        &self.path
    }
}

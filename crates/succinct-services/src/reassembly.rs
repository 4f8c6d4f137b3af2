//! Receiver side of the fragment stream.
//!
//! Fed fragments in sequence order, yields complete messages. After a gap
//! the leading continuation is skipped using the first-piece hint and the
//! torn message is dropped.

use bytes::Buf;
use succinct_core::wire::{FragmentHeader, FRAGMENT_HEADER_LEN, MAX_HINT, MESSAGE_HEADER_LEN};
use succinct_core::{MessageType, WireError};

struct Partial {
    kind: u8,
    length: usize,
    body: Vec<u8>,
}

#[derive(Default)]
pub struct Reassembler {
    expected_seq: Option<u32>,
    partial: Option<Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence the next in-order fragment should carry.
    pub fn expected_seq(&self) -> Option<u32> {
        self.expected_seq
    }

    /// Consume one fragment. Duplicates of already-seen fragments yield nothing.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Vec<(MessageType, Vec<u8>)>, WireError> {
        let header = FragmentHeader::parse(fragment)?;
        let seq = header.seq();
        match self.expected_seq {
            Some(expected) if seq < expected => return Ok(Vec::new()),
            Some(expected) if seq > expected => {
                if self.partial.take().is_some() {
                    tracing::debug!(expected, seq, "gap in fragment stream, dropping torn message");
                }
            }
            None if header.hint != 0 => {
                // joined mid-stream
                self.partial = None;
            }
            _ => {}
        }
        self.expected_seq = Some(seq + 1);

        let mut rest = &fragment[FRAGMENT_HEADER_LEN..];
        let mut out = Vec::new();

        match self.partial.take() {
            Some(mut partial) if header.hint != 0 => {
                let take = (partial.length - partial.body.len()).min(rest.len());
                partial.body.extend_from_slice(&rest[..take]);
                rest.advance(take);
                self.finish(partial, &mut out);
            }
            Some(_) => {
                tracing::debug!(seq, "continuation missing, dropping torn message");
            }
            None if header.hint == MAX_HINT => rest = &[],
            None if header.hint != 0 => {
                let skip = (header.hint as usize - 1).min(rest.len());
                rest.advance(skip);
            }
            None => {}
        }

        while rest.remaining() >= MESSAGE_HEADER_LEN {
            let kind = rest.get_u8();
            let length = rest.get_u16() as usize;
            let take = length.min(rest.len());
            let partial = Partial {
                kind,
                length,
                body: rest[..take].to_vec(),
            };
            rest.advance(take);
            self.finish(partial, &mut out);
        }
        Ok(out)
    }

    fn finish(&mut self, partial: Partial, out: &mut Vec<(MessageType, Vec<u8>)>) {
        if partial.body.len() < partial.length {
            self.partial = Some(partial);
            return;
        }
        match MessageType::try_from(partial.kind) {
            Ok(kind) => out.push((kind, partial.body)),
            Err(e) => tracing::debug!(error = %e, "skipping message"),
        }
    }
}

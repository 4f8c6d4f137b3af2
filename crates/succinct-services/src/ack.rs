//! Acknowledgement tracking over the fragment log.
//!
//! The log can only be stepped one record at a time, so locating an acked
//! sequence starts from whichever known position is closest: the start of
//! the log, the end, or the fragment the cursor already holds.

use crate::fragment_log::{Fragment, FragmentLog, HTTP_ACKED, SENDING};
use crate::queue::QueueError;

/// Advance [`HTTP_ACKED`] past fragment `seq`. `-1` means the remote holds
/// nothing and the mark returns to the first fragment.
///
/// Also drags [`SENDING`] forward to the same position if it is behind, so
/// local transports never re-offer a fragment the relay already holds.
/// Returns the number of cursor steps taken.
pub fn ack_up_to(log: &mut FragmentLog, seq: i64) -> Result<usize, QueueError> {
    let next = log.next_seq();
    if seq < -1 || seq >= i64::from(next) {
        return Err(QueueError::AckOutOfRange { seq, next });
    }

    let cursor = log.cursor();
    if seq < 0 {
        cursor.seek_start();
        cursor.next()?;
        cursor.commit_mark_as(HTTP_ACKED)?;
        tracing::debug!("relay holds nothing, acked mark reset");
        return Ok(0);
    }

    let target = seq as u32;
    let mut first = 0;
    let mut last = next - 1;
    if let Some(current) = cursor.record::<Fragment>()? {
        if target >= current.seq {
            first = current.seq;
        } else {
            last = current.seq;
        }
    }

    let forwards = (target - first) < (last - target);
    let mut steps = 0;
    if forwards && first == 0 {
        cursor.seek_start();
        if !cursor.next()? {
            return Err(QueueError::AckNotFound(seq));
        }
        steps += 1;
    } else if !forwards && last == next - 1 {
        cursor.seek_end()?;
        if !cursor.prev()? {
            return Err(QueueError::AckNotFound(seq));
        }
        steps += 1;
    }

    loop {
        let Some(fragment) = cursor.record::<Fragment>()? else {
            break;
        };
        if fragment.seq == target {
            cursor.next()?;
            cursor.commit_mark_as(HTTP_ACKED)?;
            if cursor.marked(SENDING) < cursor.offset() {
                cursor.commit_mark_as(SENDING)?;
            }
            tracing::debug!(seq, steps, forwards, "fragments acked");
            return Ok(steps);
        }
        let moved = if forwards {
            cursor.next()?
        } else {
            cursor.prev()?
        };
        if !moved {
            break;
        }
        steps += 1;
    }
    Err(QueueError::AckNotFound(seq))
}

//! Compact body serialisation for bandwidth-constrained transports.
//!
//! Times go out as a varint delta from the team epoch, strings as a varint
//! length followed by UTF-8.

use bytes::{Buf, BufMut, BytesMut};

use crate::wire::WireError;

#[derive(Debug, Default)]
pub struct BodyWriter {
    buf: BytesMut,
}

impl BodyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_byte(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    pub fn put_raw_long(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64(value);
        self
    }

    pub fn put_varint(&mut self, mut value: u64) -> &mut Self {
        while value >= 0x80 {
            self.buf.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
        self
    }

    /// Times before the epoch clamp to zero.
    pub fn put_time(&mut self, time: i64, epoch: i64) -> &mut Self {
        let delta = time.saturating_sub(epoch).max(0) as u64;
        self.put_varint(delta)
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_varint(value.len() as u64);
        self.buf.put_slice(value.as_bytes());
        self
    }

    /// Raw trailing bytes, no length prefix.
    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

pub struct BodyReader<'a> {
    buf: &'a [u8],
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.buf.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                got: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_byte(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_raw_long(&mut self) -> Result<i64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn get_varint(&mut self) -> Result<u64, WireError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.get_byte()?;
            if shift >= 64 {
                return Err(WireError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn get_time(&mut self, epoch: i64) -> Result<i64, WireError> {
        Ok(epoch.saturating_add(self.get_varint()? as i64))
    }

    pub fn get_string(&mut self) -> Result<String, WireError> {
        let len = self.get_varint()? as usize;
        self.need(len)?;
        let text = std::str::from_utf8(&self.buf[..len])
            .map_err(|_| WireError::InvalidUtf8)?
            .to_owned();
        self.buf.advance(len);
        Ok(text)
    }

    /// Everything not read yet.
    pub fn rest(&mut self) -> Vec<u8> {
        let rest = self.buf.to_vec();
        self.buf = &[];
        rest
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

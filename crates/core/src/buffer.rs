//! Reusable byte buffers for frame encoding. A [`ByteWriter`] is meant to be
//! kept per-producer and reused across sends: call [`ByteWriter::finish`] to
//! copy the encoded bytes out before handing them to the I/O core, so the
//! growable scratch buffer itself is never shared across threads.

use crate::error::{NetSyncError, Result};

#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(256) }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed (1-byte length) UTF-8 string.
    pub fn short_str(&mut self, field: &'static str, s: &str) -> Result<()> {
        let bytes = s.as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(NetSyncError::OversizeField {
                field,
                max: u8::MAX as usize,
                actual: bytes.len(),
            });
        }
        self.u8(bytes.len() as u8);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Length-prefixed (2-byte length) UTF-8 string.
    pub fn long_str(&mut self, field: &'static str, s: &str) -> Result<()> {
        let bytes = s.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(NetSyncError::OversizeField {
                field,
                max: u16::MAX as usize,
                actual: bytes.len(),
            });
        }
        self.u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Copies the encoded frame out, leaving the writer empty and ready to
    /// be reused for the next send.
    pub fn finish(&mut self) -> Vec<u8> {
        let out = self.buf.clone();
        self.buf.clear();
        out
    }
}

#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn u8(&mut self) -> Option<u8> {
        let v = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    pub fn u16(&mut self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        let v = u16::from_le_bytes(self.data[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Some(v)
    }

    pub fn u32(&mut self) -> Option<u32> {
        if self.remaining() < 4 {
            return None;
        }
        let v = u32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Some(v)
    }

    pub fn i16(&mut self) -> Option<i16> {
        if self.remaining() < 2 {
            return None;
        }
        let v = i16::from_le_bytes(self.data[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Some(v)
    }

    pub fn f64(&mut self) -> Option<f64> {
        if self.remaining() < 8 {
            return None;
        }
        let v = f64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Some(v)
    }

    pub fn short_str(&mut self) -> Option<String> {
        let len = self.u8()? as usize;
        if self.remaining() < len {
            return None;
        }
        let s = std::str::from_utf8(&self.data[self.pos..self.pos + len]).ok()?.to_owned();
        self.pos += len;
        Some(s)
    }

    pub fn long_str(&mut self) -> Option<String> {
        let len = self.u16()? as usize;
        if self.remaining() < len {
            return None;
        }
        let s = std::str::from_utf8(&self.data[self.pos..self.pos + len]).ok()?.to_owned();
        self.pos += len;
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_mixed_fields() {
        let mut w = ByteWriter::new();
        w.u8(11);
        w.u16(42);
        w.f64(1.5);
        w.short_str("name", "room-a").unwrap();
        let bytes = w.finish();

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.u8(), Some(11));
        assert_eq!(r.u16(), Some(42));
        assert_eq!(r.f64(), Some(1.5));
        assert_eq!(r.short_str().as_deref(), Some("room-a"));
    }

    #[test]
    fn oversize_short_str_rejected() {
        let mut w = ByteWriter::new();
        let s: String = std::iter::repeat('x').take(300).collect();
        assert!(w.short_str("name", &s).is_err());
    }

    #[test]
    fn truncated_read_returns_none() {
        let mut r = ByteReader::new(&[1, 2]);
        assert_eq!(r.u32(), None);
    }
}

use byteorder::{ByteOrder, LE};
use thiserror::Error;

/// Raised when a packed record is decoded from a buffer shorter than its
/// fixed layout requires.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("record truncated: needed {needed} more bytes, {have} left")]
pub struct Truncated {
    pub needed: usize,
    pub have: usize,
}

/// Bounds-checked little-endian reader over a byte slice. All multi-byte
/// fields on the DFU wire are little-endian.
pub struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { rest: buf }
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], Truncated> {
        if self.rest.len() < len {
            return Err(Truncated {
                needed: len - self.rest.len(),
                have: self.rest.len(),
            });
        }
        let (taken, rest) = self.rest.split_at(len);
        self.rest = rest;
        Ok(taken)
    }

    pub fn u8(&mut self) -> Result<u8, Truncated> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, Truncated> {
        Ok(LE::read_u16(self.bytes(2)?))
    }

    pub fn u24(&mut self) -> Result<u32, Truncated> {
        Ok(LE::read_u24(self.bytes(3)?))
    }

    pub fn u32(&mut self) -> Result<u32, Truncated> {
        Ok(LE::read_u32(self.bytes(4)?))
    }
}

/// Growable little-endian writer, the serialization side of [Reader].
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u24(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes()[..3]);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Split a BCD-coded version (e.g. 0x011A) into its (major, minor) halves.
pub fn split_bcd(bcd: u16) -> (u8, u8) {
    ((bcd >> 8) as u8, (bcd & 0xff) as u8)
}

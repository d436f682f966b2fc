//! This module contains a bounds-checked reader for big-endian binary data
//!
//! Every read names its length up front and is checked against the end of the buffer before any byte is touched.
//! A failed read leaves the cursor where it was.

use thiserror::Error;

/// Errors when reading from a [`Reader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The read would run past the end of the buffer
    #[error("read of {len} bytes at offset {offset} overruns buffer of {available} bytes")]
    OutOfBounds {
        /// Cursor position when the read was attempted
        offset: usize,
        /// Number of bytes requested
        len: usize,
        /// Total length of the buffer
        available: usize,
    },
}

/// Cursor over an immutable byte buffer
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    /// Buffer being read
    data: &'a [u8],
    /// Offset of the next unread byte
    pos: usize,
}
impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Offset of the next unread byte
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns `true` once every byte has been consumed
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Takes the next `len` bytes and advances past them.
    ///
    /// This is the only place the cursor moves; every other read is built on it.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(ReadError::OutOfBounds {
                offset: self.pos,
                len,
                available: self.data.len(),
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Takes the next `N` bytes as a fixed-size array
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], ReadError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Reads a single byte
    pub fn u8(&mut self) -> Result<u8, ReadError> {
        self.array::<1>().map(|[b]| b)
    }

    /// Reads a big-endian `u16`
    pub fn u16(&mut self) -> Result<u16, ReadError> {
        self.array().map(u16::from_be_bytes)
    }

    /// Reads a big-endian `u32`
    pub fn u32(&mut self) -> Result<u32, ReadError> {
        self.array().map(u32::from_be_bytes)
    }

    /// Skips `len` bytes without looking at them
    pub fn skip(&mut self, len: usize) -> Result<(), ReadError> {
        self.bytes(len).map(|_| ())
    }

    /// Splits off the next `len` bytes as their own reader and advances past them.
    ///
    /// The returned reader cannot see anything outside those `len` bytes, so a record decoded from it can never reach
    /// into the record that follows.
    pub fn split(&mut self, len: usize) -> Result<Reader<'a>, ReadError> {
        self.bytes(len).map(Reader::new)
    }

    /// Consumes and returns everything that is left
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}

//! A fixed-capacity, reusable byte buffer. Its purpose is to minimize copying and
//!  allocation on the datagram hot path: buffers are pre-allocated at
//!  `DATAGRAM_SIZE` and recycled through the buffer pool.
//!
//! It implements `bytes::BufMut` so headers can be written with the `bytes`
//!  ecosystem's `put_*` calls.

use bytes::buf::UninitSlice;
use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};

/// A fixed-capacity dynamically allocated buffer.
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}

impl FixedBuf {
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // buffers are reused aggressively, so we trade eager zero-initialization
            //  for simplicity
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// make the entire underlying buffer available through as_ref() / as_mut()
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Convenience constructor for test code, deriving the length from the content.
    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(capacity);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for FixedBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

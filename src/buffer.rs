//! Growable byte buffer
//!
//! Every pipeline stage takes input by slice and returns a fresh `Buffer`,
//! never an alias into caller memory. Logical length and capacity are kept
//! separate so framing code can reserve generously and fill incrementally.

use std::ops::{Deref, DerefMut};

/// Fixed per-socket transfer unit used throughout the relay path.
pub const SSR_BUFF_SIZE: usize = 2048;

/// Resizable byte buffer with explicit length/capacity discipline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Create an empty buffer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the logical length is zero.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Currently reserved capacity.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Reset logical length to zero, keeping capacity.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append a slice.
    pub fn put_slice(&mut self, slice: &[u8]) {
        self.data.extend_from_slice(slice);
    }

    /// Append a single byte.
    pub fn put_u8(&mut self, byte: u8) {
        self.data.push(byte);
    }

    /// Grow the logical length by `n` zero bytes and return a mutable view of
    /// the newly added tail.
    pub fn grow(&mut self, n: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.resize(start + n, 0);
        &mut self.data[start..]
    }

    /// Drop the first `n` bytes, shifting the remainder to the front.
    pub fn drain_front(&mut self, n: usize) {
        self.data.drain(..n.min(self.data.len()));
    }

    /// Truncate the logical length.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Entire logical content as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consume into the underlying vector.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl From<&[u8]> for Buffer {
    fn from(slice: &[u8]) -> Self {
        Self {
            data: slice.to_vec(),
        }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_capacity_discipline() {
        let mut buf = Buffer::with_capacity(64);
        assert_eq!(buf.len(), 0);
        assert!(buf.capacity() >= 64);

        buf.put_slice(b"hello");
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.as_slice(), b"hello");

        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
    }

    #[test]
    fn test_grow_returns_tail() {
        let mut buf = Buffer::from(&b"ab"[..]);
        let tail = buf.grow(3);
        tail.copy_from_slice(b"cde");
        assert_eq!(buf.as_slice(), b"abcde");
    }

    #[test]
    fn test_drain_front() {
        let mut buf = Buffer::from(&b"abcdef"[..]);
        buf.drain_front(4);
        assert_eq!(buf.as_slice(), b"ef");
        buf.drain_front(10);
        assert!(buf.is_empty());
    }
}

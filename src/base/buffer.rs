//! Position/limit byte buffer shared between the application and the engine.
//!
//! Reads fill the region between `position` and `limit` and advance
//! `position`; writes consume the same region. Bytes outside that window are
//! never touched, so one buffer can be reused across many calls. Buffers move
//! into the engine with `read`/`write` and come back with the matching
//! callback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

pub struct ByteBuffer {
    id: u64,
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

impl ByteBuffer {
    /// Allocate a zeroed buffer with `position = 0` and `limit = capacity`.
    pub fn allocate(capacity: usize) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            data: vec![0; capacity],
            position: 0,
            limit: capacity,
        }
    }

    /// Wrap existing bytes, ready to be written out (`position = 0`,
    /// `limit = len`).
    pub fn wrap(bytes: impl Into<Vec<u8>>) -> Self {
        let data = bytes.into();
        let limit = data.len();
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            data,
            position: 0,
            limit,
        }
    }

    /// Identity of this buffer. Stable for its whole life, unique per process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// # Panics
    ///
    /// Panics if `position > limit`.
    pub fn set_position(&mut self, position: usize) -> &mut Self {
        assert!(
            position <= self.limit,
            "position {} exceeds limit {}",
            position,
            self.limit
        );
        self.position = position;
        self
    }

    /// Moves `position` back to the new limit if it was beyond it.
    ///
    /// # Panics
    ///
    /// Panics if `limit > capacity`.
    pub fn set_limit(&mut self, limit: usize) -> &mut Self {
        assert!(
            limit <= self.data.len(),
            "limit {} exceeds capacity {}",
            limit,
            self.data.len()
        );
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
        self
    }

    /// Copy as much of `src` as fits at `position`, returning the count.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.position..self.position + n].copy_from_slice(&src[..n]);
        self.position += n;
        n
    }

    /// Switch from filling to draining: `limit = position`, `position = 0`.
    pub fn flip(&mut self) -> &mut Self {
        self.limit = self.position;
        self.position = 0;
        self
    }

    pub fn clear(&mut self) -> &mut Self {
        self.position = 0;
        self.limit = self.data.len();
        self
    }

    /// The whole backing storage, independent of position and limit.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The bytes between `position` and `limit`.
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Bytes `[start, end)` of the backing storage.
    pub fn contents(&self, start: usize, end: usize) -> &[u8] {
        &self.data[start..end]
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("id", &self.id)
            .field("capacity", &self.data.len())
            .field("position", &self.position)
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_respects_window() {
        let mut buf = ByteBuffer::allocate(5);
        assert_eq!(buf.put(b"FOR"), 3);
        assert_eq!(buf.position(), 3);
        assert_eq!(buf.put(b"GET"), 2);
        assert_eq!(buf.as_slice(), b"FORGE");
        assert!(!buf.has_remaining());

        buf.set_position(3);
        assert_eq!(buf.put(b"T"), 1);
        assert_eq!(buf.as_slice(), b"FORTE");
        assert_eq!(buf.position(), 4);
        assert_eq!(buf.limit(), 5);
    }

    #[test]
    fn test_flip_exposes_written_bytes() {
        let mut buf = ByteBuffer::allocate(8);
        buf.put(b"abc");
        buf.flip();
        assert_eq!(buf.remaining(), 3);
        assert_eq!(buf.remaining_slice(), b"abc");
    }

    #[test]
    fn test_set_limit_clamps_position() {
        let mut buf = ByteBuffer::wrap(b"hello".to_vec());
        buf.set_position(4);
        buf.set_limit(2);
        assert_eq!(buf.position(), 2);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ByteBuffer::allocate(1);
        let b = ByteBuffer::allocate(1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    #[should_panic(expected = "exceeds limit")]
    fn test_position_past_limit_panics() {
        let mut buf = ByteBuffer::allocate(2);
        buf.set_position(3);
    }
}

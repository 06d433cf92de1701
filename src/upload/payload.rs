//! Synthetic payload generator.
//!
//! Content is random filler; only its length matters for the benchmark.

use bytes::{Bytes, BytesMut};
use rand::RngCore;

use super::UPLOAD_PACKET;

/// Virtual size advertised in the `UPLOAD` request line.
pub const DEFAULT_PAYLOAD_SIZE: u64 = 1_000_000_000;

/// A bounded, read-only stream of filler bytes.
#[derive(Debug, Clone)]
pub struct PayloadSource {
    limit: u64,
    position: u64,
    block: Bytes,
}

impl PayloadSource {
    /// Create a source that yields `limit` bytes in total.
    pub fn new(limit: u64) -> Self {
        let mut block = vec![0u8; UPLOAD_PACKET];
        rand::thread_rng().fill_bytes(&mut block);
        Self {
            limit,
            position: 0,
            block: Bytes::from(block),
        }
    }

    /// Read up to `n` bytes. Returns an empty buffer once the limit is reached.
    pub fn read(&mut self, n: usize) -> Bytes {
        let len = (n as u64).min(self.remaining()) as usize;
        if len == 0 {
            return Bytes::new();
        }
        self.position += len as u64;

        if len <= self.block.len() {
            return self.block.slice(..len);
        }

        let mut out = BytesMut::with_capacity(len);
        while out.len() < len {
            let take = (len - out.len()).min(self.block.len());
            out.extend_from_slice(&self.block[..take]);
        }
        out.freeze()
    }

    pub fn remaining(&self) -> u64 {
        self.limit - self.position
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

impl Default for PayloadSource {
    fn default() -> Self {
        Self::new(DEFAULT_PAYLOAD_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_advances_cursor() {
        let mut src = PayloadSource::new(100_000);
        let chunk = src.read(UPLOAD_PACKET);
        assert_eq!(chunk.len(), UPLOAD_PACKET);
        assert_eq!(src.position(), UPLOAD_PACKET as u64);
        assert_eq!(src.remaining(), 100_000 - UPLOAD_PACKET as u64);
    }

    #[test]
    fn test_short_read_at_limit() {
        let mut src = PayloadSource::new(20_000);
        assert_eq!(src.read(UPLOAD_PACKET).len(), UPLOAD_PACKET);
        // Only 20_000 - 16_384 bytes left.
        assert_eq!(src.read(UPLOAD_PACKET).len(), 20_000 - UPLOAD_PACKET);
        assert!(src.is_exhausted());
        assert!(src.read(UPLOAD_PACKET).is_empty());
        assert!(src.read(1).is_empty());
    }

    #[test]
    fn test_read_larger_than_block() {
        let mut src = PayloadSource::new(1_000_000);
        let big = src.read(UPLOAD_PACKET * 3 + 7);
        assert_eq!(big.len(), UPLOAD_PACKET * 3 + 7);
        // Repeats the filler block.
        assert_eq!(big[..UPLOAD_PACKET], big[UPLOAD_PACKET..UPLOAD_PACKET * 2]);
    }

    #[test]
    fn test_zero_limit_and_zero_read() {
        let mut empty = PayloadSource::new(0);
        assert!(empty.is_exhausted());
        assert!(empty.read(UPLOAD_PACKET).is_empty());

        let mut src = PayloadSource::new(10);
        assert!(src.read(0).is_empty());
        assert_eq!(src.position(), 0);
    }

    #[test]
    fn test_default_limit() {
        let src = PayloadSource::default();
        assert_eq!(src.limit(), DEFAULT_PAYLOAD_SIZE);
    }
}

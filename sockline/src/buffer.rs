//! Growable byte queue.
//!
//! A [`Buffer`] is written at the back and consumed from the front. It keeps
//! two running positions, the total number of bytes ever written and the
//! total ever consumed, so callers can tell how far a stream has advanced
//! even after the storage has been reclaimed.
//!
//! The buffer itself is not synchronized. A socket keeps both of its buffers
//! behind its own mutex.

use bytes::{Bytes, BytesMut};

#[derive(Debug, Default, Clone)]
pub struct Buffer {
  data: BytesMut,
  written: u64,
  consumed: u64,
}

impl Buffer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self { data: BytesMut::with_capacity(capacity), written: 0, consumed: 0 }
  }

  /// Appends `bytes` at the back.
  pub fn append(&mut self, bytes: &[u8]) {
    self.data.extend_from_slice(bytes);
    self.written += bytes.len() as u64;
  }

  /// Removes and returns up to `max` bytes from the front.
  pub fn consume(&mut self, max: usize) -> Bytes {
    let n = max.min(self.data.len());
    self.consumed += n as u64;
    self.data.split_to(n).freeze()
  }

  /// Removes and returns everything.
  pub fn consume_all(&mut self) -> Bytes {
    self.consume(self.data.len())
  }

  /// Copies up to `out.len()` bytes from the front without consuming them.
  pub fn peek(&self, out: &mut [u8]) -> usize {
    let n = out.len().min(self.data.len());
    out[..n].copy_from_slice(&self.data[..n]);
    n
  }

  /// The unread bytes.
  pub fn as_slice(&self) -> &[u8] {
    &self.data
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  /// Drops every unread byte. Dropped bytes count as consumed.
  pub fn clear(&mut self) {
    self.consumed += self.data.len() as u64;
    self.data.clear();
  }

  /// Total bytes ever appended.
  pub fn write_position(&self) -> u64 {
    self.written
  }

  /// Total bytes ever consumed or cleared.
  pub fn read_position(&self) -> u64 {
    self.consumed
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn consume_is_bounded_by_len() {
    let mut buf = Buffer::new();
    buf.append(b"hello");

    assert_eq!(&buf.consume(3)[..], b"hel");
    assert_eq!(&buf.consume(10)[..], b"lo");
    assert!(buf.consume(1).is_empty());
    assert!(buf.is_empty());
  }

  #[test]
  fn peek_leaves_data_in_place() {
    let mut buf = Buffer::with_capacity(16);
    buf.append(b"abcdef");

    let mut out = [0u8; 4];
    assert_eq!(buf.peek(&mut out), 4);
    assert_eq!(&out, b"abcd");
    assert_eq!(buf.len(), 6);
    assert_eq!(buf.as_slice(), b"abcdef");
  }

  #[test]
  fn positions_survive_clear() {
    let mut buf = Buffer::new();
    buf.append(b"0123456789");
    buf.consume(4);
    buf.clear();
    buf.append(b"ab");

    assert_eq!(buf.write_position(), 12);
    assert_eq!(buf.read_position(), 10);
    assert_eq!(buf.len(), 2);
  }

  proptest! {
    #[test]
    fn chunked_consume_returns_every_byte_in_order(
      writes in prop::collection::vec(
        prop::collection::vec(any::<u8>(), 0..64),
        0..16,
      ),
      chunk in 1usize..48,
    ) {
      let mut buf = Buffer::new();
      let mut expected = Vec::new();
      for w in &writes {
        buf.append(w);
        expected.extend_from_slice(w);
      }

      let mut got = Vec::new();
      while !buf.is_empty() {
        let part = buf.consume(chunk);
        prop_assert!(part.len() <= chunk);
        got.extend_from_slice(&part);
      }

      prop_assert_eq!(got, expected);
      prop_assert_eq!(buf.read_position(), buf.write_position());
    }
  }
}

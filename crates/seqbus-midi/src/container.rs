//! Append-only byte buffer with a read cursor.
//!
//! Outbound messages are serialized into a `ByteContainer` before they are
//! handed to a back-end. Short channel messages stay inline.

use smallvec::SmallVec;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteContainer {
    bytes: SmallVec<[u8; 4]>,
    position: usize,
}

impl ByteContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: SmallVec::with_capacity(capacity),
            position: 0,
        }
    }

    #[inline]
    pub fn put(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Reads the byte under the cursor and advances it.
    #[inline]
    pub fn get(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.position)?;
        self.position += 1;
        Some(byte)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.position = 0;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl Extend<u8> for ByteContainer {
    fn extend<I: IntoIterator<Item = u8>>(&mut self, iter: I) {
        self.bytes.extend(iter);
    }
}

//! Immutable transfer source images.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::chunk::{ChunkError, ChunkIterator};

/// An immutable byte sequence to be transferred.
///
/// Cloning is cheap; the bytes are shared and never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct ByteImage {
    data: Arc<[u8]>,
}

impl ByteImage {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    /// Read an image from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        Ok(Self::new(std::fs::read(path)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate over chunks of at most `chunk_size` bytes.
    pub fn chunks(&self, chunk_size: usize) -> Result<ChunkIterator<'_>, ChunkError> {
        ChunkIterator::new(&self.data, chunk_size)
    }
}

impl From<Vec<u8>> for ByteImage {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for ByteImage {
    fn from(data: &[u8]) -> Self {
        Self::new(data)
    }
}

impl fmt::Debug for ByteImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteImage({} bytes)", self.data.len())
    }
}

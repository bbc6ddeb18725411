//! Chunk planning.
//!
//! Splits an image into ordered, size-bounded slices that fit one frame
//! each. Chunks partition the image: no gaps, no overlaps, no reordering.

use thiserror::Error;

use super::image::ByteImage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),
}

/// One slice of an image, tagged with its 0-based position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub index: usize,
    pub data: &'a [u8],
}

impl Chunk<'_> {
    /// 1-based sequence number, as devices count packets.
    pub fn sequence(&self) -> usize {
        self.index + 1
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Iterator over fixed-size chunks with a short final chunk.
#[derive(Debug, Clone)]
pub struct ChunkIterator<'a> {
    data: &'a [u8],
    chunk_size: usize,
    offset: usize,
    current_chunk: usize,
}

impl<'a> ChunkIterator<'a> {
    pub fn new(data: &'a [u8], chunk_size: usize) -> Result<Self, ChunkError> {
        if chunk_size == 0 {
            return Err(ChunkError::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            data,
            chunk_size,
            offset: 0,
            current_chunk: 0,
        })
    }

    /// Total number of chunks (including the partial one).
    pub fn total(&self) -> usize {
        self.data.len().div_ceil(self.chunk_size)
    }

    /// Index of the next chunk to be yielded.
    pub fn current(&self) -> usize {
        self.current_chunk
    }
}

impl<'a> Iterator for ChunkIterator<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let remaining = self.data.len() - self.offset;
        let chunk_len = remaining.min(self.chunk_size);

        let chunk = Chunk {
            index: self.current_chunk,
            data: &self.data[self.offset..self.offset + chunk_len],
        };
        self.offset += chunk_len;
        self.current_chunk += 1;

        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total() - self.current_chunk;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ChunkIterator<'_> {}

/// Plan the chunks of `image` for a maximum chunk size of `chunk_size`.
pub fn plan_chunks(image: &ByteImage, chunk_size: usize) -> Result<Vec<Chunk<'_>>, ChunkError> {
    Ok(ChunkIterator::new(image.as_bytes(), chunk_size)?.collect())
}

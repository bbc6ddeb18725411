//! Payload handling module.
//!
//! Provides the transfer source image and chunk planning.

pub mod chunk;
pub mod image;

pub use chunk::{Chunk, ChunkError, ChunkIterator, plan_chunks};
pub use image::ByteImage;

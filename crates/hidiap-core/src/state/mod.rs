//! State machine module.

pub mod machine;

pub use machine::{ChunkProgress, SessionState, Status, TransferKind};

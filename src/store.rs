//! Snapshot store implementations.

pub mod memory;

pub use memory::{MemSnapshot, MemStore};

//! Execution snapshot stores for taskmill.
//!
//! The engine persists every status transition on a best-effort basis and
//! can reload the snapshots to resume a scheduling cycle. Durability is the
//! store's concern, not the engine's.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory;
pub mod json_storage;

pub use trait_::{TaskStore, StorageError, Result};
pub use memory::MemoryStore;
pub use json_storage::JsonStore;

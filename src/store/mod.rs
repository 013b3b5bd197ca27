//! Durable-data collaborator contracts
//!
//! The repository registry and the history indexer are consumed by the
//! orchestrator through traits; the in-memory registry here is the
//! implementation used by a single-process deployment and by tests.

mod registry;

pub use registry::*;

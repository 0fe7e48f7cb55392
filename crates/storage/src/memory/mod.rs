//! In-process backend
//!
//! Holds everything in maps behind async locks. Used for tests and for
//! single-process runs that do not need durability across restarts.

mod graph;
mod state;
mod vectors;

pub use graph::MemoryRelationGraph;
pub use state::MemoryStateStore;
pub use vectors::MemoryVectorStore;

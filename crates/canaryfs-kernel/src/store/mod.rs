//! Volatile, capacity-bounded filesystem store.
//!
//! Key components:
//!
//! - [`StoreOps`] - Capability set the dispatcher drives
//! - [`MemoryStore`] - Arena-backed in-memory tree with a byte capacity
//!
//! ## Design Decisions
//!
//! - **Path-based**: Every operation resolves its path from the root when it
//!   runs. Callers that need inode numbers (the FUSE adapter) keep their own
//!   inode ↔ path map.
//! - **All-or-nothing mutations**: Capacity and type checks happen before any
//!   byte moves.
//! - **No access control**: Gating happens one layer up in the dispatcher.

mod error;
mod memory;
mod ops;
pub mod path;
mod types;

pub use error::{StoreError, StoreResult};
pub use memory::{DEFAULT_CAPACITY, MemoryStore};
pub use ops::StoreOps;
pub use types::{
    BLOCK_SIZE, DirEntry, FileAttr, FileType, MAX_NAME_LEN, NodeId, ROOT_ID, SetAttr, StatFs,
};

//! Store operations trait.
//!
//! Path-based and synchronous: every call resolves its path from the root at
//! call time and completes without blocking. Suspension belongs to the
//! dispatcher, never to the store.

use std::path::Path;

use super::StoreResult;
use super::types::{DirEntry, FileAttr, SetAttr, StatFs};

/// Capability set of a capacity-bounded filesystem tree.
///
/// Paths are absolute (`/a/b`). Mutations are all-or-nothing: an operation
/// that fails leaves the tree exactly as it was.
pub trait StoreOps: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// Get node attributes.
    fn getattr(&self, path: &Path) -> StoreResult<FileAttr>;

    /// List the children of a directory, sorted by name.
    fn readdir(&self, path: &Path) -> StoreResult<Vec<DirEntry>>;

    /// Read up to `size` bytes starting at `offset`.
    ///
    /// Returns fewer bytes if EOF is reached, and nothing past EOF.
    fn read(&self, path: &Path, offset: u64, size: u32) -> StoreResult<Vec<u8>>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write `data` at `offset`, zero-filling any gap past the current end.
    ///
    /// Returns the number of bytes written.
    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> StoreResult<u32>;

    /// Create a new empty file.
    fn create(&self, path: &Path, mode: u32) -> StoreResult<FileAttr>;

    /// Create a new directory.
    fn mkdir(&self, path: &Path, mode: u32) -> StoreResult<FileAttr>;

    /// Remove a file, releasing its capacity.
    fn unlink(&self, path: &Path) -> StoreResult<()>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &Path) -> StoreResult<()>;

    /// Rename (and possibly reparent) a node.
    fn rename(&self, from: &Path, to: &Path) -> StoreResult<()>;

    /// Truncate or zero-extend a file to `size` bytes.
    fn truncate(&self, path: &Path, size: u64) -> StoreResult<()>;

    /// Set permissions, ownership or timestamps.
    fn setattr(&self, path: &Path, attr: SetAttr) -> StoreResult<FileAttr>;

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Get filesystem statistics.
    fn statfs(&self) -> StatFs;

    /// Configured capacity in bytes.
    fn capacity(&self) -> u64;

    /// Bytes currently held by file contents.
    fn used(&self) -> u64;

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Check if a path exists.
    fn exists(&self, path: &Path) -> bool {
        self.getattr(path).is_ok()
    }

    /// Read entire file contents.
    fn read_all(&self, path: &Path) -> StoreResult<Vec<u8>> {
        let attr = self.getattr(path)?;
        let size = u32::try_from(attr.size).unwrap_or(u32::MAX);
        self.read(path, 0, size)
    }
}

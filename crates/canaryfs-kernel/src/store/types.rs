//! Core store types.
//!
//! Attributes are reported by value; callers never hold references into the
//! node arena.

use std::time::SystemTime;

/// Block size used for capacity reporting.
pub const BLOCK_SIZE: u32 = 4096;

/// Longest accepted name for a single path component.
pub const MAX_NAME_LEN: usize = 255;

/// Stable node identifier. The root is always [`ROOT_ID`].
pub type NodeId = u64;

/// Identifier of the root directory (matches the FUSE root inode).
pub const ROOT_ID: NodeId = 1;

/// Node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// File attributes (metadata).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    /// Node identifier.
    pub ino: NodeId,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Node kind.
    pub kind: FileType,
    /// Permission bits (e.g., 0o644), without the type bits.
    pub perm: u32,
    /// Number of hard links.
    pub nlink: u32,
    /// Owner user ID.
    pub uid: u32,
    /// Owner group ID.
    pub gid: u32,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last status change time.
    pub ctime: SystemTime,
    /// Creation time.
    pub crtime: SystemTime,
}

impl FileAttr {
    /// Create attributes for a new file.
    pub fn file(ino: NodeId, perm: u32, uid: u32, gid: u32) -> Self {
        Self::new(ino, FileType::File, perm, 1, uid, gid)
    }

    /// Create attributes for a new directory.
    pub fn directory(ino: NodeId, perm: u32, uid: u32, gid: u32) -> Self {
        // . and ..
        Self::new(ino, FileType::Directory, perm, 2, uid, gid)
    }

    fn new(ino: NodeId, kind: FileType, perm: u32, nlink: u32, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            ino,
            size: 0,
            kind,
            perm: perm & 0o7777,
            nlink,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Number of 512-byte blocks, as `stat(2)` reports them.
    pub fn blocks(&self) -> u64 {
        self.size.div_ceil(512)
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub kind: FileType,
    /// Node identifier of the entry.
    pub ino: NodeId,
}

/// Attributes to set (chmod, chown, utimens).
///
/// Size changes go through `truncate` so they pass the capacity check.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    /// New permission bits.
    pub perm: Option<u32>,
    /// New user ID.
    pub uid: Option<u32>,
    /// New group ID.
    pub gid: Option<u32>,
    /// New access time.
    pub atime: Option<SystemTime>,
    /// New modification time.
    pub mtime: Option<SystemTime>,
}

impl SetAttr {
    /// Create a new empty SetAttr.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set permissions.
    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = Some(perm);
        self
    }

    /// Set ownership.
    pub fn with_owner(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Set access and modification times.
    pub fn with_times(mut self, atime: SystemTime, mtime: SystemTime) -> Self {
        self.atime = Some(atime);
        self.mtime = Some(mtime);
        self
    }
}

/// Filesystem statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFs {
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Available blocks (to non-root).
    pub bavail: u64,
    /// Total inodes in use.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Block size.
    pub bsize: u32,
    /// Maximum name length.
    pub namelen: u32,
    /// Fragment size.
    pub frsize: u32,
}

impl StatFs {
    /// Report a store of `capacity` bytes with `used` bytes of content and
    /// `files` live nodes.
    pub fn for_capacity(capacity: u64, used: u64, files: u64) -> Self {
        let block = u64::from(BLOCK_SIZE);
        let free = capacity.saturating_sub(used) / block;
        Self {
            blocks: capacity / block,
            bfree: free,
            bavail: free,
            files,
            ffree: u64::from(u32::MAX).saturating_sub(files),
            bsize: BLOCK_SIZE,
            namelen: MAX_NAME_LEN as u32,
            frsize: BLOCK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_attr_constructors() {
        let file = FileAttr::file(7, 0o100644, 1000, 1000);
        assert!(file.is_file());
        assert_eq!(file.perm, 0o644);
        assert_eq!(file.nlink, 1);

        let dir = FileAttr::directory(ROOT_ID, 0o755, 0, 0);
        assert!(dir.is_dir());
        assert_eq!(dir.nlink, 2);
    }

    #[test]
    fn test_blocks_round_up() {
        let mut file = FileAttr::file(2, 0o644, 0, 0);
        file.size = 513;
        assert_eq!(file.blocks(), 2);
    }

    #[test]
    fn test_statfs_reports_capacity_in_blocks() {
        let st = StatFs::for_capacity(10 * 1024 * 1024, 4096 * 3 + 1, 4);
        assert_eq!(st.blocks, 2560);
        assert_eq!(st.bfree, 2556);
        assert_eq!(st.bavail, st.bfree);
        assert_eq!(st.namelen, 255);
    }

    #[test]
    fn test_setattr_builder() {
        let attr = SetAttr::new().with_perm(0o600);
        assert_eq!(attr.perm, Some(0o600));
        assert!(attr.mtime.is_none());
        assert!(SetAttr::new().perm.is_none());
    }
}

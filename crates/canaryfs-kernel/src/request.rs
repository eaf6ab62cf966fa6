//! Request descriptors: the immutable description of one intercepted call.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use strum::{Display, EnumString, IntoStaticStr};

/// Filesystem operation kind.
///
/// The lower-case name is what appears in prompts, audit lines and op-scoped
/// grant keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum OpKind {
    Access,
    Getattr,
    Readdir,
    Mkdir,
    Rmdir,
    Unlink,
    Rename,
    Open,
    Create,
    Read,
    Write,
    Truncate,
    Utimens,
    Chmod,
    Chown,
    Statfs,
}

impl OpKind {
    /// Operations that are audited but never gated.
    ///
    /// `statfs` is issued constantly by desktop tooling; prompting for it would
    /// make the mount unusable.
    pub fn is_ungated(&self) -> bool {
        matches!(self, OpKind::Statfs)
    }
}

/// Immutable description of one intercepted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Monotonically increasing sequence id.
    pub seq: u64,
    /// Operation kind.
    pub op: OpKind,
    /// Exact, normalized path the operation targets.
    pub path: PathBuf,
    /// Destination path (rename only).
    pub dest: Option<PathBuf>,
    /// When the dispatcher received the call.
    pub at: SystemTime,
}

impl RequestDescriptor {
    /// Returns true if this request is an audit-only operation.
    pub fn is_ungated(&self) -> bool {
        self.op.is_ungated()
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.path.display())?;
        if let Some(dest) = &self.dest {
            write!(f, " -> {}", dest.display())?;
        }
        Ok(())
    }
}

/// Hands out request descriptors with strictly increasing sequence ids.
#[derive(Debug)]
pub struct RequestSequencer {
    next: AtomicU64,
}

impl Default for RequestSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSequencer {
    /// Start numbering at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Build the descriptor for a call on `path`.
    pub fn describe(&self, op: OpKind, path: &Path) -> RequestDescriptor {
        self.build(op, path, None)
    }

    /// Build the descriptor for a call carrying a destination (rename).
    pub fn describe_with_dest(&self, op: OpKind, path: &Path, dest: &Path) -> RequestDescriptor {
        self.build(op, path, Some(dest.to_path_buf()))
    }

    fn build(&self, op: OpKind, path: &Path, dest: Option<PathBuf>) -> RequestDescriptor {
        RequestDescriptor {
            seq: self.next.fetch_add(1, Ordering::Relaxed),
            op,
            path: path.to_path_buf(),
            dest,
            at: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_op_kind_names() {
        assert_eq!(OpKind::Getattr.to_string(), "getattr");
        assert_eq!(OpKind::from_str("readdir").unwrap(), OpKind::Readdir);
        let name: &'static str = OpKind::Utimens.into();
        assert_eq!(name, "utimens");
    }

    #[test]
    fn test_sequence_ids_increase() {
        let seq = RequestSequencer::new();
        let a = seq.describe(OpKind::Read, Path::new("/x"));
        let b = seq.describe(OpKind::Read, Path::new("/x"));
        assert!(b.seq > a.seq);
        assert_eq!(a.seq, 1);
    }

    #[test]
    fn test_display_with_dest() {
        let seq = RequestSequencer::new();
        let req = seq.describe_with_dest(OpKind::Rename, Path::new("/a"), Path::new("/b"));
        assert_eq!(req.to_string(), "rename /a -> /b");
        assert!(!req.is_ungated());
    }
}

//! Operation dispatcher: the single entry point from the protocol layer.
//!
//! Every call goes through the same pipeline:
//!
//! ```text
//! protocol call ─► RequestDescriptor ─► AllowanceEngine::decide
//!                                          ├── DENY  ─► audit ─► EACCES
//!                                          └── ALLOW ─► StoreOps ─► audit ─► value / errno
//! ```
//!
//! This is the only module that speaks both the store's error vocabulary and
//! the protocol's errno vocabulary.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use rustix::io::Errno;

use crate::allowance::{AllowanceEngine, Basis, Decision, DecisionSource};
use crate::audit::{AuditSink, Outcome};
use crate::config::CanaryConfig;
use crate::request::{OpKind, RequestDescriptor, RequestSequencer};
use crate::store::path::normalize;
use crate::store::{DirEntry, FileAttr, MemoryStore, SetAttr, StatFs, StoreError, StoreOps, StoreResult};

/// Result in the protocol's vocabulary.
pub type ProtocolResult<T> = Result<T, Errno>;

/// Translate a store error into the errno the kernel expects.
pub fn errno_for(err: &StoreError) -> Errno {
    match err {
        StoreError::NotFound(_) => Errno::NOENT,
        StoreError::AlreadyExists(_) => Errno::EXIST,
        StoreError::NotEmpty(_) => Errno::NOTEMPTY,
        StoreError::CapacityExceeded { .. } => Errno::NOSPC,
        StoreError::NotADirectory(_) => Errno::NOTDIR,
        StoreError::IsADirectory(_) => Errno::ISDIR,
        StoreError::InvalidPath(_) => Errno::INVAL,
        StoreError::NameTooLong(_) => Errno::NAMETOOLONG,
        StoreError::PermissionDenied(_) => Errno::PERM,
    }
}

/// Errno returned when the allowance engine denies a call.
pub const DENIED: Errno = Errno::ACCESS;

/// Maps protocol calls onto the store, gated and audited.
pub struct Dispatcher {
    store: Arc<dyn StoreOps>,
    allowance: Arc<AllowanceEngine>,
    audit: Arc<dyn AuditSink>,
    sequencer: RequestSequencer,
    next_fh: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("capacity", &self.store.capacity())
            .field("used", &self.store.used())
            .field("allowance", &self.allowance)
            .finish()
    }
}

impl Dispatcher {
    /// Wire a dispatcher from explicitly owned parts.
    pub fn new(
        store: Arc<dyn StoreOps>,
        allowance: Arc<AllowanceEngine>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            allowance,
            audit,
            sequencer: RequestSequencer::new(),
            next_fh: AtomicU64::new(0),
        }
    }

    /// Build a fresh session: an empty store of the configured capacity and an
    /// allowance engine with no grants.
    pub fn from_config(
        config: &CanaryConfig,
        source: Arc<dyn DecisionSource>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new(config.capacity_bytes));
        let allowance = Arc::new(AllowanceEngine::new(config, source));
        Self::new(store, allowance, audit)
    }

    /// The underlying store, ungated. For reporting only.
    pub fn store(&self) -> &Arc<dyn StoreOps> {
        &self.store
    }

    /// The allowance engine.
    pub fn allowance(&self) -> &Arc<AllowanceEngine> {
        &self.allowance
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    /// Ask the allowance engine; audit and map to EACCES on deny.
    async fn gate(&self, request: &RequestDescriptor) -> ProtocolResult<Basis> {
        match self.allowance.decide(request).await {
            Decision::Allow(basis) => Ok(basis),
            Decision::Deny(basis) => {
                self.audit.record(request, &Outcome::Denied(basis));
                Err(DENIED)
            }
        }
    }

    /// Audit a store result and translate its error.
    fn finish<T>(
        &self,
        request: &RequestDescriptor,
        basis: Basis,
        result: StoreResult<T>,
    ) -> ProtocolResult<T> {
        match result {
            Ok(value) => {
                self.audit.record(request, &Outcome::Completed(basis));
                Ok(value)
            }
            Err(error) => {
                let errno = errno_for(&error);
                self.audit.record(request, &Outcome::Failed { basis, error });
                Err(errno)
            }
        }
    }

    async fn run<T, F>(&self, op: OpKind, path: &Path, f: F) -> ProtocolResult<T>
    where
        F: FnOnce(&dyn StoreOps, &Path) -> StoreResult<T>,
    {
        let path = normalize(path);
        let request = self.sequencer.describe(op, &path);
        tracing::trace!(seq = request.seq, op = %op, path = %path.display(), "dispatch");
        let basis = self.gate(&request).await?;
        let result = f(self.store.as_ref(), &path);
        self.finish(&request, basis, result)
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Attributes of `path`. Also serves kernel `lookup`.
    pub async fn getattr(&self, path: &Path) -> ProtocolResult<FileAttr> {
        self.run(OpKind::Getattr, path, |store, path| store.getattr(path))
            .await
    }

    /// Existence check; permission bits are not enforced.
    pub async fn access(&self, path: &Path, _mask: i32) -> ProtocolResult<()> {
        self.run(OpKind::Access, path, |store, path| {
            store.getattr(path).map(|_| ())
        })
        .await
    }

    /// Directory listing, sorted by name (without `.` and `..`).
    pub async fn readdir(&self, path: &Path) -> ProtocolResult<Vec<DirEntry>> {
        self.run(OpKind::Readdir, path, |store, path| store.readdir(path))
            .await
    }

    /// Open an existing node; returns a fresh file handle.
    pub async fn open(&self, path: &Path, _flags: i32) -> ProtocolResult<u64> {
        self.run(OpKind::Open, path, |store, path| store.getattr(path))
            .await?;
        Ok(self.alloc_fh())
    }

    /// Read up to `size` bytes at `offset`.
    pub async fn read(&self, path: &Path, offset: u64, size: u32) -> ProtocolResult<Vec<u8>> {
        self.run(OpKind::Read, path, |store, path| {
            store.read(path, offset, size)
        })
        .await
    }

    /// Filesystem statistics. Audited, never gated.
    pub async fn statfs(&self, path: &Path) -> ProtocolResult<StatFs> {
        self.run(OpKind::Statfs, path, |store, _| Ok(store.statfs()))
            .await
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write `data` at `offset`; all of it or none of it.
    pub async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> ProtocolResult<u32> {
        self.run(OpKind::Write, path, |store, path| {
            store.write(path, offset, data)
        })
        .await
    }

    /// Create an empty file; returns its attributes and a fresh file handle.
    pub async fn create(&self, path: &Path, mode: u32) -> ProtocolResult<(FileAttr, u64)> {
        let attr = self
            .run(OpKind::Create, path, |store, path| store.create(path, mode))
            .await?;
        Ok((attr, self.alloc_fh()))
    }

    /// Create a directory.
    pub async fn mkdir(&self, path: &Path, mode: u32) -> ProtocolResult<FileAttr> {
        self.run(OpKind::Mkdir, path, |store, path| store.mkdir(path, mode))
            .await
    }

    /// Remove a file.
    pub async fn unlink(&self, path: &Path) -> ProtocolResult<()> {
        self.run(OpKind::Unlink, path, |store, path| store.unlink(path))
            .await
    }

    /// Remove an empty directory.
    pub async fn rmdir(&self, path: &Path) -> ProtocolResult<()> {
        self.run(OpKind::Rmdir, path, |store, path| store.rmdir(path))
            .await
    }

    /// Truncate or zero-extend a file.
    pub async fn truncate(&self, path: &Path, size: u64) -> ProtocolResult<()> {
        self.run(OpKind::Truncate, path, |store, path| {
            store.truncate(path, size)
        })
        .await
    }

    /// Replace permission bits, keeping the node type.
    pub async fn chmod(&self, path: &Path, mode: u32) -> ProtocolResult<FileAttr> {
        self.run(OpKind::Chmod, path, |store, path| {
            store.setattr(path, SetAttr::new().with_perm(mode))
        })
        .await
    }

    /// Change ownership; `None` leaves that id alone.
    pub async fn chown(
        &self,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> ProtocolResult<FileAttr> {
        self.run(OpKind::Chown, path, |store, path| {
            store.setattr(path, SetAttr::new().with_owner(uid, gid))
        })
        .await
    }

    /// Set access and modification times; `None` means now.
    pub async fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ProtocolResult<FileAttr> {
        let now = SystemTime::now();
        let set = SetAttr::new().with_times(atime.unwrap_or(now), mtime.unwrap_or(now));
        self.run(OpKind::Utimens, path, |store, path| store.setattr(path, set))
            .await
    }

    /// Rename `from` to `to`.
    ///
    /// Both ends are gated (as `rename` on each path) and both are audited.
    /// On success, grants keyed to `from` are dropped rather than migrated,
    /// unless `from` and `to` are the same path.
    pub async fn rename(&self, from: &Path, to: &Path) -> ProtocolResult<()> {
        let from = normalize(from);
        let to = normalize(to);
        let source_req = self
            .sequencer
            .describe_with_dest(OpKind::Rename, &from, &to);
        let source_basis = self.gate(&source_req).await?;

        let dest_req = self.sequencer.describe(OpKind::Rename, &to);
        let dest_basis = match self.allowance.decide(&dest_req).await {
            Decision::Allow(basis) => basis,
            Decision::Deny(basis) => {
                tracing::debug!(allowed = %source_basis, "rename source allowed, destination denied");
                self.audit.record(&dest_req, &Outcome::Denied(basis.clone()));
                self.audit.record(&source_req, &Outcome::Denied(basis));
                return Err(DENIED);
            }
        };

        let result = self.store.rename(&from, &to);
        if result.is_ok() && from != to {
            self.allowance.forget_path(&from);
        }
        let _ = self.finish(&dest_req, dest_basis, result.clone());
        self.finish(&source_req, source_basis, result)
    }
}

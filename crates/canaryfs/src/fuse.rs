//! FUSE adapter: turns kernel callbacks into [`Dispatcher`] calls.
//!
//! The kernel speaks inode numbers; the dispatcher speaks paths. Store node ids
//! double as inode numbers (the root is 1 in both), and [`InodeTable`] keeps
//! the reverse mapping current as lookups, creates, removals and renames go by.
//!
//! Every callback resolves its path on the session thread, then hands the
//! dispatcher call to the tokio runtime and replies from there. A request
//! waiting on the operator therefore does not hold up calls that are already
//! granted.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use fuser::{
    FileType as FuseFileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::Mutex;
use rustix::io::Errno;
use tokio::runtime::Handle;

use canaryfs_kernel::store::{BLOCK_SIZE, ROOT_ID};
use canaryfs_kernel::{Dispatcher, FileAttr, FileType, StoreOps};

/// Attributes change behind the kernel's back (grants, other writers), so
/// nothing is cached.
const TTL: Duration = Duration::ZERO;

// ============================================================================
// Inode table
// ============================================================================

/// Inode number to current path.
#[derive(Debug)]
pub struct InodeTable {
    paths: HashMap<u64, PathBuf>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// A table knowing only the root.
    pub fn new() -> Self {
        let mut paths = HashMap::new();
        paths.insert(ROOT_ID, PathBuf::from("/"));
        Self { paths }
    }

    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).cloned()
    }

    /// Path of `name` inside directory `parent`.
    pub fn child(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.paths.get(&parent).map(|dir| dir.join(name))
    }

    /// Inode of the directory containing `ino`. The root is its own parent.
    pub fn parent_of(&self, ino: u64) -> u64 {
        let Some(parent) = self.paths.get(&ino).and_then(|p| p.parent()) else {
            return ROOT_ID;
        };
        self.paths
            .iter()
            .find(|(_, path)| path.as_path() == parent)
            .map(|(ino, _)| *ino)
            .unwrap_or(ROOT_ID)
    }

    pub fn remember(&mut self, ino: u64, path: PathBuf) {
        self.paths.insert(ino, path);
    }

    /// Remember `ino` at `path` only if the store still has that node there.
    ///
    /// Callbacks finish in any order. Removals and renames update the store
    /// before they take this table's lock, so a lookup that lost the race
    /// sees the change here instead of restoring a stale entry.
    pub fn remember_live(&mut self, ino: u64, path: PathBuf, store: &dyn StoreOps) -> bool {
        let live = store.getattr(&path).is_ok_and(|attr| attr.ino == ino);
        if live {
            self.remember(ino, path);
        }
        live
    }

    /// Drop `path` and everything known beneath it.
    pub fn forget(&mut self, path: &Path) {
        self.paths
            .retain(|ino, known| *ino == ROOT_ID || !known.starts_with(path));
    }

    /// Drop entries at or beneath a removed `path`, keeping any whose node
    /// the store still holds there (a newer node created under the same name).
    pub fn forget_removed(&mut self, path: &Path, store: &dyn StoreOps) {
        self.paths.retain(|ino, known| {
            *ino == ROOT_ID
                || !known.starts_with(path)
                || store.getattr(known.as_path()).is_ok_and(|attr| attr.ino == *ino)
        });
    }

    /// Re-home `from` and its descendants under `to`, dropping whatever was
    /// known at `to` before.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        self.forget(to);
        for known in self.paths.values_mut() {
            if let Ok(rest) = known.strip_prefix(from) {
                *known = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

// ============================================================================
// Attribute conversion
// ============================================================================

fn fuse_kind(kind: FileType) -> FuseFileType {
    match kind {
        FileType::File => FuseFileType::RegularFile,
        FileType::Directory => FuseFileType::Directory,
    }
}

fn fuse_attr(attr: &FileAttr) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks(),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: fuse_kind(attr.kind),
        perm: (attr.perm & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn raw(errno: Errno) -> i32 {
    errno.raw_os_error()
}

// ============================================================================
// Filesystem
// ============================================================================

type Listing = Vec<(u64, FuseFileType, OsString)>;

/// `fuser::Filesystem` over a [`Dispatcher`].
pub struct CanaryFuse {
    dispatcher: Arc<Dispatcher>,
    runtime: Handle,
    inodes: Arc<Mutex<InodeTable>>,
    /// Directory snapshots taken at opendir, keyed by handle.
    listings: Arc<Mutex<HashMap<u64, Listing>>>,
    next_dir_fh: AtomicU64,
}

impl CanaryFuse {
    pub fn new(dispatcher: Arc<Dispatcher>, runtime: Handle) -> Self {
        Self {
            dispatcher,
            runtime,
            inodes: Arc::new(Mutex::new(InodeTable::new())),
            listings: Arc::new(Mutex::new(HashMap::new())),
            next_dir_fh: AtomicU64::new(0),
        }
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf, i32> {
        self.inodes.lock().path(ino).ok_or(raw(Errno::NOENT))
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<PathBuf, i32> {
        self.inodes
            .lock()
            .child(parent, name)
            .ok_or(raw(Errno::NOENT))
    }

    /// Run an entry-producing call and remember the resulting inode.
    fn reply_entry<F>(&self, path: PathBuf, reply: ReplyEntry, call: F)
    where
        F: Future<Output = Result<FileAttr, Errno>> + Send + 'static,
    {
        let inodes = self.inodes.clone();
        let store = self.dispatcher.store().clone();
        self.runtime.spawn(async move {
            match call.await {
                Ok(attr) => {
                    inodes.lock().remember_live(attr.ino, path, store.as_ref());
                    reply.entry(&TTL, &fuse_attr(&attr), 0);
                }
                Err(errno) => reply.error(raw(errno)),
            }
        });
    }

    fn reply_empty<F>(&self, reply: ReplyEmpty, call: F)
    where
        F: Future<Output = Result<(), Errno>> + Send + 'static,
    {
        self.runtime.spawn(async move {
            match call.await {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(raw(errno)),
            }
        });
    }
}

impl Filesystem for CanaryFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = self.dispatcher.clone();
        let target = path.clone();
        self.reply_entry(path, reply, async move { fs.getattr(&target).await });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = self.dispatcher.clone();
        self.runtime.spawn(async move {
            match fs.getattr(&path).await {
                Ok(attr) => reply.attr(&TTL, &fuse_attr(&attr)),
                Err(errno) => reply.error(raw(errno)),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = self.dispatcher.clone();
        self.runtime.spawn(async move {
            // Each requested change is its own gated call.
            let result = async {
                if let Some(size) = size {
                    fs.truncate(&path, size).await?;
                }
                if let Some(mode) = mode {
                    fs.chmod(&path, mode & 0o7777).await?;
                }
                if uid.is_some() || gid.is_some() {
                    fs.chown(&path, uid, gid).await?;
                }
                if atime.is_some() || mtime.is_some() {
                    fs.utimens(&path, atime.map(resolve_time), mtime.map(resolve_time))
                        .await?;
                }
                Ok::<(), Errno>(())
            }
            .await;

            // Reply with the resulting attributes; the change itself was
            // already gated and audited.
            match result.and_then(|()| {
                fs.store()
                    .getattr(&path)
                    .map_err(|e| canaryfs_kernel::errno_for(&e))
            }) {
                Ok(attr) => reply.attr(&TTL, &fuse_attr(&attr)),
                Err(errno) => reply.error(raw(errno)),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = self.dispatcher.clone();
        let target = path.clone();
        self.reply_entry(path, reply, async move { fs.mkdir(&target, mode & !umask).await });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = self.dispatcher.clone();
        let inodes = self.inodes.clone();
        self.reply_empty(reply, async move {
            fs.unlink(&path).await?;
            inodes.lock().forget_removed(&path, fs.store().as_ref());
            Ok(())
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = self.dispatcher.clone();
        let inodes = self.inodes.clone();
        self.reply_empty(reply, async move {
            fs.rmdir(&path).await?;
            inodes.lock().forget_removed(&path, fs.store().as_ref());
            Ok(())
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (from, to) = match (self.child_of(parent, name), self.child_of(newparent, newname)) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(errno), _) | (_, Err(errno)) => return reply.error(errno),
        };
        let fs = self.dispatcher.clone();
        let inodes = self.inodes.clone();
        self.reply_empty(reply, async move {
            fs.rename(&from, &to).await?;
            inodes.lock().rename(&from, &to);
            Ok(())
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = self.dispatcher.clone();
        self.runtime.spawn(async move {
            match fs.open(&path, flags).await {
                Ok(fh) => reply.opened(fh, 0),
                Err(errno) => reply.error(raw(errno)),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(raw(Errno::INVAL));
        };
        let fs = self.dispatcher.clone();
        self.runtime.spawn(async move {
            match fs.read(&path, offset, size).await {
                Ok(data) => reply.data(&data),
                Err(errno) => reply.error(raw(errno)),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(raw(Errno::INVAL));
        };
        let data = data.to_vec();
        let fs = self.dispatcher.clone();
        self.runtime.spawn(async move {
            match fs.write(&path, offset, &data).await {
                Ok(written) => reply.written(written),
                Err(errno) => reply.error(raw(errno)),
            }
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = self.dispatcher.clone();
        let inodes = self.inodes.clone();
        let listings = self.listings.clone();
        let fh = self.next_dir_fh.fetch_add(1, Ordering::Relaxed) + 1;
        self.runtime.spawn(async move {
            let entries = match fs.readdir(&path).await {
                Ok(entries) => entries,
                Err(errno) => return reply.error(raw(errno)),
            };

            let mut listing: Listing = Vec::with_capacity(entries.len() + 2);
            {
                let mut inodes = inodes.lock();
                listing.push((ino, FuseFileType::Directory, OsString::from(".")));
                listing.push((inodes.parent_of(ino), FuseFileType::Directory, OsString::from("..")));
                for entry in entries {
                    inodes.remember_live(entry.ino, path.join(&entry.name), fs.store().as_ref());
                    listing.push((entry.ino, fuse_kind(entry.kind), OsString::from(entry.name)));
                }
            }
            listings.lock().insert(fh, listing);
            reply.opened(fh, 0);
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let listings = self.listings.lock();
        let Some(listing) = listings.get(&fh) else {
            return reply.error(raw(Errno::BADF));
        };
        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (ino, kind, name)) in listing.iter().enumerate().skip(skip) {
            // The offset handed back is the index of the next entry.
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.listings.lock().remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.path_of(ino).unwrap_or_else(|_| PathBuf::from("/"));
        let fs = self.dispatcher.clone();
        self.runtime.spawn(async move {
            match fs.statfs(&path).await {
                Ok(st) => reply.statfs(
                    st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                    st.frsize,
                ),
                Err(errno) => reply.error(raw(errno)),
            }
        });
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = self.dispatcher.clone();
        self.reply_empty(reply, async move { fs.access(&path, mask).await });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = self.dispatcher.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            match fs.create(&path, mode & !umask).await {
                Ok((attr, fh)) => {
                    inodes.lock().remember_live(attr.ino, path, fs.store().as_ref());
                    reply.created(&TTL, &fuse_attr(&attr), 0, fh, 0);
                }
                Err(errno) => reply.error(raw(errno)),
            }
        });
    }
}

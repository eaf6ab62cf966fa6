//! In-memory, capacity-bounded store.
//!
//! Nodes live in an arena keyed by [`NodeId`]. Directories own their children
//! by id; children point back at their parent by id, so the tree has no
//! ownership cycles. All data is lost when the store is dropped.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::SystemTime;

use super::error::{StoreError, StoreResult};
use super::ops::StoreOps;
use super::path::{components, display};
use super::types::{DirEntry, FileAttr, FileType, NodeId, ROOT_ID, SetAttr, StatFs};

/// Default capacity: 10 MiB.
pub const DEFAULT_CAPACITY: u64 = 10 * 1024 * 1024;

#[derive(Debug)]
enum Body {
    File(Vec<u8>),
    Directory(BTreeMap<String, NodeId>),
}

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    name: String,
    attr: FileAttr,
    body: Body,
}

impl Node {
    fn children(&self) -> Option<&BTreeMap<String, NodeId>> {
        match &self.body {
            Body::Directory(children) => Some(children),
            Body::File(_) => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut BTreeMap<String, NodeId>> {
        match &mut self.body {
            Body::Directory(children) => Some(children),
            Body::File(_) => None,
        }
    }
}

/// The node arena plus capacity accounting.
#[derive(Debug)]
struct Tree {
    nodes: HashMap<NodeId, Node>,
    next_id: NodeId,
    used: u64,
}

impl Tree {
    fn new(uid: u32, gid: u32) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID,
            Node {
                parent: None,
                name: String::new(),
                attr: FileAttr::directory(ROOT_ID, 0o755, uid, gid),
                body: Body::Directory(BTreeMap::new()),
            },
        );
        Self {
            nodes,
            next_id: ROOT_ID + 1,
            used: 0,
        }
    }

    fn node(&self, id: NodeId) -> StoreResult<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| StoreError::not_found(format!("node {id}")))
    }

    fn node_mut(&mut self, id: NodeId) -> StoreResult<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("node {id}")))
    }

    /// Walk `names` from the root.
    fn resolve(&self, names: &[String]) -> StoreResult<NodeId> {
        let mut current = ROOT_ID;
        for (depth, name) in names.iter().enumerate() {
            let children = self
                .node(current)?
                .children()
                .ok_or_else(|| StoreError::not_a_directory(display(&names[..depth])))?;
            current = *children
                .get(name)
                .ok_or_else(|| StoreError::not_found(display(&names[..=depth])))?;
        }
        Ok(current)
    }

    /// Resolve the parent directory of `names` and return it with the final name.
    fn resolve_parent<'a>(&self, names: &'a [String]) -> StoreResult<(NodeId, &'a str)> {
        let Some((name, parent_names)) = names.split_last() else {
            return Err(StoreError::already_exists("/"));
        };
        let parent = self.resolve(parent_names)?;
        if self.node(parent)?.children().is_none() {
            return Err(StoreError::not_a_directory(display(parent_names)));
        }
        Ok((parent, name.as_str()))
    }

    fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes
            .get(&parent)
            .and_then(Node::children)
            .and_then(|children| children.get(name).copied())
    }

    fn alloc_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert(&mut self, parent: NodeId, name: &str, attr: FileAttr, body: Body) -> StoreResult<()> {
        let id = attr.ino;
        let is_dir = attr.is_dir();
        let parent_node = self.node_mut(parent)?;
        if let Some(children) = parent_node.children_mut() {
            children.insert(name.to_string(), id);
        }
        if is_dir {
            parent_node.attr.nlink += 1;
        }
        touch(&mut parent_node.attr);
        self.nodes.insert(
            id,
            Node {
                parent: Some(parent),
                name: name.to_string(),
                attr,
                body,
            },
        );
        Ok(())
    }

    /// Unhook a node from its parent without dropping it.
    fn detach(&mut self, id: NodeId) -> StoreResult<()> {
        let node = self.node(id)?;
        let (parent, name, is_dir) = match node.parent {
            Some(parent) => (parent, node.name.clone(), node.attr.is_dir()),
            None => return Err(StoreError::permission_denied("/")),
        };
        let parent_node = self.node_mut(parent)?;
        if let Some(children) = parent_node.children_mut() {
            children.remove(&name);
        }
        if is_dir {
            parent_node.attr.nlink = parent_node.attr.nlink.saturating_sub(1);
        }
        touch(&mut parent_node.attr);
        Ok(())
    }

    /// Detach and drop a file or empty directory, releasing its capacity.
    fn remove(&mut self, id: NodeId) -> StoreResult<()> {
        self.detach(id)?;
        if let Some(node) = self.nodes.remove(&id) {
            if let Body::File(content) = node.body {
                self.used = self.used.saturating_sub(content.len() as u64);
            }
        }
        Ok(())
    }
}

/// Mark a node modified now.
fn touch(attr: &mut FileAttr) {
    let now = SystemTime::now();
    attr.mtime = now;
    attr.ctime = now;
}

/// In-memory filesystem store with a hard byte capacity.
///
/// Thread-safe via a single internal lock: the whole tree is the unit of
/// mutual exclusion, so no caller ever observes a half-applied mutation.
#[derive(Debug)]
pub struct MemoryStore {
    capacity: u64,
    uid: u32,
    gid: u32,
    tree: Mutex<Tree>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemoryStore {
    /// Create an empty store owned by the current process user.
    pub fn new(capacity: u64) -> Self {
        let uid = rustix::process::getuid().as_raw();
        let gid = rustix::process::getgid().as_raw();
        Self::with_owner(capacity, uid, gid)
    }

    /// Create an empty store whose nodes are owned by `uid`/`gid`.
    pub fn with_owner(capacity: u64, uid: u32, gid: u32) -> Self {
        Self {
            capacity,
            uid,
            gid,
            tree: Mutex::new(Tree::new(uid, gid)),
        }
    }

    /// Fail unless `delta` more bytes fit.
    fn reserve(&self, used: u64, delta: u64) -> StoreResult<()> {
        let available = self.capacity.saturating_sub(used);
        if delta > available {
            return Err(StoreError::CapacityExceeded {
                requested: delta,
                available,
            });
        }
        Ok(())
    }

    fn make_node(&self, path: &Path, kind: FileType, mode: u32) -> StoreResult<FileAttr> {
        let names = components(path)?;
        let mut tree = self.tree.lock();
        let (parent, name) = tree.resolve_parent(&names)?;
        if tree.child(parent, name).is_some() {
            return Err(StoreError::already_exists(display(&names)));
        }

        let id = tree.alloc_id();
        let (attr, body) = match kind {
            FileType::File => (
                FileAttr::file(id, mode, self.uid, self.gid),
                Body::File(Vec::new()),
            ),
            FileType::Directory => (
                FileAttr::directory(id, mode, self.uid, self.gid),
                Body::Directory(BTreeMap::new()),
            ),
        };
        tree.insert(parent, name, attr.clone(), body)?;
        Ok(attr)
    }
}

impl StoreOps for MemoryStore {
    fn getattr(&self, path: &Path) -> StoreResult<FileAttr> {
        let names = components(path)?;
        let tree = self.tree.lock();
        let id = tree.resolve(&names)?;
        Ok(tree.node(id)?.attr.clone())
    }

    fn readdir(&self, path: &Path) -> StoreResult<Vec<DirEntry>> {
        let names = components(path)?;
        let mut tree = self.tree.lock();
        let id = tree.resolve(&names)?;
        let children = tree
            .node(id)?
            .children()
            .ok_or_else(|| StoreError::not_a_directory(display(&names)))?;

        // BTreeMap iteration is already sorted by name
        let mut entries = Vec::with_capacity(children.len());
        for (name, child) in children {
            let kind = tree.node(*child)?.attr.kind;
            entries.push(DirEntry {
                name: name.clone(),
                kind,
                ino: *child,
            });
        }
        tree.node_mut(id)?.attr.atime = SystemTime::now();
        Ok(entries)
    }

    fn read(&self, path: &Path, offset: u64, size: u32) -> StoreResult<Vec<u8>> {
        let names = components(path)?;
        let mut tree = self.tree.lock();
        let id = tree.resolve(&names)?;
        let node = tree.node_mut(id)?;
        let Body::File(content) = &node.body else {
            return Err(StoreError::is_a_directory(display(&names)));
        };

        let len = content.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(u64::from(size)).min(len) as usize;
        let data = content[start..end].to_vec();
        node.attr.atime = SystemTime::now();
        Ok(data)
    }

    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> StoreResult<u32> {
        let names = components(path)?;
        let mut tree = self.tree.lock();
        let id = tree.resolve(&names)?;
        let used = tree.used;

        let node = tree.node_mut(id)?;
        let Body::File(content) = &mut node.body else {
            return Err(StoreError::is_a_directory(display(&names)));
        };
        if data.is_empty() {
            return Ok(0);
        }

        let old_size = content.len() as u64;
        let end = offset.saturating_add(data.len() as u64);
        let new_size = old_size.max(end);
        let delta = new_size - old_size;
        self.reserve(used, delta)?;

        // new_size <= capacity, so these fit in usize
        let start = offset as usize;
        if new_size > old_size {
            content.resize(new_size as usize, 0);
        }
        content[start..start + data.len()].copy_from_slice(data);

        node.attr.size = new_size;
        let now = SystemTime::now();
        node.attr.mtime = now;
        node.attr.ctime = now;
        node.attr.atime = now;
        tree.used += delta;

        Ok(data.len() as u32)
    }

    fn create(&self, path: &Path, mode: u32) -> StoreResult<FileAttr> {
        self.make_node(path, FileType::File, mode)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> StoreResult<FileAttr> {
        self.make_node(path, FileType::Directory, mode)
    }

    fn unlink(&self, path: &Path) -> StoreResult<()> {
        let names = components(path)?;
        if names.is_empty() {
            return Err(StoreError::is_a_directory("/"));
        }
        let mut tree = self.tree.lock();
        let id = tree.resolve(&names)?;
        if tree.node(id)?.attr.is_dir() {
            return Err(StoreError::is_a_directory(display(&names)));
        }
        tree.remove(id)
    }

    fn rmdir(&self, path: &Path) -> StoreResult<()> {
        let names = components(path)?;
        if names.is_empty() {
            return Err(StoreError::permission_denied("cannot remove root"));
        }
        let mut tree = self.tree.lock();
        let id = tree.resolve(&names)?;
        match tree.node(id)?.children() {
            None => return Err(StoreError::not_a_directory(display(&names))),
            Some(children) if !children.is_empty() => {
                return Err(StoreError::not_empty(display(&names)));
            }
            Some(_) => {}
        }
        tree.remove(id)
    }

    fn rename(&self, from: &Path, to: &Path) -> StoreResult<()> {
        let from_names = components(from)?;
        let to_names = components(to)?;
        if from_names.is_empty() || to_names.is_empty() {
            return Err(StoreError::invalid_path("cannot rename the root"));
        }

        let mut tree = self.tree.lock();
        let source = tree.resolve(&from_names)?;
        let (new_parent, new_name) = tree.resolve_parent(&to_names)?;
        if from_names == to_names {
            return Ok(());
        }

        let source_is_dir = tree.node(source)?.attr.is_dir();
        if source_is_dir && to_names.starts_with(&from_names) {
            return Err(StoreError::invalid_path(format!(
                "cannot move {} into itself",
                display(&from_names)
            )));
        }

        // Validate the destination fully before touching anything.
        let replaced = match tree.child(new_parent, new_name) {
            None => None,
            Some(existing) => {
                let existing_node = tree.node(existing)?;
                match existing_node.children() {
                    Some(children) if !children.is_empty() => {
                        return Err(StoreError::already_exists(display(&to_names)));
                    }
                    Some(_) if !source_is_dir => {
                        return Err(StoreError::is_a_directory(display(&to_names)));
                    }
                    None if source_is_dir => {
                        return Err(StoreError::not_a_directory(display(&to_names)));
                    }
                    _ => Some(existing),
                }
            }
        };

        if let Some(existing) = replaced {
            tree.remove(existing)?;
        }
        tree.detach(source)?;

        let parent_node = tree.node_mut(new_parent)?;
        if let Some(children) = parent_node.children_mut() {
            children.insert(new_name.to_string(), source);
        }
        if source_is_dir {
            parent_node.attr.nlink += 1;
        }
        touch(&mut parent_node.attr);

        let node = tree.node_mut(source)?;
        node.parent = Some(new_parent);
        node.name = new_name.to_string();
        node.attr.ctime = SystemTime::now();
        Ok(())
    }

    fn truncate(&self, path: &Path, size: u64) -> StoreResult<()> {
        let names = components(path)?;
        let mut tree = self.tree.lock();
        let id = tree.resolve(&names)?;
        let used = tree.used;

        let node = tree.node_mut(id)?;
        let Body::File(content) = &mut node.body else {
            return Err(StoreError::is_a_directory(display(&names)));
        };

        let old_size = content.len() as u64;
        if size > old_size {
            self.reserve(used, size - old_size)?;
        }
        content.resize(size as usize, 0);
        node.attr.size = size;
        touch(&mut node.attr);

        tree.used = used - old_size + size;
        Ok(())
    }

    fn setattr(&self, path: &Path, set: SetAttr) -> StoreResult<FileAttr> {
        let names = components(path)?;
        let mut tree = self.tree.lock();
        let id = tree.resolve(&names)?;
        let attr = &mut tree.node_mut(id)?.attr;

        if let Some(perm) = set.perm {
            attr.perm = perm & 0o7777;
        }
        if let Some(uid) = set.uid {
            attr.uid = uid;
        }
        if let Some(gid) = set.gid {
            attr.gid = gid;
        }
        if let Some(atime) = set.atime {
            attr.atime = atime;
        }
        if let Some(mtime) = set.mtime {
            attr.mtime = mtime;
        }
        attr.ctime = SystemTime::now();
        Ok(attr.clone())
    }

    fn statfs(&self) -> StatFs {
        let tree = self.tree.lock();
        StatFs::for_capacity(self.capacity, tree.used, tree.nodes.len() as u64)
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn used(&self) -> u64 {
        self.tree.lock().used
    }
}

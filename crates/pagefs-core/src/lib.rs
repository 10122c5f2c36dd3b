#![forbid(unsafe_code)]
//! The pagefs namespace: path resolution and the operation surface the
//! host bridge calls.
//!
//! [`PageFs`] owns the whole filesystem state (the page store, the
//! `NodeId -> BlockId` table, and the node-id issuer) behind one coarse
//! [`parking_lot::Mutex`]. Operations come in two flavors: the path-keyed
//! surface (`getattr`, `mknod`, `read`, ...) used by path-based hosts,
//! and a node-keyed surface (`attr_of`, `lookup_child`, ...) used by the
//! FUSE bridge, which addresses inodes directly.

pub mod check;
mod path;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use pagefs_dir as dir;
use pagefs_error::{PfsError, Result};
use pagefs_file as file;
use pagefs_inode::{create_inode, remove_inode, CreateAttrs, Inode, NodeIds};
use pagefs_store::PageStore;
use pagefs_types::{data_pages_for, BlockId, NodeId, PAGE_SIZE};
use tracing::{debug, trace};

pub use pagefs_inode::NodeKind;

/// Caller context applied to nodes created through the path surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsConfig {
    pub uid: u32,
    pub gid: u32,
}

/// Attribute snapshot of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub node: NodeId,
    pub parent: NodeId,
    pub kind: NodeKind,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub rdev: u64,
    /// 512-byte units, as `stat(2)` reports them.
    pub blocks: u64,
    pub crtime: i64,
    pub mtime: i64,
}

/// One `readdir` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub node: NodeId,
    pub kind: NodeKind,
    pub name: String,
}

/// Allocation counters for reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FsStats {
    pub pages_allocated: u64,
    pub nodes_live: u64,
    pub node_ids_issued: u64,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

pub(crate) struct FsInner {
    pub(crate) store: PageStore,
    pub(crate) nodes: HashMap<NodeId, BlockId>,
    pub(crate) ids: NodeIds,
    uid: u32,
    gid: u32,
}

/// The in-memory filesystem.
pub struct PageFs {
    inner: Mutex<FsInner>,
}

impl PageFs {
    /// Build a fresh filesystem containing only the root directory.
    ///
    /// The root inode's page is the store's first allocation, id 0,
    /// which is what lets chain slots use 0 as the empty sentinel.
    pub fn new(config: FsConfig) -> Result<Self> {
        let mut store = PageStore::new();
        let mut ids = NodeIds::new();
        let root = create_inode(
            &mut store,
            &mut ids,
            NodeKind::Dir,
            "/",
            NodeId::ROOT,
            CreateAttrs {
                mode: None,
                uid: config.uid,
                gid: config.gid,
                rdev: 0,
                now: now_secs(),
            },
        )?;
        debug_assert_eq!(root.node_id, NodeId::ROOT);
        debug_assert_eq!(root.self_block, BlockId(0));

        let mut nodes = HashMap::new();
        nodes.insert(root.node_id, root.self_block);
        Ok(Self {
            inner: Mutex::new(FsInner {
                store,
                nodes,
                ids,
                uid: config.uid,
                gid: config.gid,
            }),
        })
    }

    // ── Path-keyed surface ──────────────────────────────────────────────

    /// Host bridge startup hook. All state exists from construction, so
    /// this only announces itself.
    pub fn init(&self) {
        let inner = self.inner.lock();
        debug!(
            target: "pagefs::core",
            event = "init",
            pages = inner.store.allocated()
        );
    }

    pub fn getattr(&self, path: &str) -> Result<NodeStat> {
        let inner = self.inner.lock();
        let inode = inner.resolve(path)?;
        Ok(inner.stat_of(&inode))
    }

    /// Emit `.`, `..`, then every child in insertion order.
    pub fn readdir(&self, path: &str, emit: &mut dyn FnMut(&str, &NodeStat)) -> Result<()> {
        let inner = self.inner.lock();
        let dir_inode = inner.resolve(path)?;
        if dir_inode.kind != NodeKind::Dir {
            return Err(PfsError::NotDirectory);
        }
        emit(".", &inner.stat_of(&dir_inode));
        let parent = inner.inode_of(dir_inode.parent)?;
        emit("..", &inner.stat_of(&parent));
        for child in dir::children(&inner.store, &dir_inode)? {
            emit(&child.name, &inner.stat_of(&child));
        }
        Ok(())
    }

    pub fn mknod(&self, path: &str, mode: u32, rdev: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let (uid, gid) = (inner.uid, inner.gid);
        inner
            .create_at(path, NodeKind::File, Some(mode), rdev, uid, gid)
            .map(|_| ())
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let (uid, gid) = (inner.uid, inner.gid);
        inner
            .create_at(path, NodeKind::Dir, Some(mode), 0, uid, gid)
            .map(|_| ())
    }

    /// Stateless: no handle table, nothing to do.
    pub fn open(&self, path: &str, flags: u32) {
        trace!(target: "pagefs::core", event = "open", path, flags);
    }

    pub fn read(&self, path: &str, off: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.lock();
        let inode = inner.resolve(path)?;
        file::read(&inner.store, &inode, off, buf)
    }

    /// Write `data` at `off`, growing the file to `max(size, off + len)`.
    /// Returns the full length written.
    pub fn write(&self, path: &str, off: u64, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let inode = inner.resolve(path)?;
        inner.write_file(inode, off, data)
    }

    /// Resize a file; growth zero-fills implicitly (fresh pages are
    /// zero, missing pages read as holes).
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let inode = inner.resolve(path)?;
        inner.truncate_file(inode, size)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let (parent, leaf) = inner.resolve_parent(path)?;
        inner.remove_at_parent(parent, leaf, false)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let (parent, leaf) = inner.resolve_parent(path)?;
        inner.remove_at_parent(parent, leaf, true)
    }

    // ── Node-keyed surface (FUSE bridge) ────────────────────────────────

    pub fn attr_of(&self, node: NodeId) -> Result<NodeStat> {
        let inner = self.inner.lock();
        let inode = inner.inode_of(node)?;
        Ok(inner.stat_of(&inode))
    }

    pub fn lookup_child(&self, parent: NodeId, name: &str) -> Result<NodeStat> {
        let inner = self.inner.lock();
        let dir_inode = inner.inode_of(parent)?;
        let child = dir::lookup(&inner.store, &dir_inode, name)?
            .ok_or_else(|| PfsError::NotFound(name.to_owned()))?;
        Ok(inner.stat_of(&child))
    }

    pub fn read_dir(&self, node: NodeId) -> Result<Vec<DirEntry>> {
        let inner = self.inner.lock();
        let dir_inode = inner.inode_of(node)?;
        if dir_inode.kind != NodeKind::Dir {
            return Err(PfsError::NotDirectory);
        }
        let mut entries = vec![
            DirEntry {
                node: dir_inode.node_id,
                kind: NodeKind::Dir,
                name: ".".to_owned(),
            },
            DirEntry {
                node: dir_inode.parent,
                kind: NodeKind::Dir,
                name: "..".to_owned(),
            },
        ];
        for child in dir::children(&inner.store, &dir_inode)? {
            entries.push(DirEntry {
                node: child.node_id,
                kind: child.kind,
                name: child.name,
            });
        }
        Ok(entries)
    }

    /// Create a child under `parent` with explicit caller credentials.
    pub fn create_child(
        &self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        mode: u32,
        rdev: u64,
        uid: u32,
        gid: u32,
    ) -> Result<NodeStat> {
        let mut inner = self.inner.lock();
        let parent_inode = inner.inode_of(parent)?;
        let child = inner.create_node(parent_inode, name, kind, Some(mode), rdev, uid, gid)?;
        Ok(inner.stat_of(&child))
    }

    pub fn unlink_child(&self, parent: NodeId, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let parent_inode = inner.inode_of(parent)?;
        inner.remove_at_parent(parent_inode, name, false)
    }

    pub fn rmdir_child(&self, parent: NodeId, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let parent_inode = inner.inode_of(parent)?;
        inner.remove_at_parent(parent_inode, name, true)
    }

    pub fn read_node(&self, node: NodeId, off: u64, size: u32) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let inode = inner.inode_of(node)?;
        let want = (inode.size.saturating_sub(off)).min(u64::from(size));
        let want = usize::try_from(want)
            .map_err(|_| PfsError::InvalidArgument("read length overflows usize"))?;
        let mut buf = vec![0_u8; want];
        let n = file::read(&inner.store, &inode, off, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write_node(&self, node: NodeId, off: u64, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let inode = inner.inode_of(node)?;
        inner.write_file(inode, off, data)
    }

    pub fn truncate_node(&self, node: NodeId, size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let inode = inner.inode_of(node)?;
        inner.truncate_file(inode, size)
    }

    // ── Reporting ───────────────────────────────────────────────────────

    pub fn stats(&self) -> FsStats {
        let inner = self.inner.lock();
        FsStats {
            pages_allocated: inner.store.allocated() as u64,
            nodes_live: inner.nodes.len() as u64,
            node_ids_issued: inner.ids.issued(),
        }
    }

    /// Run the full invariant sweep (see [`check`]).
    pub fn check(&self) -> check::CheckReport {
        let inner = self.inner.lock();
        check::verify(&inner)
    }
}

impl FsInner {
    fn inode_of(&self, node: NodeId) -> Result<Inode> {
        let block = self
            .nodes
            .get(&node)
            .ok_or_else(|| PfsError::NotFound(format!("node {node}")))?;
        Inode::load(&self.store, *block)
    }

    fn resolve(&self, path_str: &str) -> Result<Inode> {
        let comps = path::components(path_str)?;
        self.resolve_components(&comps, path_str)
    }

    fn resolve_components(&self, comps: &[&str], full: &str) -> Result<Inode> {
        let mut cur = self.inode_of(NodeId::ROOT)?;
        for comp in comps {
            cur = dir::lookup(&self.store, &cur, comp)?
                .ok_or_else(|| PfsError::NotFound(full.to_owned()))?;
        }
        Ok(cur)
    }

    /// Resolve all but the last component; the leaf need not exist.
    fn resolve_parent<'p>(&self, path_str: &'p str) -> Result<(Inode, &'p str)> {
        let (parent_comps, leaf) = path::split_leaf(path_str)?;
        let parent = self.resolve_components(&parent_comps, path_str)?;
        Ok((parent, leaf))
    }

    fn stat_of(&self, inode: &Inode) -> NodeStat {
        NodeStat {
            node: inode.node_id,
            parent: inode.parent,
            kind: inode.kind,
            mode: inode.mode,
            nlink: inode.nlink,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            rdev: inode.rdev,
            blocks: data_pages_for(inode.size) * (PAGE_SIZE as u64 / 512),
            crtime: inode.crtime,
            mtime: inode.mtime,
        }
    }

    fn create_at(
        &mut self,
        path_str: &str,
        kind: NodeKind,
        mode: Option<u32>,
        rdev: u64,
        uid: u32,
        gid: u32,
    ) -> Result<Inode> {
        let (parent, leaf) = self.resolve_parent(path_str)?;
        self.create_node(parent, leaf, kind, mode, rdev, uid, gid)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_node(
        &mut self,
        mut parent: Inode,
        name: &str,
        kind: NodeKind,
        mode: Option<u32>,
        rdev: u64,
        uid: u32,
        gid: u32,
    ) -> Result<Inode> {
        if parent.kind != NodeKind::Dir {
            return Err(PfsError::NotDirectory);
        }
        if dir::lookup(&self.store, &parent, name)?.is_some() {
            return Err(PfsError::Exists);
        }
        let child = create_inode(
            &mut self.store,
            &mut self.ids,
            kind,
            name,
            parent.node_id,
            CreateAttrs {
                mode,
                uid,
                gid,
                rdev,
                now: now_secs(),
            },
        )?;
        if let Err(e) = dir::insert(&mut self.store, &mut parent, child.self_block) {
            // Roll the half-created inode back so nothing leaks.
            let _ = remove_inode(&mut self.store, &child);
            return Err(e);
        }
        self.nodes.insert(child.node_id, child.self_block);
        debug!(
            target: "pagefs::core",
            event = "create",
            parent = parent.node_id.0,
            node = child.node_id.0,
            kind = ?kind,
            name
        );
        Ok(child)
    }

    fn remove_at_parent(&mut self, mut parent: Inode, name: &str, want_dir: bool) -> Result<()> {
        let child = dir::lookup(&self.store, &parent, name)?
            .ok_or_else(|| PfsError::NotFound(name.to_owned()))?;
        match (want_dir, child.kind) {
            (true, NodeKind::File) => return Err(PfsError::NotDirectory),
            (false, NodeKind::Dir) => return Err(PfsError::IsDirectory),
            _ => {}
        }
        let mut child = child;
        if child.kind == NodeKind::File {
            // Release the whole data chain before the inode goes away.
            file::realloc(&mut self.store, &mut child, 0)?;
        } else if !dir::is_empty(&self.store, &child)? {
            return Err(PfsError::NotEmpty);
        }
        dir::remove(&mut self.store, &mut parent, child.self_block)?;
        remove_inode(&mut self.store, &child)?;
        self.nodes.remove(&child.node_id);
        debug!(
            target: "pagefs::core",
            event = "remove",
            parent = parent.node_id.0,
            node = child.node_id.0,
            name
        );
        Ok(())
    }

    fn write_file(&mut self, mut inode: Inode, off: u64, data: &[u8]) -> Result<usize> {
        let end = off
            .checked_add(data.len() as u64)
            .ok_or(PfsError::InvalidArgument("write range overflows u64"))?;
        if end > inode.size {
            file::realloc(&mut self.store, &mut inode, end)?;
        }
        let n = file::write(&mut self.store, &inode, off, data)?;
        inode.mtime = now_secs();
        inode.flush(&mut self.store)?;
        Ok(n)
    }

    fn truncate_file(&mut self, mut inode: Inode, size: u64) -> Result<()> {
        file::realloc(&mut self.store, &mut inode, size)?;
        inode.mtime = now_secs();
        inode.flush(&mut self.store)
    }
}

#![forbid(unsafe_code)]
//! Inode management.
//!
//! An inode occupies exactly one page: fixed little-endian field offsets,
//! a magic word for corruption detection, and the component name inline.
//! Every inode owns a content chain whose head page is allocated together
//! with the inode itself.

use pagefs_chain::IndexPage;
use pagefs_error::{PfsError, Result};
use pagefs_store::PageStore;
use pagefs_types::{
    read_le_i64, read_le_u16, read_le_u32, read_le_u64, write_le_i64, write_le_u16, write_le_u32,
    write_le_u64, BlockId, NodeId, MAX_NODES, NAME_MAX, S_IFDIR, S_IFMT, S_IFREG,
};
use tracing::debug;

/// Magic word in every inode page ("PFN1").
const INODE_MAGIC: u32 = 0x5046_4E31;

// Field offsets within the inode page.
const OFF_MAGIC: usize = 0x00;
const OFF_KIND: usize = 0x04;
const OFF_NAME_LEN: usize = 0x06;
const OFF_NODE_ID: usize = 0x08;
const OFF_PARENT: usize = 0x10;
const OFF_SELF_BLOCK: usize = 0x18;
const OFF_CONTENT_HEAD: usize = 0x20;
const OFF_CONTENT_TAIL: usize = 0x28;
const OFF_SIZE: usize = 0x30;
const OFF_MODE: usize = 0x38;
const OFF_UID: usize = 0x3C;
const OFF_GID: usize = 0x40;
const OFF_NLINK: usize = 0x44;
const OFF_RDEV: usize = 0x48;
const OFF_CRTIME: usize = 0x50;
const OFF_MTIME: usize = 0x58;
const OFF_NAME: usize = 0x60;

/// What an inode is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    fn to_raw(self) -> u16 {
        match self {
            Self::File => 1,
            Self::Dir => 2,
        }
    }

    fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::File),
            2 => Some(Self::Dir),
            _ => None,
        }
    }

    /// The `S_IFMT` bits this kind corresponds to.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::File => S_IFREG,
            Self::Dir => S_IFDIR,
        }
    }
}

/// In-memory view of one inode page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub kind: NodeKind,
    pub node_id: NodeId,
    pub parent: NodeId,
    pub self_block: BlockId,
    pub content_head: BlockId,
    pub content_tail: BlockId,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub rdev: u64,
    pub crtime: i64,
    pub mtime: i64,
    pub name: String,
}

impl Inode {
    /// Decode the inode stored at `block`.
    pub fn load(store: &PageStore, block: BlockId) -> Result<Self> {
        let page = store.page(block)?;
        let corrupt = |detail: String| PfsError::Corruption {
            block: block.0,
            detail,
        };

        let magic = read_le_u32(page, OFF_MAGIC).map_err(|e| corrupt(e.to_string()))?;
        if magic != INODE_MAGIC {
            return Err(corrupt(format!("bad inode magic {magic:#010x}")));
        }
        let kind_raw = read_le_u16(page, OFF_KIND).map_err(|e| corrupt(e.to_string()))?;
        let kind = NodeKind::from_raw(kind_raw)
            .ok_or_else(|| corrupt(format!("unknown inode kind {kind_raw}")))?;
        let name_len = usize::from(read_le_u16(page, OFF_NAME_LEN).map_err(|e| corrupt(e.to_string()))?);
        if name_len > NAME_MAX {
            return Err(corrupt(format!("inode name length {name_len} exceeds limit")));
        }
        let self_block =
            BlockId(read_le_u64(page, OFF_SELF_BLOCK).map_err(|e| corrupt(e.to_string()))?);
        if self_block != block {
            return Err(corrupt(format!(
                "inode self reference {self_block} does not match its page"
            )));
        }
        let name_bytes = &page[OFF_NAME..OFF_NAME + name_len];
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| corrupt("inode name is not valid UTF-8".into()))?;

        Ok(Self {
            kind,
            node_id: NodeId(read_le_u64(page, OFF_NODE_ID).map_err(|e| corrupt(e.to_string()))?),
            parent: NodeId(read_le_u64(page, OFF_PARENT).map_err(|e| corrupt(e.to_string()))?),
            self_block,
            content_head: BlockId(
                read_le_u64(page, OFF_CONTENT_HEAD).map_err(|e| corrupt(e.to_string()))?,
            ),
            content_tail: BlockId(
                read_le_u64(page, OFF_CONTENT_TAIL).map_err(|e| corrupt(e.to_string()))?,
            ),
            size: read_le_u64(page, OFF_SIZE).map_err(|e| corrupt(e.to_string()))?,
            mode: read_le_u32(page, OFF_MODE).map_err(|e| corrupt(e.to_string()))?,
            uid: read_le_u32(page, OFF_UID).map_err(|e| corrupt(e.to_string()))?,
            gid: read_le_u32(page, OFF_GID).map_err(|e| corrupt(e.to_string()))?,
            nlink: read_le_u32(page, OFF_NLINK).map_err(|e| corrupt(e.to_string()))?,
            rdev: read_le_u64(page, OFF_RDEV).map_err(|e| corrupt(e.to_string()))?,
            crtime: read_le_i64(page, OFF_CRTIME).map_err(|e| corrupt(e.to_string()))?,
            mtime: read_le_i64(page, OFF_MTIME).map_err(|e| corrupt(e.to_string()))?,
            name,
        })
    }

    /// Persist this inode to its own page.
    pub fn flush(&self, store: &mut PageStore) -> Result<()> {
        debug_assert!(self.name.len() <= NAME_MAX);
        let page = store.page_mut(self.self_block)?;
        write_le_u32(page, OFF_MAGIC, INODE_MAGIC);
        write_le_u16(page, OFF_KIND, self.kind.to_raw());
        #[allow(clippy::cast_possible_truncation)] // bounded by NAME_MAX
        write_le_u16(page, OFF_NAME_LEN, self.name.len() as u16);
        write_le_u64(page, OFF_NODE_ID, self.node_id.0);
        write_le_u64(page, OFF_PARENT, self.parent.0);
        write_le_u64(page, OFF_SELF_BLOCK, self.self_block.0);
        write_le_u64(page, OFF_CONTENT_HEAD, self.content_head.0);
        write_le_u64(page, OFF_CONTENT_TAIL, self.content_tail.0);
        write_le_u64(page, OFF_SIZE, self.size);
        write_le_u32(page, OFF_MODE, self.mode);
        write_le_u32(page, OFF_UID, self.uid);
        write_le_u32(page, OFF_GID, self.gid);
        write_le_u32(page, OFF_NLINK, self.nlink);
        write_le_u64(page, OFF_RDEV, self.rdev);
        write_le_i64(page, OFF_CRTIME, self.crtime);
        write_le_i64(page, OFF_MTIME, self.mtime);
        page[OFF_NAME..OFF_NAME + self.name.len()].copy_from_slice(self.name.as_bytes());
        // Stale name bytes past the recorded length are harmless but
        // confusing in hexdumps; clear them.
        page[OFF_NAME + self.name.len()..OFF_NAME + NAME_MAX].fill(0);
        Ok(())
    }
}

/// Monotonic node-id issuer. Ids are never reused.
#[derive(Debug, Default)]
pub struct NodeIds {
    next: u64,
}

impl NodeIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next unused id, or `OutOfNodes` past the cap.
    pub fn next(&mut self) -> Result<NodeId> {
        if self.next >= MAX_NODES {
            return Err(PfsError::OutOfNodes);
        }
        let id = NodeId(self.next);
        self.next += 1;
        Ok(id)
    }

    /// Highest id issued so far plus one.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.next
    }
}

/// Creation-time attributes supplied by the caller context.
#[derive(Debug, Clone, Copy)]
pub struct CreateAttrs {
    /// Permission/type bits; defaulted per kind when `None`.
    pub mode: Option<u32>,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    /// Wall-clock seconds for crtime/mtime.
    pub now: i64,
}

/// Allocate and persist a fresh inode with an empty content chain.
///
/// The caller is responsible for linking the returned inode into its
/// parent directory's chain.
pub fn create_inode(
    store: &mut PageStore,
    ids: &mut NodeIds,
    kind: NodeKind,
    name: &str,
    parent: NodeId,
    attrs: CreateAttrs,
) -> Result<Inode> {
    if name.is_empty() {
        return Err(PfsError::InvalidArgument("empty inode name"));
    }
    if name.len() > NAME_MAX {
        return Err(PfsError::NameTooLong);
    }

    let node_id = ids.next()?;
    let self_block = store.alloc()?;
    let content_head = match store.alloc() {
        Ok(id) => id,
        Err(e) => {
            store.free(self_block)?;
            return Err(e);
        }
    };

    let mut mode = attrs.mode.unwrap_or(kind.mode_bits() | 0o755);
    if mode & S_IFMT == 0 {
        mode |= kind.mode_bits();
    }

    let inode = Inode {
        kind,
        node_id,
        parent,
        self_block,
        content_head,
        content_tail: content_head,
        size: 0,
        mode,
        uid: attrs.uid,
        gid: attrs.gid,
        nlink: 1,
        rdev: attrs.rdev,
        crtime: attrs.now,
        mtime: attrs.now,
        name: name.to_owned(),
    };
    inode.flush(store)?;
    debug!(
        target: "pagefs::inode",
        event = "inode_create",
        node = node_id.0,
        block = self_block.0,
        kind = ?kind,
        name
    );
    Ok(inode)
}

/// Free the pages of an inode whose content chain has already been
/// reduced to its bare head (files via `realloc(0)`, directories by
/// emptiness).
pub fn remove_inode(store: &mut PageStore, inode: &Inode) -> Result<()> {
    let head = IndexPage::load(store, inode.content_head)?;
    if head.next().is_some() || !head.is_payload_empty() {
        return Err(PfsError::Corruption {
            block: inode.content_head.0,
            detail: "removing an inode with a live content chain".into(),
        });
    }
    store.free(inode.content_head)?;
    store.free(inode.self_block)?;
    debug!(
        target: "pagefs::inode",
        event = "inode_remove",
        node = inode.node_id.0,
        block = inode.self_block.0
    );
    Ok(())
}

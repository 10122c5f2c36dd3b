#![forbid(unsafe_code)]
//! FUSE adapter for pagefs.
//!
//! A thin translation layer: kernel FUSE requests arrive via the `fuser`
//! crate, get forwarded to the [`PageFs`] node-keyed surface, and errors
//! are mapped through `PfsError::to_errno()`. FUSE inode numbers are
//! `NodeId + 1`, because the kernel reserves ino 1 for the root while the
//! core's root node id is 0.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use pagefs_core::{NodeKind, NodeStat, PageFs};
use pagefs_types::{NodeId, PAGE_SIZE};
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// TTL for cached attributes and entries. The filesystem is only
/// mutated through this mount, so a short TTL suffices.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Type conversions ────────────────────────────────────────────────────────

fn ino_of(node: NodeId) -> u64 {
    node.0 + 1
}

fn node_of(ino: u64) -> Option<NodeId> {
    ino.checked_sub(1).map(NodeId)
}

fn to_file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::File => FileType::RegularFile,
        NodeKind::Dir => FileType::Directory,
    }
}

fn to_system_time(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::try_from(secs).unwrap_or(0))
}

#[allow(clippy::cast_possible_truncation)] // perm is the low 16 mode bits, rdev a FUSE u32
fn to_file_attr(st: &NodeStat) -> FileAttr {
    FileAttr {
        ino: ino_of(st.node),
        size: st.size,
        blocks: st.blocks,
        atime: to_system_time(st.mtime),
        mtime: to_system_time(st.mtime),
        ctime: to_system_time(st.mtime),
        crtime: to_system_time(st.crtime),
        kind: to_file_type(st.kind),
        perm: (st.mode & 0o7777) as u16,
        nlink: st.nlink,
        uid: st.uid,
        gid: st.gid,
        rdev: st.rdev as u32,
        blksize: PAGE_SIZE as u32,
        flags: 0,
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter delegating every operation to a [`PageFs`].
pub struct PagefsFuse {
    fs: PageFs,
}

impl PagefsFuse {
    #[must_use]
    pub fn new(fs: PageFs) -> Self {
        Self { fs }
    }
}

impl Filesystem for PagefsFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        self.fs.init();
        Ok(())
    }

    fn destroy(&mut self) {}

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent) = node_of(parent) else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.lookup_child(parent, name) {
            Ok(st) => reply.entry(&ATTR_TTL, &to_file_attr(&st), 0),
            Err(e) => {
                // A missing entry is the common case; only warn on real failures.
                if e.to_errno() != libc::ENOENT {
                    warn!(parent = parent.0, name, error = %e, "lookup failed");
                }
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(node) = node_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.attr_of(node) {
            Ok(st) => reply.attr(&ATTR_TTL, &to_file_attr(&st)),
            Err(e) => {
                warn!(ino, error = %e, "getattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(node) = node_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        // Only size changes (truncate) are honored; other attribute
        // updates are accepted as no-ops and the current state returned.
        if let Some(size) = size {
            if let Err(e) = self.fs.truncate_node(node, size) {
                warn!(ino, size, error = %e, "truncate failed");
                reply.error(e.to_errno());
                return;
            }
        }
        match self.fs.attr_of(node) {
            Ok(st) => reply.attr(&ATTR_TTL, &to_file_attr(&st)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent) = node_of(parent) else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.create_child(
            parent,
            name,
            NodeKind::File,
            mode,
            u64::from(rdev),
            req.uid(),
            req.gid(),
        ) {
            Ok(st) => reply.entry(&ATTR_TTL, &to_file_attr(&st), 0),
            Err(e) => {
                warn!(parent = parent.0, name, error = %e, "mknod failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent) = node_of(parent) else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self
            .fs
            .create_child(parent, name, NodeKind::Dir, mode, 0, req.uid(), req.gid())
        {
            Ok(st) => reply.entry(&ATTR_TTL, &to_file_attr(&st), 0),
            Err(e) => {
                warn!(parent = parent.0, name, error = %e, "mkdir failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (Some(parent), Some(name)) = (node_of(parent), name.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.unlink_child(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (Some(parent), Some(name)) = (node_of(parent), name.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.rmdir_child(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Stateless open: no file handles are tracked.
        reply.opened(0, 0);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
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
        let Some(node) = node_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.read_node(node, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!(ino, offset, size, error = %e, "read failed");
                reply.error(e.to_errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        let Some(node) = node_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.write_node(node, offset, data) {
            Ok(n) => reply.written(u32::try_from(n).unwrap_or(u32::MAX)),
            Err(e) => {
                warn!(ino, offset, len = data.len(), error = %e, "write failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(node) = node_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        let skip = usize::try_from(offset).unwrap_or(0);
        match self.fs.read_dir(node) {
            Ok(entries) => {
                for (i, entry) in entries.iter().enumerate().skip(skip) {
                    let full = reply.add(
                        ino_of(entry.node),
                        i64::try_from(i + 1).unwrap_or(i64::MAX),
                        to_file_type(entry.kind),
                        OsStr::new(&entry.name),
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => {
                warn!(ino, offset, error = %e, "readdir failed");
                reply.error(e.to_errno());
            }
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("pagefs".to_owned()),
        MountOption::Subtype("pagefs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

fn validate_mountpoint(mountpoint: &Path) -> Result<(), FuseError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    Ok(())
}

/// Mount a pagefs filesystem at the given mountpoint (blocking).
///
/// Blocks until the filesystem is unmounted.
pub fn mount(
    fs: PageFs,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    validate_mountpoint(mountpoint)?;
    let fuse_opts = build_mount_options(options);
    fuser::mount2(PagefsFuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount in the background, returning a session handle; the filesystem
/// is unmounted when the handle is dropped.
pub fn mount_background(
    fs: PageFs,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    validate_mountpoint(mountpoint)?;
    let fuse_opts = build_mount_options(options);
    let session = fuser::spawn_mount2(PagefsFuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(session)
}

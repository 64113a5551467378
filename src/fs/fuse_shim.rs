//! FUSE shim for the binfmt_misc emulator
//!
//! `fuser` speaks inodes; [`BinfmtMisc`] speaks paths. This module keeps the
//! mapping between the two and forwards every callback.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │          update-binfmts / test suite (echo, cat, test -e)      │
//! └────────────────────────────────────────────────────────────────┘
//!                                  │ VFS syscalls
//!                                  ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                 Linux Kernel VFS → /dev/fuse                   │
//! └────────────────────────────────────────────────────────────────┘
//!                                  │ fuser crate (one session thread)
//!                                  ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                   BinfmtMiscFs (this module)                   │
//! │            inode ⇄ path table, attribute conversion            │
//! └────────────────────────────────────────────────────────────────┘
//!                                  │ paths
//!                                  ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │        BinfmtMisc adapter → registry + wire formats            │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! binfmt-misc-fs -s /tmp/binfmt_misc
//! echo 1 > /tmp/binfmt_misc/status
//! echo ':jar:E::jar::/usr/bin/jexec:' > /tmp/binfmt_misc/register
//! cat /tmp/binfmt_misc/jar
//! fusermount -u /tmp/binfmt_misc
//! ```

use std::time::{Duration, SystemTime};

use rustc_hash::FxHashMap;

use crate::adapter::{BinfmtMisc, FileKind, NodeAttr, REGISTER_NAME, STATUS_NAME};
use crate::error::{BinfmtError, Result};

#[cfg(feature = "fuse")]
use std::ffi::OsStr;
#[cfg(feature = "fuse")]
use std::path::Path;

#[cfg(feature = "fuse")]
use log::{debug, info};

/// Inode number type (matches fuser's u64 inode convention)
pub type Ino = u64;

/// Root inode number (FUSE convention: inode 1 is root)
pub const ROOT_INO: Ino = 1;

/// Inode of `/register`
pub const REGISTER_INO: Ino = 2;

/// Inode of `/status`
pub const STATUS_INO: Ino = 3;

/// First inode handed out to binding entries
pub const FIRST_ENTRY_INO: Ino = 4;

/// File attributes for FUSE
///
/// Mirrors `fuser::FileAttr` so attribute construction works without the
/// `fuse` feature.
#[derive(Clone, Debug)]
pub struct FileAttr {
    pub ino: Ino,
    pub size: u64,
    /// Number of 512-byte blocks allocated
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Creation time (macOS only)
    pub crtime: SystemTime,
    pub kind: FileKind,
    /// Permissions (mode & 0o7777)
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    /// Flags (macOS only)
    pub flags: u32,
}

impl Default for FileAttr {
    fn default() -> Self {
        let now = SystemTime::now();
        FileAttr {
            ino: 0,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileKind::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

impl FileAttr {
    /// Attach an inode number to what the adapter reported.
    pub fn from_node(ino: Ino, node: NodeAttr) -> Self {
        FileAttr {
            ino,
            size: node.size,
            blocks: node.size.div_ceil(512),
            kind: node.kind,
            perm: node.perm,
            nlink: node.nlink,
            ..Default::default()
        }
    }
}

#[cfg(feature = "fuse")]
impl From<FileAttr> for fuser::FileAttr {
    fn from(attr: FileAttr) -> Self {
        fuser::FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.crtime,
            kind: attr.kind.into(),
            perm: attr.perm,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
            flags: attr.flags,
        }
    }
}

#[cfg(feature = "fuse")]
impl From<FileKind> for fuser::FileType {
    fn from(kind: FileKind) -> Self {
        match kind {
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::RegularFile => fuser::FileType::RegularFile,
        }
    }
}

/// Stable inode numbers for entry names
///
/// An inode stays bound to its name for the life of the process, so a name
/// that is removed and registered again gets its old inode back.
#[derive(Debug)]
pub struct InodeTable {
    by_name: FxHashMap<String, Ino>,
    names: FxHashMap<Ino, String>,
    next_ino: Ino,
}

impl Default for InodeTable {
    fn default() -> Self {
        InodeTable {
            by_name: FxHashMap::default(),
            names: FxHashMap::default(),
            next_ino: FIRST_ENTRY_INO,
        }
    }
}

impl InodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inode for a root-level name, allocating one for unseen entry names.
    pub fn ino_for(&mut self, name: &str) -> Ino {
        match name {
            REGISTER_NAME => return REGISTER_INO,
            STATUS_NAME => return STATUS_INO,
            _ => {}
        }
        if let Some(&ino) = self.by_name.get(name) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_name.insert(name.to_string(), ino);
        self.names.insert(ino, name.to_string());
        ino
    }

    /// Path an inode stands for.
    pub fn path_of(&self, ino: Ino) -> Result<String> {
        match ino {
            ROOT_INO => Ok("/".to_string()),
            REGISTER_INO => Ok(format!("/{}", REGISTER_NAME)),
            STATUS_INO => Ok(format!("/{}", STATUS_NAME)),
            _ => self
                .names
                .get(&ino)
                .map(|name| format!("/{}", name))
                .ok_or(BinfmtError::NotFound),
        }
    }
}

/// The FUSE-facing filesystem
///
/// Owns the adapter outright; every fuser callback takes `&mut self`, so
/// requests are serialized without locks.
pub struct BinfmtMiscFs {
    fs: BinfmtMisc,
    inodes: InodeTable,
    /// Zero so the kernel re-asks after every registration or removal
    ttl: Duration,
}

impl BinfmtMiscFs {
    pub fn new(fs: BinfmtMisc) -> Self {
        BinfmtMiscFs {
            fs,
            inodes: InodeTable::new(),
            ttl: Duration::ZERO,
        }
    }

    pub fn inner(&self) -> &BinfmtMisc {
        &self.fs
    }

    pub fn inner_mut(&mut self) -> &mut BinfmtMisc {
        &mut self.fs
    }

    /// Attributes of an inode, if it still resolves.
    pub fn attr(&self, ino: Ino) -> Result<FileAttr> {
        let path = self.inodes.path_of(ino)?;
        let node = self.fs.getattr(&path)?;
        Ok(FileAttr::from_node(ino, node))
    }

    /// Attributes of `name` under the root, allocating its inode on success.
    pub fn lookup_name(&mut self, name: &str) -> Result<FileAttr> {
        if name.is_empty() || name.contains('/') {
            return Err(BinfmtError::NotFound);
        }
        let node = self.fs.getattr(&format!("/{}", name))?;
        let ino = self.inodes.ino_for(name);
        Ok(FileAttr::from_node(ino, node))
    }

    /// Root listing as `(ino, kind, name)` triples.
    pub fn list_root(&mut self) -> Result<Vec<(Ino, FileKind, String)>> {
        let entries = self.fs.readdir("/")?;
        Ok(entries
            .into_iter()
            .map(|e| {
                let ino = match e.name.as_str() {
                    "." | ".." => ROOT_INO,
                    name => self.inodes.ino_for(name),
                };
                (ino, e.kind, e.name)
            })
            .collect())
    }

    #[cfg_attr(not(feature = "fuse"), allow(dead_code))]
    fn path(&self, ino: Ino) -> Result<String> {
        self.inodes.path_of(ino)
    }
}

// =============================================================================
// FUSER FILESYSTEM TRAIT IMPLEMENTATION
// =============================================================================

#[cfg(feature = "fuse")]
impl fuser::Filesystem for BinfmtMiscFs {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        info!("binfmt_misc emulator initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            "binfmt_misc emulator unmounted ({} bindings dropped)",
            self.fs.registry().len()
        );
    }

    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        if parent != ROOT_INO {
            reply.error(libc::ENOTDIR);
            return;
        }

        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.lookup_name(name) {
            Ok(attr) => reply.entry(&self.ttl, &attr.into(), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        match self.attr(ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr.into()),
            Err(e) => reply.error(e.errno()),
        }
    }

    /// Only size changes arrive here in practice (`O_TRUNC` from `echo >`).
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let result = self.path(ino).and_then(|path| {
            if let Some(size) = size {
                self.fs.truncate(&path, size)?;
            }
            self.attr(ino)
        });
        match result {
            Ok(attr) => reply.attr(&self.ttl, &attr.into()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let result = self.path(ino).and_then(|path| self.fs.open(&path, flags));
        match result {
            // Content is synthesized per read; keep the page cache out of it.
            Ok(()) => reply.opened(0, fuser::consts::FOPEN_DIRECT_IO),
            Err(e) => {
                debug!("open ino {} flags {:#o}: {}", ino, flags, e);
                reply.error(e.errno())
            }
        }
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let result = self
            .path(ino)
            .and_then(|path| self.fs.read(&path, offset as u64, size as usize));
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let result = self.path(ino).and_then(|path| {
            debug!("write {} ({} bytes)", path, data.len());
            self.fs.write(&path, data)
        });
        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        match self.path(ino).and_then(|path| self.fs.flush(&path)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        match self.attr(ino) {
            Ok(attr) if attr.kind == FileKind::Directory => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let entries = match self.path(ino).and_then(|path| {
            // Only the root lists; the adapter rejects anything else.
            self.fs.readdir(&path)?;
            self.list_root()
        }) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            // Reply returns true if buffer is full
            if reply.add(ino, (i + 1) as i64, kind.into(), &name) {
                break;
            }
        }

        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let files = self.fs.registry().len() as u64 + 3;
        reply.statfs(0, 0, 0, files, 0, 512, 255, 0);
    }

    fn access(&mut self, _req: &fuser::Request<'_>, ino: u64, _mask: i32, reply: fuser::ReplyEmpty) {
        match self.attr(ino) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        match self.path(ino).and_then(|path| self.fs.readlink(&path)) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.errno()),
        }
    }
}

// =============================================================================
// MOUNT FUNCTIONS
// =============================================================================

/// Mount options, filled from `-o opt[,opt...]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountOptions {
    /// Filesystem name shown in mount output
    pub fsname: String,
    pub subtype: Option<String>,
    pub read_only: bool,
    /// Allow other users to access the mount (default: false)
    pub allow_other: bool,
    /// Allow root to access the mount (default: false)
    pub allow_root: bool,
    pub auto_unmount: bool,
    pub default_permissions: bool,
    /// Anything not recognized, passed through to the kernel untouched
    pub custom: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            fsname: "binfmt_misc".to_string(),
            subtype: None,
            read_only: false,
            allow_other: false,
            allow_root: false,
            auto_unmount: false,
            default_permissions: false,
            custom: Vec::new(),
        }
    }
}

impl MountOptions {
    /// Apply a comma-separated option string. Later options win.
    pub fn apply(&mut self, opts: &str) {
        for opt in opts.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match opt {
                "ro" => self.read_only = true,
                "rw" => self.read_only = false,
                "allow_other" => self.allow_other = true,
                "allow_root" => self.allow_root = true,
                "auto_unmount" => self.auto_unmount = true,
                "default_permissions" => self.default_permissions = true,
                _ => {
                    if let Some(name) = opt.strip_prefix("fsname=") {
                        self.fsname = name.to_string();
                    } else if let Some(subtype) = opt.strip_prefix("subtype=") {
                        self.subtype = Some(subtype.to_string());
                    } else {
                        self.custom.push(opt.to_string());
                    }
                }
            }
        }
    }

    #[cfg(feature = "fuse")]
    pub fn to_fuser(&self) -> Vec<fuser::MountOption> {
        use fuser::MountOption;

        let mut opts = vec![MountOption::FSName(self.fsname.clone())];
        if let Some(subtype) = &self.subtype {
            opts.push(MountOption::Subtype(subtype.clone()));
        }
        opts.push(if self.read_only {
            MountOption::RO
        } else {
            MountOption::RW
        });
        if self.allow_other {
            opts.push(MountOption::AllowOther);
        } else if self.allow_root {
            opts.push(MountOption::AllowRoot);
        }
        if self.auto_unmount {
            opts.push(MountOption::AutoUnmount);
        }
        if self.default_permissions {
            opts.push(MountOption::DefaultPermissions);
        }
        opts.extend(self.custom.iter().cloned().map(MountOption::CUSTOM));
        opts
    }
}

/// Mount in a background session thread
///
/// The returned session unmounts when dropped. Requests are still handled
/// one at a time on that single session thread.
#[cfg(feature = "fuse")]
pub fn spawn_mount<P: AsRef<Path>>(
    fs: BinfmtMisc,
    mountpoint: P,
    options: &MountOptions,
) -> std::io::Result<fuser::BackgroundSession> {
    info!(
        "mounting binfmt_misc emulator at {}",
        mountpoint.as_ref().display()
    );
    fuser::spawn_mount2(BinfmtMiscFs::new(fs), mountpoint.as_ref(), &options.to_fuser())
}

// =============================================================================
// TESTS
// =============================================================================

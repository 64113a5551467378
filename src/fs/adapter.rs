//! Path-based binfmt_misc filesystem model
//!
//! The tree is flat:
//!
//! ```text
//! /
//! ├── register    write-only control file, accepts register records
//! ├── status      write "1" to enable, anything else to disable
//! └── <name>      one file per binding; read renders it, "-1" removes it
//! ```
//!
//! [`BinfmtMisc`] answers every request from the path alone; it knows nothing
//! about inodes or the FUSE protocol. The shim in `fuse_shim` does that
//! translation. Requests are handled one at a time through `&mut self`.

use log::{debug, info, warn};

use crate::error::{BinfmtError, Result};
use crate::registry::Registry;
use crate::wire;

/// Name of the registration control file
pub const REGISTER_NAME: &str = "register";

/// Name of the enable/disable control file
pub const STATUS_NAME: &str = "status";

/// File type of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// Directory
    Directory,
    /// Regular file
    RegularFile,
}

/// What `getattr` reports for a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeAttr {
    pub kind: FileKind,
    /// Permissions (mode & 0o7777)
    pub perm: u16,
    pub nlink: u32,
    pub size: u64,
}

/// Directory entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

impl DirEntry {
    fn new(name: impl Into<String>, kind: FileKind) -> Self {
        DirEntry {
            name: name.into(),
            kind,
        }
    }
}

/// A path resolved to one of the node classes of the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Node<'a> {
    Root,
    Register,
    Status,
    /// `/<name>`; may or may not be registered
    Entry(&'a str),
}

impl<'a> Node<'a> {
    /// Classify a path. Anything deeper than one level resolves to nothing.
    pub fn classify(path: &'a str) -> Option<Self> {
        let rest = path.strip_prefix('/')?;
        match rest {
            "" => Some(Node::Root),
            REGISTER_NAME => Some(Node::Register),
            STATUS_NAME => Some(Node::Status),
            name if !name.contains('/') => Some(Node::Entry(name)),
            _ => None,
        }
    }
}

/// One filesystem request, minus the path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op<'a> {
    GetAttr,
    ReadDir,
    Open { flags: i32 },
    Read { offset: u64, size: usize },
    Write { data: &'a [u8] },
    Truncate { size: u64 },
    Flush,
    ReadLink,
}

/// Successful outcome of an [`Op`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Attr(NodeAttr),
    Entries(Vec<DirEntry>),
    Opened,
    Data(Vec<u8>),
    Written(usize),
    Done,
}

/// In-memory binfmt_misc instance: the binding registry plus the global
/// enabled flag.
#[derive(Debug, Default)]
pub struct BinfmtMisc {
    registry: Registry,
    enabled: bool,
}

impl BinfmtMisc {
    /// Empty registry, disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `/status` was last set to `1`. Not consulted by any operation.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Dispatch a request to the matching hook.
    pub fn handle(&mut self, path: &str, op: Op<'_>) -> Result<Reply> {
        match op {
            Op::GetAttr => self.getattr(path).map(Reply::Attr),
            Op::ReadDir => self.readdir(path).map(Reply::Entries),
            Op::Open { flags } => self.open(path, flags).map(|()| Reply::Opened),
            Op::Read { offset, size } => self.read(path, offset, size).map(Reply::Data),
            Op::Write { data } => self.write(path, data).map(Reply::Written),
            Op::Truncate { size } => self.truncate(path, size).map(|()| Reply::Done),
            Op::Flush => self.flush(path).map(|()| Reply::Done),
            Op::ReadLink => self.readlink(path).map(Reply::Data),
        }
    }

    pub fn getattr(&self, path: &str) -> Result<NodeAttr> {
        match Node::classify(path).ok_or(BinfmtError::NotFound)? {
            Node::Root => Ok(NodeAttr {
                kind: FileKind::Directory,
                perm: 0o755,
                nlink: 2,
                size: 0,
            }),
            Node::Register => Ok(file_attr(0o200, 0)),
            Node::Status => Ok(file_attr(0o644, 0)),
            Node::Entry(name) => {
                let content = wire::render_entry(&self.registry, name)?;
                Ok(file_attr(0o644, content.len() as u64))
            }
        }
    }

    /// List the root directory as it is right now.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        if Node::classify(path) != Some(Node::Root) {
            return Err(BinfmtError::NotFound);
        }

        let names = self.registry.names();
        let mut entries = Vec::with_capacity(names.len() + 4);
        entries.push(DirEntry::new(".", FileKind::Directory));
        entries.push(DirEntry::new("..", FileKind::Directory));
        entries.extend(
            names
                .into_iter()
                .map(|name| DirEntry::new(name, FileKind::RegularFile)),
        );
        entries.push(DirEntry::new(REGISTER_NAME, FileKind::RegularFile));
        entries.push(DirEntry::new(STATUS_NAME, FileKind::RegularFile));
        Ok(entries)
    }

    /// `/register` only opens write-only; everything else that exists opens.
    pub fn open(&self, path: &str, flags: i32) -> Result<()> {
        self.getattr(path)?;
        if Node::classify(path) == Some(Node::Register)
            && flags & libc::O_ACCMODE != libc::O_WRONLY
        {
            return Err(BinfmtError::PermissionDenied);
        }
        Ok(())
    }

    pub fn read(&self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        match Node::classify(path) {
            Some(Node::Register) | Some(Node::Status) => {
                Err(BinfmtError::InvalidArgument("control files are not readable"))
            }
            Some(Node::Entry(name)) => {
                let content = wire::render_entry(&self.registry, name)?;
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
                let end = start.saturating_add(size).min(content.len());
                Ok(content[start..end].to_vec())
            }
            Some(Node::Root) | None => Err(BinfmtError::NotFound),
        }
    }

    /// Returns the number of bytes consumed, which is always all of `data`.
    pub fn write(&mut self, path: &str, data: &[u8]) -> Result<usize> {
        match Node::classify(path) {
            Some(Node::Status) => {
                self.enabled = wire::strip_newline(data) == b"1";
                info!(
                    "binfmt_misc {}",
                    if self.enabled { "enabled" } else { "disabled" }
                );
                Ok(data.len())
            }
            Some(Node::Register) => wire::register(&mut self.registry, data).map_err(|e| {
                warn!("rejected register record \"{}\": {}", data.escape_ascii(), e);
                e
            }),
            Some(Node::Entry(name)) if self.registry.contains(name) => {
                if wire::strip_newline(data) != b"-1" {
                    return Err(BinfmtError::InvalidArgument("entries only accept -1"));
                }
                self.registry.remove(name)?;
                info!("removed {}", name);
                Ok(data.len())
            }
            _ => Err(BinfmtError::NotFound),
        }
    }

    /// Content is derived from the registry, so there is nothing to cut.
    pub fn truncate(&mut self, path: &str, size: u64) -> Result<()> {
        debug!("truncate {} to {} ignored", path, size);
        Ok(())
    }

    pub fn flush(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    /// There are no symlinks in this tree.
    pub fn readlink(&self, _path: &str) -> Result<Vec<u8>> {
        Err(BinfmtError::NotSupported)
    }
}

fn file_attr(perm: u16, size: u64) -> NodeAttr {
    NodeAttr {
        kind: FileKind::RegularFile,
        perm,
        nlink: 1,
        size,
    }
}

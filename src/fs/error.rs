//! Error types for binfmt_misc operations
//!
//! Every failure a filesystem request can hit maps onto exactly one errno,
//! the same one the kernel's binfmt_misc module returns for that situation.
//! Callers never see a partially applied mutation: a request either succeeds
//! or leaves the registry and the enabled flag untouched.

use thiserror::Error;

/// Result type for binfmt_misc operations
pub type Result<T> = std::result::Result<T, BinfmtError>;

/// Errors surfaced to filesystem clients
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BinfmtError {
    /// Path does not resolve to the root, a control file or a registered entry
    #[error("no such file or directory")]
    NotFound,

    /// Malformed register record, bad write value, or read of a control file
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A binding with this name is already registered
    #[error("binding already exists: {0}")]
    AlreadyExists(String),

    /// `/register` opened with a readable access mode
    #[error("permission denied")]
    PermissionDenied,

    /// Operation has no meaning here (there are no symlinks)
    #[error("operation not supported")]
    NotSupported,
}

impl BinfmtError {
    /// The errno reported back through FUSE.
    pub fn errno(&self) -> libc::c_int {
        match self {
            BinfmtError::NotFound => libc::ENOENT,
            BinfmtError::InvalidArgument(_) => libc::EINVAL,
            BinfmtError::AlreadyExists(_) => libc::EEXIST,
            BinfmtError::PermissionDenied => libc::EACCES,
            // readlink(2) on something that is not a symlink
            BinfmtError::NotSupported => libc::EINVAL,
        }
    }
}

//! # binfmt-misc-fs
//!
//! A user-space stand-in for the Linux `binfmt_misc` filesystem.
//!
//! Test suites for binary format registration tools (`update-binfmts` and
//! friends) need a `binfmt_misc` mount to talk to, but mounting the real one
//! takes root and changes how the host executes binaries. This crate serves
//! the same files over FUSE from an in-memory registry instead:
//!
//! - `register` accepts `:name:type:offset:magic:mask:interpreter:flags`
//!   records
//! - `status` toggles the global enabled flag
//! - `<name>` renders a binding in the kernel's format; writing `-1` removes it
//!
//! Nothing is ever executed and nothing outlives the process.

pub mod fs;
pub use fs::*;

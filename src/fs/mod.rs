pub mod adapter;
pub mod error;
pub mod fuse_shim;
pub mod registry;
pub mod signal;
pub mod wire;

pub use adapter::*;
pub use error::*;
pub use fuse_shim::*;
pub use registry::*;

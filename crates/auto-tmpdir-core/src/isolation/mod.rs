//! Bind-mount isolation of job temporary directories
//!
//! - `namespace` - private mount namespace for the job's process tree
//! - `mounts` - bind mounts from private sources onto shared mount points

pub mod mounts;
pub mod namespace;

pub use self::mounts::{MountBinding, MountIsolation};
pub use self::namespace::enter_private_namespace;

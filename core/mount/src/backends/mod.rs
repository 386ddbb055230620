//! Concrete FUSE backends.
//!
//! Transport is delegated to external tools (`sshfs`, `encfs`,
//! `fusermount`) through a [`CommandRunner`](crate::backend::CommandRunner).

pub mod encfs;
pub mod ssh;
pub mod ssh_encfs;

pub use encfs::EncfsBackend;
pub use ssh::SshBackend;
pub use ssh_encfs::SshEncfsBackend;

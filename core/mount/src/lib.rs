//! Mount orchestration for snapkeep.
//!
//! This crate provides:
//! - Hash identity of mount specs and the on-disk mount tree layout
//! - Filesystem locks coordinating independent processes
//! - The backend contract and the sshfs/encfs backends
//! - The mount state machine and the orchestrator on top of it
//!
//! # Architecture
//! [`MountManager`] resolves a backend from the [`BackendRegistry`] and
//! drives it through a [`MountControl`]. Every structural change under the
//! mount root happens while the process lock is held; mount locks record
//! which processes still depend on a mount.

pub mod backend;
pub mod backends;
pub mod control;
pub mod hash;
pub mod layout;
pub mod lock;
pub mod orchestrator;
pub mod password_cache;
pub mod process;
pub mod registry;
pub mod salt;
pub mod settings;
pub mod spec;
pub mod symlink;

pub use backend::{Command, CommandOutput, CommandRunner, MountBackend, MountTarget, SystemRunner};
pub use control::{MountContext, MountControl, MountOptions, MountState, UmountOutcome};
pub use hash::compute_hash;
pub use layout::MountLayout;
pub use lock::{LockScanner, MountLock, ProcessLock, ProcessLockGuard};
pub use orchestrator::MountManager;
pub use password_cache::{ensure_password_cache, PasswordCache, PidFilePasswordCache};
pub use process::{ProcessProbe, SystemProbe};
pub use registry::{BackendFactory, BackendRegistry};
pub use salt::SaltStore;
pub use settings::{PasswordCacheSettings, ProfileSettings, Settings};
pub use spec::{MountHandle, MountMode, MountParams, MountSpec, SshParams};
pub use symlink::ProfileLink;

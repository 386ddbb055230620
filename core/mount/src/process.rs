//! Process liveness checks.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Answers whether a process id belongs to a running process.
pub trait ProcessProbe: Send + Sync {
    /// Check if a process with the given PID is alive.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        // Pid 0 would address our own process group.
        let Ok(raw_pid) = i32::try_from(pid) else {
            return false;
        };
        if raw_pid == 0 {
            return false;
        }
        // kill(pid, 0) probes without delivering a signal. EPERM means the
        // process exists but belongs to someone else.
        match kill(Pid::from_raw(raw_pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

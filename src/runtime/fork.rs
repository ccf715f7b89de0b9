//! Process duplication and child bookkeeping.
//!
//! Callers must fork only from a single-threaded process: the child
//! resumes with just the calling thread, and any lock held by another
//! thread at the time of the fork stays held forever.

use std::io;
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

/// Which side of a fork we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent { child: libc::pid_t },
    Child,
}

/// Duplicate the current process.
pub fn fork() -> io::Result<Fork> {
    let parent = unsafe { libc::getpid() };

    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            die_with_parent(parent);
            Ok(Fork::Child)
        }
        child => Ok(Fork::Parent { child }),
    }
}

/// Fork, retrying up to `attempts` times with `backoff` between failures.
///
/// Fork failure means the host is out of processes or memory; each
/// failure is logged before pausing.
pub fn fork_with_backoff(attempts: usize, backoff: Duration) -> io::Result<Fork> {
    let mut attempt = 1;
    loop {
        match fork() {
            Ok(side) => return Ok(side),
            Err(e) if attempt < attempts => {
                warn!(attempt, error = %e, "Fork failed, resource exhaustion; backing off");
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => {
                error!(attempt, error = %e, "Fork failed, giving up");
                return Err(e);
            }
        }
    }
}

/// Terminate a child without running the parent's exit handlers.
pub fn exit_child(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    fn from_raw(status: libc::c_int) -> Self {
        if libc::WIFSIGNALED(status) {
            ExitStatus::Signaled(libc::WTERMSIG(status))
        } else {
            ExitStatus::Exited(libc::WEXITSTATUS(status))
        }
    }
}

/// Collect every child that has already exited, without blocking.
pub fn reap_exited() -> usize {
    let mut reaped = 0;
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return reaped;
        }
        reaped += 1;
    }
}

/// Block until any child exits.
pub fn wait_any() -> io::Result<(libc::pid_t, ExitStatus)> {
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid > 0 {
            return Ok((pid, ExitStatus::from_raw(status)));
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Ask the kernel to SIGTERM this child when the parent dies, so a
/// killed server does not leave workers holding the listening port.
#[cfg(target_os = "linux")]
fn die_with_parent(parent: libc::pid_t) {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        // Parent already gone before prctl took effect.
        if libc::getppid() != parent {
            libc::_exit(0);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_parent: libc::pid_t) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_decoding() {
        // Encoded the way wait(2) reports a normal exit with code 3.
        let exited = 3 << 8;
        assert_eq!(ExitStatus::from_raw(exited), ExitStatus::Exited(3));

        let signaled = libc::SIGKILL;
        assert_eq!(
            ExitStatus::from_raw(signaled),
            ExitStatus::Signaled(libc::SIGKILL)
        );
    }

    #[test]
    fn test_reap_without_children() {
        assert_eq!(reap_exited(), 0);
    }
}

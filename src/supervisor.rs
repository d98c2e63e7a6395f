//! Detaching from the invoking terminal.
//!
//! The parent stays alive as a supervisor until the child confirms a
//! successful start: the child SIGTERMs it after claiming the PID file
//! and detaching, and the parent exits 0. If the child dies first the
//! parent's SIGCHLD handler exits 1, so the invoking shell sees the
//! failure immediately; if nothing happens for ten minutes the parent
//! gives up with the same status.
//!
//! Must run before the async runtime exists: forking a process with
//! live runtime threads is undefined behaviour territory.

use crate::error::{Error, Result};
use crate::pidfile::PidFile;
use std::path::Path;

/// Parent wait ceiling, seconds.
const SUPERVISOR_TIMEOUT_SECS: u32 = 600;

extern "C" fn parent_success(_: libc::c_int) {
    unsafe { libc::_exit(0) }
}

extern "C" fn parent_failure(_: libc::c_int) {
    unsafe { libc::_exit(1) }
}

/// Claim the PID file, optionally forking away from the terminal
/// first.
///
/// With `detach` set this returns only in the child, together with the
/// supervisor's PID; the parent process exits through its signal
/// handlers. Without it, the PID file is still claimed and the
/// supervisor phase is skipped.
pub fn detach(
    pid_file: &Path,
    netname: Option<&str>,
    detach: bool,
) -> Result<(PidFile, Option<i32>)> {
    crate::checkpoint!();
    if !detach {
        return Ok((PidFile::claim(pid_file, netname)?, None));
    }

    let supervisor_pid = unsafe { libc::getpid() };
    match unsafe { libc::fork() } {
        -1 => {
            return Err(Error::Fatal(format!(
                "fork failed: {}",
                std::io::Error::last_os_error()
            )))
        }
        0 => { /* child falls through */ }
        _child => {
            // Supervisor: wait for the child's verdict.
            unsafe {
                libc::signal(libc::SIGTERM, parent_success as libc::sighandler_t);
                libc::signal(libc::SIGCHLD, parent_failure as libc::sighandler_t);
                libc::sleep(SUPERVISOR_TIMEOUT_SECS);
                libc::_exit(1);
            }
        }
    }

    // Child: claim the lock while stderr still reaches the caller.
    let guard = PidFile::claim(pid_file, netname)?;

    drop_controlling_terminal();
    if unsafe { libc::setsid() } < 0 {
        return Err(Error::Fatal(format!(
            "setsid failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    // Successful start: release the supervisor.
    unsafe {
        libc::kill(supervisor_pid, libc::SIGTERM);
    }

    // Do not keep a mount point busy.
    if let Err(e) = std::env::set_current_dir("/") {
        log::warn!("Failed to chdir to /: {e}");
    }

    Ok((guard, Some(supervisor_pid)))
}

fn drop_controlling_terminal() {
    unsafe {
        let fd = libc::open(c"/dev/tty".as_ptr(), libc::O_RDWR);
        if fd >= 0 {
            libc::ioctl(fd, libc::TIOCNOTTY as libc::c_ulong, 0);
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_detach_claims_pid_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tincd.pid");

        let (guard, supervisor_pid) = detach(&path, None, false).expect("claim without fork");
        assert!(supervisor_pid.is_none());
        assert!(path.exists());
        drop(guard);
        assert!(!path.exists());
    }
}

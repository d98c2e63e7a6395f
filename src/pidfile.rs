//! PID-file locking for single-instance daemons.
//!
//! The lock is the PID file itself: it either contains the PID of a live
//! daemon or does not exist. Liveness is probed with `kill(pid, 0)`, so
//! a file left behind by a crashed daemon is treated as stale and
//! replaced.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Read the PID recorded in `path`, if the file exists and parses.
pub fn read_pid(path: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse::<i32>().ok()
}

/// Whether `pid` names a live process.
///
/// Signal 0 probes existence without delivering anything; EPERM still
/// means the process exists.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Return the PID of a live daemon holding `path`, if any.
pub fn check_pid(path: &Path) -> Option<i32> {
    let pid = read_pid(path)?;
    if pid_alive(pid) {
        Some(pid)
    } else {
        None
    }
}

/// Claim the PID file for the current process.
///
/// Fails with [`Error::AlreadyRunning`] when a live daemon holds the
/// file. A stale file (dead PID) is removed first, then the file is
/// created exclusively so two racing starters cannot both win.
pub fn write_pid(path: &Path, netname: Option<&str>) -> Result<()> {
    if let Some(pid) = check_pid(path) {
        let msg = match netname {
            Some(net) => format!("A tincd is already running for net '{net}' with pid {pid}."),
            None => format!("A tincd is already running with pid {pid}."),
        };
        return Err(Error::AlreadyRunning(msg));
    }

    if read_pid(path).is_some() {
        // Stale lock from a dead process.
        std::fs::remove_file(path)?;
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // Lost the creation race to another starter.
            let msg = match check_pid(path) {
                Some(pid) => match netname {
                    Some(net) => {
                        format!("A tincd is already running for net '{net}' with pid {pid}.")
                    }
                    None => format!("A tincd is already running with pid {pid}."),
                },
                None => "A tincd is already starting.".to_string(),
            };
            return Err(Error::AlreadyRunning(msg));
        }
        Err(e) => return Err(e.into()),
    };

    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;
    Ok(())
}

/// Remove the PID file. Missing files are not an error.
pub fn remove_pid(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove pid file {}: {}", path.display(), e);
        }
    }
}

/// Terminate the daemon recorded in `path`.
///
/// Sends SIGTERM and unlinks the file. When the recorded process is
/// already gone, reports the stale lock on stderr and still unlinks.
/// Returns an error when no daemon is recorded at all.
pub fn kill_other(path: &Path, netname: Option<&str>) -> Result<()> {
    let Some(pid) = read_pid(path) else {
        let msg = match netname {
            Some(net) => format!("No other tincd is running for net '{net}'."),
            None => "No other tincd is running.".to_string(),
        };
        return Err(Error::Config(msg));
    };

    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret != 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
        eprintln!("Removing stale lock file.");
    }
    remove_pid(path);
    Ok(())
}

/// RAII guard holding the PID file for the daemon's lifetime.
///
/// The main loop removes the file explicitly on graceful shutdown; the
/// guard covers early-exit error paths.
pub struct PidFile {
    path: std::path::PathBuf,
    armed: bool,
}

impl PidFile {
    /// Claim the PID file and return the guard.
    pub fn claim(path: &Path, netname: Option<&str>) -> Result<Self> {
        write_pid(path, netname)?;
        Ok(Self {
            path: path.to_path_buf(),
            armed: true,
        })
    }

    /// Remove the file now and disarm the guard.
    pub fn release(&mut self) {
        if self.armed {
            remove_pid(&self.path);
            self.armed = false;
        }
    }

    /// Keep the file on disk past the guard (used before re-exec).
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_pid() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tincd.pid");

        write_pid(&path, None).expect("claim pid file");
        assert_eq!(read_pid(&path), Some(std::process::id() as i32));
        let contents = std::fs::read_to_string(&path).expect("read pid file");
        assert!(contents.ends_with('\n'));

        remove_pid(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_claim_fails_already_running() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tincd.pid");

        write_pid(&path, Some("v1")).expect("first claim");
        let err = write_pid(&path, Some("v1")).expect_err("second claim must fail");
        match err {
            Error::AlreadyRunning(msg) => {
                assert!(msg.contains("net 'v1'"), "message was: {msg}");
                assert!(msg.contains(&std::process::id().to_string()));
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_pid_is_replaced() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tincd.pid");

        // No such process: PIDs are capped well below this on Linux.
        std::fs::write(&path, "999999\n").expect("write stale pid");
        assert_eq!(check_pid(&path), None);
        write_pid(&path, None).expect("stale lock should be replaced");
        assert_eq!(read_pid(&path), Some(std::process::id() as i32));
    }

    #[test]
    fn test_kill_other_stale_lock() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tincd.pid");

        std::fs::write(&path, "999999\n").expect("write stale pid");
        kill_other(&path, Some("v1")).expect("stale kill succeeds");
        assert!(!path.exists(), "stale lock file must be removed");
    }

    #[test]
    fn test_kill_other_without_pidfile() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tincd.pid");

        let err = kill_other(&path, None).expect_err("no pid file");
        assert!(err.to_string().contains("No other tincd is running."));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tincd.pid");

        {
            let _guard = PidFile::claim(&path, None).expect("claim");
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}

//! Crash-restart on fatal memory faults.
//!
//! SEGV or BUS means the process state is gone, but the mesh benefits
//! from the daemon coming back: the handler unlinks the PID file and
//! re-execs the original argv. A second-strike handler is installed
//! first so a fault during recovery terminates instead of looping.
//! Everything in handler context sticks to async-signal-safe calls
//! (`write`, `unlink`, `execvp`, `_exit`); this is best-effort by
//! design, and a host supervisor restarting the process is the sturdier
//! alternative where available.

use std::ffi::CString;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct ReexecData {
    pid_file: CString,
    /// NULL-terminated argv for execvp.
    argv_ptrs: Vec<*const libc::c_char>,
    /// Backing storage the pointers borrow from.
    _argv: Vec<CString>,
}

// The data is written once before the handlers are armed and only read
// from signal context afterwards.
unsafe impl Sync for ReexecData {}

static REEXEC: AtomicPtr<ReexecData> = AtomicPtr::new(ptr::null_mut());

fn write_stderr(msg: &str) {
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
        );
    }
}

extern "C" fn second_strike(_: libc::c_int) {
    write_stderr("Got another fatal signal: not restarting.\n");
    unsafe { libc::_exit(1) }
}

extern "C" fn crash_handler(_: libc::c_int) {
    unsafe {
        libc::signal(libc::SIGSEGV, second_strike as libc::sighandler_t);
        libc::signal(libc::SIGBUS, second_strike as libc::sighandler_t);
    }
    write_stderr("Got fatal signal: trying to re-execute.\n");

    let data = REEXEC.load(Ordering::Relaxed);
    if !data.is_null() {
        unsafe {
            let data = &*data;
            libc::unlink(data.pid_file.as_ptr());
            libc::execvp(data.argv_ptrs[0], data.argv_ptrs.as_ptr());
        }
    }
    unsafe { libc::_exit(1) }
}

/// Arm the crash-restart handlers with the state re-exec needs.
///
/// `argv` is the original command line; it is stored for the lifetime
/// of the process.
pub fn install(pid_file: &Path, argv: &[String]) {
    let Ok(pid_file) = CString::new(pid_file.to_string_lossy().as_bytes()) else {
        return;
    };
    let storage: Vec<CString> = argv
        .iter()
        .filter_map(|a| CString::new(a.as_bytes()).ok())
        .collect();
    if storage.is_empty() {
        return;
    }
    let mut argv_ptrs: Vec<*const libc::c_char> =
        storage.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(ptr::null());

    let data = Box::new(ReexecData {
        pid_file,
        argv_ptrs,
        _argv: storage,
    });
    // On re-arm the previous block stays leaked: the handler may hold
    // a pointer to it.
    let _ = REEXEC.swap(Box::into_raw(data), Ordering::Relaxed);

    unsafe {
        libc::signal(libc::SIGSEGV, crash_handler as libc::sighandler_t);
        libc::signal(libc::SIGBUS, crash_handler as libc::sighandler_t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_stores_reexec_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("tincd.pid");
        install(&pid_file, &["tincd".to_string(), "-n".to_string(), "v1".to_string()]);

        let data = REEXEC.load(Ordering::Relaxed);
        assert!(!data.is_null());
        let data = unsafe { &*data };
        assert_eq!(data.argv_ptrs.len(), 4, "three args plus NULL");
        assert!(data.argv_ptrs[3].is_null());

        // Installing again must not invalidate the stored pointers.
        install(&pid_file, &["tincd".to_string()]);
        assert!(!REEXEC.load(Ordering::Relaxed).is_null());
    }
}

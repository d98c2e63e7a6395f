//! Signal dispatch.
//!
//! Signals never run daemon logic in handler context. The bound set is
//! surfaced as [`SignalEvent`] values on the main-loop channel via the
//! runtime's signal streams; everything else gets a diagnostic handler
//! that records the signal number for the main loop to log together
//! with the most recent checkpoint.

use crate::error::Result;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// An edge-triggered signal event consumed by the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// TERM, QUIT or INT: graceful shutdown.
    Terminate,
    /// HUP: tear down, reparse configuration, come back up.
    Reload,
    /// USR1: dump connection and topology tables to the log.
    DumpTables,
    /// USR2: force a session-key rotation.
    RotateKeys,
    /// ALRM: coarse tick.
    Alarm,
    /// CHLD: reap script subprocesses.
    ReapChildren,
}

/// Register the bound signal set and forward events to `tx`.
///
/// PIPE is registered but drained silently, which replaces its default
/// disposition. Each stream runs in its own task for the life of the
/// process.
pub fn spawn_listener(tx: mpsc::UnboundedSender<SignalEvent>) -> Result<()> {
    let bindings = [
        (SignalKind::terminate(), Some(SignalEvent::Terminate)),
        (SignalKind::quit(), Some(SignalEvent::Terminate)),
        (SignalKind::interrupt(), Some(SignalEvent::Terminate)),
        (SignalKind::hangup(), Some(SignalEvent::Reload)),
        (SignalKind::user_defined1(), Some(SignalEvent::DumpTables)),
        (SignalKind::user_defined2(), Some(SignalEvent::RotateKeys)),
        (SignalKind::alarm(), Some(SignalEvent::Alarm)),
        (SignalKind::child(), Some(SignalEvent::ReapChildren)),
        (SignalKind::pipe(), None),
    ];

    for (kind, event) in bindings {
        let mut stream = signal(kind)?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                let Some(event) = event else { continue };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
    }
    Ok(())
}

/// Most recent unexpected signal number, 0 when none is pending.
static UNEXPECTED: AtomicI32 = AtomicI32::new(0);

extern "C" fn diagnostic_handler(signo: libc::c_int) {
    UNEXPECTED.store(signo, Ordering::Relaxed);
}

/// Trap every catchable signal outside the bound set with the
/// diagnostic handler, so strays are logged instead of killing the
/// daemon.
pub fn install_diagnostic_handlers() {
    // Bound set, crash handlers (SEGV/BUS) and the unblockable pair.
    let skip = [
        libc::SIGTERM,
        libc::SIGQUIT,
        libc::SIGINT,
        libc::SIGHUP,
        libc::SIGUSR1,
        libc::SIGUSR2,
        libc::SIGALRM,
        libc::SIGCHLD,
        libc::SIGPIPE,
        libc::SIGSEGV,
        libc::SIGBUS,
        libc::SIGKILL,
        libc::SIGSTOP,
    ];

    for signo in 1..32 {
        if skip.contains(&signo) {
            continue;
        }
        unsafe {
            libc::signal(signo, diagnostic_handler as libc::sighandler_t);
        }
    }
}

/// Take the pending unexpected-signal number, if any.
pub fn take_unexpected() -> Option<i32> {
    match UNEXPECTED.swap(0, Ordering::Relaxed) {
        0 => None,
        signo => Some(signo),
    }
}

//! Source-location checkpoints surfaced in fatal-error logs.
//!
//! Key function boundaries call [`checkpoint!`] to record a static
//! `(file, line)` pair. The record is a pointer store into a global
//! atomic, so reading it is safe even from a signal handler.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A recorded source location.
#[derive(Debug)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
}

static LAST: AtomicPtr<Location> = AtomicPtr::new(ptr::null_mut());

/// Record a location as the most recent checkpoint.
#[doc(hidden)]
pub fn record(loc: &'static Location) {
    LAST.store(loc as *const Location as *mut Location, Ordering::Relaxed);
}

/// The most recently recorded checkpoint, if any.
pub fn last() -> Option<&'static Location> {
    let p = LAST.load(Ordering::Relaxed);
    // Stores only ever hold &'static Location.
    unsafe { p.cast_const().as_ref() }
}

/// Format the last checkpoint for log messages.
pub fn describe() -> String {
    match last() {
        Some(loc) => format!("after {} line {}", loc.file, loc.line),
        None => "before first checkpoint".to_string(),
    }
}

/// Record the current source location as a checkpoint.
#[macro_export]
macro_rules! checkpoint {
    () => {{
        static LOC: $crate::checkpoint::Location = $crate::checkpoint::Location {
            file: file!(),
            line: line!(),
        };
        $crate::checkpoint::record(&LOC);
    }};
}

//! Unrecoverable failure path.
//!
//! A corrupted locking invariant cannot be safely continued past, so nothing in
//! this crate returns these conditions to a caller. [`fatal`] writes one
//! diagnostic line and terminates (or panics, when configured for tests).
//! Only the lock wrappers and the thread lifecycle call it.

use crate::config::{self, FatalAction};
use crate::directory::ThreadKey;
use crate::log::{self, LogEntry, LogLevel};

/// Every condition that terminates the process.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    /// An OS locking or threading primitive returned an undocumented code.
    #[error("{op}({addr:#x}) failed: {source}")]
    Primitive {
        op: &'static str,
        addr: usize,
        code: i32,
        #[source]
        source: std::io::Error,
    },
    /// Release attempted by a thread that is not the holder.
    #[error("{op}: mutex {addr:#x} is held by {holder:?}, not by caller {caller}")]
    WrongHolder {
        op: &'static str,
        addr: usize,
        holder: Option<ThreadKey>,
        caller: ThreadKey,
    },
    /// Release attempted while the holding count is already zero.
    #[error("{op}: mutex {addr:#x} released while not held")]
    NotHeld { op: &'static str, addr: usize },
    /// A plain release would drop a self mutex below its self-holding level.
    #[error("{op}: self mutex {addr:#x} of {holder} released below its self hold")]
    SelfReleaseBelowSelfHold {
        op: &'static str,
        addr: usize,
        holder: ThreadKey,
    },
    /// Reentrant holding count would overflow.
    #[error("{op}: holding count overflow on mutex {addr:#x}")]
    HoldingOverflow { op: &'static str, addr: usize },
    /// A lock was dropped while still held.
    #[error("{what} {addr:#x} destroyed while held")]
    DestroyedWhileHeld { what: &'static str, addr: usize },
    /// An execution thread was destroyed on an OS thread other than the one
    /// entitled to its self mutex.
    #[error("thread {name:?} ({key}) destroyed on foreign OS thread {here:?}, owner is {owner:?}")]
    ForeignDestroy {
        name: String,
        key: ThreadKey,
        owner: std::thread::ThreadId,
        here: std::thread::ThreadId,
    },
    /// The self mutex no longer points back at its thread at destruction.
    #[error("thread {name:?} ({key}) destroyed while its self mutex is held by {holder:?}")]
    SelfMutexStolen {
        name: String,
        key: ThreadKey,
        holder: Option<ThreadKey>,
    },
    /// The thread's own code left extra holds on its self mutex.
    #[error("thread {name:?} ({key}) destroyed with its self mutex still held {depth} deep")]
    SelfMutexLeftHeld {
        name: String,
        key: ThreadKey,
        depth: u32,
    },
    /// The OS refused to create a thread.
    #[error("failed to spawn thread {name:?}: {source}")]
    Spawn {
        name: String,
        code: i32,
        #[source]
        source: std::io::Error,
    },
}

impl Fault {
    /// Wrap an errno-style return code from an OS primitive.
    #[must_use]
    pub fn primitive(op: &'static str, addr: usize, code: i32) -> Self {
        Self::Primitive {
            op,
            addr,
            code,
            source: std::io::Error::from_raw_os_error(code),
        }
    }

    /// The OS error code carried by the fault, if any.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Primitive { code, .. } | Self::Spawn { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Report `fault` and terminate according to [`config::fatal_action`].
#[cold]
#[inline(never)]
pub fn fatal(fault: Fault) -> ! {
    let message = fault.to_string();
    let mut details = serde_json::json!({ "message": message });
    if let Some(code) = fault.code() {
        details["code"] = serde_json::json!(code);
    }
    log::emit(&LogEntry::new(LogLevel::Fatal, "fatal").with_details(details));
    match config::fatal_action() {
        FatalAction::Abort => std::process::abort(),
        FatalAction::Panic => panic!("evthread fatal: {message}"),
    }
}

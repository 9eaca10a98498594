//! Thread directory: which [`ThreadInfo`] is running on the calling OS thread.
//!
//! Every OS thread has its own slot in thread-local storage, so registration and
//! lookup never take a lock and never touch another thread's slot. The slot is a
//! weak back-reference; the owning [`crate::Thread`] lives in its trampoline.
//!
//! The directory also hands out [`ThreadKey`]s. Execution threads get one at
//! construction; any other OS thread that needs a holder identity (the main
//! thread, a test thread) gets an anonymous key from the same counter on first
//! use. Once that thread's TLS is gone (inside another thread-local's
//! destructor), its key is derived from `pthread_self` instead, so a lock taken
//! and released there still sees one holder.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::thread::ThreadInfo;

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);

/// Marks keys derived from the OS thread id; the counter never reaches it.
const TORN_DOWN_BIT: u64 = 1 << 63;

thread_local! {
    static CURRENT: RefCell<Weak<ThreadInfo>> = const { RefCell::new(Weak::new()) };
    static ANON_KEY: Cell<Option<ThreadKey>> = const { Cell::new(None) };
}

/// Process-unique identity of a lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadKey(NonZeroU64);

impl ThreadKey {
    /// Allocate a fresh key.
    pub(crate) fn fresh() -> Self {
        let raw = NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed);
        match NonZeroU64::new(raw) {
            Some(key) => Self(key),
            // The counter starts at 1 and would need 2^64 allocations to wrap.
            None => Self(NonZeroU64::MIN),
        }
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Record `info` as the execution thread running on this OS thread.
pub(crate) fn register(info: &Arc<ThreadInfo>) {
    CURRENT.with(|slot| *slot.borrow_mut() = Arc::downgrade(info));
}

/// Clear this OS thread's slot if it still refers to `key`.
///
/// Returns true if the slot was cleared.
pub(crate) fn clear_if(key: ThreadKey) -> bool {
    CURRENT
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            let matches = slot.upgrade().is_some_and(|info| info.key() == key);
            if matches {
                *slot = Weak::new();
            }
            matches
        })
        .unwrap_or(false)
}

/// The execution thread running on the calling OS thread, if any.
#[must_use]
pub fn current() -> Option<Arc<ThreadInfo>> {
    CURRENT
        .try_with(|slot| slot.borrow().upgrade())
        .ok()
        .flatten()
}

/// Holder identity of the caller: the registered execution thread's key, or
/// this OS thread's anonymous key.
#[must_use]
pub fn current_key() -> ThreadKey {
    if let Some(info) = current() {
        return info.key();
    }
    anonymous_key()
}

fn anonymous_key() -> ThreadKey {
    ANON_KEY
        .try_with(|slot| {
            if let Some(key) = slot.get() {
                return key;
            }
            let key = ThreadKey::fresh();
            slot.set(Some(key));
            key
        })
        .unwrap_or_else(|_| torn_down_key())
}

/// Key for an OS thread whose TLS is already destroyed: stable for the rest of
/// its life and disjoint from counter keys.
#[allow(unsafe_code)]
fn torn_down_key() -> ThreadKey {
    // SAFETY: pthread_self has no preconditions.
    let raw = unsafe { libc::pthread_self() } as usize as u64;
    match NonZeroU64::new(TORN_DOWN_BIT | (raw & !TORN_DOWN_BIT)) {
        Some(key) => ThreadKey(key),
        None => ThreadKey(NonZeroU64::MIN),
    }
}

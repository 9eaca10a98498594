//! Thread-affine, reentrant, reference-counted mutex.
//!
//! A [`ProxyMutex`] records which [`ThreadKey`] holds it and how many times.
//! The holder may re-acquire without blocking; only the holder may release.
//! Every execution thread owns one as its *self mutex*: the thread takes it at
//! construction, marks it self-held, and gives it back at destruction. The
//! self-held mark is a separate flag rather than a bias on the count, so plain
//! releases can never eat into the self hold without tripping a fatal check.
//!
//! Misuse (wrong-thread release, release of an unheld mutex, count overflow,
//! dropping a held mutex) goes through [`crate::fatal::fatal`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::directory::{self, ThreadKey};
use crate::fatal::{Fault, fatal};

/// Shared handle to a [`ProxyMutex`]. The mutex lives as long as its longest
/// holder of a reference.
pub type MutexRef = Arc<ProxyMutex>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct HoldState {
    holder: Option<ThreadKey>,
    nthread_holding: u32,
    self_held: bool,
}

/// Reentrant mutex with an explicit holder identity.
pub struct ProxyMutex {
    state: Mutex<HoldState>,
    released: Condvar,
}

impl ProxyMutex {
    /// Create an unheld mutex behind a shared handle.
    #[must_use]
    pub fn new() -> MutexRef {
        Arc::new(Self::default())
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Block until `holder` holds the mutex, then bump the holding count.
    pub(crate) fn take_lock(&self, holder: ThreadKey) {
        let mut state = self.state.lock();
        loop {
            match state.holder {
                None => {
                    state.holder = Some(holder);
                    state.nthread_holding = 1;
                    return;
                }
                Some(current) if current == holder => {
                    state.nthread_holding = self.bump(state.nthread_holding, "acquire");
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    /// Non-blocking [`Self::take_lock`]. On failure nothing changes.
    pub(crate) fn try_take_lock(&self, holder: ThreadKey) -> bool {
        let mut state = self.state.lock();
        match state.holder {
            None => {
                state.holder = Some(holder);
                state.nthread_holding = 1;
                true
            }
            Some(current) if current == holder => {
                state.nthread_holding = self.bump(state.nthread_holding, "try_acquire");
                true
            }
            Some(_) => false,
        }
    }

    /// Drop one level of `holder`'s hold; wakes a waiter when the count hits zero.
    pub(crate) fn untake_lock(&self, holder: ThreadKey, op: &'static str) {
        let mut state = self.state.lock();
        self.check_holder(&state, holder, op);
        if state.self_held && state.nthread_holding == 1 {
            fatal(Fault::SelfReleaseBelowSelfHold {
                op,
                addr: self.addr(),
                holder,
            });
        }
        state.nthread_holding -= 1;
        if state.nthread_holding == 0 {
            state.holder = None;
            drop(state);
            self.released.notify_one();
        }
    }

    /// Tag the current hold as an execution thread's self hold.
    pub(crate) fn mark_self_held(&self, holder: ThreadKey) {
        let mut state = self.state.lock();
        self.check_holder(&state, holder, "mark_self_held");
        state.self_held = true;
    }

    /// Remove the self-hold tag ahead of the final release.
    pub(crate) fn clear_self_hold(&self, holder: ThreadKey) {
        let mut state = self.state.lock();
        self.check_holder(&state, holder, "clear_self_hold");
        state.self_held = false;
    }

    fn check_holder(&self, state: &HoldState, holder: ThreadKey, op: &'static str) {
        if state.nthread_holding == 0 {
            fatal(Fault::NotHeld {
                op,
                addr: self.addr(),
            });
        }
        if state.holder != Some(holder) {
            fatal(Fault::WrongHolder {
                op,
                addr: self.addr(),
                holder: state.holder,
                caller: holder,
            });
        }
    }

    fn bump(&self, count: u32, op: &'static str) -> u32 {
        match count.checked_add(1) {
            Some(next) => next,
            None => fatal(Fault::HoldingOverflow {
                op,
                addr: self.addr(),
            }),
        }
    }

    /// Block until the calling thread holds the mutex (reentrant).
    pub fn acquire(&self) {
        self.take_lock(directory::current_key());
    }

    /// Take the mutex only if it is free or already held by the caller.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.try_take_lock(directory::current_key())
    }

    /// Release one level of the caller's hold.
    ///
    /// Fatal if the caller is not the holder, if the mutex is not held, or if
    /// the release would cut into an execution thread's self hold.
    pub fn release(&self) {
        self.untake_lock(directory::current_key(), "release");
    }

    /// Acquire and return a guard that releases on drop.
    pub fn lock(&self) -> MutexGuard<'_> {
        let holder = directory::current_key();
        self.take_lock(holder);
        MutexGuard::new(self, holder)
    }

    /// Non-blocking [`Self::lock`].
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        let holder = directory::current_key();
        self.try_take_lock(holder)
            .then(|| MutexGuard::new(self, holder))
    }

    /// Current holder, if any.
    #[must_use]
    pub fn holder(&self) -> Option<ThreadKey> {
        self.state.lock().holder
    }

    /// Reentrant holding count (zero when unheld).
    #[must_use]
    pub fn holding_count(&self) -> u32 {
        self.state.lock().nthread_holding
    }

    /// True while an execution thread holds this as its self mutex.
    #[must_use]
    pub fn is_self_held(&self) -> bool {
        self.state.lock().self_held
    }

    /// Reentrant depth if the caller is the holder, `None` otherwise.
    #[must_use]
    pub fn held_by_current(&self) -> Option<u32> {
        self.held_by(directory::current_key())
    }

    /// Reentrant depth if `key` is the holder, `None` otherwise.
    #[must_use]
    pub fn held_by(&self, key: ThreadKey) -> Option<u32> {
        let state = self.state.lock();
        (state.holder == Some(key)).then_some(state.nthread_holding)
    }
}

impl Default for ProxyMutex {
    fn default() -> Self {
        Self {
            state: Mutex::new(HoldState::default()),
            released: Condvar::new(),
        }
    }
}

impl Drop for ProxyMutex {
    fn drop(&mut self) {
        let held = self.state.get_mut().nthread_holding > 0;
        if held && !std::thread::panicking() {
            fatal(Fault::DestroyedWhileHeld {
                what: "mutex",
                addr: self.addr(),
            });
        }
    }
}

impl fmt::Debug for ProxyMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("ProxyMutex")
            .field("holder", &state.holder)
            .field("nthread_holding", &state.nthread_holding)
            .field("self_held", &state.self_held)
            .finish()
    }
}

/// Scoped hold on a [`ProxyMutex`]; releases one level on drop.
///
/// Not `Send`: the hold belongs to the thread that took it.
#[must_use = "dropping the guard releases the mutex immediately"]
pub struct MutexGuard<'a> {
    mutex: &'a ProxyMutex,
    holder: ThreadKey,
    _not_send: PhantomData<*const ()>,
}

impl<'a> MutexGuard<'a> {
    fn new(mutex: &'a ProxyMutex, holder: ThreadKey) -> Self {
        Self {
            mutex,
            holder,
            _not_send: PhantomData,
        }
    }

    /// The mutex this guard holds.
    #[must_use]
    pub fn mutex(&self) -> &'a ProxyMutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.untake_lock(self.holder, "guard_release");
    }
}

impl fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard")
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

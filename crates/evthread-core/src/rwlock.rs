//! Read-write lock for read-mostly shared tables.
//!
//! A thin wrapper over the platform `pthread_rwlock_t`, plus a task-fair
//! backend for platforms whose native lock lets continuous readers starve a
//! waiting writer. No holder identity is tracked. Unexpected primitive errors
//! are fatal; `EBUSY` from the `try_*` calls is an ordinary `false`.
//!
//! ## Writer starvation per platform
//!
//! | target            | `RwLockPolicy::Default`        | `NoWriterStarvation`        |
//! |-------------------|--------------------------------|-----------------------------|
//! | macOS, FreeBSD    | pthread, writers do not starve | pthread (same lock)         |
//! | Linux and others  | pthread, readers preferred     | task-fair `parking_lot` lock |
//!
//! [`DEFAULT_POLICY_PREVENTS_WRITER_STARVATION`] encodes the left column so
//! callers and tests can check it instead of trusting it.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::lock_api::RawRwLock as _;

use crate::fatal::{Fault, fatal};

/// True where the native default lock already keeps a pending writer from
/// being overtaken forever by new readers.
pub const DEFAULT_POLICY_PREVENTS_WRITER_STARVATION: bool =
    cfg!(any(target_os = "macos", target_os = "freebsd"));

/// Fairness policy chosen once at creation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RwLockPolicy {
    /// Whatever the platform lock does by default.
    #[default]
    Default,
    /// A waiting writer is guaranteed eventual access under reader churn.
    NoWriterStarvation,
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

struct FairLock {
    raw: parking_lot::RawRwLock,
    writer: AtomicBool,
    readers: AtomicUsize,
}

impl FairLock {
    const fn new() -> Self {
        Self {
            raw: <parking_lot::RawRwLock as parking_lot::lock_api::RawRwLock>::INIT,
            writer: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
        }
    }

    fn is_held(&self) -> bool {
        self.writer.load(Ordering::Acquire) || self.readers.load(Ordering::Acquire) > 0
    }
}

enum Backend {
    /// Statically initialized pthread lock. Must not move after first use.
    #[cfg(unix)]
    Native(UnsafeCell<libc::pthread_rwlock_t>),
    /// Dynamically initialized pthread lock at a stable heap address.
    #[cfg(unix)]
    NativeBoxed(Box<UnsafeCell<libc::pthread_rwlock_t>>),
    Fair(FairLock),
}

const fn native_for(policy: RwLockPolicy) -> bool {
    if cfg!(unix) {
        match policy {
            RwLockPolicy::Default => true,
            RwLockPolicy::NoWriterStarvation => DEFAULT_POLICY_PREVENTS_WRITER_STARVATION,
        }
    } else {
        false
    }
}

#[cfg(unix)]
const fn static_backend(policy: RwLockPolicy) -> Backend {
    if native_for(policy) {
        Backend::Native(UnsafeCell::new(libc::PTHREAD_RWLOCK_INITIALIZER))
    } else {
        Backend::Fair(FairLock::new())
    }
}

#[cfg(not(unix))]
const fn static_backend(_policy: RwLockPolicy) -> Backend {
    Backend::Fair(FairLock::new())
}

// ---------------------------------------------------------------------------
// RwLock
// ---------------------------------------------------------------------------

/// Shared/exclusive lock with no ownership tracking.
pub struct RwLock {
    backend: Backend,
    policy: RwLockPolicy,
}

// SAFETY: the pthread lock is designed for concurrent use through a shared
// reference, and the fair backend is built from thread-safe atomics and
// parking_lot's raw lock. Nothing in `RwLock` is tied to the creating thread.
unsafe impl Send for RwLock {}
// SAFETY: see above; every operation takes `&self` and is internally synchronized.
unsafe impl Sync for RwLock {}

impl RwLock {
    /// Static initializer with the default policy. Meant for `static` items.
    ///
    /// The native lock is stored inline, so a lock built from this constant
    /// must not be moved once it has been used. Use [`RwLock::new`] for locks
    /// that are not `static`.
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: RwLock = RwLock {
        backend: static_backend(RwLockPolicy::Default),
        policy: RwLockPolicy::Default,
    };

    /// Static initializer that forbids writer starvation. Meant for `static` items.
    ///
    /// Same placement rule as [`RwLock::INIT`]: never move it after first use.
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT_NO_WRITER_STARVATION: RwLock = RwLock {
        backend: static_backend(RwLockPolicy::NoWriterStarvation),
        policy: RwLockPolicy::NoWriterStarvation,
    };

    /// Dynamically initialize a lock with `policy`.
    #[must_use]
    pub fn new(policy: RwLockPolicy) -> Self {
        #[cfg(unix)]
        if native_for(policy) {
            // SAFETY: all-zero bytes are a valid bit pattern for the plain C
            // struct; `pthread_rwlock_init` then initializes it in place.
            let cell: Box<UnsafeCell<libc::pthread_rwlock_t>> =
                Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
            // SAFETY: the pointer is to heap memory owned by `cell` that has not
            // been used as a lock yet; a null attribute selects the defaults.
            let rc = unsafe { libc::pthread_rwlock_init(cell.get(), std::ptr::null()) };
            if rc != 0 {
                fatal(Fault::primitive("pthread_rwlock_init", cell.get() as usize, rc));
            }
            return Self {
                backend: Backend::NativeBoxed(cell),
                policy,
            };
        }
        Self {
            backend: Backend::Fair(FairLock::new()),
            policy,
        }
    }

    /// Explicitly destroy the lock. Equivalent to dropping it.
    pub fn destroy(self) {
        drop(self);
    }

    /// The policy this lock was created with.
    #[must_use]
    pub const fn policy(&self) -> RwLockPolicy {
        self.policy
    }

    /// Whether a pending writer is guaranteed to get through reader churn.
    #[must_use]
    pub const fn prevents_writer_starvation(&self) -> bool {
        match self.policy {
            RwLockPolicy::NoWriterStarvation => true,
            RwLockPolicy::Default => DEFAULT_POLICY_PREVENTS_WRITER_STARVATION,
        }
    }

    /// True if this lock is backed by the platform pthread lock.
    #[must_use]
    pub const fn is_native(&self) -> bool {
        !matches!(self.backend, Backend::Fair(_))
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    #[cfg(unix)]
    fn native_ptr(&self) -> Option<*mut libc::pthread_rwlock_t> {
        match &self.backend {
            Backend::Native(cell) => Some(cell.get()),
            Backend::NativeBoxed(cell) => Some(cell.get()),
            Backend::Fair(_) => None,
        }
    }

    #[cfg(unix)]
    fn native_call(
        &self,
        ptr: *mut libc::pthread_rwlock_t,
        op: &'static str,
        call: unsafe extern "C" fn(*mut libc::pthread_rwlock_t) -> libc::c_int,
        busy_ok: bool,
    ) -> bool {
        // SAFETY: `ptr` points at a lock owned by `self` that was initialized
        // statically or by `pthread_rwlock_init`, and outlives this call.
        let rc = unsafe { call(ptr) };
        if rc == 0 {
            return true;
        }
        if busy_ok && rc == libc::EBUSY {
            return false;
        }
        fatal(Fault::primitive(op, ptr as usize, rc))
    }

    /// Block until held in shared mode.
    pub fn read_lock(&self) {
        #[cfg(unix)]
        if let Some(ptr) = self.native_ptr() {
            self.native_call(ptr, "pthread_rwlock_rdlock", libc::pthread_rwlock_rdlock, false);
            return;
        }
        if let Backend::Fair(lock) = &self.backend {
            lock.raw.lock_shared();
            lock.readers.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Take shared mode only if no writer holds the lock.
    #[must_use]
    pub fn try_read_lock(&self) -> bool {
        #[cfg(unix)]
        if let Some(ptr) = self.native_ptr() {
            return self.native_call(
                ptr,
                "pthread_rwlock_tryrdlock",
                libc::pthread_rwlock_tryrdlock,
                true,
            );
        }
        match &self.backend {
            Backend::Fair(lock) => {
                let acquired = lock.raw.try_lock_shared();
                if acquired {
                    lock.readers.fetch_add(1, Ordering::AcqRel);
                }
                acquired
            }
            #[cfg(unix)]
            _ => false,
        }
    }

    /// Block until held exclusively.
    pub fn write_lock(&self) {
        #[cfg(unix)]
        if let Some(ptr) = self.native_ptr() {
            self.native_call(ptr, "pthread_rwlock_wrlock", libc::pthread_rwlock_wrlock, false);
            return;
        }
        if let Backend::Fair(lock) = &self.backend {
            lock.raw.lock_exclusive();
            lock.writer.store(true, Ordering::Release);
        }
    }

    /// Take exclusive mode only if nobody holds the lock.
    #[must_use]
    pub fn try_write_lock(&self) -> bool {
        #[cfg(unix)]
        if let Some(ptr) = self.native_ptr() {
            return self.native_call(
                ptr,
                "pthread_rwlock_trywrlock",
                libc::pthread_rwlock_trywrlock,
                true,
            );
        }
        match &self.backend {
            Backend::Fair(lock) => {
                let acquired = lock.raw.try_lock_exclusive();
                if acquired {
                    lock.writer.store(true, Ordering::Release);
                }
                acquired
            }
            #[cfg(unix)]
            _ => false,
        }
    }

    /// Release whichever mode the caller holds.
    pub fn unlock(&self) {
        #[cfg(unix)]
        if let Some(ptr) = self.native_ptr() {
            self.native_call(ptr, "pthread_rwlock_unlock", libc::pthread_rwlock_unlock, false);
            return;
        }
        if let Backend::Fair(lock) = &self.backend {
            if lock.writer.swap(false, Ordering::AcqRel) {
                // SAFETY: `writer` is set only between a successful exclusive
                // acquire and this release, so the exclusive lock is held.
                unsafe { lock.raw.unlock_exclusive() };
            } else if lock
                .readers
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
            {
                // SAFETY: a non-zero reader count means at least one shared
                // acquire has not been matched by a release yet.
                unsafe { lock.raw.unlock_shared() };
            } else {
                fatal(Fault::NotHeld {
                    op: "rwlock_unlock",
                    addr: self.addr(),
                });
            }
        }
    }

    /// Shared lock released when the guard drops.
    pub fn read(&self) -> ReadGuard<'_> {
        self.read_lock();
        ReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Non-blocking [`Self::read`].
    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        self.try_read_lock().then(|| ReadGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Exclusive lock released when the guard drops.
    pub fn write(&self) -> WriteGuard<'_> {
        self.write_lock();
        WriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Non-blocking [`Self::write`].
    pub fn try_write(&self) -> Option<WriteGuard<'_>> {
        self.try_write_lock().then(|| WriteGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new(RwLockPolicy::Default)
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        match &self.backend {
            #[cfg(unix)]
            Backend::Native(cell) => destroy_native(cell.get()),
            #[cfg(unix)]
            Backend::NativeBoxed(cell) => destroy_native(cell.get()),
            Backend::Fair(lock) => {
                if lock.is_held() {
                    fatal(Fault::DestroyedWhileHeld {
                        what: "rwlock",
                        addr: self.addr(),
                    });
                }
            }
        }
    }
}

#[cfg(unix)]
fn destroy_native(ptr: *mut libc::pthread_rwlock_t) {
    // SAFETY: called once from `Drop`, after which the lock is never touched.
    let rc = unsafe { libc::pthread_rwlock_destroy(ptr) };
    if rc != 0 {
        fatal(Fault::primitive("pthread_rwlock_destroy", ptr as usize, rc));
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("policy", &self.policy)
            .field("native", &self.is_native())
            .finish_non_exhaustive()
    }
}

/// Shared hold on an [`RwLock`].
#[must_use = "dropping the guard unlocks immediately"]
pub struct ReadGuard<'a> {
    lock: &'a RwLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Exclusive hold on an [`RwLock`].
#[must_use = "dropping the guard unlocks immediately"]
pub struct WriteGuard<'a> {
    lock: &'a RwLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{self, FatalAction};

    static ROUTES: RwLock = RwLock::INIT;
    static FAIR_ROUTES: RwLock = RwLock::INIT_NO_WRITER_STARVATION;

    fn both_policies() -> [RwLock; 2] {
        [
            RwLock::new(RwLockPolicy::Default),
            RwLock::new(RwLockPolicy::NoWriterStarvation),
        ]
    }

    #[test]
    fn policy_mapping_matches_platform_table() {
        let default = RwLock::new(RwLockPolicy::Default);
        let fair = RwLock::new(RwLockPolicy::NoWriterStarvation);
        assert_eq!(default.policy(), RwLockPolicy::Default);
        assert_eq!(
            default.prevents_writer_starvation(),
            DEFAULT_POLICY_PREVENTS_WRITER_STARVATION
        );
        assert!(fair.prevents_writer_starvation());
        if cfg!(unix) {
            assert!(default.is_native());
            assert_eq!(fair.is_native(), DEFAULT_POLICY_PREVENTS_WRITER_STARVATION);
        }
        if cfg!(target_os = "linux") {
            assert!(!DEFAULT_POLICY_PREVENTS_WRITER_STARVATION);
        }
    }

    #[test]
    fn static_initializers_work() {
        ROUTES.read_lock();
        ROUTES.unlock();
        ROUTES.write_lock();
        ROUTES.unlock();
        let _r = FAIR_ROUTES.read();
        assert!(FAIR_ROUTES.try_read_lock());
        FAIR_ROUTES.unlock();
        assert!(!FAIR_ROUTES.try_write_lock());
    }

    #[test]
    fn dynamic_locks_survive_moves_after_use() {
        let mut moved = Vec::new();
        for lock in both_policies() {
            lock.write_lock();
            lock.unlock();
            assert!(lock.try_read_lock());
            lock.unlock();
            moved.push(lock);
        }
        let moved: Vec<_> = moved.into_iter().rev().collect();
        for lock in &moved {
            assert!(lock.try_write_lock());
            assert!(!lock.try_read_lock());
            lock.unlock();
            let _r = lock.read();
            assert!(lock.try_write().is_none());
        }
    }

    #[test]
    fn readers_share_writers_exclude() {
        for lock in both_policies() {
            assert!(lock.try_read_lock());
            assert!(lock.try_read_lock());
            assert!(!lock.try_write_lock());
            lock.unlock();
            lock.unlock();

            assert!(lock.try_write_lock());
            assert!(!lock.try_read_lock());
            assert!(!lock.try_write_lock());
            lock.unlock();
            assert!(lock.try_write_lock());
            lock.unlock();
        }
    }

    #[test]
    fn guards_unlock_on_drop() {
        for lock in both_policies() {
            {
                let _w = lock.write();
                assert!(lock.try_read().is_none());
            }
            {
                let _r1 = lock.read();
                let _r2 = lock.try_read().expect("second reader");
                assert!(lock.try_write().is_none());
            }
            assert!(lock.try_write().is_some());
        }
    }

    #[test]
    fn readers_on_other_threads_block_writer() {
        let lock = Arc::new(RwLock::new(RwLockPolicy::NoWriterStarvation));
        lock.read_lock();
        let contender = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || lock.try_write_lock())
        };
        assert!(!contender.join().unwrap());
        lock.unlock();
    }

    #[test]
    fn unlocking_unheld_fair_lock_is_fatal() {
        config::set_fatal_action(FatalAction::Panic);
        let lock = RwLock::new(RwLockPolicy::NoWriterStarvation);
        if lock.is_native() {
            return;
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| lock.unlock()));
        assert!(result.is_err());
        assert!(lock.try_write_lock());
        lock.unlock();
    }

    #[test]
    fn explicit_destroy_of_unheld_lock_is_quiet() {
        for lock in both_policies() {
            lock.write_lock();
            lock.unlock();
            lock.destroy();
        }
    }
}

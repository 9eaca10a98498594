//! Execution threads.
//!
//! A [`Thread`] is created on whatever OS thread builds it and immediately
//! holds its own self mutex. [`Thread::start`] moves it onto a freshly spawned
//! OS thread, which registers it in the thread directory, names itself, runs
//! the [`Entry`] and then destroys the `Thread` in place. Destruction checks
//! that it happens on the OS thread entitled to it and that the self mutex is
//! held by the thread exactly once. Any violation is fatal.
//!
//! State shared with observers lives in [`ThreadInfo`], handed out as an `Arc`
//! before `start` so callers can inspect the thread after it is gone.

#[allow(unsafe_code)]
mod spawn;
#[allow(unsafe_code)]
mod stack;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crate::directory::{self, ThreadKey};
use crate::fatal::{Fault, fatal};
use crate::mutex::{MutexRef, ProxyMutex};

pub use spawn::{ThreadHandle, current_os_thread_name, current_stack_size};
pub use stack::ThreadStack;

/// Size of the OS thread name buffer, including the terminating NUL.
pub const MAX_THREAD_NAME_LENGTH: usize = 16;

/// Lifecycle of an execution thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    Constructed = 0,
    Running = 1,
    Terminated = 2,
}

impl ThreadState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Constructed,
            1 => Self::Running,
            _ => Self::Terminated,
        }
    }
}

/// Work run by a thread started without an explicit function.
///
/// Event-loop threads implement this; `execute` is called exactly once, on the
/// spawned OS thread, after directory registration.
pub trait Execute: Send + 'static {
    fn execute(&mut self, thread: &Thread);
}

/// What a started thread runs, decided once at [`Thread::start`].
pub enum Entry {
    /// A one-shot function. The `Thread` is destroyed as soon as it returns.
    Function(Box<dyn FnOnce() + Send + 'static>),
    /// A long-lived body supplied by a specialized thread type.
    Execute(Box<dyn Execute>),
}

impl Entry {
    pub fn function(f: impl FnOnce() + Send + 'static) -> Self {
        Self::Function(Box::new(f))
    }

    pub fn execute(body: impl Execute) -> Self {
        Self::Execute(Box::new(body))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Function(_) => "function",
            Self::Execute(_) => "execute",
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Entry").field(&self.kind()).finish()
    }
}

/// Observable state of one execution thread.
pub struct ThreadInfo {
    key: ThreadKey,
    name: OnceLock<String>,
    mutex: MutexRef,
    state: AtomicU8,
    os_thread: OnceLock<std::thread::ThreadId>,
}

impl ThreadInfo {
    fn new(key: ThreadKey, mutex: MutexRef) -> Self {
        Self {
            key,
            name: OnceLock::new(),
            mutex,
            state: AtomicU8::new(ThreadState::Constructed as u8),
            os_thread: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> ThreadKey {
        self.key
    }

    /// The (possibly truncated) name given to `start`; empty before that.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.get().map_or("", String::as_str)
    }

    /// The self mutex.
    #[must_use]
    pub fn mutex(&self) -> &MutexRef {
        &self.mutex
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The OS thread the thread ran on, once it has started running.
    #[must_use]
    pub fn os_thread(&self) -> Option<std::thread::ThreadId> {
        self.os_thread.get().copied()
    }

    /// Whether the caller is the holder of this thread's self mutex.
    #[must_use]
    pub fn holds_self_mutex(&self) -> bool {
        self.mutex.held_by_current().is_some()
    }
}

impl fmt::Debug for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadInfo")
            .field("key", &self.key)
            .field("name", &self.name())
            .field("state", &self.state())
            .field("mutex", &self.mutex)
            .finish()
    }
}

/// An execution thread bound to one OS thread.
pub struct Thread {
    info: Arc<ThreadInfo>,
    /// The only OS thread allowed to destroy this object.
    affinity: std::thread::ThreadId,
}

impl Thread {
    /// Construct on the calling OS thread, taking and self-marking the self mutex.
    #[must_use]
    pub fn new() -> Self {
        let key = ThreadKey::fresh();
        let mutex = ProxyMutex::new();
        mutex.take_lock(key);
        mutex.mark_self_held(key);
        Self {
            info: Arc::new(ThreadInfo::new(key, mutex)),
            affinity: std::thread::current().id(),
        }
    }

    /// Shared observer handle.
    #[must_use]
    pub fn info(&self) -> Arc<ThreadInfo> {
        Arc::clone(&self.info)
    }

    #[must_use]
    pub fn key(&self) -> ThreadKey {
        self.info.key
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.info.name()
    }

    #[must_use]
    pub fn mutex(&self) -> &MutexRef {
        &self.info.mutex
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.info.state()
    }

    /// Spawn the OS thread and run `entry` on it.
    ///
    /// `name` is truncated to fit [`MAX_THREAD_NAME_LENGTH`]. A `stack_size`
    /// of zero selects [`crate::config::default_stack_size`]; it is ignored
    /// when `stack` is given. Failure to create the OS thread is fatal.
    pub fn start(
        self,
        name: &str,
        stack: Option<ThreadStack>,
        stack_size: usize,
        entry: Entry,
    ) -> ThreadHandle {
        let _ = self.info.name.set(truncate_name(name).to_owned());
        spawn::spawn(self, stack, stack_size, entry)
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

impl Thread {
    /// The first destruction rule this object would break if dropped here.
    fn destruction_fault(&self) -> Option<Fault> {
        let info = &self.info;
        let here = std::thread::current().id();
        if here != self.affinity {
            return Some(Fault::ForeignDestroy {
                name: info.name().to_owned(),
                key: info.key,
                owner: self.affinity,
                here,
            });
        }
        match info.mutex.held_by(info.key) {
            Some(1) => None,
            Some(depth) => Some(Fault::SelfMutexLeftHeld {
                name: info.name().to_owned(),
                key: info.key,
                depth,
            }),
            None => Some(Fault::SelfMutexStolen {
                name: info.name().to_owned(),
                key: info.key,
                holder: info.mutex.holder(),
            }),
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(fault) = self.destruction_fault() {
            // Already unwinding: leave the self mutex held rather than panic twice.
            if std::thread::panicking() {
                return;
            }
            fatal(fault);
        }
        let info = &self.info;
        directory::clear_if(info.key);
        info.mutex.clear_self_hold(info.key);
        info.mutex.untake_lock(info.key, "thread_destroy");
        info.set_state(ThreadState::Terminated);
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("info", &self.info)
            .field("affinity", &self.affinity)
            .finish()
    }
}

/// The execution thread running on the calling OS thread, if any.
#[must_use]
pub fn current() -> Option<Arc<ThreadInfo>> {
    directory::current()
}

/// Longest prefix of `name` that fits the OS name buffer, cut on a char boundary.
pub(crate) fn truncate_name(name: &str) -> &str {
    let limit = MAX_THREAD_NAME_LENGTH - 1;
    if name.len() <= limit {
        return name;
    }
    let mut end = limit;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, FatalAction};

    #[test]
    fn construction_self_holds_the_mutex() {
        let thread = Thread::new();
        let mutex = thread.mutex();
        assert_eq!(mutex.holder(), Some(thread.key()));
        assert_eq!(mutex.holding_count(), 1);
        assert!(mutex.is_self_held());
        assert_eq!(thread.state(), ThreadState::Constructed);
        assert_eq!(thread.name(), "");
    }

    #[test]
    fn local_destruction_releases_everything() {
        let thread = Thread::new();
        let info = thread.info();
        drop(thread);
        assert_eq!(info.mutex().holding_count(), 0);
        assert_eq!(info.mutex().holder(), None);
        assert!(!info.mutex().is_self_held());
        assert_eq!(info.state(), ThreadState::Terminated);
    }

    #[test]
    fn constructing_thread_is_not_the_holder() {
        let thread = Thread::new();
        assert!(!thread.info().holds_self_mutex());
    }

    #[test]
    fn names_truncate_on_char_boundaries() {
        assert_eq!(truncate_name("net"), "net");
        assert_eq!(truncate_name("ET_NET 0123456789"), "ET_NET 01234567");
        assert_eq!(truncate_name("ET_NET 012345678").len(), 15);
        // 'é' is two bytes and would straddle the limit.
        assert_eq!(truncate_name("ET_NET_0123456é"), "ET_NET_0123456");
    }

    #[test]
    fn foreign_destruction_is_fatal() {
        config::set_fatal_action(FatalAction::Panic);
        let thread = Thread::new();
        let info = thread.info();
        let outcome = std::thread::spawn(move || {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || drop(thread)))
        })
        .join()
        .unwrap();
        let payload = outcome.unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert!(message.contains("destroyed on foreign OS thread"));
        assert_eq!(info.mutex().holding_count(), 1);
        // The self hold can no longer be given back by anyone.
        std::mem::forget(info);
    }

    #[test]
    fn leftover_hold_blocks_destruction() {
        config::set_fatal_action(FatalAction::Panic);
        let thread = Thread::new();
        let info = thread.info();
        info.mutex().take_lock(thread.key());
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || drop(thread)));
        let payload = outcome.unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert!(message.contains("still held 2 deep"), "{message}");
        assert_eq!(info.mutex().holding_count(), 2);
        assert_eq!(info.state(), ThreadState::Constructed);
        std::mem::forget(info);
    }

    #[test]
    fn unwinding_through_a_foreign_thread_keeps_the_first_panic() {
        config::set_fatal_action(FatalAction::Panic);
        let thread = Thread::new();
        let info = thread.info();
        let outcome = std::thread::spawn(move || {
            let _moved = thread;
            panic!("body failed");
        })
        .join();
        let payload = outcome.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"body failed"));
        assert_eq!(info.mutex().holding_count(), 1);
        std::mem::forget(info);
    }

    #[test]
    fn entry_debug_names_the_kind() {
        let entry = Entry::function(|| {});
        assert_eq!(format!("{entry:?}"), "Entry(\"function\")");
    }
}

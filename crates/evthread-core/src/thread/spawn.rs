//! OS thread creation, the start trampoline, and join/detach.

use std::any::Any;
use std::ffi::{CStr, CString, c_void};
use std::fmt;
use std::mem::MaybeUninit;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::stack::{ThreadStack, normalize_stack_size};
use super::{Entry, Thread, ThreadInfo, ThreadState};
use crate::config;
use crate::directory::{self, ThreadKey};
use crate::fatal::{Fault, fatal};
use crate::log::{self, LogEntry, LogLevel};

type Panic = Box<dyn Any + Send + 'static>;

/// Everything the new OS thread needs, leaked through `pthread_create`'s `arg`.
struct Boot {
    thread: Thread,
    name: CString,
    entry: Entry,
    outcome: Arc<Mutex<Option<Panic>>>,
}

pub(super) fn spawn(
    thread: Thread,
    stack: Option<ThreadStack>,
    stack_size: usize,
    entry: Entry,
) -> ThreadHandle {
    let info = thread.info();
    let name = CString::new(info.name().replace('\0', "")).unwrap_or_default();
    let size = match &stack {
        Some(stack) => stack.usable_size(),
        None if stack_size == 0 => normalize_stack_size(config::default_stack_size()),
        None => normalize_stack_size(stack_size),
    };

    log::emit(
        &LogEntry::new(LogLevel::Debug, "thread_spawn").with_details(serde_json::json!({
            "spawned": info.key().get(),
            "name": info.name(),
            "entry": entry.kind(),
            "stack_size": size,
            "caller_stack": stack.is_some(),
        })),
    );

    let outcome = Arc::new(Mutex::new(None));
    let boot = Box::into_raw(Box::new(Boot {
        thread,
        name,
        entry,
        outcome: Arc::clone(&outcome),
    }));

    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
    // SAFETY: initializes the attribute object in place.
    let rc = unsafe { libc::pthread_attr_init(attr.as_mut_ptr()) };
    if rc != 0 {
        fatal(Fault::primitive("pthread_attr_init", attr.as_ptr() as usize, rc));
    }
    let attr_ptr = attr.as_mut_ptr();

    let (op, rc) = match &stack {
        // SAFETY: `attr_ptr` was initialized above; the region is mapped
        // read/write and outlives the thread (the handle owns it until join).
        Some(stack) => ("pthread_attr_setstack", unsafe {
            libc::pthread_attr_setstack(attr_ptr, stack.bottom(), stack.usable_size())
        }),
        // SAFETY: `attr_ptr` was initialized above.
        None => ("pthread_attr_setstacksize", unsafe {
            libc::pthread_attr_setstacksize(attr_ptr, size)
        }),
    };
    if rc != 0 {
        fatal(Fault::primitive(op, attr_ptr as usize, rc));
    }

    // Set before the OS thread exists so its own Terminated store always wins.
    info.set_state(ThreadState::Running);
    let mut native = MaybeUninit::<libc::pthread_t>::uninit();
    // SAFETY: `attr_ptr` is initialized, `trampoline` matches the start routine
    // ABI, and `boot` is a live allocation whose ownership passes to the new
    // thread on success.
    let rc = unsafe {
        libc::pthread_create(native.as_mut_ptr(), attr_ptr, trampoline, boot.cast::<c_void>())
    };
    // SAFETY: the attribute object is initialized and no longer needed.
    unsafe { libc::pthread_attr_destroy(attr_ptr) };
    if rc != 0 {
        fatal(Fault::Spawn {
            name: info.name().to_owned(),
            code: rc,
            source: std::io::Error::from_raw_os_error(rc),
        });
    }

    ThreadHandle {
        // SAFETY: `pthread_create` succeeded and wrote the thread id.
        native: Some(unsafe { native.assume_init() }),
        info,
        stack,
        outcome,
    }
}

extern "C" fn trampoline(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` is the `Box<Boot>` leaked by `spawn`, handed to exactly
    // this thread.
    let boot = unsafe { Box::from_raw(arg.cast::<Boot>()) };
    run(*boot);
    ptr::null_mut()
}

fn run(boot: Boot) {
    let Boot {
        mut thread,
        name,
        entry,
        outcome,
    } = boot;
    let here = std::thread::current().id();
    thread.affinity = here;
    let info = thread.info();
    let _ = info.os_thread.set(here);

    directory::register(&info);
    set_os_name(&name);
    log::emit(
        &LogEntry::new(LogLevel::Debug, "thread_enter")
            .with_details(serde_json::json!({ "stack_size": current_stack_size() })),
    );

    let ran = panic::catch_unwind(AssertUnwindSafe(|| match entry {
        Entry::Function(f) => f(),
        Entry::Execute(mut body) => body.execute(&thread),
    }));
    let destroyed = panic::catch_unwind(AssertUnwindSafe(move || drop(thread)));

    let failure = ran.err().or(destroyed.err());
    match &failure {
        Some(payload) => log::emit(
            &LogEntry::new(LogLevel::Error, "thread_panicked")
                .with_thread(info.key(), info.name())
                .with_details(serde_json::json!({ "message": panic_message(payload) })),
        ),
        None => log::emit(
            &LogEntry::new(LogLevel::Debug, "thread_exit").with_thread(info.key(), info.name()),
        ),
    }
    *outcome.lock() = failure;
}

fn panic_message(payload: &Panic) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_os_name(name: &CStr) {
    // SAFETY: `name` is NUL-terminated and fits the 16-byte kernel limit.
    unsafe { libc::pthread_setname_np(libc::pthread_self(), name.as_ptr()) };
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn set_os_name(name: &CStr) {
    // SAFETY: `name` is NUL-terminated; Darwin only names the calling thread.
    unsafe { libc::pthread_setname_np(name.as_ptr()) };
}

#[cfg(target_os = "freebsd")]
fn set_os_name(name: &CStr) {
    // SAFETY: `name` is NUL-terminated.
    unsafe { libc::pthread_set_name_np(libc::pthread_self(), name.as_ptr()) };
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn set_os_name(_name: &CStr) {}

/// The OS-level name of the calling thread, where the platform exposes it.
#[cfg(any(target_os = "linux", target_os = "macos"))]
#[must_use]
pub fn current_os_thread_name() -> Option<String> {
    let mut buf = [0 as libc::c_char; super::MAX_THREAD_NAME_LENGTH];
    // SAFETY: the buffer is writable for `buf.len()` bytes.
    let rc = unsafe { libc::pthread_getname_np(libc::pthread_self(), buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: on success the buffer holds a NUL-terminated string.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
#[must_use]
pub fn current_os_thread_name() -> Option<String> {
    None
}

/// Size of the calling thread's stack as the OS reports it.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[must_use]
pub fn current_stack_size() -> Option<usize> {
    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
    // SAFETY: fills `attr` for the calling thread; destroyed below on success.
    if unsafe { libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) } != 0 {
        return None;
    }
    let mut size = 0;
    // SAFETY: `attr` was initialized by `pthread_getattr_np`.
    let rc = unsafe { libc::pthread_attr_getstacksize(attr.as_ptr(), &mut size) };
    // SAFETY: initialized above and not used afterwards.
    unsafe { libc::pthread_attr_destroy(attr.as_mut_ptr()) };
    (rc == 0).then_some(size)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
#[must_use]
pub fn current_stack_size() -> Option<usize> {
    // SAFETY: queries the calling thread only.
    Some(unsafe { libc::pthread_get_stacksize_np(libc::pthread_self()) })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
#[must_use]
pub fn current_stack_size() -> Option<usize> {
    None
}

/// Join handle for a started [`Thread`].
///
/// Dropping it without [`Self::join`] detaches the OS thread. A caller-supplied
/// stack is then leaked, since nothing can tell when the thread stops using it.
#[must_use = "dropping the handle detaches the thread"]
pub struct ThreadHandle {
    native: Option<libc::pthread_t>,
    info: Arc<ThreadInfo>,
    stack: Option<ThreadStack>,
    outcome: Arc<Mutex<Option<Panic>>>,
}

// SAFETY: a pthread_t may be joined or detached from any thread; on some
// targets it is a raw pointer, which is the only reason this is not automatic.
unsafe impl Send for ThreadHandle {}

impl ThreadHandle {
    /// Shared state of the thread this handle refers to.
    #[must_use]
    pub fn info(&self) -> &Arc<ThreadInfo> {
        &self.info
    }

    #[must_use]
    pub fn key(&self) -> ThreadKey {
        self.info.key()
    }

    /// True once the `Thread` object has been destroyed on its OS thread.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.info.state() == ThreadState::Terminated
    }

    /// Wait for the OS thread to exit.
    ///
    /// Returns the panic payload if the entry or the thread's destruction
    /// panicked. A caller-supplied stack is unmapped afterwards.
    pub fn join(mut self) -> std::thread::Result<()> {
        if let Some(native) = self.native.take() {
            // SAFETY: `native` came from a successful `pthread_create` and has
            // been neither joined nor detached (`take` guarantees once).
            let rc = unsafe { libc::pthread_join(native, ptr::null_mut()) };
            if rc != 0 {
                fatal(Fault::primitive(
                    "pthread_join",
                    Arc::as_ptr(&self.info) as usize,
                    rc,
                ));
            }
        }
        drop(self.stack.take());
        match self.outcome.lock().take() {
            Some(payload) => Err(payload),
            None => Ok(()),
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        let Some(native) = self.native.take() else {
            return;
        };
        // SAFETY: `native` has been neither joined nor detached.
        let rc = unsafe { libc::pthread_detach(native) };
        if rc != 0 && !std::thread::panicking() {
            fatal(Fault::primitive(
                "pthread_detach",
                Arc::as_ptr(&self.info) as usize,
                rc,
            ));
        }
        if let Some(stack) = self.stack.take() {
            log::emit(
                &LogEntry::new(LogLevel::Warn, "stack_leaked")
                    .with_thread(self.info.key(), self.info.name())
                    .with_details(serde_json::json!({ "bytes": stack.usable_size() })),
            );
            std::mem::forget(stack);
        }
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("info", &self.info)
            .field("joined", &self.native.is_none())
            .field("caller_stack", &self.stack.is_some())
            .finish()
    }
}

//! # evthread-core
//!
//! Execution-thread and mutual-exclusion substrate for an event-driven,
//! multi-threaded proxy.
//!
//! Every scheduled unit of work runs on a [`Thread`] bound to one OS thread.
//! Each `Thread` owns exactly one [`ProxyMutex`] (its *self mutex*) whose holder
//! must always be the thread actually running; violations of that rule, and any
//! unexpected failure of an underlying locking primitive, terminate the process
//! through [`fatal::fatal`] instead of being reported upward.
//!
//! [`RwLock`] is a separate, non-reentrant shared/exclusive lock for read-mostly
//! tables, with an explicit writer-starvation-avoidance policy.

#![deny(unsafe_code)]

pub mod config;
pub mod directory;
pub mod fatal;
pub mod log;
pub mod mutex;
#[allow(unsafe_code)]
pub mod rwlock;
pub mod thread;
pub mod time;

pub use config::FatalAction;
pub use directory::ThreadKey;
pub use fatal::Fault;
pub use mutex::{MutexGuard, MutexRef, ProxyMutex};
pub use rwlock::{
    DEFAULT_POLICY_PREVENTS_WRITER_STARVATION, ReadGuard, RwLock, RwLockPolicy, WriteGuard,
};
pub use thread::{
    Entry, Execute, MAX_THREAD_NAME_LENGTH, Thread, ThreadHandle, ThreadInfo, ThreadStack,
    ThreadState,
};

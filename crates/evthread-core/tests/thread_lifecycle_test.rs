use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Instant;

use evthread_core::thread::{self, current_os_thread_name};
use evthread_core::{
    Entry, Execute, FatalAction, MAX_THREAD_NAME_LENGTH, Thread, ThreadStack, ThreadState, config,
    directory, time,
};

static TEST_GUARD: Mutex<()> = Mutex::new(());

#[test]
fn function_entry_records_truncated_name_and_releases_self_mutex() {
    let recorded = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&recorded);

    let thread = Thread::new();
    let info = thread.info();
    assert_eq!(info.state(), ThreadState::Constructed);
    assert_eq!(info.mutex().holding_count(), 1);

    let handle = thread.start(
        "ET_NET_worker_thread_7",
        None,
        0,
        Entry::function(move || {
            let me = thread::current().expect("thread directory entry");
            *sink.lock().unwrap() = me.name().to_owned();
        }),
    );
    handle.join().unwrap();

    let name = recorded.lock().unwrap().clone();
    assert_eq!(name, "ET_NET_worker_t");
    assert_eq!(name.len(), MAX_THREAD_NAME_LENGTH - 1);
    assert_eq!(info.mutex().holding_count(), 0);
    assert_eq!(info.mutex().holder(), None);
    assert_eq!(info.state(), ThreadState::Terminated);
}

struct StampOnce {
    stamp: Arc<Mutex<Option<Instant>>>,
    key_matches: Arc<Mutex<bool>>,
}

impl Execute for StampOnce {
    fn execute(&mut self, thread: &Thread) {
        *self.stamp.lock().unwrap() = Some(time::cur_time());
        let registered = directory::current().map(|info| info.key());
        *self.key_matches.lock().unwrap() =
            registered == Some(thread.key()) && thread.info().holds_self_mutex();
    }
}

#[test]
fn execute_body_reads_its_cached_time() {
    let stamp = Arc::new(Mutex::new(None));
    let key_matches = Arc::new(Mutex::new(false));
    let before = Instant::now();

    let handle = Thread::new().start(
        "stamp",
        None,
        0,
        Entry::execute(StampOnce {
            stamp: Arc::clone(&stamp),
            key_matches: Arc::clone(&key_matches),
        }),
    );
    handle.join().unwrap();

    let seen = stamp.lock().unwrap().expect("execute ran");
    assert!(seen >= before);
    assert!(*key_matches.lock().unwrap());
}

#[test]
fn directory_slot_is_cleared_after_destruction() {
    let after = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&after);
    let handle = Thread::new().start(
        "dir-clear",
        None,
        0,
        Entry::function(|| assert!(thread::current().is_some())),
    );
    handle.join().unwrap();

    // A second thread on a fresh OS thread starts with an empty slot.
    std::thread::spawn(move || *sink.lock().unwrap() = Some(thread::current().is_none()))
        .join()
        .unwrap();
    assert_eq!(*after.lock().unwrap(), Some(true));
}

#[test]
fn os_thread_carries_the_name() {
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    Thread::new()
        .start(
            "ET_TASK 3",
            None,
            0,
            Entry::function(move || *sink.lock().unwrap() = current_os_thread_name()),
        )
        .join()
        .unwrap();
    if cfg!(any(target_os = "linux", target_os = "macos")) {
        assert_eq!(seen.lock().unwrap().as_deref(), Some("ET_TASK 3"));
    }
}

#[test]
fn caller_supplied_stack_is_used() {
    let stack = ThreadStack::allocate(256 * 1024).unwrap();
    let (low, high) = (stack.bottom() as usize, stack.bottom() as usize + stack.usable_size());
    let local_addr = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&local_addr);
    let handle = Thread::new().start(
        "own-stack",
        Some(stack),
        0,
        Entry::function(move || {
            let marker = 0u8;
            *sink.lock().unwrap() = std::ptr::addr_of!(marker) as usize;
        }),
    );
    handle.join().unwrap();
    let addr = *local_addr.lock().unwrap();
    assert!(addr >= low && addr < high, "{addr:#x} not in {low:#x}..{high:#x}");
}

#[test]
fn panicking_entry_still_destroys_the_thread() {
    let thread = Thread::new();
    let info = thread.info();
    let handle = thread.start("panicky", None, 0, Entry::function(|| panic!("entry failed")));
    let payload = handle.join().unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"entry failed"));
    assert_eq!(info.state(), ThreadState::Terminated);
    assert_eq!(info.mutex().holding_count(), 0);
}

#[test]
fn destruction_on_a_foreign_thread_is_fatal() {
    let _guard = TEST_GUARD.lock().unwrap();
    config::set_fatal_action(FatalAction::Panic);

    let thread = Thread::new();
    let info = thread.info();
    let outcome = std::thread::spawn(move || {
        panic::catch_unwind(AssertUnwindSafe(move || drop(thread))).is_err()
    })
    .join()
    .unwrap();

    assert!(outcome, "destroying on thread B must trip the fatal check");
    assert_eq!(info.mutex().holding_count(), 1);
    assert!(info.mutex().is_self_held());
    assert_ne!(info.state(), ThreadState::Terminated);
    std::mem::forget(info);
}

#[test]
fn started_thread_reports_running_before_its_entry_finishes() {
    let gate = Arc::new(Barrier::new(2));
    let entry_gate = Arc::clone(&gate);
    let handle = Thread::new().start(
        "gated",
        None,
        0,
        Entry::function(move || {
            entry_gate.wait();
        }),
    );
    let info = Arc::clone(handle.info());
    assert_eq!(info.state(), ThreadState::Running);
    assert!(!handle.is_finished());

    gate.wait();
    handle.join().unwrap();
    assert_eq!(info.state(), ThreadState::Terminated);
}

#[test]
fn leftover_self_hold_is_fatal_on_the_thread_itself() {
    let _guard = TEST_GUARD.lock().unwrap();
    config::set_fatal_action(FatalAction::Panic);

    let thread = Thread::new();
    let info = thread.info();
    let handle = thread.start(
        "leaky",
        None,
        0,
        Entry::function(|| {
            let me = thread::current().expect("registered");
            me.mutex().acquire();
        }),
    );
    let payload = handle.join().unwrap_err();
    let message = payload.downcast_ref::<String>().expect("fatal message");
    assert!(message.contains("\"leaky\""), "{message}");
    assert!(message.contains("still held 2 deep"), "{message}");
    assert_eq!(info.mutex().holding_count(), 2);
    assert_ne!(info.state(), ThreadState::Terminated);
    // Only the dead thread could have released the extra hold.
    std::mem::forget(info);
}

#[cfg(target_os = "linux")]
#[test]
fn zero_stack_size_uses_the_configured_default() {
    let _guard = TEST_GUARD.lock().unwrap();
    let previous = config::default_stack_size();
    let configured = 512 * 1024;
    config::set_default_stack_size(configured);

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let joined = Thread::new()
        .start(
            "small-stack",
            None,
            0,
            Entry::function(move || *sink.lock().unwrap() = thread::current_stack_size()),
        )
        .join();
    config::set_default_stack_size(previous);
    joined.unwrap();

    let size = seen.lock().unwrap().expect("stack size reported");
    // The C library may carve its guard and TLS out of the requested block.
    assert!(size <= configured + 64 * 1024, "{size}");
    assert!(size >= configured * 3 / 4, "{size}");
    assert!(size < previous, "{size} not below {previous}");
}

#[cfg(target_os = "linux")]
#[test]
fn refused_spawn_is_fatal_and_names_the_thread() {
    let _guard = TEST_GUARD.lock().unwrap();
    config::set_fatal_action(FatalAction::Panic);

    let thread = Thread::new();
    let info = thread.info();
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
        thread.start("huge", None, usize::MAX / 4, Entry::function(|| {}))
    }));
    let payload = outcome.map(drop).unwrap_err();
    let message = payload.downcast_ref::<String>().expect("fatal message");
    assert!(
        message.starts_with("evthread fatal: failed to spawn thread \"huge\""),
        "{message}"
    );
    // The unstarted thread stays leaked with its self hold.
    assert_eq!(info.mutex().holding_count(), 1);
    std::mem::forget(info);
}

#[test]
fn local_destruction_without_start_is_clean() {
    let thread = Thread::new();
    let info = thread.info();
    drop(thread);
    assert_eq!(info.state(), ThreadState::Terminated);
    assert_eq!(info.mutex().holding_count(), 0);
}

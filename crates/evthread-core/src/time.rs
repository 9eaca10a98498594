//! Per-OS-thread cached time.
//!
//! Event loops refresh the cached value once per iteration so that code running
//! on the thread can read "now" without a clock call or any synchronization.
//! The value is initialized to the real monotonic time the first time an OS
//! thread touches it, and only that thread ever writes it.

use std::cell::Cell;
use std::time::Instant;

thread_local! {
    static CUR_TIME: Cell<Instant> = Cell::new(Instant::now());
}

/// The calling thread's cached time.
#[must_use]
pub fn cur_time() -> Instant {
    CUR_TIME.with(Cell::get)
}

/// Overwrite the calling thread's cached time.
pub fn set_cur_time(now: Instant) {
    CUR_TIME.with(|slot| slot.set(now));
}

/// Refresh the calling thread's cached time from the monotonic clock.
pub fn refresh_cur_time() -> Instant {
    let now = Instant::now();
    set_cur_time(now);
    now
}

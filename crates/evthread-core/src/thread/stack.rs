//! Caller-supplied thread stacks.
//!
//! Layout of one mapping (stack grows down):
//!
//! ```text
//! base                base + guard                      base + total
//!  | PROT_NONE guard   | usable stack (read/write)        |
//! ```

use std::io;
use std::ptr;

/// Round `size` up to the page size, and to at least `PTHREAD_STACK_MIN`.
pub(crate) fn normalize_stack_size(size: usize) -> usize {
    let page = page_size();
    let size = size.max(libc::PTHREAD_STACK_MIN);
    size.div_ceil(page).saturating_mul(page)
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
}

/// An `mmap`ed stack region with a guard page at its low end.
///
/// Unmapped on drop. A stack handed to [`crate::Thread::start`] is owned by the
/// returned [`crate::ThreadHandle`] and unmapped only after the thread is joined.
#[derive(Debug)]
pub struct ThreadStack {
    base: usize,
    total: usize,
    guard: usize,
}

impl ThreadStack {
    /// Map a stack with at least `size` usable bytes.
    ///
    /// `size` is rounded up to the page size and raised to the platform
    /// minimum; zero selects [`crate::config::default_stack_size`].
    pub fn allocate(size: usize) -> io::Result<Self> {
        let size = if size == 0 {
            crate::config::default_stack_size()
        } else {
            size
        };
        let usable = normalize_stack_size(size);
        let guard = page_size();
        let total = usable
            .checked_add(guard)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;

        // SAFETY: anonymous private mapping, no fd, no fixed address.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `base` is the page-aligned start of the mapping created above,
        // which is larger than one guard page.
        if unsafe { libc::mprotect(base, guard, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: unmapping the region mapped above.
            unsafe { libc::munmap(base, total) };
            return Err(err);
        }

        Ok(Self {
            base: base as usize,
            total,
            guard,
        })
    }

    /// Lowest usable address (just above the guard page).
    #[must_use]
    pub fn bottom(&self) -> *mut libc::c_void {
        (self.base + self.guard) as *mut libc::c_void
    }

    /// Usable bytes, excluding the guard page.
    #[must_use]
    pub fn usable_size(&self) -> usize {
        self.total - self.guard
    }

    /// Whether `addr` lies inside the usable part of this stack.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base + self.guard && addr < self.base + self.total
    }
}

impl Drop for ThreadStack {
    fn drop(&mut self) {
        // SAFETY: base/total describe the mapping created in `allocate`, and no
        // thread runs on it any more (the handle joins before dropping it).
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
    }
}

use crate::platform;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

/// A recursive mutex built on futex (Linux) with a spin fallback elsewhere.
///
/// The heap, block-heap and quarantine facets are all served by one object
/// and call into each other while holding the heap lock, so the lock must be
/// reentrant. std::sync::Mutex is neither reentrant nor allocation-free; we
/// extend a futex mutex with an owner id and a recursion depth instead.
///
/// The futex word holds 0 (unlocked), 1 (locked) or 2 (locked, and at least
/// one thread may be asleep waiting for it).
pub struct RecursiveMutex {
    state: AtomicI32,
    /// Thread id of the current owner, 0 when unlocked.
    owner: AtomicUsize,
    /// Recursion depth. Only accessed by the owning thread.
    depth: UnsafeCell<u32>,
}

unsafe impl Send for RecursiveMutex {}
unsafe impl Sync for RecursiveMutex {}

/// Id of the calling thread, cached in TLS so reentrant acquisitions skip
/// the syscall. Zero never identifies a live thread.
#[inline]
fn owner_tid() -> usize {
    use core::cell::Cell;

    thread_local! {
        static TID: Cell<usize> = const { Cell::new(0) };
    }

    TID.with(|tid| {
        let cached = tid.get();
        if cached != 0 {
            return cached;
        }
        let fresh = platform::current_thread_id();
        tid.set(fresh);
        fresh
    })
}

/// Sleep until the futex word moves away from `expected`.
#[cfg(target_os = "linux")]
fn futex_wait(state: &AtomicI32, expected: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicI32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

/// Wake one sleeper on the futex word.
#[cfg(target_os = "linux")]
fn futex_wake_one(state: &AtomicI32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicI32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1i32,
        );
    }
}

impl RecursiveMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
            owner: AtomicUsize::new(0),
            depth: UnsafeCell::new(0),
        }
    }

    #[inline]
    pub fn lock(&self) {
        let tid = owner_tid();
        // Only the owner can observe owner == tid, so this read alone
        // decides the reentrant path.
        if self.owner.load(Ordering::Relaxed) == tid {
            unsafe { *self.depth.get() += 1 };
            return;
        }
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        self.owner.store(tid, Ordering::Relaxed);
        unsafe { *self.depth.get() = 1 };
    }

    #[cold]
    fn lock_contended(&self) {
        // The critical sections behind this lock are short (queue pops and
        // slab-table writes), so spin a little before involving the kernel.
        for _ in 0..64 {
            if self
                .state
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            core::hint::spin_loop();
        }
        // Park the word at 2 to advertise a sleeper, then wait until a
        // release hands it back at 0. Re-parking at 2 on every wakeup is
        // pessimistic but keeps the release path a single swap.
        while self.state.swap(2, Ordering::Acquire) != 0 {
            #[cfg(target_os = "linux")]
            futex_wait(&self.state, 2);
            #[cfg(not(target_os = "linux"))]
            core::hint::spin_loop();
        }
    }

    #[inline]
    pub fn unlock(&self) {
        debug_assert_eq!(
            self.owner.load(Ordering::Relaxed),
            owner_tid(),
            "unlock from non-owning thread"
        );
        let depth = unsafe { &mut *self.depth.get() };
        debug_assert!(*depth > 0);
        *depth -= 1;
        if *depth > 0 {
            return;
        }
        self.owner.store(0, Ordering::Relaxed);
        // A 2 means someone may be asleep on the word.
        if self.state.swap(0, Ordering::Release) == 2 {
            #[cfg(target_os = "linux")]
            futex_wake_one(&self.state);
        }
    }

    /// Try to acquire without blocking. Succeeds when the lock is free or
    /// already held by this thread.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let tid = owner_tid();
        if self.owner.load(Ordering::Relaxed) == tid {
            unsafe { *self.depth.get() += 1 };
            return true;
        }
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(tid, Ordering::Relaxed);
            unsafe { *self.depth.get() = 1 };
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reentrant_lock_unlock() {
        let m = RecursiveMutex::new();
        m.lock();
        m.lock();
        assert!(m.try_lock());
        m.unlock();
        m.unlock();
        m.unlock();
        // Fully released: another acquire works.
        m.lock();
        m.unlock();
    }

    #[test]
    fn try_lock_fails_across_threads() {
        let m = Arc::new(RecursiveMutex::new());
        m.lock();
        let m2 = Arc::clone(&m);
        let failed = thread::spawn(move || !m2.try_lock())
            .join()
            .expect("thread panicked");
        assert!(failed, "try_lock must fail while another thread holds");
        m.unlock();
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 1000;

        let m = Arc::new(RecursiveMutex::new());
        let inside = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let m = Arc::clone(&m);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        m.lock();
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        // Nested acquire must not deadlock.
                        m.lock();
                        m.unlock();
                        assert!(inside.swap(false, Ordering::SeqCst));
                        m.unlock();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().expect("thread panicked under contention");
        }
    }
}

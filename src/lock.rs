use std::hint;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

/// Maximum number of spin-loop iterations before parking a thread.
/// Spinning avoids kernel calls for short waits; parking avoids wasting CPU
/// on long ones.
const MAX_SPIN: usize = 100;

/// Lock state is a single atomic word:
/// - Bit 0: writer flag
/// - Bits 1-15: reader count (bounds concurrent readers per stripe to 32767)
/// - Bits 16 and up: version counter, incremented on every writer release
const WRITER: usize = 1;
const READER: usize = 1 << 1;
const VERSION: usize = 1 << VERSION_SHIFT;
const VERSION_SHIFT: u32 = 16;
const READERS_MASK: usize = VERSION - 1 - WRITER;

/// A stamped reader-writer lock guarding one stripe of buckets.
///
/// Supports three access modes:
///
/// 1. **Optimistic read**: never blocks. The caller takes a version stamp,
///    performs its reads, and validates the stamp afterwards. Validation
///    fails if a writer held the lock at any point in between, in which case
///    the caller retries under a shared read lock.
///
/// 2. **Shared read**: blocks writers, coexists with other readers. Used as
///    the fallback when optimistic validation fails.
///
/// 3. **Exclusive write**: blocks all readers and writers of the same stripe.
///    Releasing a write lock advances the version so that overlapped
///    optimistic reads fail validation.
///
/// Waiting threads spin a bounded number of times and then park through
/// `parking_lot_core`, keyed by the address of the state word. Locks on
/// distinct stripes are fully independent.
pub(crate) struct StampedLock {
    state: AtomicUsize,
}

impl StampedLock {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Returns a stamp to be checked with [`validate`](Self::validate) after
    /// the optimistic read completes. Never blocks. If a writer currently
    /// holds the lock, the stamp is already stale and validation will fail.
    pub(crate) fn optimistic_read(&self) -> usize {
        self.state.load(Ordering::Acquire)
    }

    /// Returns true if no writer has touched the stripe since `stamp` was
    /// obtained.
    pub(crate) fn validate(&self, stamp: usize) -> bool {
        if stamp & WRITER != 0 {
            return false;
        }
        // the reads being validated must not drift past the state re-read
        fence(Ordering::Acquire);
        let state = self.state.load(Ordering::Relaxed);
        state & WRITER == 0 && state >> VERSION_SHIFT == stamp >> VERSION_SHIFT
    }

    /// Acquires a shared read lock, blocking while a writer holds the stripe.
    pub(crate) fn read(&self) -> ReadGuard<'_> {
        let mut retry = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & WRITER == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        state,
                        state + READER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return ReadGuard { lock: self };
                }
                continue;
            }
            self.spin_or_park(&mut retry, state);
        }
    }

    /// Acquires an exclusive write lock, blocking while any reader or writer
    /// holds the stripe.
    pub(crate) fn write(&self) -> WriteGuard<'_> {
        let mut retry = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (WRITER | READERS_MASK) == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        state,
                        state | WRITER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return WriteGuard { lock: self };
                }
                continue;
            }
            self.spin_or_park(&mut retry, state);
        }
    }

    /// Spin or park the thread while the lock is held in a conflicting mode.
    /// The park validation rechecks the state so a release between the load
    /// and the park cannot strand a sleeper.
    fn spin_or_park(&self, retry: &mut usize, seen: usize) {
        if *retry > MAX_SPIN {
            *retry = 0;
            unsafe {
                parking_lot_core::park(
                    self.park_key(),
                    || self.state.load(Ordering::Acquire) == seen,
                    || (),
                    |_, _| (),
                    DEFAULT_PARK_TOKEN,
                    None,
                );
            }
        } else {
            *retry += 1;
            hint::spin_loop();
        }
    }

    fn park_key(&self) -> usize {
        self.state.as_ptr() as usize
    }

    fn unpark_waiters(&self) {
        unsafe {
            parking_lot_core::unpark_all(self.park_key(), DEFAULT_UNPARK_TOKEN);
        }
    }
}

pub(crate) struct ReadGuard<'a> {
    lock: &'a StampedLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let previous = self.lock.state.fetch_sub(READER, Ordering::Release);
        if previous & READERS_MASK == READER {
            // last reader out; a writer may be waiting
            self.lock.unpark_waiters();
        }
    }
}

pub(crate) struct WriteGuard<'a> {
    lock: &'a StampedLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        // clears the writer bit and advances the version in a single step,
        // invalidating every optimistic read that overlapped this writer
        self.lock.state.fetch_add(VERSION - WRITER, Ordering::Release);
        self.lock.unpark_waiters();
    }
}

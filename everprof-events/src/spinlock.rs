use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Tiny cross-process spinlock over a word in shared memory.
///
/// Producers hold it for the duration of one reservation; the deadline on
/// [`SpinLock::try_lock`] is what detects a producer that died mid-write.
pub struct SpinLock<'a> {
    cell: &'a AtomicU32,
}

impl<'a> SpinLock<'a> {
    pub fn new(cell: &'a AtomicU32) -> Self {
        SpinLock { cell }
    }

    /// Spin until the lock is acquired or `timeout` elapses.
    pub fn try_lock(&self, timeout: Duration) -> Option<SpinLockGuard<'a>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Check the deadline only every few iterations; reading the
            // clock on every spin would dominate the uncontended path.
            for _ in 0..64 {
                if self
                    .cell
                    .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Some(SpinLockGuard { cell: self.cell });
                }
                std::hint::spin_loop();
            }
            if Instant::now() >= deadline {
                return None;
            }
        }
    }
}

pub struct SpinLockGuard<'a> {
    cell: &'a AtomicU32,
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.cell.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_unlock() {
        let cell = AtomicU32::new(0);
        let lock = SpinLock::new(&cell);
        {
            let _guard = lock.try_lock(Duration::from_micros(200)).unwrap();
            assert_eq!(cell.load(Ordering::Relaxed), LOCKED);
        }
        assert_eq!(cell.load(Ordering::Relaxed), UNLOCKED);
    }

    #[test]
    fn contended_lock_times_out() {
        let cell = AtomicU32::new(0);
        let lock = SpinLock::new(&cell);
        let guard = lock.try_lock(Duration::from_micros(200)).unwrap();
        assert!(lock.try_lock(Duration::from_micros(200)).is_none());
        drop(guard);
        assert!(lock.try_lock(Duration::from_micros(200)).is_some());
    }
}

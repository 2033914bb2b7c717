use crossbeam_utils::Backoff;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Default pause between re-checks of a held lock.
pub const DEFAULT_BACKOFF: Duration = Duration::from_micros(10);

/// Tuning of the triple-buffer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    /// Sleep between re-checks once the short spin phase is exhausted.
    pub backoff_us: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backoff_us: DEFAULT_BACKOFF.as_micros() as u64,
        }
    }
}

impl LockConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_micros(self.backoff_us)
    }
}

/// Exclusive lock over the index fields of one buffer set.
///
/// The lock word lives in shared memory and is also taken by the peer, which
/// treats any non-zero value as held. Acquisition is a test-and-set; a caller
/// that loses the race waits with plain loads (a few spins, then fixed
/// sleeps) and only retries the atomic exchange once the word reads clear,
/// which keeps the cache line quiet while the other side finishes its swap.
///
/// There is no fairness and no timeout. Both sides hold the lock only for a
/// constant number of stores, so the wait is bounded by that.
#[derive(Debug)]
pub struct TripleBufLock<'a> {
    word: &'a AtomicU32,
    backoff: Duration,
}

/// Holds a [`TripleBufLock`]; releases it when dropped.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    word: &'a AtomicU32,
}

impl<'a> TripleBufLock<'a> {
    pub fn new(word: &'a AtomicU32, backoff: Duration) -> Self {
        Self { word, backoff }
    }

    /// Spins until the lock is held.
    #[inline]
    pub fn acquire(&self) -> LockGuard<'a> {
        loop {
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            self.wait_until_clear();
        }
    }

    /// Single test-and-set attempt.
    #[inline(always)]
    pub fn try_acquire(&self) -> Option<LockGuard<'a>> {
        if self.word.swap(1, Ordering::Acquire) == 0 {
            Some(LockGuard { word: self.word })
        } else {
            None
        }
    }

    /// Whether someone currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != 0
    }

    fn wait_until_clear(&self) {
        let backoff = Backoff::new();
        while self.word.load(Ordering::Relaxed) != 0 {
            if backoff.is_completed() {
                std::thread::sleep(self.backoff);
            } else {
                backoff.snooze();
            }
        }
    }
}

impl Drop for LockGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

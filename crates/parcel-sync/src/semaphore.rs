//! Single-writer semaphore
//!
//! A counting semaphore with an initial and maximum count of one. Unlike a
//! mutex guard, a [`SyncPermit`] may be released on a different thread than
//! the one that acquired it: staging can happen on a worker while the world
//! is written on the simulation thread.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default interval at which a waiting acquire re-checks the pause signal
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct SemaphoreInner {
    available: Mutex<bool>,
    released: Condvar,
}

impl SemaphoreInner {
    fn release(&self) {
        let mut available = self.available.lock();
        *available = true;
        self.released.notify_one();
    }
}

/// Shared flag that suspends acquire timeouts
///
/// While paused (for example a debugger break in the host), waiting for the
/// semaphore is expected to take arbitrarily long and never times out.
#[derive(Debug, Clone, Default)]
pub struct PauseSignal(Arc<AtomicBool>);

impl PauseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Binary semaphore guarding one scene's world
#[derive(Debug, Clone)]
pub struct BinarySemaphore {
    inner: Arc<SemaphoreInner>,
    poll_interval: Duration,
}

impl BinarySemaphore {
    /// Create an available semaphore
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                available: Mutex::new(true),
                released: Condvar::new(),
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set how often a waiting acquire re-checks the pause signal
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Take the permit if nobody holds it
    pub fn try_acquire(&self) -> Option<SyncPermit> {
        let mut available = self.inner.available.lock();
        if *available {
            *available = false;
            Some(self.permit())
        } else {
            None
        }
    }

    /// Wait for the permit for at most `timeout`
    ///
    /// Time spent while `pause` is set does not count: the full budget starts
    /// again once the pause ends.
    pub fn acquire_timeout(&self, timeout: Duration, pause: &PauseSignal) -> Option<SyncPermit> {
        let mut available = self.inner.available.lock();
        let mut deadline = Instant::now() + timeout;

        loop {
            if *available {
                *available = false;
                return Some(self.permit());
            }

            let now = Instant::now();
            if pause.is_paused() {
                deadline = now + timeout;
                self.inner.released.wait_for(&mut available, self.poll_interval);
                continue;
            }

            if now >= deadline {
                return None;
            }

            let wake = deadline.min(now + self.poll_interval);
            self.inner.released.wait_until(&mut available, wake);
        }
    }

    /// Whether the permit is currently free
    pub fn is_available(&self) -> bool {
        *self.inner.available.lock()
    }

    fn permit(&self) -> SyncPermit {
        SyncPermit {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for BinarySemaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to stage and apply one batch
///
/// Dropping the permit releases the semaphore, on whatever thread that happens.
#[must_use = "dropping the permit releases the semaphore immediately"]
pub struct SyncPermit {
    inner: Arc<SemaphoreInner>,
}

impl fmt::Debug for SyncPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SyncPermit")
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.inner.release();
    }
}

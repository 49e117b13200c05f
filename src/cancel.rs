//! Cooperative cancellation for blocking workers
//!
//! A [`CancellationSource`] owns the flag; cheap [`CancellationToken`]
//! clones are handed to workers, which poll between I/O waits and on every
//! frame boundary. `cancel()` publishes with release ordering, reads use
//! acquire, so a worker that observes the flag also observes every write
//! made before cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct Shared {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Shared {
            cancelled: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        })
    }
}

/// Worker-side view of the cancellation flag.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Sleeps up to `timeout`, waking early on cancellation.
    ///
    /// Returns `true` if the token was cancelled. Workers must re-check
    /// the flag after every wake; the value must not be cached across
    /// suspension points.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let guard = self.shared.lock.lock().unwrap();
        let (_guard, _res) = self
            .shared
            .cond
            .wait_timeout_while(guard, timeout, |_| {
                !self.shared.cancelled.load(Ordering::Acquire)
            })
            .unwrap();
        self.is_cancelled()
    }
}

/// Owner-side handle; created per session, reset on restart.
pub struct CancellationSource {
    shared: Arc<Shared>,
}

impl CancellationSource {
    pub fn new() -> Self {
        CancellationSource {
            shared: Shared::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        let _guard = self.shared.lock.lock().unwrap();
        self.shared.cond.notify_all();
    }

    /// Replaces the underlying state so a new session starts with a fresh
    /// token. Tokens issued before the reset keep observing the old state.
    pub fn reset(&mut self) {
        self.shared = Shared::new();
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

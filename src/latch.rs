//! Countdown barrier used to join the workers of one tick.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use log::warn;
use tokio::sync::Notify;

/// Releases waiters once it has been counted down `count` times.
///
/// Counting down past zero is ignored, so a latch can never underflow.
#[derive(Debug)]
pub struct CountdownLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    /// Count-downs still missing before waiters are released.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn count_down(&self) {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.notify.notify_waiters(),
            Ok(_) => {}
            Err(_) => warn!("Latch counted down below zero"),
        }
    }

    /// Resolves once the count reached zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking, so a release between the check and
            // the await is not lost.
            notified.as_mut().enable();

            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Returns a guard that counts down exactly once when dropped, including
    /// during unwinding.
    pub fn guard(self: &Arc<Self>) -> CountdownGuard {
        CountdownGuard {
            latch: Arc::clone(self),
        }
    }
}

#[derive(Debug)]
pub struct CountdownGuard {
    latch: Arc<CountdownLatch>,
}

impl Drop for CountdownGuard {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}

//! The remount fence.
//!
//! A shared/exclusive barrier between filesystem calls that read catalog
//! state and the remount committer that swaps catalog revisions. Readers
//! enter and leave freely; the committer blocks new readers and waits for
//! the in-flight ones to drain before performing the swap.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared/exclusive coordination for catalog revision swaps.
#[derive(Debug, Default)]
pub struct RemountFence {
    readers: AtomicU64,
    blocking: AtomicBool,
}

impl RemountFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the read side. Spins in 100 ms sleeps while a swap is in
    /// progress. The returned guard leaves the fence on drop.
    pub fn enter(&self) -> FenceGuard<'_> {
        while self.blocking.load(Ordering::Acquire) {
            std::thread::sleep(POLL_INTERVAL);
        }
        self.readers.fetch_add(1, Ordering::AcqRel);
        FenceGuard { fence: self }
    }

    /// Stop new readers and wait until the current ones have drained.
    pub fn block(&self) {
        self.blocking.store(true, Ordering::Release);
        while self.readers.load(Ordering::Acquire) > 0 {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Re-admit readers after the swap.
    pub fn unblock(&self) {
        self.blocking.store(false, Ordering::Release);
    }
}

/// Read-side guard; leaving happens on drop.
#[must_use = "dropping the guard immediately defeats the fence"]
pub struct FenceGuard<'a> {
    fence: &'a RemountFence,
}

impl Drop for FenceGuard<'_> {
    fn drop(&mut self) {
        self.fence.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

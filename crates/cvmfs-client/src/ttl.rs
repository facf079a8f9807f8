//! The catalog TTL trigger.
//!
//! A dedicated timer thread arms a deadline and flips an atomic flag when
//! it passes; the remount machinery polls the flag at the front of
//! `lookup`/`getattr`. (The original used a `SIGALRM` handler for this;
//! a timer thread has the same observable behavior and no signal-safety
//! constraints.)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct TimerShared {
    deadline: Mutex<Option<Instant>>,
    wakeup: Condvar,
    expired: AtomicBool,
    shutdown: AtomicBool,
}

/// Arms catalog-expiry deadlines and reports their firing.
pub struct TtlTimer {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl TtlTimer {
    pub fn spawn() -> Self {
        let shared = Arc::new(TimerShared {
            deadline: Mutex::new(None),
            wakeup: Condvar::new(),
            expired: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("cvmfs-ttl".to_string())
            .spawn(move || Self::run(&worker))
            .expect("failed to spawn ttl timer thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    fn run(shared: &TimerShared) {
        let mut deadline = shared.deadline.lock().unwrap();
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            match *deadline {
                None => {
                    deadline = shared.wakeup.wait(deadline).unwrap();
                }
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        *deadline = None;
                        shared.expired.store(true, Ordering::Release);
                    } else {
                        let (guard, _) = shared.wakeup.wait_timeout(deadline, at - now).unwrap();
                        deadline = guard;
                    }
                }
            }
        }
    }

    /// Arm (or re-arm) the deadline `ttl` from now.
    pub fn arm(&self, ttl: Duration) {
        let mut deadline = self.shared.deadline.lock().unwrap();
        *deadline = Some(Instant::now() + ttl);
        self.shared.wakeup.notify_one();
    }

    /// Disarm the timer (maintenance mode, fixed catalogs).
    pub fn disarm(&self) {
        let mut deadline = self.shared.deadline.lock().unwrap();
        *deadline = None;
        self.shared.expired.store(false, Ordering::Release);
        self.shared.wakeup.notify_one();
    }

    /// Consume a pending expiration.
    pub fn take_expired(&self) -> bool {
        self.shared.expired.swap(false, Ordering::AcqRel)
    }
}

impl Drop for TtlTimer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

const SPINS_BEFORE_YIELD: u32 = 64;

/// Spinlock-style writer latch.
///
/// Every mutating table call holds the latch for its full duration, making
/// the table single-writer. Acquisition spins briefly, then yields to the
/// scheduler, and gives up with [`crate::Error::LockTimeout`] once the
/// deadline passes.
#[derive(Debug)]
pub struct Latch {
    locked: AtomicBool,
    timeout: Duration,
}

impl Latch {
    /// Creates a latch with the given acquisition timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            locked: AtomicBool::new(false),
            timeout,
        }
    }

    /// Acquires the latch, spinning until it is free.
    pub fn lock(&self) -> crate::Result<LatchGuard<'_>> {
        let deadline = Instant::now() + self.timeout;
        let mut spins = 0u32;

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;

            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
            } else {
                if Instant::now() >= deadline {
                    return Err(crate::Error::LockTimeout);
                }
                std::thread::yield_now();
            }
        }

        Ok(LatchGuard { latch: self })
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Releases the latch on drop.
#[derive(Debug)]
pub struct LatchGuard<'a> {
    latch: &'a Latch,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn latch_reentry_after_release() -> crate::Result<()> {
        let latch = Latch::default();

        {
            let _guard = latch.lock()?;
        }

        let _guard = latch.lock()?;
        Ok(())
    }

    #[test]
    fn latch_times_out_while_held() {
        let latch = Latch::new(Duration::from_millis(50));
        let _guard = latch.lock().unwrap();

        let err = latch.lock().unwrap_err();
        assert!(matches!(err, crate::Error::LockTimeout));
    }

    #[test]
    fn latch_excludes_concurrent_writers() {
        use std::sync::Arc;

        let latch = Arc::new(Latch::default());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let latch = latch.clone();
                let counter = counter.clone();

                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        let _guard = latch.lock().unwrap();
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(4_000, counter.load(Ordering::Relaxed));
    }
}

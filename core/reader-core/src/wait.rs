//! Cancellable waits.
//!
//! A [`WaitGate`] lets a stop (or any other state change) cut every pending
//! wait short. Waiters capture the generation when they start; `release_all`
//! bumps it and wakes them. A wait that begins after a release is unaffected.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Released,
}

#[derive(Debug, Default)]
pub struct WaitGate {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        *self.lock()
    }

    /// Wakes every wait currently in progress.
    pub fn release_all(&self) {
        let mut generation = self.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks for `duration` unless released first.
    pub fn wait_timeout(&self, duration: Duration) -> WaitOutcome {
        let deadline = Instant::now() + duration;
        let mut guard = self.lock();
        let started = *guard;

        loop {
            if *guard != started {
                return WaitOutcome::Released;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Elapsed;
            }
            guard = match self.cond.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

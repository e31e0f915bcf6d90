// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A mutex that lives inside a shared segment and is used by unrelated
//! processes.
//!
//! The lock word records the holder's pid. Waiters spin, yield, then sleep
//! with exponential backoff. Once the deadline passes a waiter checks whether
//! the holder still exists and takes the lock over if it does not, so a
//! crashed process cannot wedge every other one forever.

use crate::error::{Result, ShmemError};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicI32, Ordering};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const SPIN_BEFORE_YIELD: u32 = 128;
const YIELD_BEFORE_SLEEP: u32 = 16;
const MIN_SLEEP: Duration = Duration::from_micros(50);
const MAX_SLEEP: Duration = Duration::from_millis(10);

const UNLOCKED: i32 = 0;

/// The lock word is the holder's pid, 0 when unlocked.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmMutex {
    owner: AtomicI32,
    _pad: u32,
}

/// Releases the lock on drop. Not `Send`: the lock belongs to this thread of
/// this process.
#[must_use]
#[derive(Debug)]
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
    _not_send: PhantomData<*const ()>,
}

struct Backoff {
    spins: u32,
    yields: u32,
    sleep: Duration,
}

impl Backoff {
    fn new() -> Self {
        Backoff {
            spins: 0,
            yields: 0,
            sleep: MIN_SLEEP,
        }
    }

    fn wait(&mut self, deadline: Instant) {
        if self.spins < SPIN_BEFORE_YIELD {
            self.spins += 1;
            core::hint::spin_loop();
        } else if self.yields < YIELD_BEFORE_SLEEP {
            self.yields += 1;
            thread::yield_now();
        } else {
            let left = deadline.saturating_duration_since(Instant::now());
            thread::sleep(self.sleep.min(left));
            self.sleep = (self.sleep * 2).min(MAX_SLEEP);
        }
    }
}

fn current_pid() -> i32 {
    nix::unistd::getpid().as_raw()
}

fn process_exists(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

impl ShmMutex {
    pub const fn new() -> Self {
        ShmMutex {
            owner: AtomicI32::new(UNLOCKED),
            _pad: 0,
        }
    }

    /// Resets the mutex to unlocked. Only for freshly created segments.
    pub fn init(&self) {
        self.owner.store(UNLOCKED, Ordering::Release);
    }

    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.owner
            .compare_exchange(UNLOCKED, current_pid(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| self.guard())
    }

    pub fn lock(&self, timeout: Duration) -> Result<ShmMutexGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        loop {
            if self.owner.load(Ordering::Relaxed) == UNLOCKED {
                if let Some(guard) = self.try_lock() {
                    return Ok(guard);
                }
            }
            if Instant::now() >= deadline {
                return self.take_over_from_dead(timeout);
            }
            backoff.wait(deadline);
        }
    }

    fn take_over_from_dead(&self, timeout: Duration) -> Result<ShmMutexGuard<'_>> {
        let holder = match self.owner.compare_exchange(
            UNLOCKED,
            current_pid(),
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => return Ok(self.guard()),
            Err(holder) => holder,
        };
        // Only the dead holder's pid may be swapped out, so a racing waiter
        // or a new holder makes this fail.
        if !process_exists(holder)
            && self
                .owner
                .compare_exchange(holder, current_pid(), Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            tracing::warn!("Recovered shared memory lock held by dead process {holder}");
            return Ok(self.guard());
        }
        Err(ShmemError::LockTimeout(timeout))
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNLOCKED
    }

    /// The pid of the current holder, if any.
    pub fn holder(&self) -> Option<i32> {
        match self.owner.load(Ordering::Relaxed) {
            UNLOCKED => None,
            pid => Some(pid),
        }
    }

    fn guard(&self) -> ShmMutexGuard<'_> {
        ShmMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.owner.store(UNLOCKED, Ordering::Release);
    }
}

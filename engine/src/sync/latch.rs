/*
 * Created on Sat Feb 15 2025
 *
 * This file is a part of Loam
 * Loam is a free and open-source embedded, transactional key/value storage
 * engine written by Sayan Nandan ("the Author") with the vision to provide
 * safe and concurrent ordered storage without compromising on durability,
 * predictability or performance.
 *
 * Copyright (c) 2025, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! # Page latches
//!
//! In several scenarios, we may find `std`'s or other crates' implementations of
//! synchronization primitives to be either _too sophisticated_ or _not what we want_.
//! The page latch is one such case: latch coupling holds and releases latches across
//! function boundaries, so RAII guards are useless, and the shared→exclusive upgrade
//! must be atomic (succeed only for a sole reader), which `parking_lot` cannot express.
//! So we keep our own.
//!
//! The latch word is a single `u32`: the MSB is the writer bit, the rest counts
//! readers. Upgrade is a CAS from "exactly one reader" to "writer", which is what
//! makes `try_upgrade` sound: it can only succeed for the thread that holds the
//! sole shared acquisition.

use super::backoff::Backoff;
use core::sync::atomic::{AtomicU32, Ordering};

const WRITER: u32 = 0x8000_0000;
const ONE_READER: u32 = 1;

/// A short-duration page latch: shared/exclusive with try-variants, atomic
/// shared→exclusive upgrade and exclusive→shared downgrade.
///
/// Acquire/release pairing is the caller's burden. Every algorithm in the tree
/// module is written so that each exit path releases what it acquired.
pub struct Latch {
    state: AtomicU32,
}

impl Latch {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Block until a shared acquisition succeeds
    pub fn acquire_shared(&self) {
        let backoff = Backoff::new();
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & WRITER == 0 {
                if self
                    .state
                    .compare_exchange_weak(s, s + ONE_READER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else {
                backoff.snooze();
            }
        }
    }

    /// Attempt a shared acquisition without waiting for writers
    pub fn try_acquire_shared(&self) -> bool {
        let mut s = self.state.load(Ordering::Relaxed);
        while s & WRITER == 0 {
            match self.state.compare_exchange_weak(
                s,
                s + ONE_READER,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => s = actual,
            }
        }
        false
    }

    /// Block until the exclusive acquisition succeeds
    pub fn acquire_exclusive(&self) {
        let backoff = Backoff::new();
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    /// Attempt the exclusive acquisition without waiting
    pub fn try_acquire_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Upgrade shared→exclusive. Succeeds only if the caller is the sole
    /// reader; on failure the shared acquisition is retained
    pub fn try_upgrade(&self) -> bool {
        self.state
            .compare_exchange(ONE_READER, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Downgrade exclusive→shared without opening a window for writers
    pub fn downgrade(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), WRITER);
        self.state.store(ONE_READER, Ordering::Release);
    }

    pub fn release_shared(&self) {
        let prev = self.state.fetch_sub(ONE_READER, Ordering::Release);
        debug_assert_ne!(prev & !WRITER, 0);
    }

    pub fn release_exclusive(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), WRITER);
        self.state.store(0, Ordering::Release);
    }

    cfg_test! {
        pub fn is_idle(&self) -> bool {
            self.state.load(Ordering::Acquire) == 0
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Latch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = self.state.load(Ordering::Relaxed);
        f.debug_struct("Latch")
            .field("writer", &(s & WRITER != 0))
            .field("readers", &(s & !WRITER))
            .finish()
    }
}

/// An extremely simple mutual exclusion flag without the extra fuss: protects the
/// per-node cursor frame list, whose bind/unbind windows are a handful of pointer
/// stores. Spinning beats parking at that scale
pub struct FrameLock {
    state: AtomicU32,
}

impl FrameLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }
    pub fn lock(&self) {
        let backoff = Backoff::new();
        while self
            .state
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
    }
    pub fn release(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), 1);
        self.state.store(0, Ordering::Release);
    }
}

cfg_test! {
    mod tests {
        use super::Latch;
        use std::sync::Arc;
        use std::thread;

        #[test]
        fn shared_is_reentrant_across_threads() {
            let latch = Arc::new(Latch::new());
            latch.acquire_shared();
            let l2 = latch.clone();
            let t = thread::spawn(move || {
                assert!(l2.try_acquire_shared());
                l2.release_shared();
            });
            t.join().unwrap();
            latch.release_shared();
            assert!(latch.is_idle());
        }

        #[test]
        fn exclusive_excludes_shared() {
            let latch = Latch::new();
            latch.acquire_exclusive();
            assert!(!latch.try_acquire_shared());
            assert!(!latch.try_acquire_exclusive());
            latch.release_exclusive();
            assert!(latch.try_acquire_shared());
            latch.release_shared();
        }

        #[test]
        fn upgrade_only_for_sole_reader() {
            let latch = Latch::new();
            latch.acquire_shared();
            assert!(latch.try_upgrade());
            latch.downgrade();
            // second reader defeats the upgrade
            assert!(latch.try_acquire_shared());
            assert!(!latch.try_upgrade());
            latch.release_shared();
            assert!(latch.try_upgrade());
            latch.release_exclusive();
            assert!(latch.is_idle());
        }

        #[test]
        fn downgrade_admits_readers_not_writers() {
            let latch = Latch::new();
            latch.acquire_exclusive();
            latch.downgrade();
            assert!(latch.try_acquire_shared());
            assert!(!latch.try_acquire_exclusive());
            latch.release_shared();
            latch.release_shared();
            assert!(latch.is_idle());
        }

        #[test]
        fn contended_exclusive_eventually_acquires() {
            let latch = Arc::new(Latch::new());
            latch.acquire_exclusive();
            let l2 = latch.clone();
            let t = thread::spawn(move || {
                l2.acquire_exclusive();
                l2.release_exclusive();
            });
            thread::sleep(std::time::Duration::from_millis(10));
            latch.release_exclusive();
            t.join().unwrap();
            assert!(latch.is_idle());
        }
    }
}

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

use core::cell::Cell;
use core::hint::spin_loop;
use std::thread;

const SPIN_LIMIT: u8 = 6;
const YIELD_LIMIT: u8 = 10;

/// Exponential busy-wait helper for contended CAS loops. Spins for short
/// contention windows and hands the timeslice back to the OS once the
/// window looks long
pub struct Backoff {
    step: Cell<u8>,
}

impl Backoff {
    pub const fn new() -> Self {
        Self { step: Cell::new(0) }
    }
    /// Back off once. Early calls spin, later calls yield
    pub fn snooze(&self) {
        let step = self.step.get();
        if step <= SPIN_LIMIT {
            for _ in 0..(1u32 << step) {
                spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if step <= YIELD_LIMIT {
            self.step.set(step + 1);
        }
    }
    /// Has contention lasted long enough that the caller should consider
    /// releasing what it holds and taking the blocking path?
    pub fn is_saturated(&self) -> bool {
        self.step.get() > YIELD_LIMIT
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

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

pub mod backoff;
pub mod latch;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub type CommitShared<'a> = RwLockReadGuard<'a, ()>;
pub type CommitExclusive<'a> = RwLockWriteGuard<'a, ()>;

/// The tree-wide commit lock. Structural mutations (split finish, merge, page
/// dirtying) take it shared; the checkpointer takes it exclusive to snapshot a
/// consistent on-disk image
pub struct CommitLock {
    inner: RwLock<()>,
}

impl CommitLock {
    pub const fn new() -> Self {
        Self {
            inner: RwLock::new(()),
        }
    }
    pub fn try_shared(&self) -> Option<CommitShared<'_>> {
        self.inner.try_read()
    }
    pub fn shared(&self) -> CommitShared<'_> {
        self.inner.read()
    }
    pub fn exclusive(&self) -> CommitExclusive<'_> {
        self.inner.write()
    }
}

impl Default for CommitLock {
    fn default() -> Self {
        Self::new()
    }
}

/*
 * Created on Wed Mar 05 2025
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

use crate::tree::node::Node;
use bytes::Bytes;
use core::cmp::Ordering;
use std::sync::Arc;

/// The separator chosen by a split. A fragmented separator keeps the chain
/// pointer it will be stored under in the parent, plus the full key bytes for
/// comparisons. No reference-equality tricks: the representation says what it is
#[derive(Clone)]
pub enum SeparatorKey {
    Inline(Bytes),
    Fragmented { chain: u64, full: Bytes },
}

impl SeparatorKey {
    #[inline]
    pub fn full(&self) -> &Bytes {
        match self {
            Self::Inline(k) => k,
            Self::Fragmented { full, .. } => full,
        }
    }
}

impl core::fmt::Debug for SeparatorKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Inline(k) => write!(f, "Inline({} bytes)", k.len()),
            Self::Fragmented { chain, full } => {
                write!(f, "Fragmented({} bytes @ {chain})", full.len())
            }
        }
    }
}

/// Transient descriptor attached to a node that has split but whose separator
/// is not yet promoted into the parent.
///
/// With `split_right == true` the sibling holds the upper half and the original
/// node retains the lower keys; `false` is the mirror. While a split is
/// pending, the original page plus the sibling page together hold exactly the
/// pre-split content (plus whatever landed after), and any latch holder that
/// wants to mutate either side must finish the split first.
pub struct Split {
    split_right: bool,
    sibling: Arc<Node>,
    key: SeparatorKey,
}

/// Which physical node a logical access lands on while a split is pending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitSide {
    Original,
    Sibling,
}

impl Split {
    pub fn new(split_right: bool, sibling: Arc<Node>, key: SeparatorKey) -> Self {
        Self {
            split_right,
            sibling,
            key,
        }
    }

    #[inline]
    pub fn split_right(&self) -> bool {
        self.split_right
    }
    #[inline]
    pub fn sibling(&self) -> &Arc<Node> {
        &self.sibling
    }
    #[inline]
    pub fn separator(&self) -> &SeparatorKey {
        &self.key
    }
    #[inline]
    pub fn full_key(&self) -> &Bytes {
        self.key.full()
    }

    /// Sign of `k` relative to the separator
    #[inline]
    pub fn compare(&self, k: &[u8]) -> Ordering {
        k.cmp(self.full_key())
    }

    pub fn into_parts(self) -> (bool, Arc<Node>, SeparatorKey) {
        (self.split_right, self.sibling, self.key)
    }

    /// Which side does `key` belong to? Keys >= separator live in the upper half
    pub fn select_side(&self, key: &[u8]) -> SplitSide {
        let upper = self.compare(key) != Ordering::Less;
        if upper == self.split_right {
            SplitSide::Sibling
        } else {
            SplitSide::Original
        }
    }

    /// Side holding the logically lowest entry
    pub fn low_side(&self) -> SplitSide {
        if self.split_right {
            SplitSide::Original
        } else {
            SplitSide::Sibling
        }
    }

    /// Side holding the logically highest entry
    pub fn high_side(&self) -> SplitSide {
        if self.split_right {
            SplitSide::Sibling
        } else {
            SplitSide::Original
        }
    }
}

impl core::fmt::Debug for Split {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Split")
            .field("split_right", &self.split_right)
            .field("sibling", &self.sibling.id())
            .field("key", &self.key)
            .finish()
    }
}

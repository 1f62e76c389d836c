/*
 * Created on Sun Mar 02 2025
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

//! # Nodes
//!
//! A [`Node`] is the in-memory image of one fixed-size page: either a leaf, an
//! internal node or a value/key fragment page. The page body is a slotted page:
//!
//! ```text
//! [type u8][resv u8][garbage u16][num_keys u16]([leftmost child u64])[search vector ...][free][... blobs]
//! ```
//!
//! The search vector is a packed array of little-endian `u16` offsets, one per
//! key, sorted by key. All position arithmetic across the tree module is in
//! these 2-byte units: position `p` addresses vector slot `p >> 1`, the next
//! entry is at `p + 2`. Blobs are allocated from the page end downwards; holes
//! left by deletes and updates are accounted in `garbage` and squeezed out when
//! an allocation needs them.
//!
//! Leaf blobs are `[key part][value part]`; internal blobs are
//! `[right child id u64][key part]` with the extra leftmost child held in the
//! header. Oversized keys and values are written out-of-line as fragment page
//! chains and referenced by id (see `tree::value`).
//!
//! Latching rules: every `&self` accessor requires the node latch in at least
//! shared mode, every mutator requires it exclusively. The struct hands out
//! `&mut` through an `UnsafeCell`, so breaking that contract is UB; the
//! cursor/tree layers are written so that it cannot happen.

use crate::cache::PageCache;
use crate::error::{EngineError, EngineResult};
use crate::sync::latch::{FrameLock, Latch};
use crate::tree::frame::{self, CursorFrame};
use crate::tree::split::{SeparatorKey, Split};
use crate::tree::value;
use bytes::Bytes;
use core::cell::UnsafeCell;
use core::cmp::Ordering as CmpOrdering;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

consts! {
    // node type bits
    pub TYPE_LEAF: u8 = 0x01;
    pub TYPE_INTERNAL: u8 = 0x02;
    /// Set together with [`TYPE_INTERNAL`]: every child is a leaf
    pub TYPE_BOTTOM: u8 = 0x04;
    pub TYPE_FRAGMENT: u8 = 0x08;
    /// This node sits on the leftmost spine
    pub LOW_EXTREMITY: u8 = 0x10;
    /// This node sits on the rightmost spine
    pub HIGH_EXTREMITY: u8 = 0x20;

    // page header layout
    OFF_TYPE: usize = 0;
    OFF_GARBAGE: usize = 2;
    OFF_NUM_KEYS: usize = 4;
    OFF_LEFTMOST_CHILD: usize = 6;
    SEARCH_BASE_LEAF: usize = 6;
    SEARCH_BASE_INTERNAL: usize = 14;

    // key part encoding
    KEY_SHORT_MAX: usize = 128;
    KEY_MEDIUM_FLAG: u8 = 0x80;
    KEY_FRAGMENT_FLAG: u8 = 0xC0;
    KEY_MEDIUM_MAX: usize = 0x3FFF + 129;
    KEY_FRAGMENT_PART: usize = 13;

    // value part encoding
    VAL_SHORT_MAX: usize = 0x7F;
    VAL_MEDIUM_FLAG: u8 = 0x80;
    VAL_MEDIUM_MAX: usize = 0x3FFF + 128;
    VAL_FRAGMENT: u8 = 0xE0;
    VAL_GHOST: u8 = 0xFF;
    VAL_FRAGMENT_PART: usize = 17;

    /// Hard cap on key length, fragmented or not
    pub MAX_KEY_LEN: usize = 1 << 20;

    // cached-state values (double-buffered dirtiness)
    pub CACHED_CLEAN: u8 = 0;
    pub CACHED_DIRTY_A: u8 = 1;
    pub CACHED_DIRTY_B: u8 = 2;
}

#[inline]
fn read_u16(page: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([page[off], page[off + 1]])
}

#[inline]
fn write_u16(page: &mut [u8], off: usize, v: u16) {
    page[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn read_u32(page: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]])
}

#[inline]
fn write_u32(page: &mut [u8], off: usize, v: u32) {
    page[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn read_u64(page: &[u8], off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&page[off..off + 8]);
    u64::from_le_bytes(buf)
}

#[inline]
pub(crate) fn write_u64(page: &mut [u8], off: usize, v: u64) {
    page[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Largest key stored inline for the given page size
pub fn max_inline_key(page_size: usize) -> usize {
    (page_size / 8).max(32).min(KEY_MEDIUM_MAX)
}

/// Largest value stored inline for the given page size
pub fn max_inline_value(page_size: usize) -> usize {
    (page_size / 4).min(VAL_MEDIUM_MAX)
}

/// One page worth of tree state plus its latch. See the module docs for the
/// latching contract
pub struct Node {
    id: AtomicU64,
    cached_state: AtomicU8,
    pub(crate) latch: Latch,
    pub(crate) frame_lock: FrameLock,
    /// Head of the intrusive list of cursor frames bound to this node,
    /// guarded by `frame_lock`
    pub(crate) last_cursor_frame: AtomicPtr<CursorFrame>,
    inner: UnsafeCell<NodeInner>,
}

// UNSAFE(@ohsayan): access to `inner` is serialized by `latch`; the atomics take
// care of themselves
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

pub struct NodeInner {
    page: Box<[u8]>,
    /// Transient: this node has split but the separator is not in the parent yet
    pub(crate) split: Option<Box<Split>>,
    /// Lowest byte offset taken by any live blob (conservative)
    blob_low: usize,
    /// Per-child non-ghost entry counts; only meaningful on a clean
    /// bottom-internal node
    pub(crate) child_counts: Option<Box<[u64]>>,
}

impl Node {
    pub fn new(id: u64, page_size: usize, type_byte: u8) -> Arc<Self> {
        let mut page = vec![0u8; page_size].into_boxed_slice();
        page[OFF_TYPE] = type_byte;
        Arc::new(Self {
            id: AtomicU64::new(id),
            cached_state: AtomicU8::new(CACHED_CLEAN),
            latch: Latch::new(),
            frame_lock: FrameLock::new(),
            last_cursor_frame: AtomicPtr::new(ptr::null_mut()),
            inner: UnsafeCell::new(NodeInner {
                page,
                split: None,
                blob_low: page_size,
                child_counts: None,
            }),
        })
    }

    /// Rebuild a node from a page image read back from the pager
    pub fn from_page(id: u64, page: Box<[u8]>) -> EngineResult<Arc<Self>> {
        let page_size = page.len();
        let node = Self::new(id, page_size, page[OFF_TYPE]);
        {
            // UNSAFE(@ohsayan): the node was created on this line; nobody else
            // can hold the latch
            let inner = unsafe { &mut *node.inner.get() };
            inner.page = page;
            let mut blob_low = page_size;
            let n = inner.num_keys();
            for i in 0..n {
                let loc = inner.entry_loc(2 * i as i32) as usize;
                if loc < inner.search_base() + 2 * n || loc >= page_size {
                    return Err(EngineError::corrupted_page(id, "entry offset out of bounds"));
                }
                blob_low = blob_low.min(loc);
            }
            inner.blob_low = blob_low;
        }
        Ok(node)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }
    #[inline]
    pub(crate) fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Release)
    }
    #[inline]
    pub fn cached_state(&self) -> u8 {
        self.cached_state.load(Ordering::Acquire)
    }
    #[inline]
    pub(crate) fn set_cached_state(&self, state: u8) {
        self.cached_state.store(state, Ordering::Release)
    }

    /// Page image view. Caller must hold the latch in at least shared mode
    #[inline]
    pub(crate) fn read(&self) -> &NodeInner {
        // UNSAFE(@ohsayan): latch contract (see module docs)
        unsafe { &*self.inner.get() }
    }

    /// Mutable page image view. Caller must hold the latch exclusively
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn write(&self) -> &mut NodeInner {
        // UNSAFE(@ohsayan): latch contract (see module docs)
        unsafe { &mut *self.inner.get() }
    }
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("cached_state", &self.cached_state())
            .finish()
    }
}

/// Outcome of a slotted-page insert
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry is in place
    Done,
    /// The entry is in place, but the node split on the way: `split` is set
    /// and must be finished by the caller
    DidSplit,
}

impl NodeInner {
    // ==== header accessors ====

    #[inline]
    pub fn type_byte(&self) -> u8 {
        self.page[OFF_TYPE]
    }
    #[inline]
    pub fn set_type_byte(&mut self, b: u8) {
        self.page[OFF_TYPE] = b;
    }
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.type_byte() & TYPE_LEAF != 0
    }
    #[inline]
    pub fn is_internal(&self) -> bool {
        self.type_byte() & TYPE_INTERNAL != 0
    }
    #[inline]
    pub fn is_bottom_internal(&self) -> bool {
        self.type_byte() & TYPE_BOTTOM != 0
    }
    #[inline]
    pub fn is_low_extremity(&self) -> bool {
        self.type_byte() & LOW_EXTREMITY != 0
    }
    #[inline]
    pub fn is_high_extremity(&self) -> bool {
        self.type_byte() & HIGH_EXTREMITY != 0
    }
    #[inline]
    pub fn num_keys(&self) -> usize {
        read_u16(&self.page, OFF_NUM_KEYS) as usize
    }
    #[inline]
    fn set_num_keys(&mut self, n: usize) {
        write_u16(&mut self.page, OFF_NUM_KEYS, n as u16)
    }
    #[inline]
    fn garbage(&self) -> usize {
        read_u16(&self.page, OFF_GARBAGE) as usize
    }
    #[inline]
    fn set_garbage(&mut self, g: usize) {
        write_u16(&mut self.page, OFF_GARBAGE, g as u16)
    }
    #[inline]
    fn add_garbage(&mut self, g: usize) {
        let cur = self.garbage();
        self.set_garbage(cur + g)
    }
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page.len()
    }
    #[inline]
    fn search_base(&self) -> usize {
        if self.is_internal() {
            SEARCH_BASE_INTERNAL
        } else {
            SEARCH_BASE_LEAF
        }
    }
    /// Highest valid position, `-2` when empty
    #[inline]
    pub fn highest_pos(&self) -> i32 {
        2 * self.num_keys() as i32 - 2
    }
    /// Highest child position of an internal node (`num_keys * 2`)
    #[inline]
    pub fn highest_child_pos(&self) -> i32 {
        2 * self.num_keys() as i32
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_keys() == 0
    }
    #[inline]
    pub(crate) fn raw_page(&self) -> &[u8] {
        &self.page
    }
    #[inline]
    pub(crate) fn raw_page_mut(&mut self) -> &mut [u8] {
        &mut self.page
    }

    // ==== search vector ====

    #[inline]
    fn vec_off(&self, pos: i32) -> usize {
        debug_assert!(pos >= 0 && (pos as usize) < 2 * self.num_keys() + 2);
        self.search_base() + pos as usize
    }
    #[inline]
    pub(crate) fn entry_loc(&self, pos: i32) -> u16 {
        read_u16(&self.page, self.vec_off(pos))
    }
    #[inline]
    fn set_entry_loc(&mut self, pos: i32, loc: u16) {
        let off = self.vec_off(pos);
        write_u16(&mut self.page, off, loc)
    }
    #[inline]
    fn search_end(&self) -> usize {
        self.search_base() + 2 * self.num_keys()
    }

    // ==== children ====

    /// Child page id for child index `i` (0 ..= num_keys)
    pub fn child_id(&self, i: usize) -> u64 {
        debug_assert!(self.is_internal());
        debug_assert!(i <= self.num_keys());
        if i == 0 {
            read_u64(&self.page, OFF_LEFTMOST_CHILD)
        } else {
            let loc = self.entry_loc(2 * (i as i32 - 1)) as usize;
            read_u64(&self.page, loc)
        }
    }

    pub fn set_child_id(&mut self, i: usize, id: u64) {
        debug_assert!(self.is_internal());
        if i == 0 {
            write_u64(&mut self.page, OFF_LEFTMOST_CHILD, id)
        } else {
            let loc = self.entry_loc(2 * (i as i32 - 1)) as usize;
            write_u64(&mut self.page, loc, id)
        }
    }

    /// Locate the child slot whose subtree holds `child_id`, if any
    pub fn find_child_slot(&self, child_id: u64) -> Option<usize> {
        (0..=self.num_keys()).find(|&i| self.child_id(i) == child_id)
    }

    // ==== key part codec ====

    /// Byte length of the key part starting at `loc`
    fn key_part_len(&self, loc: usize) -> usize {
        let b0 = self.page[loc];
        if b0 < KEY_MEDIUM_FLAG {
            1 + b0 as usize + 1
        } else if b0 & 0x40 == 0 {
            2 + (((b0 & 0x3F) as usize) << 8 | self.page[loc + 1] as usize) + 129
        } else {
            KEY_FRAGMENT_PART
        }
    }

    fn key_is_fragmented(&self, loc: usize) -> bool {
        self.page[loc] & KEY_FRAGMENT_FLAG == KEY_FRAGMENT_FLAG
    }

    /// Inline key bytes at `loc`; `None` for a fragmented key
    fn inline_key_at(&self, loc: usize) -> Option<&[u8]> {
        let b0 = self.page[loc];
        if b0 < KEY_MEDIUM_FLAG {
            let len = b0 as usize + 1;
            Some(&self.page[loc + 1..loc + 1 + len])
        } else if b0 & 0x40 == 0 {
            let len = (((b0 & 0x3F) as usize) << 8 | self.page[loc + 1] as usize) + 129;
            Some(&self.page[loc + 2..loc + 2 + len])
        } else {
            None
        }
    }

    fn fragmented_key_at(&self, loc: usize) -> (usize, u64) {
        debug_assert!(self.key_is_fragmented(loc));
        let full_len = read_u32(&self.page, loc + 1) as usize;
        let chain = read_u64(&self.page, loc + 5);
        (full_len, chain)
    }

    /// Full key bytes at position `pos`, loading the fragment chain if needed
    pub fn retrieve_key(&self, cache: &PageCache, pos: i32) -> EngineResult<Bytes> {
        let loc = self.entry_loc(pos) as usize;
        let key_loc = if self.is_internal() { loc + 8 } else { loc };
        match self.inline_key_at(key_loc) {
            Some(k) => Ok(Bytes::copy_from_slice(k)),
            None => {
                let (full_len, chain) = self.fragmented_key_at(key_loc);
                value::read_chain(cache, chain, full_len)
            }
        }
    }

    /// Compare the search key against the key at `pos`
    fn compare_key_at(&self, cache: &PageCache, pos: i32, key: &[u8]) -> EngineResult<CmpOrdering> {
        let loc = self.entry_loc(pos) as usize;
        let key_loc = if self.is_internal() { loc + 8 } else { loc };
        match self.inline_key_at(key_loc) {
            Some(k) => Ok(key.cmp(k)),
            None => {
                let (full_len, chain) = self.fragmented_key_at(key_loc);
                let full = value::read_chain(cache, chain, full_len)?;
                Ok(key.cmp(&full[..]))
            }
        }
    }

    /// Standard binary search over the search vector. Returns the matching
    /// position (2-byte units) or the one's complement of the insert position
    pub fn binary_search(&self, cache: &PageCache, key: &[u8]) -> EngineResult<i32> {
        let mut lo = 0i32;
        let mut hi = self.num_keys() as i32 - 1;
        while lo <= hi {
            let mid = (lo + hi) >> 1;
            match self.compare_key_at(cache, mid * 2, key)? {
                CmpOrdering::Equal => return Ok(mid * 2),
                CmpOrdering::Greater => lo = mid + 1,
                CmpOrdering::Less => hi = mid - 1,
            }
        }
        Ok(!(lo * 2))
    }

    /// Map a separator search result to the child slot to descend into:
    /// an exact match descends right of the separator
    #[inline]
    pub fn child_index_for(search: i32) -> usize {
        if search >= 0 {
            (search >> 1) as usize + 1
        } else {
            (!search >> 1) as usize
        }
    }

    // ==== value part codec ====

    fn value_part_len(&self, loc: usize) -> usize {
        let b0 = self.page[loc];
        if b0 as usize <= VAL_SHORT_MAX {
            1 + b0 as usize
        } else if b0 < VAL_FRAGMENT {
            2 + (((b0 & 0x3F) as usize) << 8 | self.page[loc + 1] as usize) + 128
        } else if b0 == VAL_FRAGMENT {
            VAL_FRAGMENT_PART
        } else {
            debug_assert_eq!(b0, VAL_GHOST);
            1
        }
    }

    fn value_loc(&self, pos: i32) -> usize {
        debug_assert!(self.is_leaf());
        let loc = self.entry_loc(pos) as usize;
        loc + self.key_part_len(loc)
    }

    /// Is the entry at `pos` a ghost (deleted by an uncommitted transaction)?
    pub fn is_ghost(&self, pos: i32) -> bool {
        self.page[self.value_loc(pos)] == VAL_GHOST
    }

    /// Fragment chain head of the value at `pos`, if it is fragmented
    pub fn value_fragment_chain(&self, pos: i32) -> Option<(u64, usize)> {
        let loc = self.value_loc(pos);
        if self.page[loc] == VAL_FRAGMENT {
            let len = read_u64(&self.page, loc + 1) as usize;
            let chain = read_u64(&self.page, loc + 9);
            Some((chain, len))
        } else {
            None
        }
    }

    /// Overwrite the fragment chain pointer of the value at `pos`
    pub fn set_value_fragment_chain(&mut self, pos: i32, chain: u64) {
        let loc = self.value_loc(pos);
        debug_assert_eq!(self.page[loc], VAL_FRAGMENT);
        write_u64(&mut self.page, loc + 9, chain)
    }

    /// Fragment chain head of the key at `pos`, if it is fragmented
    pub fn key_fragment_chain(&self, pos: i32) -> Option<(u64, usize)> {
        let loc = self.entry_loc(pos) as usize;
        let key_loc = if self.is_internal() { loc + 8 } else { loc };
        if self.key_is_fragmented(key_loc) {
            let (len, chain) = self.fragmented_key_at(key_loc);
            Some((chain, len))
        } else {
            None
        }
    }

    /// Overwrite the fragment chain pointer of the key at `pos`
    pub fn set_key_fragment_chain(&mut self, pos: i32, chain: u64) {
        let loc = self.entry_loc(pos) as usize;
        let key_loc = if self.is_internal() { loc + 8 } else { loc };
        debug_assert!(self.key_is_fragmented(key_loc));
        write_u64(&mut self.page, key_loc + 5, chain)
    }

    /// Value bytes at `pos`; `None` for a ghost
    pub fn retrieve_leaf_value(&self, cache: &PageCache, pos: i32) -> EngineResult<Option<Bytes>> {
        let loc = self.value_loc(pos);
        let b0 = self.page[loc];
        if b0 as usize <= VAL_SHORT_MAX {
            let len = b0 as usize;
            Ok(Some(Bytes::copy_from_slice(&self.page[loc + 1..loc + 1 + len])))
        } else if b0 < VAL_FRAGMENT {
            let len = (((b0 & 0x3F) as usize) << 8 | self.page[loc + 1] as usize) + 128;
            Ok(Some(Bytes::copy_from_slice(&self.page[loc + 2..loc + 2 + len])))
        } else if b0 == VAL_FRAGMENT {
            let len = read_u64(&self.page, loc + 1) as usize;
            let chain = read_u64(&self.page, loc + 9);
            Ok(Some(value::read_chain(cache, chain, len)?))
        } else {
            Ok(None)
        }
    }

    // ==== entry encoding ====

    /// Encode a key part into `out`, fragmenting it if oversized
    fn encode_key(cache: &PageCache, key: &[u8], out: &mut Vec<u8>) -> EngineResult<()> {
        if key.is_empty() {
            return Err(EngineError::NullKey);
        }
        if key.len() > MAX_KEY_LEN {
            return Err(EngineError::LargeKey(key.len()));
        }
        let page_size = cache.page_size();
        if key.len() <= KEY_SHORT_MAX && key.len() <= max_inline_key(page_size) {
            out.push((key.len() - 1) as u8);
            out.extend_from_slice(key);
        } else if key.len() <= max_inline_key(page_size) {
            let biased = key.len() - 129;
            out.push(KEY_MEDIUM_FLAG | (biased >> 8) as u8);
            out.push(biased as u8);
            out.extend_from_slice(key);
        } else {
            let chain = value::write_chain(cache, key)?;
            out.push(KEY_FRAGMENT_FLAG);
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(&chain.to_le_bytes());
        }
        Ok(())
    }

    /// Encode a value part into `out`, fragmenting it if oversized.
    /// `None` encodes a ghost
    fn encode_value(cache: &PageCache, val: Option<&[u8]>, out: &mut Vec<u8>) -> EngineResult<()> {
        let val = match val {
            Some(v) => v,
            None => {
                out.push(VAL_GHOST);
                return Ok(());
            }
        };
        let page_size = cache.page_size();
        if val.len() <= VAL_SHORT_MAX && val.len() <= max_inline_value(page_size) {
            out.push(val.len() as u8);
            out.extend_from_slice(val);
        } else if val.len() <= max_inline_value(page_size) {
            let biased = val.len() - 128;
            out.push(VAL_MEDIUM_FLAG | (biased >> 8) as u8);
            out.push(biased as u8);
            out.extend_from_slice(val);
        } else {
            let chain = value::write_chain(cache, val)?;
            out.push(VAL_FRAGMENT);
            out.extend_from_slice(&(val.len() as u64).to_le_bytes());
            out.extend_from_slice(&chain.to_le_bytes());
        }
        Ok(())
    }

    /// Copy the raw key part at `loc` as a [`SeparatorKey`]
    fn separator_at(&self, cache: &PageCache, key_loc: usize) -> EngineResult<SeparatorKey> {
        match self.inline_key_at(key_loc) {
            Some(k) => Ok(SeparatorKey::Inline(Bytes::copy_from_slice(k))),
            None => {
                let (full_len, chain) = self.fragmented_key_at(key_loc);
                let full = value::read_chain(cache, chain, full_len)?;
                Ok(SeparatorKey::Fragmented { chain, full })
            }
        }
    }

    /// Separator key for the entry at `pos` (leaf: the entry key; internal:
    /// the separator)
    pub fn separator_key_at(&self, cache: &PageCache, pos: i32) -> EngineResult<SeparatorKey> {
        let loc = self.entry_loc(pos) as usize;
        let key_loc = if self.is_internal() { loc + 8 } else { loc };
        self.separator_at(cache, key_loc)
    }

    // ==== space management ====

    /// Free contiguous bytes between the search vector and the blob heap
    fn contiguous_free(&self) -> usize {
        self.blob_low.saturating_sub(self.search_end())
    }

    /// Total reclaimable bytes including garbage
    fn total_free(&self) -> usize {
        self.contiguous_free() + self.garbage()
    }

    /// Bytes of live payload (blobs only, search vector excluded)
    fn live_blob_bytes(&self) -> usize {
        let mut total = 0;
        for i in 0..self.num_keys() {
            total += self.entry_len(2 * i as i32);
        }
        total
    }

    /// Full blob length of the entry at `pos`
    pub(crate) fn entry_len(&self, pos: i32) -> usize {
        let loc = self.entry_loc(pos) as usize;
        if self.is_leaf() {
            let kl = self.key_part_len(loc);
            kl + self.value_part_len(loc + kl)
        } else {
            8 + self.key_part_len(loc + 8)
        }
    }

    /// Squeeze garbage out of the blob heap. Offsets in the search vector are
    /// rewritten; positions are unaffected
    fn compact_page(&mut self) {
        let page_size = self.page_size();
        let mut scratch = vec![0u8; page_size];
        let mut top = page_size;
        let n = self.num_keys();
        let mut new_locs = vec![0u16; n];
        for i in 0..n {
            let pos = 2 * i as i32;
            let loc = self.entry_loc(pos) as usize;
            let len = self.entry_len(pos);
            top -= len;
            scratch[top..top + len].copy_from_slice(&self.page[loc..loc + len]);
            new_locs[i] = top as u16;
        }
        self.page[top..page_size].copy_from_slice(&scratch[top..page_size]);
        for (i, loc) in new_locs.into_iter().enumerate() {
            self.set_entry_loc(2 * i as i32, loc);
        }
        self.blob_low = top;
        self.set_garbage(0);
    }

    /// Allocate `len` blob bytes, compacting if fragmentation demands it.
    /// Returns `None` on a genuine overflow (caller splits)
    fn alloc_blob(&mut self, len: usize, extra_vec: usize) -> Option<usize> {
        let needed = len + extra_vec;
        if self.contiguous_free() < needed {
            if self.total_free() < needed {
                return None;
            }
            self.compact_page();
            if self.contiguous_free() < needed {
                return None;
            }
        }
        self.blob_low -= len;
        Some(self.blob_low)
    }

    /// Shift the search vector open at `pos`, making room for one slot
    fn open_slot(&mut self, pos: i32) {
        let base = self.search_base();
        let end = self.search_end();
        let at = base + pos as usize;
        self.page.copy_within(at..end, at + 2);
        self.set_num_keys(self.num_keys() + 1);
    }

    /// Remove the slot at `pos`
    fn close_slot(&mut self, pos: i32) {
        let base = self.search_base();
        let end = self.search_end();
        let at = base + pos as usize;
        self.page.copy_within(at + 2..end, at);
        self.set_num_keys(self.num_keys() - 1);
    }

    // ==== leaf mutators ====

    /// Insert a new leaf entry at insert position `ip` (2-byte units). On
    /// overflow the node splits and the entry lands in the proper half; bound
    /// cursor frames are adjusted either way. `self_arc` is this node
    pub fn insert_leaf_entry(
        &mut self,
        cache: &PageCache,
        self_arc: &Arc<Node>,
        ip: i32,
        key: &[u8],
        val: Option<&[u8]>,
    ) -> EngineResult<InsertOutcome> {
        debug_assert!(self.is_leaf());
        debug_assert!(self.split.is_none());
        let mut blob = Vec::new();
        Self::encode_key(cache, key, &mut blob)?;
        Self::encode_value(cache, val, &mut blob)?;
        if let Some(loc) = self.alloc_blob(blob.len(), 2) {
            self.page[loc..loc + blob.len()].copy_from_slice(&blob);
            self.open_slot(ip);
            self.set_entry_loc(ip, loc as u16);
            frame::fix_frames_insert(self_arc, ip, key);
            self.child_counts = None;
            return Ok(InsertOutcome::Done);
        }
        // overflow: split, then place the entry in whichever half owns it
        self.split_leaf(cache, self_arc, ip)?;
        // UNSAFE(@ohsayan): split is set on this very node by split_leaf
        let split = unsafe { crate::util::Unwrappable::unsafe_unwrap(self.split.as_deref()) };
        let sibling = split.sibling().clone();
        let target_original = match split.compare(key) {
            CmpOrdering::Less => split.split_right(),
            _ => !split.split_right(),
        };
        if target_original {
            let ip = match self.binary_search(cache, key)? {
                found if found >= 0 => return Err(EngineError::corrupted_page(0, "dup after split")),
                nf => !nf,
            };
            let loc = self
                .alloc_blob(blob.len(), 2)
                .ok_or_else(|| EngineError::corrupted_page(0, "no room after split"))?;
            self.page[loc..loc + blob.len()].copy_from_slice(&blob);
            self.open_slot(ip);
            self.set_entry_loc(ip, loc as u16);
            frame::fix_frames_insert(self_arc, ip, key);
        } else {
            sibling.latch.acquire_exclusive();
            let sib = sibling.write();
            let ip = match sib.binary_search(cache, key)? {
                found if found >= 0 => {
                    sibling.latch.release_exclusive();
                    return Err(EngineError::corrupted_page(0, "dup after split"));
                }
                nf => !nf,
            };
            match sib.alloc_blob(blob.len(), 2) {
                Some(loc) => {
                    sib.page[loc..loc + blob.len()].copy_from_slice(&blob);
                    sib.open_slot(ip);
                    sib.set_entry_loc(ip, loc as u16);
                    frame::fix_frames_insert(&sibling, ip, key);
                    sibling.latch.release_exclusive();
                }
                None => {
                    sibling.latch.release_exclusive();
                    return Err(EngineError::corrupted_page(0, "no room after split"));
                }
            }
        }
        Ok(InsertOutcome::DidSplit)
    }

    /// Split this leaf around insert pressure at `ip`. Attaches the split
    /// record; does not insert anything
    fn split_leaf(&mut self, cache: &PageCache, self_arc: &Arc<Node>, ip: i32) -> EngineResult<()> {
        let n = self.num_keys();
        debug_assert!(n >= 2);
        let split_right;
        let cut; // first index moving right-of-separator
        if ip >= self.highest_child_pos() {
            // append-heavy: new sibling takes (almost) nothing
            split_right = true;
            cut = n - 1;
        } else if ip == 0 {
            split_right = false;
            cut = 1;
        } else {
            split_right = true;
            let total = self.live_blob_bytes();
            let mut acc = 0;
            let mut c = n - 1;
            for i in 0..n {
                acc += self.entry_len(2 * i as i32);
                if acc * 2 >= total {
                    c = (i + 1).min(n - 1);
                    break;
                }
            }
            cut = c.max(1);
        }
        let sibling = cache.alloc_node(self.type_byte() & !(LOW_EXTREMITY | HIGH_EXTREMITY))?;
        {
            let sib = sibling.write();
            if split_right {
                // entries cut..n move to the sibling
                if self.is_high_extremity() {
                    sib.set_type_byte(sib.type_byte() | HIGH_EXTREMITY);
                    self.set_type_byte(self.type_byte() & !HIGH_EXTREMITY);
                }
                for i in cut..n {
                    let pos = 2 * i as i32;
                    let loc = self.entry_loc(pos) as usize;
                    let len = self.entry_len(pos);
                    let sloc = sib
                        .alloc_blob(len, 2)
                        .ok_or_else(|| EngineError::corrupted_page(0, "fresh sibling overflow"))?;
                    sib.page[sloc..sloc + len].copy_from_slice(&self.page[loc..loc + len]);
                    let spos = 2 * (i - cut) as i32;
                    sib.open_slot(spos);
                    sib.set_entry_loc(spos, sloc as u16);
                    self.add_garbage(len);
                }
                self.set_num_keys(cut);
            } else {
                // entries 0..cut move to the sibling
                if self.is_low_extremity() {
                    sib.set_type_byte(sib.type_byte() | LOW_EXTREMITY);
                    self.set_type_byte(self.type_byte() & !LOW_EXTREMITY);
                }
                for i in 0..cut {
                    let pos = 2 * i as i32;
                    let loc = self.entry_loc(pos) as usize;
                    let len = self.entry_len(pos);
                    let sloc = sib
                        .alloc_blob(len, 2)
                        .ok_or_else(|| EngineError::corrupted_page(0, "fresh sibling overflow"))?;
                    sib.page[sloc..sloc + len].copy_from_slice(&self.page[loc..loc + len]);
                    let spos = 2 * i as i32;
                    sib.open_slot(spos);
                    sib.set_entry_loc(spos, sloc as u16);
                    self.add_garbage(len);
                }
                // shift the retained slots down
                let base = self.search_base();
                let end = self.search_end();
                self.page.copy_within(base + 2 * cut..end, base);
                self.set_num_keys(n - cut);
            }
        }
        // the separator is the lowest key right of the cut
        let separator = if split_right {
            let sib = sibling.read();
            sib.separator_key_at(cache, 0)?
        } else {
            self.separator_key_at(cache, 0)?
        };
        // UNSAFE(@ohsayan): we hold this node exclusively; the sibling is not
        // yet reachable by any other thread
        unsafe {
            frame::rebind_frames_for_split(
                self_arc,
                &sibling,
                2 * cut as i32,
                split_right,
                separator.full(),
            );
        }
        self.child_counts = None;
        self.split = Some(Box::new(Split::new(split_right, sibling, separator)));
        Ok(())
    }

    /// Replace the value of the leaf entry at `pos`. May split on growth.
    /// Frames never move for an update, except through the split path
    pub fn update_leaf_value(
        &mut self,
        cache: &PageCache,
        self_arc: &Arc<Node>,
        pos: i32,
        val: Option<&[u8]>,
    ) -> EngineResult<InsertOutcome> {
        debug_assert!(self.is_leaf());
        debug_assert!(self.split.is_none());
        // free an existing fragmented value; the caller has copied whatever
        // undo state it needs
        if let Some((chain, _)) = self.value_fragment_chain(pos) {
            value::free_chain(cache, chain)?;
        }
        let loc = self.entry_loc(pos) as usize;
        let kl = self.key_part_len(loc);
        let old_len = kl + self.value_part_len(loc + kl);
        let mut vpart = Vec::new();
        Self::encode_value(cache, val, &mut vpart)?;
        self.child_counts = None;
        if vpart.len() <= self.value_part_len(loc + kl) {
            // in-place shrink
            let shrink = self.value_part_len(loc + kl) - vpart.len();
            self.page[loc + kl..loc + kl + vpart.len()].copy_from_slice(&vpart);
            self.add_garbage(shrink);
            return Ok(InsertOutcome::Done);
        }
        // grow: rewrite the whole blob
        let mut blob = Vec::with_capacity(kl + vpart.len());
        blob.extend_from_slice(&self.page[loc..loc + kl]);
        blob.extend_from_slice(&vpart);
        self.add_garbage(old_len);
        if let Some(new_loc) = self.alloc_blob(blob.len(), 0) {
            self.page[new_loc..new_loc + blob.len()].copy_from_slice(&blob);
            self.set_entry_loc(pos, new_loc as u16);
            return Ok(InsertOutcome::Done);
        }
        // overflow: take the entry out, split, and reinsert
        let key = self.retrieve_key(cache, pos)?;
        let loc = self.entry_loc(pos) as usize;
        if self.key_is_fragmented(loc) {
            let (_, chain) = self.fragmented_key_at(loc);
            value::free_chain(cache, chain)?;
        }
        self.close_slot(pos);
        frame::fix_frames_delete(self_arc, pos, &key);
        match self.insert_leaf_entry(cache, self_arc, {
            match self.binary_search(cache, &key)? {
                found if found >= 0 => {
                    return Err(EngineError::corrupted_page(0, "dup during update"))
                }
                nf => !nf,
            }
        }, &key, val)? {
            InsertOutcome::Done => Ok(InsertOutcome::Done),
            InsertOutcome::DidSplit => Ok(InsertOutcome::DidSplit),
        }
    }

    /// Turn the entry at `pos` into a ghost in place
    pub fn ghost_leaf_value(&mut self, cache: &PageCache, pos: i32) -> EngineResult<()> {
        debug_assert!(self.is_leaf());
        if let Some((chain, _)) = self.value_fragment_chain(pos) {
            value::free_chain(cache, chain)?;
        }
        let loc = self.entry_loc(pos) as usize;
        let kl = self.key_part_len(loc);
        let vlen = self.value_part_len(loc + kl);
        self.page[loc + kl] = VAL_GHOST;
        self.add_garbage(vlen - 1);
        self.child_counts = None;
        Ok(())
    }

    /// Physically remove the leaf entry at `pos`, freeing fragment chains.
    /// `key` is the entry's key, used to stamp not-found frames
    pub fn delete_leaf_entry(
        &mut self,
        cache: &PageCache,
        self_arc: &Arc<Node>,
        pos: i32,
        key: &Bytes,
    ) -> EngineResult<()> {
        debug_assert!(self.is_leaf());
        if let Some((chain, _)) = self.value_fragment_chain(pos) {
            value::free_chain(cache, chain)?;
        }
        let loc = self.entry_loc(pos) as usize;
        if self.key_is_fragmented(loc) {
            let (_, chain) = self.fragmented_key_at(loc);
            value::free_chain(cache, chain)?;
        }
        let len = self.entry_len(pos);
        self.add_garbage(len);
        self.close_slot(pos);
        frame::fix_frames_delete(self_arc, pos, key);
        self.child_counts = None;
        Ok(())
    }

    /// Number of entries that are not ghosts
    pub fn count_non_ghost_keys(&self) -> u64 {
        debug_assert!(self.is_leaf());
        let mut count = 0;
        for i in 0..self.num_keys() {
            if !self.is_ghost(2 * i as i32) {
                count += 1;
            }
        }
        count
    }

    // ==== internal node mutators ====

    /// Insert a separator + right child at key index `idx`. On overflow the
    /// node splits (always right for internal nodes) and the entry lands in
    /// the correct half
    pub fn insert_internal_entry(
        &mut self,
        cache: &PageCache,
        self_arc: &Arc<Node>,
        idx: usize,
        sep: &SeparatorKey,
        right_child: u64,
    ) -> EngineResult<InsertOutcome> {
        debug_assert!(self.is_internal());
        debug_assert!(self.split.is_none());
        let mut blob = Vec::new();
        blob.extend_from_slice(&right_child.to_le_bytes());
        Self::encode_separator(sep, &mut blob);
        if let Some(loc) = self.alloc_blob(blob.len(), 2) {
            let pos = 2 * idx as i32;
            self.page[loc..loc + blob.len()].copy_from_slice(&blob);
            self.open_slot(pos);
            self.set_entry_loc(pos, loc as u16);
            frame::fix_parent_frames_child_inserted(self_arc, idx + 1);
            self.child_counts = None;
            return Ok(InsertOutcome::Done);
        }
        self.split_internal(cache, self_arc)?;
        // UNSAFE(@ohsayan): split_internal just set it
        let split = unsafe { crate::util::Unwrappable::unsafe_unwrap(self.split.as_deref()) };
        let sibling = split.sibling().clone();
        let go_original = split.compare(sep.full()) == CmpOrdering::Less;
        if go_original {
            let idx = match self.binary_search(cache, sep.full())? {
                found if found >= 0 => return Err(EngineError::corrupted_page(0, "dup separator")),
                nf => (!nf >> 1) as usize,
            };
            match self.insert_internal_entry(cache, self_arc, idx, sep, right_child)? {
                InsertOutcome::Done => {}
                InsertOutcome::DidSplit => {
                    return Err(EngineError::corrupted_page(0, "double split"))
                }
            }
        } else {
            sibling.latch.acquire_exclusive();
            let res = {
                let sib = sibling.write();
                sib.binary_search(cache, sep.full()).and_then(|search| {
                    let idx = if search >= 0 {
                        return Err(EngineError::corrupted_page(0, "dup separator"));
                    } else {
                        (!search >> 1) as usize
                    };
                    sib.insert_internal_entry(cache, &sibling, idx, sep, right_child)
                })
            };
            sibling.latch.release_exclusive();
            match res? {
                InsertOutcome::Done => {}
                InsertOutcome::DidSplit => {
                    return Err(EngineError::corrupted_page(0, "double split"))
                }
            }
        }
        Ok(InsertOutcome::DidSplit)
    }

    fn encode_separator(sep: &SeparatorKey, out: &mut Vec<u8>) {
        match sep {
            SeparatorKey::Inline(k) => {
                if k.len() <= KEY_SHORT_MAX {
                    out.push((k.len() - 1) as u8);
                } else {
                    let biased = k.len() - 129;
                    out.push(KEY_MEDIUM_FLAG | (biased >> 8) as u8);
                    out.push(biased as u8);
                }
                out.extend_from_slice(k);
            }
            SeparatorKey::Fragmented { chain, full } => {
                out.push(KEY_FRAGMENT_FLAG);
                out.extend_from_slice(&(full.len() as u32).to_le_bytes());
                out.extend_from_slice(&chain.to_le_bytes());
            }
        }
    }

    /// Split an internal node: the middle separator is promoted, the upper
    /// separators and children move to a new right sibling
    fn split_internal(&mut self, cache: &PageCache, self_arc: &Arc<Node>) -> EngineResult<()> {
        let n = self.num_keys();
        debug_assert!(n >= 3);
        let mid = n / 2;
        let sibling = cache.alloc_node(self.type_byte() & !(LOW_EXTREMITY | HIGH_EXTREMITY))?;
        let promoted = self.separator_key_at(cache, 2 * mid as i32)?;
        {
            let sib = sibling.write();
            if self.is_high_extremity() {
                sib.set_type_byte(sib.type_byte() | HIGH_EXTREMITY);
                self.set_type_byte(self.type_byte() & !HIGH_EXTREMITY);
            }
            // sibling's leftmost child is the promoted separator's right child
            let mid_loc = self.entry_loc(2 * mid as i32) as usize;
            let leftmost = read_u64(&self.page, mid_loc);
            write_u64(&mut sib.page, OFF_LEFTMOST_CHILD, leftmost);
            for i in (mid + 1)..n {
                let pos = 2 * i as i32;
                let loc = self.entry_loc(pos) as usize;
                let len = self.entry_len(pos);
                let sloc = sib
                    .alloc_blob(len, 2)
                    .ok_or_else(|| EngineError::corrupted_page(0, "fresh sibling overflow"))?;
                sib.page[sloc..sloc + len].copy_from_slice(&self.page[loc..loc + len]);
                let spos = 2 * (i - mid - 1) as i32;
                sib.open_slot(spos);
                sib.set_entry_loc(spos, sloc as u16);
                self.add_garbage(len);
            }
        }
        // drop the promoted separator and everything that moved
        self.add_garbage(self.entry_len(2 * mid as i32));
        self.set_num_keys(mid);
        // UNSAFE(@ohsayan): held exclusively; sibling unreachable
        unsafe {
            frame::rebind_frames_for_internal_split(self_arc, &sibling, mid);
        }
        self.child_counts = None;
        self.split = Some(Box::new(Split::new(true, sibling, promoted)));
        Ok(())
    }

    /// Remove the separator at key index `idx` together with its right child
    /// pointer (used after a merge consumed the right child)
    pub fn delete_internal_entry(
        &mut self,
        cache: &PageCache,
        self_arc: &Arc<Node>,
        idx: usize,
    ) -> EngineResult<()> {
        debug_assert!(self.is_internal());
        let pos = 2 * idx as i32;
        let loc = self.entry_loc(pos) as usize;
        if self.key_is_fragmented(loc + 8) {
            let (_, chain) = self.fragmented_key_at(loc + 8);
            value::free_chain(cache, chain)?;
        }
        self.add_garbage(self.entry_len(pos));
        self.close_slot(pos);
        frame::fix_parent_frames_child_removed(self_arc, idx + 1);
        self.child_counts = None;
        Ok(())
    }

    // ==== merge support ====

    /// Live payload bytes plus per-entry search vector cost, used for merge
    /// fit checks
    pub fn merge_weight(&self) -> usize {
        self.live_blob_bytes() + 2 * self.num_keys()
    }

    /// Usable payload capacity of this page
    pub fn capacity(&self) -> usize {
        self.page_size() - self.search_base()
    }

    /// Below this, a node volunteers for a merge
    pub fn is_below_fill_threshold(&self) -> bool {
        self.merge_weight() * 4 < self.capacity()
    }

    /// Move every entry of `right` (a leaf) into this leaf. The caller holds
    /// both latches exclusively and rebinds frames afterwards
    pub fn absorb_right_leaf(&mut self, right: &NodeInner) -> EngineResult<()> {
        debug_assert!(self.is_leaf() && right.is_leaf());
        let base = self.num_keys();
        for i in 0..right.num_keys() {
            let pos = 2 * i as i32;
            let loc = right.entry_loc(pos) as usize;
            let len = right.entry_len(pos);
            let nloc = self
                .alloc_blob(len, 2)
                .ok_or_else(|| EngineError::corrupted_page(0, "merge overflow"))?;
            self.page[nloc..nloc + len].copy_from_slice(&right.page[loc..loc + len]);
            let npos = 2 * (base + i) as i32;
            self.open_slot(npos);
            self.set_entry_loc(npos, nloc as u16);
        }
        if right.is_high_extremity() {
            self.set_type_byte(self.type_byte() | HIGH_EXTREMITY);
        }
        self.child_counts = None;
        Ok(())
    }

    /// Move every separator+child of `right` (an internal node) into this
    /// node, with `sep` (pulled from the parent) between the halves
    pub fn absorb_right_internal(
        &mut self,
        right: &NodeInner,
        sep: &SeparatorKey,
    ) -> EngineResult<()> {
        debug_assert!(self.is_internal() && right.is_internal());
        // the parent separator bridges: its right child is right's leftmost
        let mut blob = Vec::new();
        blob.extend_from_slice(&right.child_id(0).to_le_bytes());
        Self::encode_separator(sep, &mut blob);
        let pos = self.highest_child_pos();
        let loc = self
            .alloc_blob(blob.len(), 2)
            .ok_or_else(|| EngineError::corrupted_page(0, "merge overflow"))?;
        self.page[loc..loc + blob.len()].copy_from_slice(&blob);
        self.open_slot(pos);
        self.set_entry_loc(pos, loc as u16);
        for i in 0..right.num_keys() {
            let rpos = 2 * i as i32;
            let rloc = right.entry_loc(rpos) as usize;
            let len = right.entry_len(rpos);
            let nloc = self
                .alloc_blob(len, 2)
                .ok_or_else(|| EngineError::corrupted_page(0, "merge overflow"))?;
            self.page[nloc..nloc + len].copy_from_slice(&right.page[rloc..rloc + len]);
            let npos = self.highest_child_pos();
            self.open_slot(npos);
            self.set_entry_loc(npos, nloc as u16);
        }
        if right.is_high_extremity() {
            self.set_type_byte(self.type_byte() | HIGH_EXTREMITY);
        }
        self.child_counts = None;
        Ok(())
    }

    /// Byte-for-byte content copy (used when the root's lower half moves out
    /// to a fresh child during a root split)
    pub fn copy_from(&mut self, other: &NodeInner) {
        self.page.copy_from_slice(&other.page);
        self.blob_low = other.blob_low;
        self.child_counts = None;
        debug_assert!(self.split.is_none());
    }

    /// Reinitialize this page as an internal root with one separator and two
    /// children (the root split transform; the node object stays the root)
    pub fn init_root_internal(
        &mut self,
        sep: &SeparatorKey,
        left: u64,
        right: u64,
        bottom: bool,
    ) {
        let page_size = self.page_size();
        self.page.iter_mut().for_each(|b| *b = 0);
        let mut t = TYPE_INTERNAL | LOW_EXTREMITY | HIGH_EXTREMITY;
        if bottom {
            t |= TYPE_BOTTOM;
        }
        self.set_type_byte(t);
        self.blob_low = page_size;
        self.child_counts = None;
        write_u64(&mut self.page, OFF_LEFTMOST_CHILD, left);
        let mut blob = Vec::new();
        blob.extend_from_slice(&right.to_le_bytes());
        Self::encode_separator(sep, &mut blob);
        // UNSAFE(@ohsayan): a freshly wiped root always fits one separator
        let loc = unsafe { crate::util::Unwrappable::unsafe_unwrap(self.alloc_blob(blob.len(), 2)) };
        self.page[loc..loc + blob.len()].copy_from_slice(&blob);
        self.open_slot(0);
        self.set_entry_loc(0, loc as u16);
    }

    /// Adopt the full content of `other` (root collapse). Type byte keeps the
    /// extremity bits of a root
    pub fn adopt_content(&mut self, other: &NodeInner) {
        self.page.copy_from_slice(&other.page);
        self.set_type_byte(other.type_byte() | LOW_EXTREMITY | HIGH_EXTREMITY);
        self.blob_low = other.blob_low;
        self.child_counts = None;
        debug_assert!(self.split.is_none());
    }
}

cfg_test! {
    mod tests {
        use super::*;
        use crate::cache::PageCache;

        fn test_cache(page_size: usize) -> PageCache {
            PageCache::new(page_size, 1024)
        }

        fn leaf(cache: &PageCache) -> Arc<Node> {
            cache
                .alloc_node(TYPE_LEAF | LOW_EXTREMITY | HIGH_EXTREMITY)
                .unwrap()
        }

        fn insert(cache: &PageCache, node: &Arc<Node>, key: &[u8], val: &[u8]) -> InsertOutcome {
            node.latch.acquire_exclusive();
            let inner = node.write();
            let ip = match inner.binary_search(cache, key).unwrap() {
                p if p >= 0 => panic!("dup"),
                nf => !nf,
            };
            let out = inner
                .insert_leaf_entry(cache, node, ip, key, Some(val))
                .unwrap();
            node.latch.release_exclusive();
            out
        }

        #[test]
        fn leaf_insert_and_search() {
            let cache = test_cache(512);
            let node = leaf(&cache);
            for k in ["delta", "alpha", "charlie", "bravo"] {
                assert_eq!(insert(&cache, &node, k.as_bytes(), b"v"), InsertOutcome::Done);
            }
            node.latch.acquire_shared();
            let inner = node.read();
            assert_eq!(inner.num_keys(), 4);
            assert_eq!(inner.binary_search(&cache, b"alpha").unwrap(), 0);
            assert_eq!(inner.binary_search(&cache, b"bravo").unwrap(), 2);
            assert_eq!(inner.binary_search(&cache, b"delta").unwrap(), 6);
            assert_eq!(inner.binary_search(&cache, b"aaaa").unwrap(), !0);
            assert_eq!(inner.binary_search(&cache, b"zeta").unwrap(), !8);
            assert_eq!(
                inner.retrieve_key(&cache, 4).unwrap(),
                Bytes::from_static(b"charlie")
            );
            node.latch.release_shared();
        }

        #[test]
        fn value_codec_size_classes() {
            let cache = test_cache(4096);
            let node = leaf(&cache);
            let short = vec![7u8; 127];
            let medium = vec![9u8; 600];
            insert(&cache, &node, b"short", &short);
            insert(&cache, &node, b"medium", &medium);
            node.latch.acquire_shared();
            let inner = node.read();
            let pos = inner.binary_search(&cache, b"short").unwrap();
            assert_eq!(
                inner.retrieve_leaf_value(&cache, pos).unwrap().unwrap(),
                Bytes::from(short)
            );
            let pos = inner.binary_search(&cache, b"medium").unwrap();
            assert_eq!(
                inner.retrieve_leaf_value(&cache, pos).unwrap().unwrap(),
                Bytes::from(medium)
            );
            node.latch.release_shared();
        }

        #[test]
        fn fragmented_value_roundtrip() {
            let cache = test_cache(512);
            let node = leaf(&cache);
            let big = (0..4000u32).map(|i| i as u8).collect::<Vec<u8>>();
            insert(&cache, &node, b"big", &big);
            node.latch.acquire_shared();
            let inner = node.read();
            let pos = inner.binary_search(&cache, b"big").unwrap();
            assert!(inner.value_fragment_chain(pos).is_some());
            assert_eq!(
                inner.retrieve_leaf_value(&cache, pos).unwrap().unwrap(),
                Bytes::from(big)
            );
            node.latch.release_shared();
        }

        #[test]
        fn ghost_then_delete() {
            let cache = test_cache(512);
            let node = leaf(&cache);
            insert(&cache, &node, b"k1", b"v1");
            insert(&cache, &node, b"k2", b"v2");
            node.latch.acquire_exclusive();
            let inner = node.write();
            let pos = inner.binary_search(&cache, b"k1").unwrap();
            inner.ghost_leaf_value(&cache, pos).unwrap();
            assert!(inner.is_ghost(pos));
            assert_eq!(inner.retrieve_leaf_value(&cache, pos).unwrap(), None);
            assert_eq!(inner.count_non_ghost_keys(), 1);
            let key = inner.retrieve_key(&cache, pos).unwrap();
            inner.delete_leaf_entry(&cache, &node, pos, &key).unwrap();
            assert_eq!(inner.num_keys(), 1);
            node.latch.release_exclusive();
        }

        #[test]
        fn split_on_overflow_keeps_order() {
            let cache = test_cache(512);
            let node = leaf(&cache);
            let val = vec![3u8; 100];
            let mut split_seen = false;
            for i in 0..6u32 {
                let key = format!("key-{i:04}");
                if insert(&cache, &node, key.as_bytes(), &val) == InsertOutcome::DidSplit {
                    split_seen = true;
                    break;
                }
            }
            assert!(split_seen);
            node.latch.acquire_shared();
            let inner = node.read();
            let split = inner.split.as_deref().unwrap();
            assert!(split.split_right());
            let sibling = split.sibling().clone();
            let retained = inner.num_keys();
            assert!(retained >= 1);
            // all retained keys < separator
            let last = inner.retrieve_key(&cache, inner.highest_pos()).unwrap();
            assert!(last < *split.full_key());
            sibling.latch.acquire_shared();
            let sib = sibling.read();
            let first = sib.retrieve_key(&cache, 0).unwrap();
            assert_eq!(first, *split.full_key());
            sibling.latch.release_shared();
            node.latch.release_shared();
        }

        #[test]
        fn compaction_reclaims_garbage() {
            let cache = test_cache(512);
            let node = leaf(&cache);
            insert(&cache, &node, b"a", &[1u8; 120]);
            insert(&cache, &node, b"b", &[2u8; 120]);
            node.latch.acquire_exclusive();
            {
                let inner = node.write();
                let pos = inner.binary_search(&cache, b"a").unwrap();
                let key = inner.retrieve_key(&cache, pos).unwrap();
                inner.delete_leaf_entry(&cache, &node, pos, &key).unwrap();
                assert!(inner.garbage() > 0);
            }
            node.latch.release_exclusive();
            // garbage must be reusable without splitting
            assert_eq!(insert(&cache, &node, b"c", &[3u8; 120]), InsertOutcome::Done);
            assert_eq!(insert(&cache, &node, b"d", &[4u8; 120]), InsertOutcome::Done);
        }
    }
}

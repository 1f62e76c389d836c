/*
 * Created on Thu Mar 13 2025
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

//! # The page cache
//!
//! Maps page ids to live [`Node`]s through a sharded hash table (the same
//! shape as our other concurrent maps: one `RwLock`ed table per shard, shard
//! picked by hash). Backing storage is an in-memory stable-page table written
//! at checkpoint time; a real file backend would slot in behind the same
//! surface.
//!
//! Dirtiness is double-buffered: a node is dirty in generation A or B, and the
//! checkpointer flips the current generation under the exclusive commit lock.
//! `mark_dirty` keeps the page id stable; [`PageCache::relocate`] is the
//! explicit id-reassignment used by compaction (the caller owns updating
//! whatever references the old id).

use crate::error::{EngineError, EngineResult};
use crate::tree::node::{Node, CACHED_CLEAN, CACHED_DIRTY_A, CACHED_DIRTY_B};
use ahash::RandomState;
use core::hash::{BuildHasher, Hash, Hasher};
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use parking_lot::{Mutex, RwLock};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

type Shard = RwLock<HashMap<u64, Arc<Node>>>;

fn shard_count() -> usize {
    (num_cpus::get() * 4).next_power_of_two()
}

pub struct PageCache {
    page_size: usize,
    capacity: usize,
    shards: Box<[Shard]>,
    hasher: RandomState,
    next_id: AtomicU64,
    free_ids: Mutex<BinaryHeap<core::cmp::Reverse<u64>>>,
    /// The generation new dirt is tagged with
    dirty_gen: AtomicU8,
    /// Stable page images, written at checkpoint
    stable: Mutex<HashMap<u64, Box<[u8]>>>,
}

impl PageCache {
    pub fn new(page_size: usize, capacity: usize) -> Self {
        let shards = (0..shard_count())
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<Shard>>()
            .into_boxed_slice();
        Self {
            page_size,
            capacity,
            shards,
            hasher: RandomState::new(),
            next_id: AtomicU64::new(1),
            free_ids: Mutex::new(BinaryHeap::new()),
            dirty_gen: AtomicU8::new(CACHED_DIRTY_A),
            stable: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn shard_for(&self, id: u64) -> &Shard {
        let mut state = self.hasher.build_hasher();
        id.hash(&mut state);
        let h = state.finish() as usize;
        &self.shards[h & (self.shards.len() - 1)]
    }

    fn alloc_id(&self) -> u64 {
        if let Some(core::cmp::Reverse(id)) = self.free_ids.lock().pop() {
            return id;
        }
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    fn free_id(&self, id: u64) {
        self.free_ids.lock().push(core::cmp::Reverse(id));
    }

    /// Highest page id handed out so far
    pub fn highest_allocated_id(&self) -> u64 {
        self.next_id.load(Ordering::Acquire) - 1
    }

    /// Number of cached (live) nodes
    pub fn cached_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Allocate a fresh node. Fresh nodes are born dirty in the current
    /// generation: they have no stable image yet
    pub fn alloc_node(&self, type_byte: u8) -> EngineResult<Arc<Node>> {
        let id = self.alloc_id();
        let node = Node::new(id, self.page_size, type_byte);
        node.set_cached_state(self.dirty_gen.load(Ordering::Acquire));
        self.shard_for(id).write().insert(id, node.clone());
        Ok(node)
    }

    /// Non-blocking id lookup; the caller re-checks the id after latching to
    /// catch a racing eviction
    pub fn node_map_get(&self, id: u64) -> Option<Arc<Node>> {
        self.shard_for(id).read().get(&id).cloned()
    }

    /// Id lookup, loading the page from stable storage on a miss
    pub fn load_node(&self, id: u64) -> EngineResult<Arc<Node>> {
        if let Some(n) = self.node_map_get(id) {
            return Ok(n);
        }
        let image = self
            .stable
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::corrupted_page(id, "page not found in stable storage"))?;
        let node = Node::from_page(id, image)?;
        let mut shard = self.shard_for(id).write();
        // another loader may have won the race
        if let Some(existing) = shard.get(&id) {
            return Ok(existing.clone());
        }
        shard.insert(id, node.clone());
        Ok(node)
    }

    /// Is this page resident? (Used by the cold-subtree bias in
    /// `Cursor::random_node`)
    pub fn is_cached(&self, id: u64) -> bool {
        self.shard_for(id).read().contains_key(&id)
    }

    /// Does the node need dirtying before mutation in this generation?
    #[inline]
    pub fn should_mark_dirty(&self, node: &Node) -> bool {
        node.cached_state() != self.dirty_gen.load(Ordering::Acquire)
    }

    /// Tag the node dirty in the current generation. Caller holds the shared
    /// commit lock (so the generation cannot flip underneath); no latch is
    /// needed since the state is atomic and cached child counts are gated on
    /// the clean state anyway. Returns whether the state changed
    pub fn mark_dirty(&self, node: &Node) -> bool {
        let gen = self.dirty_gen.load(Ordering::Acquire);
        if node.cached_state() == gen {
            return false;
        }
        node.set_cached_state(gen);
        true
    }

    /// Reassign the node to a fresh page id (compaction). Caller holds the
    /// exclusive latch and owns fixing every reference to the old id
    pub fn relocate(&self, node: &Arc<Node>) -> EngineResult<u64> {
        let old = node.id();
        let new = self.alloc_id();
        self.shard_for(old).write().remove(&old);
        node.set_id(new);
        self.shard_for(new).write().insert(new, node.clone());
        self.stable.lock().remove(&old);
        self.free_id(old);
        self.mark_dirty(node);
        Ok(new)
    }

    /// About to delete: drop any stable image so a checkpoint cannot
    /// resurrect the page. Caller holds the exclusive latch
    pub fn prepare_to_delete(&self, node: &Node) {
        self.stable.lock().remove(&node.id());
    }

    /// Remove an (empty, latched) node from the tree. Its id is zeroed so
    /// stale handles revalidate and fail
    pub fn delete_node(&self, node: &Arc<Node>) {
        let id = node.id();
        self.prepare_to_delete(node);
        self.shard_for(id).write().remove(&id);
        node.set_id(0);
        node.set_cached_state(CACHED_CLEAN);
        self.free_id(id);
    }

    /// Evict a clean, unreferenced node. The id is zeroed under the exclusive
    /// latch so racing `node_map_get` users notice. Returns false if the node
    /// was dirty, bound or contended
    pub fn evict(&self, id: u64) -> bool {
        let node = match self.node_map_get(id) {
            Some(n) => n,
            None => return false,
        };
        if !node.latch.try_acquire_exclusive() {
            return false;
        }
        let evictable = node.cached_state() == CACHED_CLEAN
            && node
                .last_cursor_frame
                .load(Ordering::Acquire)
                .is_null();
        if evictable {
            self.shard_for(id).write().remove(&id);
            node.set_id(0);
        }
        node.latch.release_exclusive();
        evictable
    }

    /// Flip the dirty generation and flush everything dirty in the previous
    /// one to stable storage. Caller holds the exclusive commit lock, so no
    /// page mutation can be in flight
    pub fn checkpoint_flush(&self) -> EngineResult<usize> {
        let old = self.dirty_gen.load(Ordering::Acquire);
        let new = if old == CACHED_DIRTY_A {
            CACHED_DIRTY_B
        } else {
            CACHED_DIRTY_A
        };
        self.dirty_gen.store(new, Ordering::Release);
        let mut flushed = 0;
        let mut stable = self.stable.lock();
        for shard in self.shards.iter() {
            for node in shard.read().values() {
                if node.cached_state() == old {
                    stable.insert(node.id(), node.read().raw_page().to_vec().into_boxed_slice());
                    node.set_cached_state(CACHED_CLEAN);
                    flushed += 1;
                }
            }
        }
        Ok(flushed)
    }
}

impl core::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageCache")
            .field("page_size", &self.page_size)
            .field("capacity", &self.capacity)
            .field("cached", &self.cached_count())
            .finish()
    }
}

cfg_test! {
    mod tests {
        use super::*;
        use crate::tree::node::TYPE_LEAF;

        #[test]
        fn alloc_ids_are_dense_and_reused() {
            let cache = PageCache::new(512, 64);
            let a = cache.alloc_node(TYPE_LEAF).unwrap();
            let b = cache.alloc_node(TYPE_LEAF).unwrap();
            assert_eq!(a.id(), 1);
            assert_eq!(b.id(), 2);
            a.latch.acquire_exclusive();
            cache.delete_node(&a);
            a.latch.release_exclusive();
            assert_eq!(a.id(), 0);
            let c = cache.alloc_node(TYPE_LEAF).unwrap();
            // the freed id comes back first
            assert_eq!(c.id(), 1);
        }

        #[test]
        fn dirty_generation_flip() {
            let cache = PageCache::new(512, 64);
            let node = cache.alloc_node(TYPE_LEAF).unwrap();
            // fresh nodes are dirty
            assert!(!cache.should_mark_dirty(&node));
            let flushed = cache.checkpoint_flush().unwrap();
            assert_eq!(flushed, 1);
            assert_eq!(node.cached_state(), CACHED_CLEAN);
            assert!(cache.should_mark_dirty(&node));
            node.latch.acquire_exclusive();
            assert!(cache.mark_dirty(&node));
            assert!(!cache.mark_dirty(&node));
            node.latch.release_exclusive();
        }

        #[test]
        fn evict_and_reload() {
            let cache = PageCache::new(512, 64);
            let node = cache.alloc_node(TYPE_LEAF).unwrap();
            let id = node.id();
            cache.checkpoint_flush().unwrap();
            assert!(cache.evict(id));
            assert_eq!(node.id(), 0, "evicted node ids are zeroed");
            assert!(!cache.is_cached(id));
            let again = cache.load_node(id).unwrap();
            assert_eq!(again.id(), id);
        }

        #[test]
        fn dirty_nodes_do_not_evict() {
            let cache = PageCache::new(512, 64);
            let node = cache.alloc_node(TYPE_LEAF).unwrap();
            assert!(!cache.evict(node.id()));
        }
    }
}

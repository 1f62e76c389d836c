/*
 * Created on Sat Mar 22 2025
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

//! # The B+tree
//!
//! [`Tree`] owns the root and coordinates structural changes: finishing
//! pending splits, merging underfull nodes, and the two root transforms. The
//! root **node object is stable** for the life of the tree: a root split
//! moves the old root's content into a fresh child and rewrites the root as
//! an internal node in place; a root collapse adopts the only child's content
//! back into the root. Cursor stacks are patched in the same critical
//! sections, so no cursor ever observes a dangling root.
//!
//! Every structural change here runs under the shared commit lock; the
//! checkpointer takes it exclusively to see a quiescent tree.

pub mod cursor;
pub mod frame;
pub mod node;
pub mod split;
pub mod value;
#[cfg(test)]
mod tests;

use crate::db::DbCore;
use crate::error::{EngineError, EngineResult};
use crate::tree::cursor::Cursor;
use crate::tree::frame::CursorFrame;
use crate::tree::node::{Node, TYPE_LEAF, HIGH_EXTREMITY, LOW_EXTREMITY};
use crate::txn::Txn;
use bytes::Bytes;
use std::sync::Arc;

/// Callback target for [`Tree::verify`]. Returning `false` stops the walk
pub trait VerifyObserver {
    fn fail(&mut self, node_id: u64, level: usize, message: &str) -> bool;
}

impl<F: FnMut(u64, usize, &str) -> bool> VerifyObserver for F {
    fn fail(&mut self, node_id: u64, level: usize, message: &str) -> bool {
        self(node_id, level, message)
    }
}

pub struct Tree {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) db: Arc<DbCore>,
    pub(crate) root: Arc<Node>,
}

impl Tree {
    pub(crate) fn open(db: Arc<DbCore>, id: u64, name: String) -> EngineResult<Arc<Self>> {
        let root = db
            .cache
            .alloc_node(TYPE_LEAF | LOW_EXTREMITY | HIGH_EXTREMITY)?;
        Ok(Arc::new(Self { id, name, db, root }))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a cursor over this tree
    pub fn cursor(self: &Arc<Self>, txn: Txn) -> Cursor {
        Cursor::new(self.clone(), txn)
    }

    /// Cheap emptiness probe: true iff the root is a leaf with no entries.
    /// A tree holding only ghosts reads as non-empty
    pub fn is_empty(&self) -> bool {
        self.root.latch.acquire_shared();
        let inner = self.root.read();
        let empty = inner.is_leaf() && inner.is_empty() && inner.split.is_none();
        self.root.latch.release_shared();
        empty
    }

    /// Count live (non-ghost) entries in `[low, high)`
    pub fn count(
        self: &Arc<Self>,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> EngineResult<u64> {
        let mut cursor = self.cursor(Txn::Bogus);
        cursor.set_key_only(true);
        let mut positioned = match low {
            Some(k) => cursor.find_ge(k)?,
            None => cursor.first()?,
        };
        let mut count = 0u64;
        while positioned {
            if let (Some(hi), Some(k)) = (high, cursor.key()) {
                if &k[..] >= hi {
                    break;
                }
            }
            count += 1;
            positioned = cursor.next()?;
        }
        cursor.reset();
        Ok(count)
    }

    /// Non-transactional bulk clear
    pub fn delete_all(self: &Arc<Self>) -> EngineResult<()> {
        let mut cursor = self.cursor(Txn::Bogus);
        let res = cursor.delete_all();
        cursor.reset();
        res
    }

    // ==== split finishing ====

    /// Finish the pending split of `frame`'s node, climbing as far as the
    /// splits cascade. Caller holds the node's exclusive latch; on return the
    /// frame's (possibly rebound) node is exclusively latched and carries no
    /// split
    ///
    /// ## Safety
    /// `frame` must point at a live frame owned by the calling cursor
    pub(crate) unsafe fn finish_split(&self, frame: *mut CursorFrame) -> EngineResult<()> {
        loop {
            let f = &mut *frame;
            let node = match f.node.clone() {
                Some(n) => n,
                None => return Err(EngineError::Unpositioned),
            };
            if node.read().split.is_none() {
                return Ok(());
            }
            if Arc::ptr_eq(&node, &self.root) {
                // the root itself split (the root object is stable, so this
                // check is exact)
                self.finish_split_root(&node)?;
                let child = match f.acquire_exclusive() {
                    Some(c) => c,
                    None => {
                        node.latch.release_exclusive();
                        return Err(EngineError::Unpositioned);
                    }
                };
                node.latch.release_exclusive();
                debug_assert!(child.read().split.is_none());
                let _ = child;
                return Ok(());
            }
            let pframe: *mut CursorFrame = match f.parent.as_deref_mut() {
                Some(p) if p.node_snapshot().is_some() => p,
                // a stale (collapsed-away) stack cannot finish this split
                _ => {
                    node.latch.release_exclusive();
                    return Err(EngineError::Unpositioned);
                }
            };
            node.latch.release_exclusive();
            let parent = match (*pframe).acquire_exclusive() {
                Some(p) => p,
                None => return Err(EngineError::Unpositioned),
            };
            if parent.read().split.is_some() {
                // the parent has its own unfinished split; deal with it first
                self.finish_split(pframe)?;
            }
            let parent = match (*pframe).node.clone() {
                Some(p) => p,
                None => return Err(EngineError::Unpositioned),
            };
            // re-secure the child under the parent (it may have been rebound)
            let node = match f.acquire_exclusive() {
                Some(n) => n,
                None => {
                    parent.latch.release_exclusive();
                    return Err(EngineError::Unpositioned);
                }
            };
            if node.read().split.is_some() {
                let res = self.finish_child_split(&parent, &node);
                if res.is_err() {
                    node.latch.release_exclusive();
                    parent.latch.release_exclusive();
                    return res;
                }
                if parent.read().split.is_some() {
                    // the separator insert overflowed the parent; climb
                    node.latch.release_exclusive();
                    let res = self.finish_split(pframe);
                    let parent = (*pframe).node.clone();
                    if let Some(p) = parent {
                        p.latch.release_exclusive();
                    }
                    res?;
                    // re-secure our level and re-check from the top
                    match f.acquire_exclusive() {
                        Some(_) => continue,
                        None => return Err(EngineError::Unpositioned),
                    }
                }
                parent.latch.release_exclusive();
                // node still latched; loop re-checks and returns
                continue;
            }
            // somebody else finished it
            parent.latch.release_exclusive();
            return Ok(());
        }
    }

    /// Shared-latch variant: upgrade (or re-acquire), finish, downgrade.
    /// Returns the (possibly rebound) node, latched shared
    ///
    /// ## Safety
    /// See [`Self::finish_split`]
    pub(crate) unsafe fn finish_split_shared(
        &self,
        frame: *mut CursorFrame,
    ) -> EngineResult<Arc<Node>> {
        let f = &mut *frame;
        let node = match f.node.clone() {
            Some(n) => n,
            None => return Err(EngineError::Unpositioned),
        };
        if !node.latch.try_upgrade() {
            // readers that cannot upgrade release and retry
            node.latch.release_shared();
            match f.acquire_exclusive() {
                Some(_) => {}
                None => return Err(EngineError::Unpositioned),
            }
        }
        let still_split = f
            .node
            .as_ref()
            .map(|n| n.read().split.is_some())
            .unwrap_or(false);
        if still_split {
            // never block on the commit lock while latched: try, else release
            // the latch, block, re-latch
            let commit = match self.db.commit_lock.try_shared() {
                Some(g) => g,
                None => {
                    if let Some(n) = f.node.clone() {
                        n.latch.release_exclusive();
                    }
                    let g = self.db.commit_lock.shared();
                    match f.acquire_exclusive() {
                        Some(_) => {}
                        None => return Err(EngineError::Unpositioned),
                    }
                    g
                }
            };
            self.finish_split(frame)?;
            drop(commit);
        }
        let node = match f.node.clone() {
            Some(n) => n,
            None => return Err(EngineError::Unpositioned),
        };
        node.latch.downgrade();
        Ok(node)
    }

    /// Promote the separator of `child`'s pending split into `parent`. Both
    /// are exclusively latched; the commit lock is held shared. May leave a
    /// pending split on the parent
    pub(crate) fn finish_child_split(
        &self,
        parent: &Arc<Node>,
        child: &Arc<Node>,
    ) -> EngineResult<()> {
        let cache = &self.db.cache;
        let split = match parent.read().split.is_some() {
            // never graft into a parent that is itself mid-split
            true => return Err(EngineError::corrupted_page(parent.id(), "parent mid-split")),
            false => child.write().split.take(),
        };
        let split = match split {
            Some(s) => *s,
            None => return Ok(()),
        };
        let (split_right, sibling, sep) = split.into_parts();
        sibling.latch.acquire_exclusive();
        let slot = match parent.read().find_child_slot(child.id()) {
            Some(s) => s,
            None => {
                sibling.latch.release_exclusive();
                return Err(EngineError::corrupted_page(
                    parent.id(),
                    "split child not referenced by parent",
                ));
            }
        };
        cache.mark_dirty(parent);
        cache.mark_dirty(child);
        cache.mark_dirty(&sibling);
        let res = if split_right {
            parent
                .write()
                .insert_internal_entry(cache, parent, slot, &sep, sibling.id())
        } else {
            parent.write().set_child_id(slot, sibling.id());
            parent
                .write()
                .insert_internal_entry(cache, parent, slot, &sep, child.id())
        };
        match res {
            Ok(_) => {}
            Err(e) => {
                sibling.latch.release_exclusive();
                return Err(e);
            }
        }
        // stacks that continued into the moved half need their parent-level
        // frames repointed at the new child slot
        // UNSAFE(@ohsayan): parent, child and sibling are all latched exclusively
        unsafe {
            if split_right {
                frame::repoint_parent_frames(&sibling, parent, slot + 1);
                frame::repoint_parent_frames(child, parent, slot);
            } else {
                frame::repoint_parent_frames(&sibling, parent, slot);
                frame::repoint_parent_frames(child, parent, slot + 1);
            }
        }
        sibling.latch.release_exclusive();
        log::trace!(
            "tree {}: finished split of page {} (sibling {})",
            self.id,
            child.id(),
            sibling.id()
        );
        Ok(())
    }

    /// The root split: move the retained half into a fresh child, rewrite the
    /// root in place as an internal node over the two halves, and give every
    /// affected cursor stack a root-level frame
    fn finish_split_root(&self, root: &Arc<Node>) -> EngineResult<()> {
        let cache = &self.db.cache;
        let split = match root.write().split.take() {
            Some(s) => *s,
            None => return Ok(()),
        };
        let (split_right, sibling, sep) = split.into_parts();
        sibling.latch.acquire_exclusive();
        let halved = cache.alloc_node(root.read().type_byte())?;
        halved.latch.acquire_exclusive();
        halved.write().copy_from(root.read());
        // UNSAFE(@ohsayan): root + both halves exclusively latched; `halved`
        // is not yet reachable through the tree
        unsafe {
            frame::move_frames_for_merge(root, &halved, 0);
        }
        let bottom = halved.read().is_leaf();
        let (left_id, right_id, halved_slot, sibling_slot) = if split_right {
            (halved.id(), sibling.id(), 0usize, 1usize)
        } else {
            (sibling.id(), halved.id(), 1usize, 0usize)
        };
        root.write().init_root_internal(&sep, left_id, right_id, bottom);
        unsafe {
            frame::attach_root_frames(&halved, &sibling, root, halved_slot, sibling_slot);
        }
        cache.mark_dirty(root);
        cache.mark_dirty(&halved);
        cache.mark_dirty(&sibling);
        sibling.latch.release_exclusive();
        halved.latch.release_exclusive();
        log::debug!(
            "tree {}: root split, new height; halves {} / {}",
            self.id,
            left_id,
            right_id
        );
        Ok(())
    }

    /// The reverse transform: the root is an internal node with no keys and a
    /// single child. Adopt the child's content and drop a level. Caller holds
    /// the root exclusively; commit lock held shared
    fn root_collapse(&self, root: &Arc<Node>) -> EngineResult<()> {
        let cache = &self.db.cache;
        let child_id = root.read().child_id(0);
        let child = cache.load_node(child_id)?;
        child.latch.acquire_exclusive();
        if child.read().split.is_some() {
            // finishing re-grows the root; no collapse after all
            let res = self.finish_child_split(root, &child);
            child.latch.release_exclusive();
            return res;
        }
        root.write().adopt_content(child.read());
        // UNSAFE(@ohsayan): both held exclusively
        unsafe {
            frame::collapse_root_frames(root, &child);
        }
        cache.mark_dirty(root);
        cache.delete_node(&child);
        child.latch.release_exclusive();
        log::debug!("tree {}: root collapsed onto page {}", self.id, child_id);
        Ok(())
    }

    // ==== dirtying ====

    /// Ensure the frame's node and every ancestor is dirty in the current
    /// generation, finishing a pending split on the node first. Caller holds
    /// the node's exclusive latch and the shared commit lock
    ///
    /// ## Safety
    /// See [`Self::finish_split`]
    pub(crate) unsafe fn not_split_dirty(&self, frame: *mut CursorFrame) -> EngineResult<()> {
        let f = &*frame;
        if f
            .node
            .as_ref()
            .map(|n| n.read().split.is_some())
            .unwrap_or(false)
        {
            self.finish_split(frame)?;
        }
        let cache = &self.db.cache;
        let node = match (*frame).node.clone() {
            Some(n) => n,
            None => return Err(EngineError::Unpositioned),
        };
        cache.mark_dirty(&node);
        // ancestors: states are atomic and the commit lock pins the
        // generation, so the walk needs no latches
        let mut p: *const CursorFrame = match (*frame).parent.as_deref() {
            Some(p) => p,
            None => core::ptr::null(),
        };
        while !p.is_null() {
            let pf = &*p;
            match pf.node_snapshot() {
                Some(n) => {
                    if !cache.mark_dirty(&n) {
                        break;
                    }
                }
                None => break,
            }
            p = match pf.parent.as_deref() {
                Some(next) => next,
                None => core::ptr::null(),
            };
        }
        Ok(())
    }

    // ==== merging ====

    /// Try to merge the frame's node with a sibling, cascading upward while
    /// parents fall below the fill threshold. Caller holds the node's
    /// exclusive latch and the shared commit lock; all latches are released
    /// on return
    ///
    /// ## Safety
    /// See [`Self::finish_split`]
    pub(crate) unsafe fn merge_frame(&self, frame: *mut CursorFrame) -> EngineResult<()> {
        let cache = &self.db.cache;
        let mut fptr = frame;
        loop {
            let f = &mut *fptr;
            let node = match f.node.clone() {
                Some(n) => n,
                None => return Ok(()),
            };
            {
                let inner = node.read();
                if inner.split.is_some() || !inner.is_below_fill_threshold() {
                    node.latch.release_exclusive();
                    return Ok(());
                }
                if Arc::ptr_eq(&node, &self.root) {
                    if inner.is_internal() && inner.is_empty() {
                        let res = self.root_collapse(&node);
                        node.latch.release_exclusive();
                        return res;
                    }
                    node.latch.release_exclusive();
                    return Ok(());
                }
            }
            let pframe: *mut CursorFrame = match f.parent.as_deref_mut() {
                Some(p) => p,
                None => {
                    node.latch.release_exclusive();
                    return Ok(());
                }
            };
            node.latch.release_exclusive();
            let parent = match (*pframe).acquire_exclusive() {
                Some(p) => p,
                None => return Ok(()),
            };
            if parent.read().split.is_some() {
                self.finish_split(pframe)?;
            }
            let parent = match (*pframe).node.clone() {
                Some(p) => p,
                None => return Ok(()),
            };
            let target = match f.node_snapshot() {
                Some(n) => n,
                None => {
                    parent.latch.release_exclusive();
                    return Ok(());
                }
            };
            let slot = match parent.read().find_child_slot(target.id()) {
                Some(s) => s,
                None => {
                    // mid-split rebind; let whoever owns the split finish it
                    parent.latch.release_exclusive();
                    match f.acquire_exclusive() {
                        Some(_) => continue,
                        None => return Ok(()),
                    }
                }
            };
            let nkeys = parent.read().num_keys();
            // strict left-to-right latch order over the trio
            let left = if slot > 0 {
                let l = cache.load_node(parent.read().child_id(slot - 1))?;
                l.latch.acquire_exclusive();
                Some(l)
            } else {
                None
            };
            target.latch.acquire_exclusive();
            let right = if slot < nkeys {
                let r = cache.load_node(parent.read().child_id(slot + 1))?;
                r.latch.acquire_exclusive();
                Some(r)
            } else {
                None
            };
            // pending sibling splits must finish before any weighing
            let mut restart = false;
            for n in [left.as_ref(), Some(&target), right.as_ref()].into_iter().flatten() {
                if n.read().split.is_some() {
                    self.finish_child_split(&parent, n)?;
                    restart = true;
                    // the separator insert may have split the parent itself;
                    // stop before grafting anything else into it
                    if parent.read().split.is_some() {
                        break;
                    }
                }
            }
            if restart || !target.read().is_below_fill_threshold() {
                if let Some(r) = &right {
                    r.latch.release_exclusive();
                }
                target.latch.release_exclusive();
                if let Some(l) = &left {
                    l.latch.release_exclusive();
                }
                if restart && parent.read().split.is_none() {
                    parent.latch.release_exclusive();
                    match f.acquire_exclusive() {
                        Some(_) => continue,
                        None => return Ok(()),
                    }
                }
                if parent.read().split.is_some() {
                    self.finish_split(pframe)?;
                    let p = (*pframe).node.clone();
                    if let Some(p) = p {
                        p.latch.release_exclusive();
                    }
                    return Ok(());
                }
                parent.latch.release_exclusive();
                return Ok(());
            }
            // pick the adjacent pair with the lower combined weight
            let pick_left = match (&left, &right) {
                (Some(l), Some(r)) => l.read().merge_weight() <= r.read().merge_weight(),
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => {
                    // an only child below threshold; nothing lateral to do
                    target.latch.release_exclusive();
                    parent.latch.release_exclusive();
                    return Ok(());
                }
            };
            let (l_node, r_node, sep_idx) = if pick_left {
                if let Some(r) = &right {
                    r.latch.release_exclusive();
                }
                // UNSAFE(@ohsayan): pick_left implies left is Some
                let l = crate::util::Unwrappable::unsafe_unwrap(left);
                (l, target.clone(), slot - 1)
            } else {
                if let Some(l) = &left {
                    l.latch.release_exclusive();
                }
                // UNSAFE(@ohsayan): !pick_left implies right is Some
                let r = crate::util::Unwrappable::unsafe_unwrap(right);
                (target.clone(), r, slot)
            };
            let merged = self.try_merge_pair(&parent, &l_node, &r_node, sep_idx)?;
            r_node.latch.release_exclusive();
            l_node.latch.release_exclusive();
            let _ = merged;
            // cascade upward if the parent went below threshold
            let cascade = {
                let pi = parent.read();
                pi.split.is_none()
                    && (pi.is_below_fill_threshold() || (pi.is_internal() && pi.is_empty()))
            };
            if cascade {
                fptr = pframe;
                continue;
            }
            if parent.read().split.is_some() {
                self.finish_split(pframe)?;
                let p = (*pframe).node.clone();
                if let Some(p) = p {
                    p.latch.release_exclusive();
                }
                return Ok(());
            }
            parent.latch.release_exclusive();
            return Ok(());
        }
    }

    /// Merge `right` into `left` if both halves (plus the separator, for
    /// internal nodes) fit one page. Returns whether the merge happened.
    /// All three nodes exclusively latched
    fn try_merge_pair(
        &self,
        parent: &Arc<Node>,
        left: &Arc<Node>,
        right: &Arc<Node>,
        sep_idx: usize,
    ) -> EngineResult<bool> {
        let cache = &self.db.cache;
        let is_leaf = left.read().is_leaf();
        let sep_weight = if is_leaf {
            0
        } else {
            parent.read().entry_len(2 * sep_idx as i32) + 2
        };
        let fits = left.read().merge_weight() + right.read().merge_weight() + sep_weight
            <= left.read().capacity();
        if !fits {
            return Ok(false);
        }
        cache.mark_dirty(parent);
        cache.mark_dirty(left);
        let left_keys_before = left.read().num_keys();
        if is_leaf {
            left.write().absorb_right_leaf(right.read())?;
            // UNSAFE(@ohsayan): trio latched
            unsafe {
                frame::move_frames_for_merge(right, left, 2 * left_keys_before as i32);
            }
        } else {
            let sep = parent.read().separator_key_at(cache, 2 * sep_idx as i32)?;
            left.write().absorb_right_internal(right.read(), &sep)?;
            unsafe {
                frame::move_frames_for_merge(right, left, 2 * (left_keys_before as i32 + 1));
            }
        }
        parent.write().delete_internal_entry(cache, parent, sep_idx)?;
        cache.prepare_to_delete(right);
        cache.delete_node(right);
        log::trace!(
            "tree {}: merged page {} into {}",
            self.id,
            right.id(),
            left.id()
        );
        Ok(true)
    }

    // ==== verification ====

    /// Walk the whole tree verifying ordering, type consistency and extremity
    /// inheritance. Quiesces the tree via the exclusive commit lock. Returns
    /// `false` if the observer stopped the walk
    pub fn verify(&self, observer: &mut dyn VerifyObserver) -> EngineResult<bool> {
        let _quiesce = self.db.commit_lock.exclusive();
        let mut clean = true;
        let keep_going =
            self.verify_node(&self.root, 0, None, None, true, observer, &mut clean)?;
        let _ = keep_going;
        Ok(clean)
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_node(
        &self,
        node: &Arc<Node>,
        level: usize,
        low: Option<&Bytes>,
        high: Option<&Bytes>,
        is_root: bool,
        observer: &mut dyn VerifyObserver,
        clean: &mut bool,
    ) -> EngineResult<bool> {
        // the tree is quiesced; plain shared latches suffice
        node.latch.acquire_shared();
        let res = self.verify_node_latched(node, level, low, high, is_root, observer, clean);
        node.latch.release_shared();
        res
    }

    /// Returns `Ok(false)` when the observer asked to stop
    #[allow(clippy::too_many_arguments)]
    fn verify_node_latched(
        &self,
        node: &Arc<Node>,
        level: usize,
        low: Option<&Bytes>,
        high: Option<&Bytes>,
        is_root: bool,
        observer: &mut dyn VerifyObserver,
        clean: &mut bool,
    ) -> EngineResult<bool> {
        let cache = &self.db.cache;
        let inner = node.read();
        let id = node.id();
        macro_rules! fail {
            ($($msg:tt)*) => {{
                let msg = format!($($msg)*);
                log::warn!("verify: page {id} level {level}: {msg}");
                *clean = false;
                if !observer.fail(id, level, &msg) {
                    return Ok(false);
                }
            }};
        }
        if inner.split.is_some() {
            fail!("pending split under quiesced tree");
        }
        if is_root && (!inner.is_low_extremity() || !inner.is_high_extremity()) {
            fail!("root missing extremity bits");
        }
        if !inner.is_leaf() && !inner.is_internal() {
            fail!("bad type byte {:#x}", inner.type_byte());
            return Ok(true);
        }
        // keys strictly increasing and inside the parent-given bounds
        let mut prev: Option<Bytes> = None;
        for i in 0..inner.num_keys() {
            let key = inner.retrieve_key(cache, 2 * i as i32)?;
            if let Some(p) = &prev {
                if p >= &key {
                    fail!("key order violation at slot {i}");
                }
            }
            if let Some(lo) = low {
                if &key < lo {
                    fail!("key below lower bound at slot {i}");
                }
            }
            if let Some(hi) = high {
                if &key >= hi {
                    fail!("key at/above upper bound at slot {i}");
                }
            }
            prev = Some(key);
        }
        if !inner.is_internal() {
            return Ok(true);
        }
        // children
        let n = inner.num_keys();
        for i in 0..=n {
            let child_id = inner.child_id(i);
            if child_id == 0 {
                fail!("null child id at slot {i}");
                continue;
            }
            let child = cache.load_node(child_id)?;
            child.latch.acquire_shared();
            {
                let ci = child.read();
                let mut child_msgs: Vec<String> = Vec::new();
                if inner.is_bottom_internal() && !ci.is_leaf() {
                    child_msgs.push(format!("bottom-internal child {i} is not a leaf"));
                }
                if !inner.is_bottom_internal() && ci.is_leaf() {
                    child_msgs.push(format!("leaf child {i} under non-bottom internal"));
                }
                if ci.is_low_extremity() && !(inner.is_low_extremity() && i == 0) {
                    child_msgs.push(format!("stray low-extremity bit on child {i}"));
                }
                if ci.is_high_extremity() && !(inner.is_high_extremity() && i == n) {
                    child_msgs.push(format!("stray high-extremity bit on child {i}"));
                }
                for msg in child_msgs {
                    log::warn!("verify: page {id} level {level}: {msg}");
                    *clean = false;
                    if !observer.fail(id, level, &msg) {
                        child.latch.release_shared();
                        return Ok(false);
                    }
                }
            }
            let child_low = if i == 0 {
                low.cloned()
            } else {
                Some(inner.retrieve_key(cache, 2 * (i as i32 - 1))?)
            };
            let child_high = if i == n {
                high.cloned()
            } else {
                Some(inner.retrieve_key(cache, 2 * i as i32)?)
            };
            let keep_going = self.verify_node_latched(
                &child,
                level + 1,
                child_low.as_ref(),
                child_high.as_ref(),
                false,
                observer,
                clean,
            );
            child.latch.release_shared();
            if !keep_going? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl core::fmt::Debug for Tree {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("root", &self.root.id())
            .finish()
    }
}

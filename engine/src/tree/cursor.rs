/*
 * Created on Wed Mar 26 2025
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

//! # Cursors
//!
//! The cursor is the access layer's engine: it owns a stack of
//! [`CursorFrame`]s from the root to a leaf, descends with shared-latch
//! coupling, and drives every read, write, and maintenance operation. Between
//! public operations a cursor holds **no** latches; each operation re-secures
//! the leaf through its frame (concurrent writers keep frames consistent
//! through the bound-frame fix-up protocol, so re-latching is cheap and
//! re-validation is positional, not key-based).
//!
//! Any node found with a pending split is finished before the cursor
//! proceeds. Keys are locked through the lock manager according to the
//! transaction's [`LockMode`]; ghosts (entries deleted by uncommitted
//! transactions) read as absent but still get their lock attempt, so that
//! waiting readers line up behind the deleting transaction.

use crate::error::{EngineError, EngineResult};
use crate::tree::frame::{self, CursorFrame};
use crate::tree::node::{Node, NodeInner};
use crate::tree::split::SplitSide;
use crate::tree::value as valchain;
use crate::tree::Tree;
use crate::txn::{LockAttempt, LockMode, LockType, Txn, TxnId};
use bytes::Bytes;
use core::cell::Cell;
use rand::Rng;
use std::sync::Arc;

/// A cursor's view of the value at its position. `NotLoaded` means the value
/// was deliberately not fetched (key-only mode, or a lock that could not be
/// taken under the latch); `Absent` means there is no live entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Absent,
    NotLoaded,
    Present(Bytes),
}

impl Value {
    #[inline]
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }
    #[inline]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Present(b) => Some(b),
            _ => None,
        }
    }
}

/// Precondition for [`Cursor::find_and_modify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modify {
    /// Succeed only if no live entry exists
    Insert,
    /// Succeed only if a live entry exists
    Replace,
    /// Succeed only if the current value matches (`None` = absent)
    Expect(Option<Bytes>),
}

/// Descent policy: the four find variants share one descent parameterized by
/// this (no flag integers)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    /// Copy the value per the lock mode, release the latch
    Regular,
    /// No lock-manager interaction; the leaf stays latched shared for the
    /// caller to upgrade
    NoLock,
    /// Position only: no value copy, release the latch
    Check,
}

enum LoadOutcome {
    /// `self.value` is settled; latch released
    Done,
    /// Lock unavailable under the latch; `value == NotLoaded`, latch released
    NotLoaded,
}

pub struct Cursor {
    tree: Arc<Tree>,
    txn: Txn,
    /// Lock-owner identity for non-transactional operations
    locker_id: TxnId,
    leaf: Option<Box<CursorFrame>>,
    key: Option<Bytes>,
    value: Value,
    key_hash: Cell<Option<u64>>,
    key_only: bool,
}

impl Cursor {
    pub(crate) fn new(tree: Arc<Tree>, txn: Txn) -> Self {
        let locker_id = tree.db.next_locker_id();
        Self {
            tree,
            txn,
            locker_id,
            leaf: None,
            key: None,
            value: Value::Absent,
            key_hash: Cell::new(None),
            key_only: false,
        }
    }

    // ==== accessors ====

    /// The key the cursor is positioned at (set even when the entry is absent)
    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }
    pub fn value(&self) -> &Value {
        &self.value
    }
    pub fn is_positioned(&self) -> bool {
        self.leaf.is_some()
    }
    /// In key-only mode values are never fetched; reads report `NotLoaded`
    pub fn set_key_only(&mut self, key_only: bool) {
        self.key_only = key_only;
    }
    pub fn txn(&self) -> &Txn {
        &self.txn
    }

    fn locker(&self) -> TxnId {
        match &self.txn {
            Txn::Active(t) => t.id(),
            _ => self.locker_id,
        }
    }

    /// A timed acquisition that reported `Unavailable` (possible when the
    /// configured timeout is zero) is a timeout for write paths
    fn require_locked(&self, attempt: LockAttempt) -> EngineResult<LockAttempt> {
        if attempt == LockAttempt::Unavailable {
            return Err(EngineError::LockTimeout {
                tree_id: self.tree.id,
                timeout_nanos: self.tree.db.config.lock_timeout_nanos,
            });
        }
        Ok(attempt)
    }

    /// Lazily computed `(tree id, key)` hash for the lock manager
    fn hash_of(&self, key: &[u8]) -> u64 {
        match self.key_hash.get() {
            Some(h) => h,
            None => {
                let h = self.tree.db.locks.hash(self.tree.id, key);
                self.key_hash.set(Some(h));
                h
            }
        }
    }

    /// Unbind and drop the whole frame stack; forget the position
    pub fn reset(&mut self) {
        let mut cur = self.leaf.take();
        while let Some(mut f) = cur {
            // UNSAFE(@ohsayan): boxed frames are pinned until this unbind
            unsafe {
                frame::unbind(&mut *f);
            }
            cur = f.parent.take();
        }
        self.key = None;
        self.key_hash.set(None);
        self.value = Value::Absent;
    }

    #[inline]
    fn leaf_ptr(&mut self) -> *mut CursorFrame {
        match self.leaf.as_mut() {
            Some(f) => &mut **f,
            None => core::ptr::null_mut(),
        }
    }

    fn check_open(&self) -> EngineResult<()> {
        self.tree.db.check_open()
    }

    /// Recoverable failures reset the cursor; fatal failures close the
    /// database with the cause recorded. Lock timeouts and deadlocks do
    /// neither: the cursor keeps its position
    fn handle_error(&mut self, e: EngineError) -> EngineError {
        if e.is_fatal() {
            self.tree.db.close_on_failure(&e);
            self.reset();
        } else if matches!(e, EngineError::Corrupted(_) | EngineError::Unpositioned) {
            self.reset();
        }
        // lock timeouts and deadlocks leave the cursor positioned
        e
    }

    // ==== descent ====

    /// Couple from a shared-latched parent to the child at `child_id`:
    /// non-blocking map probe first, re-checking the id after the latch to
    /// catch eviction; falls back to loading under the parent latch
    fn latch_child_shared(&self, child_id: u64) -> EngineResult<Arc<Node>> {
        let cache = &self.tree.db.cache;
        if let Some(c) = cache.node_map_get(child_id) {
            c.latch.acquire_shared();
            if c.id() == child_id {
                return Ok(c);
            }
            c.latch.release_shared();
        }
        let c = cache.load_node(child_id)?;
        c.latch.acquire_shared();
        if c.id() != child_id {
            c.latch.release_shared();
            return Err(EngineError::corrupted_page(child_id, "page vanished mid-load"));
        }
        Ok(c)
    }

    /// Descend from `top` (bound + shared latched through `chain`) to the
    /// leaf that owns `key`, or to an edge when `key` is `None`. Consumes the
    /// ownership of the partial stack and installs the new leaf stack.
    /// On success the leaf is bound and latched shared
    fn descend(
        &mut self,
        mut chain: Box<CursorFrame>,
        mut node: Arc<Node>,
        key: Option<&[u8]>,
        forward: bool,
    ) -> EngineResult<()> {
        let cache = &self.tree.db.cache;
        loop {
            // a pending split is traversed, not finished: pick the half that
            // owns the target and rebind onto it (the sibling is reachable
            // only through the split record we hold the latch over)
            loop {
                let sibling = {
                    let inner = node.read();
                    match inner.split.as_deref() {
                        None => break,
                        Some(split) => {
                            let side = match key {
                                Some(k) => split.select_side(k),
                                None if forward => split.low_side(),
                                None => split.high_side(),
                            };
                            match side {
                                SplitSide::Original => break,
                                SplitSide::Sibling => split.sibling().clone(),
                            }
                        }
                    }
                };
                sibling.latch.acquire_shared();
                // UNSAFE(@ohsayan): `chain` is heap-pinned; both halves latched
                unsafe {
                    frame::unbind(&mut *chain);
                    frame::bind(&mut *chain, &sibling, 0);
                }
                node.latch.release_shared();
                node = sibling;
            }
            let step = {
                let inner = node.read();
                if inner.is_leaf() {
                    let pos = match key {
                        Some(k) => match inner.binary_search(cache, k) {
                            Ok(p) => p,
                            Err(e) => {
                                node.latch.release_shared();
                                self.leaf = Some(chain);
                                self.reset();
                                return Err(e);
                            }
                        },
                        None if forward => {
                            if inner.is_empty() {
                                !0
                            } else {
                                0
                            }
                        }
                        None => {
                            if inner.is_empty() {
                                !0
                            } else {
                                inner.highest_pos()
                            }
                        }
                    };
                    chain.node_pos = pos;
                    chain.not_found_key = if pos < 0 {
                        key.map(Bytes::copy_from_slice)
                    } else {
                        None
                    };
                    None
                } else {
                    let idx = match key {
                        Some(k) => match inner.binary_search(cache, k) {
                            Ok(s) => NodeInner::child_index_for(s),
                            Err(e) => {
                                node.latch.release_shared();
                                self.leaf = Some(chain);
                                self.reset();
                                return Err(e);
                            }
                        },
                        None if forward => 0,
                        None => inner.num_keys(),
                    };
                    chain.node_pos = 2 * idx as i32;
                    Some(inner.child_id(idx))
                }
            };
            let child_id = match step {
                None => {
                    self.leaf = Some(chain);
                    return Ok(());
                }
                Some(id) => id,
            };
            let child = match self.latch_child_shared(child_id) {
                Ok(c) => c,
                Err(e) => {
                    node.latch.release_shared();
                    self.leaf = Some(chain);
                    self.reset();
                    return Err(e);
                }
            };
            let mut child_frame = CursorFrame::new();
            // UNSAFE(@ohsayan): fresh boxed frame, pinned; child latched
            unsafe {
                frame::bind(&mut *child_frame, &child, 0);
            }
            child_frame.parent = Some(chain);
            node.latch.release_shared();
            chain = child_frame;
            node = child;
        }
    }

    /// Fresh full descent from the root. Leaf latched shared on success
    fn search_to_leaf(&mut self, key: Option<&[u8]>, forward: bool) -> EngineResult<()> {
        self.reset();
        let root = self.tree.root.clone();
        root.latch.acquire_shared();
        let mut root_frame = CursorFrame::new();
        // UNSAFE(@ohsayan): fresh boxed frame, root latched
        unsafe {
            frame::bind(&mut *root_frame, &root, 0);
        }
        self.descend(root_frame, root, key, forward)
    }

    /// Re-secure the leaf shared through its frame, finishing any split.
    /// Returns the latched node
    fn relatch_leaf_shared(&mut self) -> EngineResult<Arc<Node>> {
        let fptr = self.leaf_ptr();
        if fptr.is_null() {
            return Err(EngineError::Unpositioned);
        }
        // UNSAFE(@ohsayan): frame owned by us, pinned in the box
        unsafe {
            let node = (*fptr)
                .acquire_shared()
                .ok_or(EngineError::Unpositioned)?;
            if node.read().split.is_some() {
                return self.tree.finish_split_shared(fptr);
            }
            Ok(node)
        }
    }

    /// Re-secure the leaf exclusively, finishing any split
    fn relatch_leaf_exclusive(&mut self) -> EngineResult<Arc<Node>> {
        let fptr = self.leaf_ptr();
        if fptr.is_null() {
            return Err(EngineError::Unpositioned);
        }
        // UNSAFE(@ohsayan): see above
        unsafe {
            let node = (*fptr)
                .acquire_exclusive()
                .ok_or(EngineError::Unpositioned)?;
            if node.read().split.is_some() {
                // never block on the commit lock while latched
                let commit = match self.tree.db.commit_lock.try_shared() {
                    Some(g) => g,
                    None => {
                        node.latch.release_exclusive();
                        let g = self.tree.db.commit_lock.shared();
                        (*fptr)
                            .acquire_exclusive()
                            .ok_or(EngineError::Unpositioned)?;
                        g
                    }
                };
                self.tree.finish_split(fptr)?;
                drop(commit);
                return (*fptr).node.clone().ok_or(EngineError::Unpositioned);
            }
            Ok(node)
        }
    }

    // ==== read path ====

    fn effective_read_mode(&self) -> LockMode {
        match &self.txn {
            Txn::Bogus => LockMode::Unsafe,
            Txn::None => LockMode::ReadCommitted,
            Txn::Active(t) => t.mode(),
        }
    }

    /// Copy key bytes for the current (found) position under the latch
    fn copy_key_at(&self, node: &NodeInner, pos: i32) -> EngineResult<Bytes> {
        node.retrieve_key(&self.tree.db.cache, pos)
    }

    /// The under-latch read attempt: runs with the leaf latched shared and a
    /// found position. Settles `self.value`, or reports `NotLoaded` when the
    /// key lock could not be had without waiting. The latch is released in
    /// every outcome
    fn try_copy_current(&mut self, node: &Arc<Node>, pos: i32) -> EngineResult<LoadOutcome> {
        let mode = self.effective_read_mode();
        let cache = &self.tree.db.cache;
        if mode.no_read_lock() {
            let inner = node.read();
            self.value = if inner.is_ghost(pos) {
                Value::Absent
            } else if self.key_only {
                Value::NotLoaded
            } else {
                match inner.retrieve_leaf_value(cache, pos)? {
                    Some(v) => Value::Present(v),
                    None => Value::Absent,
                }
            };
            node.latch.release_shared();
            return Ok(LoadOutcome::Done);
        }
        // UNSAFE(@ohsayan): key was set when the frame was positioned
        let key = unsafe { crate::util::Unwrappable::unsafe_unwrap(self.key.clone()) };
        let hash = self.hash_of(&key);
        let locks = &self.tree.db.locks;
        let locker = self.locker();
        if !mode.repeatable() {
            // read committed: if the lock is immediately available, treat the
            // entry as unowned and copy under the latch without acquiring
            if locks.is_lock_available(locker, self.tree.id, &key, hash) {
                let inner = node.read();
                self.value = if inner.is_ghost(pos) {
                    Value::Absent
                } else if self.key_only {
                    Value::NotLoaded
                } else {
                    match inner.retrieve_leaf_value(cache, pos)? {
                        Some(v) => Value::Present(v),
                        None => Value::Absent,
                    }
                };
                node.latch.release_shared();
                return Ok(LoadOutcome::Done);
            }
            self.value = Value::NotLoaded;
            node.latch.release_shared();
            return Ok(LoadOutcome::NotLoaded);
        }
        // repeatable or stronger: zero-timeout attempt while latched
        match locks.try_lock(locker, mode.read_lock_type(), self.tree.id, &key, hash, 0)? {
            attempt @ (LockAttempt::Acquired | LockAttempt::OwnedAlready) => {
                if let Txn::Active(t) = &self.txn {
                    if attempt == LockAttempt::Acquired {
                        t.note_lock(self.tree.id, key.clone(), hash);
                    }
                }
                let inner = node.read();
                self.value = if inner.is_ghost(pos) {
                    Value::Absent
                } else if self.key_only {
                    Value::NotLoaded
                } else {
                    match inner.retrieve_leaf_value(cache, pos)? {
                        Some(v) => Value::Present(v),
                        None => Value::Absent,
                    }
                };
                node.latch.release_shared();
                Ok(LoadOutcome::Done)
            }
            LockAttempt::Unavailable => {
                self.value = Value::NotLoaded;
                node.latch.release_shared();
                Ok(LoadOutcome::NotLoaded)
            }
        }
    }

    /// The slow read path: acquire the lock without the latch, then re-latch
    /// and copy only if the entry still exists. A lock freshly acquired for
    /// an entry that vanished is released, since iteration must not leak locks
    fn lock_and_copy_if_exists(&mut self) -> EngineResult<()> {
        // UNSAFE(@ohsayan): positioned (caller guarantees)
        let key = unsafe { crate::util::Unwrappable::unsafe_unwrap(self.key.clone()) };
        let hash = self.hash_of(&key);
        let mode = self.effective_read_mode();
        let db = self.tree.db.clone();
        let locks = &db.locks;
        let locker = self.locker();
        let timeout = db.config.lock_timeout_nanos;
        let ty = if matches!(self.txn, Txn::Active(_)) && mode.repeatable() {
            mode.read_lock_type()
        } else {
            LockType::Shared
        };
        let attempt =
            self.require_locked(locks.try_lock(locker, ty, self.tree.id, &key, hash, timeout)?)?;
        let fresh = attempt == LockAttempt::Acquired;
        let node = self.relatch_leaf_shared()?;
        let pos = {
            // UNSAFE(@ohsayan): leaf latched; our frame is stable
            unsafe { (*self.leaf_ptr()).node_pos }
        };
        let cache = &db.cache;
        let mut exists = false;
        if pos >= 0 {
            let inner = node.read();
            if !inner.is_ghost(pos) {
                self.value = if self.key_only {
                    Value::NotLoaded
                } else {
                    match inner.retrieve_leaf_value(cache, pos)? {
                        Some(v) => Value::Present(v),
                        None => Value::Absent,
                    }
                };
                exists = !self.value.is_absent();
            } else {
                self.value = Value::Absent;
            }
        } else {
            self.value = Value::Absent;
        }
        node.latch.release_shared();
        let retain = matches!(self.txn, Txn::Active(_)) && mode.repeatable();
        if !retain {
            locks.unlock(locker, self.tree.id, &key, hash);
        } else if fresh && !exists {
            // the entry vanished under us; do not leak the probe lock
            locks.unlock(locker, self.tree.id, &key, hash);
        } else if let Txn::Active(t) = &self.txn {
            t.note_lock(self.tree.id, key.clone(), hash);
        }
        Ok(())
    }

    /// Settle the value for a positioned cursor. Leaf latched shared on
    /// entry; released on exit
    fn load_current(&mut self, node: Arc<Node>, variant: Variant) -> EngineResult<()> {
        let pos = unsafe { (*self.leaf_ptr()).node_pos };
        if pos < 0 {
            self.value = Value::Absent;
            if variant != Variant::NoLock {
                node.latch.release_shared();
            }
            return Ok(());
        }
        match variant {
            Variant::NoLock => {
                // leave latched; the lock manager is never consulted
                let inner = node.read();
                self.value = if inner.is_ghost(pos) {
                    Value::Absent
                } else {
                    Value::NotLoaded
                };
                Ok(())
            }
            Variant::Check => {
                self.value = Value::NotLoaded;
                node.latch.release_shared();
                Ok(())
            }
            Variant::Regular => match self.try_copy_current(&node, pos)? {
                LoadOutcome::Done => Ok(()),
                LoadOutcome::NotLoaded => self.lock_and_copy_if_exists(),
            },
        }
    }

    // ==== point lookups ====

    /// Standard search. Returns whether a live (non-ghost) entry was found
    pub fn find(&mut self, key: &[u8]) -> EngineResult<bool> {
        self.find_variant(key, Variant::Regular)
    }

    fn find_variant(&mut self, key: &[u8], variant: Variant) -> EngineResult<bool> {
        self.check_open()?;
        if key.is_empty() {
            return Err(EngineError::NullKey);
        }
        match self.find_inner(key, variant) {
            Ok(found) => Ok(found),
            Err(e) => Err(self.handle_error(e)),
        }
    }

    fn find_inner(&mut self, key: &[u8], variant: Variant) -> EngineResult<bool> {
        self.search_to_leaf(Some(key), true)?;
        self.key = Some(Bytes::copy_from_slice(key));
        self.key_hash.set(None);
        let node = {
            // the leaf is already latched from the descent
            // UNSAFE(@ohsayan): bound by descend()
            unsafe {
                crate::util::Unwrappable::unsafe_unwrap(
                    (*self.leaf_ptr()).node.clone(),
                )
            }
        };
        self.load_current(node, variant)?;
        Ok(self.value != Value::Absent)
    }

    /// `find`, then advance to the successor when the key is missing
    pub fn find_ge(&mut self, key: &[u8]) -> EngineResult<bool> {
        let found = self.find(key)?;
        if found {
            return Ok(true);
        }
        self.next()
    }

    /// Position strictly after `key`. The probe key itself is never locked
    pub fn find_gt(&mut self, key: &[u8]) -> EngineResult<bool> {
        self.find_variant(key, Variant::Check)?;
        self.next()
    }

    /// `find`, then retreat to the predecessor when the key is missing
    pub fn find_le(&mut self, key: &[u8]) -> EngineResult<bool> {
        let found = self.find(key)?;
        if found {
            return Ok(true);
        }
        self.previous()
    }

    /// Position strictly before `key`. The probe key itself is never locked
    pub fn find_lt(&mut self, key: &[u8]) -> EngineResult<bool> {
        self.find_variant(key, Variant::Check)?;
        self.previous()
    }

    /// Optimized search that starts from the current frame stack, popping
    /// levels only as far as needed
    pub fn find_nearby(&mut self, key: &[u8]) -> EngineResult<bool> {
        self.check_open()?;
        if key.is_empty() {
            return Err(EngineError::NullKey);
        }
        if self.leaf.is_none() {
            return self.find(key);
        }
        match self.find_nearby_inner(key) {
            Ok(found) => Ok(found),
            Err(e) => Err(self.handle_error(e)),
        }
    }

    fn find_nearby_inner(&mut self, key: &[u8]) -> EngineResult<bool> {
        let db = self.tree.db.clone();
        let cache = &db.cache;
        let node = self.relatch_leaf_shared()?;
        {
            let inner = node.read();
            let pos = inner.binary_search(cache, key)?;
            let interior = if pos >= 0 {
                true
            } else {
                let ip = !pos;
                // a hit strictly inside this leaf's range, or anywhere when
                // the leaf is an extremity on the open side
                (ip > 0 || inner.is_low_extremity())
                    && (ip <= inner.highest_pos() || inner.is_high_extremity())
            };
            if interior {
                let fptr = self.leaf_ptr();
                // UNSAFE(@ohsayan): leaf latched shared; fix-ups are excluded
                unsafe {
                    (*fptr).node_pos = pos;
                    (*fptr).not_found_key =
                        (pos < 0).then(|| Bytes::copy_from_slice(key));
                }
                drop(inner);
                self.key = Some(Bytes::copy_from_slice(key));
                self.key_hash.set(None);
                self.load_current(node, Variant::Regular)?;
                return Ok(self.value != Value::Absent);
            }
        }
        node.latch.release_shared();
        // pop up the stack to the first ancestor that certainly covers the key
        loop {
            // an unbound parent frame (left by a root collapse) counts as
            // "no parent": restart with a fresh descent
            let parent_bound = self
                .leaf
                .as_ref()
                .and_then(|f| f.parent.as_ref())
                .map(|p| p.node_snapshot().is_some())
                .unwrap_or(false);
            if !parent_bound {
                // popped everything: the root covers all keys
                return self.find(key);
            }
            // pop one level: the parent frame becomes the working frame
            // UNSAFE(@ohsayan): owner pops its own stack
            let mut leaf_box = unsafe { crate::util::Unwrappable::unsafe_unwrap(self.leaf.take()) };
            unsafe {
                frame::unbind(&mut *leaf_box);
            }
            let parent_box = unsafe { crate::util::Unwrappable::unsafe_unwrap(leaf_box.parent.take()) };
            self.leaf = Some(parent_box);
            let node = self.relatch_leaf_shared()?;
            let covers = {
                let inner = node.read();
                let search = inner.binary_search(cache, key)?;
                let idx = NodeInner::child_index_for(search);
                let n = inner.num_keys();
                (idx > 0 || inner.is_low_extremity()) && (idx < n || inner.is_high_extremity())
            };
            if covers {
                // UNSAFE(@ohsayan): we own the stack; chain is pinned
                let chain = unsafe { crate::util::Unwrappable::unsafe_unwrap(self.leaf.take()) };
                self.descend(chain, node, Some(key), true)?;
                self.key = Some(Bytes::copy_from_slice(key));
                self.key_hash.set(None);
                let node = unsafe {
                    crate::util::Unwrappable::unsafe_unwrap((*self.leaf_ptr()).node.clone())
                };
                self.load_current(node, Variant::Regular)?;
                return Ok(self.value != Value::Absent);
            }
            node.latch.release_shared();
        }
    }

    // ==== edge positioning & iteration ====

    /// Move to the first live entry
    pub fn first(&mut self) -> EngineResult<bool> {
        self.check_open()?;
        match self.edge_inner(true) {
            Ok(v) => Ok(v),
            Err(e) => Err(self.handle_error(e)),
        }
    }

    /// Move to the last live entry
    pub fn last(&mut self) -> EngineResult<bool> {
        self.check_open()?;
        match self.edge_inner(false) {
            Ok(v) => Ok(v),
            Err(e) => Err(self.handle_error(e)),
        }
    }

    fn edge_inner(&mut self, forward: bool) -> EngineResult<bool> {
        self.search_to_leaf(None, forward)?;
        // UNSAFE(@ohsayan): bound by descend()
        let node =
            unsafe { crate::util::Unwrappable::unsafe_unwrap((*self.leaf_ptr()).node.clone()) };
        let pos = unsafe { (*self.leaf_ptr()).node_pos };
        if pos >= 0 {
            self.key = Some(self.copy_key_at(node.read(), pos)?);
            self.key_hash.set(None);
            self.load_current(node, Variant::Regular)?;
            if self.value != Value::Absent {
                return Ok(true);
            }
            // ghost at the edge: step over it
        } else {
            node.latch.release_shared();
        }
        self.step(forward)
    }

    /// Advance to the next live entry
    pub fn next(&mut self) -> EngineResult<bool> {
        self.check_open()?;
        match self.step(true) {
            Ok(v) => Ok(v),
            Err(e) => Err(self.handle_error(e)),
        }
    }

    /// Advance, but reset and stop once past `limit` (inclusive bound)
    pub fn next_le(&mut self, limit: &[u8]) -> EngineResult<bool> {
        self.bounded_step(true, limit, true)
    }

    /// Advance, but reset and stop at or past `limit` (exclusive bound)
    pub fn next_lt(&mut self, limit: &[u8]) -> EngineResult<bool> {
        self.bounded_step(true, limit, false)
    }

    /// Retreat to the previous live entry
    pub fn previous(&mut self) -> EngineResult<bool> {
        self.check_open()?;
        match self.step(false) {
            Ok(v) => Ok(v),
            Err(e) => Err(self.handle_error(e)),
        }
    }

    /// Retreat, stopping before `limit` (inclusive bound)
    pub fn previous_ge(&mut self, limit: &[u8]) -> EngineResult<bool> {
        self.bounded_step(false, limit, true)
    }

    /// Retreat, stopping at or before `limit` (exclusive bound)
    pub fn previous_gt(&mut self, limit: &[u8]) -> EngineResult<bool> {
        self.bounded_step(false, limit, false)
    }

    fn bounded_step(&mut self, forward: bool, limit: &[u8], inclusive: bool) -> EngineResult<bool> {
        self.check_open()?;
        let moved = match self.step(forward) {
            Ok(v) => v,
            Err(e) => return Err(self.handle_error(e)),
        };
        if !moved {
            return Ok(false);
        }
        // UNSAFE(@ohsayan): step() positioned us
        let key = unsafe { crate::util::Unwrappable::unsafe_unwrap(self.key.as_deref()) };
        let out_of_bounds = if forward {
            if inclusive {
                key > limit
            } else {
                key >= limit
            }
        } else if inclusive {
            key < limit
        } else {
            key <= limit
        };
        if out_of_bounds {
            self.reset();
            return Ok(false);
        }
        Ok(true)
    }

    /// One logical step over live entries, handling ghosts, complements and
    /// node boundaries
    fn step(&mut self, forward: bool) -> EngineResult<bool> {
        if self.leaf.is_none() {
            return Err(EngineError::Unpositioned);
        }
        let mut node = self.relatch_leaf_shared()?;
        loop {
            let highest = node.read().highest_pos();
            let cur = unsafe { (*self.leaf_ptr()).node_pos };
            let cand = if cur >= 0 {
                if forward {
                    cur + 2
                } else {
                    cur - 2
                }
            } else {
                let ip = !cur;
                if forward {
                    ip
                } else {
                    ip - 2
                }
            };
            if cand >= 0 && cand <= highest {
                let fptr = self.leaf_ptr();
                // UNSAFE(@ohsayan): leaf latched shared
                unsafe {
                    (*fptr).node_pos = cand;
                    (*fptr).not_found_key = None;
                }
                self.key = Some(self.copy_key_at(node.read(), cand)?);
                self.key_hash.set(None);
                self.load_current(node, Variant::Regular)?;
                if self.value != Value::Absent {
                    return Ok(true);
                }
                // ghost (or vanished): keep walking
                node = self.relatch_leaf_shared()?;
            } else {
                // cross to the lateral leaf
                match self.move_lateral(forward)? {
                    Some(next) => node = next,
                    None => return Ok(false),
                }
            }
        }
    }

    /// Walk up until an ancestor has a lateral child, then descend its
    /// near-edge spine. Enter with the current leaf latched shared; on
    /// success the new leaf is bound, latched shared, with an edge
    /// complement position. `None` means the tree ran out (cursor reset)
    fn move_lateral(&mut self, forward: bool) -> EngineResult<Option<Arc<Node>>> {
        loop {
            // find the pivot level
            let mut fptr = self.leaf_ptr();
            let pivot;
            loop {
                // UNSAFE(@ohsayan): stack owned by us; current frame's node latched
                let f = unsafe { &mut *fptr };
                let node = match f.node.clone() {
                    Some(n) => n,
                    None => return Err(EngineError::Unpositioned),
                };
                let pframe: *mut CursorFrame = match f.parent.as_deref_mut() {
                    Some(p) => p,
                    None => {
                        node.latch.release_shared();
                        self.reset();
                        return Ok(None);
                    }
                };
                // ascend retry: try the parent first; on failure release the
                // child and block on the parent. An unbound parent frame
                // means a root collapse outran this stack: the walk is over
                let mut child_latched = true;
                let parent = unsafe {
                    loop {
                        let p = match (*pframe).node_snapshot() {
                            Some(p) => p,
                            None => {
                                if child_latched {
                                    node.latch.release_shared();
                                }
                                self.reset();
                                return Ok(None);
                            }
                        };
                        if p.latch.try_acquire_shared() {
                            let still = (*pframe)
                                .node
                                .as_ref()
                                .map(|n| Arc::ptr_eq(n, &p))
                                .unwrap_or(false);
                            if still {
                                if child_latched {
                                    node.latch.release_shared();
                                }
                                break p;
                            }
                            p.latch.release_shared();
                            continue;
                        }
                        if child_latched {
                            node.latch.release_shared();
                            child_latched = false;
                        }
                        if let Some(p) = (*pframe).acquire_shared() {
                            break p;
                        }
                        self.reset();
                        return Ok(None);
                    }
                };
                let parent = if parent.read().split.is_some() {
                    // UNSAFE(@ohsayan): pframe pinned
                    unsafe { self.tree.finish_split_shared(pframe)? }
                } else {
                    parent
                };
                let (idx, nkeys) = {
                    let pin = parent.read();
                    (unsafe { ((*pframe).node_pos >> 1) as usize }, pin.num_keys())
                };
                let lateral_ok = if forward { idx < nkeys } else { idx > 0 };
                if lateral_ok {
                    pivot = (pframe, parent, if forward { idx + 1 } else { idx - 1 });
                    break;
                }
                // exhausted at this level; keep climbing with the parent latched
                fptr = pframe;
            }
            let (pframe, parent, next_idx) = pivot;
            // drop the stale subtree frames below the pivot
            let pivot_box = self.pop_to(pframe);
            unsafe {
                (*pframe).node_pos = 2 * next_idx as i32;
                (*pframe).not_found_key = None;
            }
            let child_id = parent.read().child_id(next_idx);
            let child = match self.latch_child_shared(child_id) {
                Ok(c) => c,
                Err(e) => {
                    parent.latch.release_shared();
                    self.leaf = Some(pivot_box);
                    return Err(e);
                }
            };
            let mut child_frame = CursorFrame::new();
            // UNSAFE(@ohsayan): fresh boxed frame; child latched
            unsafe {
                frame::bind(&mut *child_frame, &child, 0);
            }
            child_frame.parent = Some(pivot_box);
            parent.latch.release_shared();
            // descend the near edge of the lateral subtree
            self.descend(child_frame, child, None, forward)?;
            // UNSAFE(@ohsayan): descend bound the leaf
            let leaf = unsafe {
                crate::util::Unwrappable::unsafe_unwrap((*self.leaf_ptr()).node.clone())
            };
            // place a complement at the near edge so the caller's stepping
            // logic picks the first/last entry (or keeps crossing when empty)
            let fptr = self.leaf_ptr();
            unsafe {
                let highest = leaf.read().highest_pos();
                (*fptr).node_pos = if forward { !0 } else { !(highest + 2) };
                (*fptr).not_found_key = None;
            }
            if leaf.read().is_empty() {
                // empty leaf: keep crossing
                continue;
            }
            return Ok(Some(leaf));
        }
    }

    /// Detach the stack below `pframe`, unbinding and dropping those frames;
    /// returns the box that owns `pframe`
    fn pop_to(&mut self, pframe: *mut CursorFrame) -> Box<CursorFrame> {
        // UNSAFE(@ohsayan): pframe is within our own chain
        let mut cur = unsafe { crate::util::Unwrappable::unsafe_unwrap(self.leaf.take()) };
        loop {
            if core::ptr::eq(&*cur, pframe as *const CursorFrame) {
                return cur;
            }
            unsafe {
                frame::unbind(&mut *cur);
            }
            let parent = unsafe { crate::util::Unwrappable::unsafe_unwrap(cur.parent.take()) };
            drop(cur);
            cur = parent;
        }
    }

    // ==== load & store ====

    /// Re-read the value at the current position under the configured
    /// isolation
    pub fn load(&mut self) -> EngineResult<bool> {
        self.check_open()?;
        if self.leaf.is_none() {
            return Err(EngineError::Unpositioned);
        }
        let res = (|| {
            let node = self.relatch_leaf_shared()?;
            self.load_current(node, Variant::Regular)?;
            Ok(self.value != Value::Absent)
        })();
        res.map_err(|e| self.handle_error(e))
    }

    /// Store through the current position: insert, update or delete
    /// (`None`). The write protocol, in order: key lock, commit lock, dirty
    /// path, redo append, page mutation, frame fix-ups, split finish or
    /// merge, durability sync outside everything
    pub fn store(&mut self, value: Option<&[u8]>) -> EngineResult<()> {
        self.check_open()?;
        let key = match &self.key {
            Some(k) => k.clone(),
            None => return Err(EngineError::Unpositioned),
        };
        if self.leaf.is_none() {
            return Err(EngineError::Unpositioned);
        }
        let hash = self.hash_of(&key);
        let db = self.tree.db.clone();
        let locks = &db.locks;
        match self.txn.clone() {
            Txn::Bogus => {
                let res = self.store_relatch(&key, value);
                res.map_err(|e| self.handle_error(e))
            }
            Txn::None => {
                let locker = self.locker_id;
                let timeout = db.config.lock_timeout_nanos;
                let attempt =
                    locks.try_lock(locker, LockType::Exclusive, self.tree.id, &key, hash, timeout)?;
                self.require_locked(attempt)?;
                let res = self.store_relatch(&key, value);
                locks.unlock(locker, self.tree.id, &key, hash);
                let pos = db.redo.position();
                match res {
                    Ok(()) => {
                        // auto-commit: make it as durable as configured
                        db.redo.txn_commit_sync(pos, -1)?;
                        Ok(())
                    }
                    Err(e) => Err(self.handle_error(e)),
                }
            }
            Txn::Active(t) => {
                let timeout = db.config.lock_timeout_nanos;
                let attempt =
                    locks.try_lock(t.id(), LockType::Exclusive, self.tree.id, &key, hash, timeout)?;
                self.require_locked(attempt)?;
                t.note_lock(self.tree.id, key.clone(), hash);
                let res = self.store_relatch(&key, value);
                res.map_err(|e| self.handle_error(e))
            }
        }
    }

    /// Latch the leaf exclusively and run the locked store
    fn store_relatch(&mut self, key: &Bytes, value: Option<&[u8]>) -> EngineResult<()> {
        let node = self.relatch_leaf_exclusive()?;
        self.store_under_latch(node, key, value)
    }

    /// The write core. Enter with the leaf exclusively latched and the key
    /// lock held (per transaction rules); every latch is released by return
    fn store_under_latch(
        &mut self,
        node: Arc<Node>,
        key: &Bytes,
        value: Option<&[u8]>,
    ) -> EngineResult<()> {
        let db = self.tree.db.clone();
        let cache = &db.cache;
        // commit lock: try while latched, else release, block, re-latch.
        // Any split found on re-latch is finished by not_split_dirty below,
        // under the guard we now hold
        let commit = match db.commit_lock.try_shared() {
            Some(g) => g,
            None => {
                node.latch.release_exclusive();
                let g = db.commit_lock.shared();
                let fptr = self.leaf_ptr();
                // UNSAFE(@ohsayan): pinned leaf frame
                unsafe {
                    (*fptr)
                        .acquire_exclusive()
                        .ok_or(EngineError::Unpositioned)?;
                }
                g
            }
        };
        let fptr = self.leaf_ptr();
        // finish splits + dirty the whole path
        // UNSAFE(@ohsayan): fptr is our pinned leaf frame
        unsafe {
            self.tree.not_split_dirty(fptr)?;
        }
        let node = unsafe {
            crate::util::Unwrappable::unsafe_unwrap((*fptr).node.clone())
        };
        // the world may have moved while unlatched; the frame's position was
        // kept correct by the fix-up protocol
        let pos = unsafe { (*fptr).node_pos };
        let txn_id = match &self.txn {
            Txn::Active(t) => t.id(),
            _ => 0,
        };
        let is_txn = matches!(self.txn, Txn::Active(_));
        let redo = !self.txn.is_bogus();
        match (value, pos >= 0) {
            (None, false) => {
                // delete of a missing entry: no-op
                node.latch.release_exclusive();
                drop(commit);
                self.value = Value::Absent;
                Ok(())
            }
            (None, true) => {
                let commit_pos = if redo {
                    db.redo.redo_store(self.tree.id, txn_id, key, None)?
                } else {
                    0
                };
                let inner = node.write();
                if is_txn {
                    // transactional delete leaves a ghost; the key lock pins it
                    let old = inner.retrieve_leaf_value(cache, pos)?;
                    if let (Txn::Active(t), Some(old)) = (&self.txn, old) {
                        t.push_undelete(self.tree.clone(), key.clone(), old);
                    }
                    inner.ghost_leaf_value(cache, pos)?;
                } else {
                    inner.delete_leaf_entry(cache, &node, pos, key)?;
                }
                self.value = Value::Absent;
                self.finish_store(node, commit, commit_pos)
            }
            (Some(v), true) => {
                let commit_pos = if redo {
                    db.redo.redo_store(self.tree.id, txn_id, key, Some(v))?
                } else {
                    0
                };
                let inner = node.write();
                if is_txn && !inner.is_ghost(pos) {
                    let old = inner.retrieve_leaf_value(cache, pos)?;
                    if let (Txn::Active(t), Some(old)) = (&self.txn, old) {
                        t.push_unupdate(self.tree.clone(), key.clone(), old);
                    }
                } else if is_txn {
                    // overwriting a ghost this txn created: rollback should
                    // remove the reborn entry
                    if let Txn::Active(t) = &self.txn {
                        t.push_uninsert(self.tree.clone(), key.clone());
                    }
                }
                inner.update_leaf_value(cache, &node, pos, Some(v))?;
                self.value = Value::Present(Bytes::copy_from_slice(v));
                self.finish_store(node, commit, commit_pos)
            }
            (Some(v), false) => {
                let commit_pos = if redo {
                    db.redo.redo_store(self.tree.id, txn_id, key, Some(v))?
                } else {
                    0
                };
                if let Txn::Active(t) = &self.txn {
                    t.push_uninsert(self.tree.clone(), key.clone());
                }
                let ip = !pos;
                node.write().insert_leaf_entry(cache, &node, ip, key, Some(v))?;
                self.value = Value::Present(Bytes::copy_from_slice(v));
                self.finish_store(node, commit, commit_pos)
            }
        }
    }

    /// Post-mutation: finish a split or volunteer a merge, release the
    /// commit lock, then hand the commit position to the transaction
    fn finish_store(
        &mut self,
        node: Arc<Node>,
        commit: crate::sync::CommitShared<'_>,
        commit_pos: u64,
    ) -> EngineResult<()> {
        let fptr = self.leaf_ptr();
        // UNSAFE(@ohsayan): pinned leaf frame
        unsafe {
            // the mutation may have rebound our frame onto the split sibling
            let node = match (*fptr).node.clone() {
                Some(n) => n,
                None => node,
            };
            if node.read().split.is_some() {
                self.tree.finish_split(fptr)?;
                let n = (*fptr).node.clone();
                if let Some(n) = n {
                    n.latch.release_exclusive();
                }
            } else if node.read().is_below_fill_threshold() {
                // merge_frame consumes the latch
                self.tree.merge_frame(fptr)?;
            } else {
                node.latch.release_exclusive();
            }
        }
        drop(commit);
        if let Txn::Active(t) = &self.txn {
            t.observe_commit_pos(commit_pos);
        }
        Ok(())
    }

    // ==== compound operations ====

    /// Atomically store and return the prior value. The exclusive key lock is
    /// taken *before* descending
    pub fn find_and_store(&mut self, key: &[u8], value: Option<&[u8]>) -> EngineResult<Value> {
        self.check_open()?;
        if key.is_empty() {
            return Err(EngineError::NullKey);
        }
        let key_b = Bytes::copy_from_slice(key);
        self.key_hash.set(None);
        let hash = {
            // hash before positioning: we lock before the descent
            let h = self.tree.db.locks.hash(self.tree.id, key);
            self.key_hash.set(Some(h));
            h
        };
        if self.txn.is_bogus() {
            let res = self.exchange_locked(&key_b, value);
            return res.map_err(|e| self.handle_error(e));
        }
        let (locker, retain) = match &self.txn {
            Txn::Active(t) => (t.id(), true),
            _ => (self.locker_id, false),
        };
        let timeout = self.tree.db.config.lock_timeout_nanos;
        let attempt = self.tree.db.locks.try_lock(
            locker,
            LockType::Exclusive,
            self.tree.id,
            &key_b,
            hash,
            timeout,
        )?;
        self.require_locked(attempt)?;
        if retain {
            if let Txn::Active(t) = &self.txn {
                t.note_lock(self.tree.id, key_b.clone(), hash);
            }
        }
        let res = self.exchange_locked(&key_b, value);
        if !retain {
            self.tree
                .db
                .locks
                .unlock(locker, self.tree.id, &key_b, hash);
            if res.is_ok() {
                // auto-commit: make it as durable as configured
                let pos = self.tree.db.redo.position();
                self.tree.db.redo.txn_commit_sync(pos, -1)?;
            }
        }
        res.map_err(|e| self.handle_error(e))
    }

    fn exchange_locked(&mut self, key: &Bytes, value: Option<&[u8]>) -> EngineResult<Value> {
        // descend without lock checks, then upgrade the leaf latch
        self.find_inner(key, Variant::NoLock)?;
        let node = self.upgrade_leaf()?;
        let pos = unsafe { (*self.leaf_ptr()).node_pos };
        let cache = &self.tree.db.cache;
        let old = if pos >= 0 && !node.read().is_ghost(pos) {
            match node.read().retrieve_leaf_value(cache, pos)? {
                Some(v) => Value::Present(v),
                None => Value::Absent,
            }
        } else {
            Value::Absent
        };
        self.store_under_latch(node, key, value)?;
        Ok(old)
    }

    /// Guarded store: apply `value` only if the precondition holds at the
    /// moment the exclusive key lock is owned. On failure a freshly acquired
    /// lock is released and the cursor resets
    pub fn find_and_modify(
        &mut self,
        key: &[u8],
        modify: Modify,
        value: Option<&[u8]>,
    ) -> EngineResult<bool> {
        self.check_open()?;
        if key.is_empty() {
            return Err(EngineError::NullKey);
        }
        let key_b = Bytes::copy_from_slice(key);
        let hash = self.tree.db.locks.hash(self.tree.id, key);
        self.key_hash.set(Some(hash));
        let (locker, is_txn) = match &self.txn {
            Txn::Active(t) => (t.id(), true),
            _ => (self.locker_id, false),
        };
        let timeout = self.tree.db.config.lock_timeout_nanos;
        let attempt = self.require_locked(self.tree.db.locks.try_lock(
            locker,
            LockType::Exclusive,
            self.tree.id,
            &key_b,
            hash,
            timeout,
        )?)?;
        let fresh = attempt == LockAttempt::Acquired;
        let res = (|| -> EngineResult<bool> {
            self.find_inner(&key_b, Variant::NoLock)?;
            let node = self.upgrade_leaf()?;
            let pos = unsafe { (*self.leaf_ptr()).node_pos };
            let cache = &self.tree.db.cache;
            let current = if pos >= 0 && !node.read().is_ghost(pos) {
                match node.read().retrieve_leaf_value(cache, pos)? {
                    Some(v) => Value::Present(v),
                    None => Value::Absent,
                }
            } else {
                Value::Absent
            };
            let pass = match &modify {
                Modify::Insert => current.is_absent(),
                Modify::Replace => current.is_present(),
                Modify::Expect(None) => current.is_absent(),
                Modify::Expect(Some(e)) => current.as_bytes().map(|b| b == e).unwrap_or(false),
            };
            if !pass {
                node.latch.release_exclusive();
                return Ok(false);
            }
            self.store_under_latch(node, &key_b, value)?;
            Ok(true)
        })();
        match res {
            Ok(true) => {
                if is_txn {
                    if let Txn::Active(t) = &self.txn {
                        t.note_lock(self.tree.id, key_b.clone(), hash);
                    }
                } else {
                    self.tree.db.locks.unlock(locker, self.tree.id, &key_b, hash);
                }
                Ok(true)
            }
            Ok(false) => {
                // precondition failed: never leak the probe lock
                if fresh || !is_txn {
                    self.tree.db.locks.unlock(locker, self.tree.id, &key_b, hash);
                }
                self.reset();
                Ok(false)
            }
            Err(e) => {
                if fresh || !is_txn {
                    self.tree.db.locks.unlock(locker, self.tree.id, &key_b, hash);
                }
                Err(self.handle_error(e))
            }
        }
    }

    /// Physically reclaim a ghost whose lock the caller's (committing)
    /// transaction owns. Runs under `Txn::Bogus`
    pub(crate) fn delete_ghost(&mut self, key: &Bytes) -> EngineResult<()> {
        self.check_open()?;
        let res = (|| -> EngineResult<()> {
            self.find_inner(key, Variant::NoLock)?;
            let node = self.upgrade_leaf()?;
            let pos = unsafe { (*self.leaf_ptr()).node_pos };
            if pos < 0 || !node.read().is_ghost(pos) {
                // someone rewrote the key after the delete committed
                node.latch.release_exclusive();
                return Ok(());
            }
            self.store_under_latch(node, key, None)
        })();
        res.map_err(|e| self.handle_error(e))
    }

    /// Upgrade the (shared-latched) leaf to exclusive, falling back to
    /// release-and-relatch when other readers hold it
    fn upgrade_leaf(&mut self) -> EngineResult<Arc<Node>> {
        let fptr = self.leaf_ptr();
        if fptr.is_null() {
            return Err(EngineError::Unpositioned);
        }
        // UNSAFE(@ohsayan): our pinned frame; leaf latched shared
        unsafe {
            let node = crate::util::Unwrappable::unsafe_unwrap((*fptr).node.clone());
            if node.latch.try_upgrade() {
                return Ok(node);
            }
            node.latch.release_shared();
        }
        self.relatch_leaf_exclusive()
    }

    // ==== skip ====

    /// Batched navigation by `amount` live entries (negative = backwards)
    pub fn skip(&mut self, amount: i64) -> EngineResult<bool> {
        self.skip_limited(amount, None, false)
    }

    /// Like [`Self::skip`], but reset and stop when the walk would pass
    /// `limit`
    pub fn skip_limited(
        &mut self,
        amount: i64,
        limit: Option<&[u8]>,
        inclusive: bool,
    ) -> EngineResult<bool> {
        self.check_open()?;
        if self.leaf.is_none() {
            return Err(EngineError::Unpositioned);
        }
        if amount == 0 {
            return Ok(true);
        }
        let forward = amount > 0;
        let mut remaining = amount.unsigned_abs();
        // subtree-skipping fast path: consume whole leaves via cached
        // child-entry counts where possible, else step
        let res = (|| -> EngineResult<bool> {
            while remaining > 0 {
                let consumed = if remaining > 1 {
                    self.skip_within_leaf(forward, remaining - 1)?
                } else {
                    0
                };
                remaining -= consumed;
                if remaining == 0 {
                    break;
                }
                // consume whole lateral leaves through cached subtree counts
                if remaining > 1 {
                    if let Some(c) =
                        self.try_skip_sibling_subtree(forward, remaining - 1, limit, inclusive)?
                    {
                        remaining -= c.min(remaining - 1);
                        continue;
                    }
                }
                let moved = self.step(forward)?;
                if !moved {
                    return Ok(false);
                }
                remaining -= 1;
                if let (Some(lim), Some(key)) = (limit, self.key.as_deref()) {
                    let beyond = if forward {
                        if inclusive { key > lim } else { key >= lim }
                    } else if inclusive {
                        key < lim
                    } else {
                        key <= lim
                    };
                    if beyond {
                        self.reset();
                        return Ok(false);
                    }
                }
            }
            // settle on the final entry with the full read protocol
            let node = self.relatch_leaf_shared()?;
            let pos = unsafe { (*self.leaf_ptr()).node_pos };
            if pos < 0 {
                node.latch.release_shared();
                return self.step(forward);
            }
            self.key = Some(self.copy_key_at(node.read(), pos)?);
            self.key_hash.set(None);
            self.load_current(node, Variant::Regular)?;
            if self.value == Value::Absent {
                return self.step(forward);
            }
            Ok(true)
        })();
        res.map_err(|e| self.handle_error(e))
    }

    /// Jump over up to `max` live entries inside the current leaf without
    /// touching values or locks. Returns how many were consumed
    fn skip_within_leaf(&mut self, forward: bool, max: u64) -> EngineResult<u64> {
        let node = self.relatch_leaf_shared()?;
        let mut consumed = 0u64;
        {
            let inner = node.read();
            let highest = inner.highest_pos();
            let fptr = self.leaf_ptr();
            // UNSAFE(@ohsayan): leaf latched shared
            let mut cur = unsafe { (*fptr).node_pos };
            while consumed < max {
                let cand = if cur >= 0 {
                    if forward {
                        cur + 2
                    } else {
                        cur - 2
                    }
                } else {
                    let ip = !cur;
                    if forward {
                        ip
                    } else {
                        ip - 2
                    }
                };
                if cand < 0 || cand > highest {
                    break;
                }
                cur = cand;
                if !inner.is_ghost(cand) {
                    consumed += 1;
                }
            }
            unsafe {
                (*fptr).node_pos = cur;
                (*fptr).not_found_key = None;
            }
        }
        node.latch.release_shared();
        Ok(consumed)
    }

    /// Bottom-internal fast path: when the current leaf is exhausted in the
    /// walk direction, consume the ENTIRE lateral sibling leaf using its
    /// cached non-ghost count instead of stepping through it. Returns
    /// `None` when the fast path does not apply, `Some(consumed)` after
    /// repositioning at the far edge of the skipped leaf
    fn try_skip_sibling_subtree(
        &mut self,
        forward: bool,
        budget: u64,
        limit: Option<&[u8]>,
        inclusive: bool,
    ) -> EngineResult<Option<u64>> {
        let node = self.relatch_leaf_shared()?;
        let exhausted = {
            let inner = node.read();
            // UNSAFE(@ohsayan): leaf latched shared
            let cur = unsafe { (*self.leaf_ptr()).node_pos };
            let cand = if cur >= 0 {
                if forward {
                    cur + 2
                } else {
                    cur - 2
                }
            } else {
                let ip = !cur;
                if forward {
                    ip
                } else {
                    ip - 2
                }
            };
            cand < 0 || cand > inner.highest_pos()
        };
        if !exhausted {
            node.latch.release_shared();
            return Ok(None);
        }
        let fptr = self.leaf_ptr();
        // UNSAFE(@ohsayan): our own pinned stack
        let pframe: *mut CursorFrame = unsafe {
            match (*fptr).parent.as_deref_mut() {
                Some(p) => p,
                None => {
                    node.latch.release_shared();
                    return Ok(None);
                }
            }
        };
        // couple the parent: try first, then release-and-block
        let mut child_latched = true;
        let parent = unsafe {
            loop {
                let p = match (*pframe).node_snapshot() {
                    Some(p) => p,
                    None => {
                        if child_latched {
                            node.latch.release_shared();
                        }
                        return Ok(None);
                    }
                };
                if p.latch.try_acquire_shared() {
                    let still = (*pframe)
                        .node
                        .as_ref()
                        .map(|n| Arc::ptr_eq(n, &p))
                        .unwrap_or(false);
                    if still {
                        if child_latched {
                            node.latch.release_shared();
                        }
                        break p;
                    }
                    p.latch.release_shared();
                    continue;
                }
                if child_latched {
                    node.latch.release_shared();
                    child_latched = false;
                }
                match (*pframe).acquire_shared() {
                    Some(p) => break p,
                    None => return Ok(None),
                }
            }
        };
        let bail = |parent: &Arc<Node>| {
            parent.latch.release_shared();
        };
        {
            let pin = parent.read();
            if pin.split.is_some() || !pin.is_bottom_internal() {
                bail(&parent);
                return Ok(None);
            }
        }
        let (idx, nkeys) = {
            let pin = parent.read();
            // UNSAFE(@ohsayan): parent latched shared
            (unsafe { ((*pframe).node_pos >> 1) as usize }, pin.num_keys())
        };
        let next = if forward {
            if idx >= nkeys {
                bail(&parent);
                return Ok(None);
            }
            idx + 1
        } else {
            if idx == 0 {
                bail(&parent);
                return Ok(None);
            }
            idx - 1
        };
        // the subtree's far separator must stay inside the limit, or we
        // could silently overshoot
        if let Some(lim) = limit {
            let cache = &self.tree.db.cache;
            if (forward && next >= nkeys) || (!forward && next == 0) {
                bail(&parent);
                return Ok(None);
            }
            let far_sep_idx = if forward { next } else { next - 1 };
            let sep = parent
                .read()
                .retrieve_key(cache, 2 * far_sep_idx as i32)?;
            let out = if forward {
                if inclusive {
                    &sep[..] > lim
                } else {
                    &sep[..] >= lim
                }
            } else if inclusive {
                &sep[..] < lim
            } else {
                &sep[..] <= lim
            };
            if out {
                bail(&parent);
                return Ok(None);
            }
        }
        let count = match self.retrieve_child_entry_count(&parent, next)? {
            Some(c) if c <= budget => c,
            _ => {
                bail(&parent);
                return Ok(None);
            }
        };
        // consume the whole leaf: repoint the parent frame and rebind the
        // leaf frame at the far edge of the skipped sibling
        let child_id = parent.read().child_id(next);
        let child = match self.latch_child_shared(child_id) {
            Ok(c) => c,
            Err(_) => {
                bail(&parent);
                return Ok(None);
            }
        };
        unsafe {
            (*pframe).node_pos = 2 * next as i32;
            frame::unbind(fptr);
            let far = if forward {
                !(child.read().highest_pos() + 2)
            } else {
                !0
            };
            frame::bind(fptr, &child, far);
        }
        parent.latch.release_shared();
        child.latch.release_shared();
        Ok(Some(count))
    }

    /// Cached non-ghost entry count for a bottom-internal child, computing
    /// and caching it when the node is clean and we can take what the
    /// protocol demands (exclusive latch + shared commit lock)
    pub(crate) fn retrieve_child_entry_count(
        &self,
        parent: &Arc<Node>,
        child_idx: usize,
    ) -> EngineResult<Option<u64>> {
        let cache = &self.tree.db.cache;
        if parent.cached_state() != crate::tree::node::CACHED_CLEAN {
            return Ok(None);
        }
        if let Some(counts) = parent.read().child_counts.as_ref() {
            return Ok(counts.get(child_idx).copied());
        }
        // compute lazily, caching only if we can upgrade on the spot
        if !parent.latch.try_upgrade() {
            return Ok(None);
        }
        let res = (|| -> EngineResult<Option<u64>> {
            let commit = match self.tree.db.commit_lock.try_shared() {
                Some(g) => g,
                None => return Ok(None),
            };
            let n = parent.read().num_keys();
            let mut counts = Vec::with_capacity(n + 1);
            for i in 0..=n {
                let child = cache.load_node(parent.read().child_id(i))?;
                child.latch.acquire_shared();
                counts.push(child.read().count_non_ghost_keys());
                child.latch.release_shared();
            }
            let out = counts.get(child_idx).copied();
            if parent.cached_state() == crate::tree::node::CACHED_CLEAN {
                parent.write().child_counts = Some(counts.into_boxed_slice());
            }
            drop(commit);
            Ok(out)
        })();
        parent.latch.downgrade();
        res
    }

    // ==== randomized access ====

    /// Position on a uniformly-ish random live entry in `[low, high)`.
    /// Ghost-only ranges reset the cursor and report `false`
    pub fn random(&mut self, low: Option<&[u8]>, high: Option<&[u8]>) -> EngineResult<bool> {
        self.check_open()?;
        if let (Some(l), Some(h)) = (low, high) {
            if l >= h {
                return Err(EngineError::BadArgument("empty random range"));
            }
        }
        let mut rng = rand::thread_rng();
        // bounded restarts: a mutating tree can dodge us only so many times
        for _ in 0..64 {
            self.search_to_random(&mut rng, low, high)?;
            let fptr = self.leaf_ptr();
            if fptr.is_null() {
                return Ok(false);
            }
            // UNSAFE(@ohsayan): positioned by the random descent
            let (node, pos) = unsafe {
                (
                    crate::util::Unwrappable::unsafe_unwrap((*fptr).node.clone()),
                    (*fptr).node_pos,
                )
            };
            if pos < 0 {
                // empty candidate leaf: reverify the range has anything at all
                node.latch.release_shared();
                self.reset();
                let mut probe = self.tree.cursor(self.txn.clone());
                probe.set_key_only(true);
                let any = match low {
                    Some(l) => probe.find_ge(l)?,
                    None => probe.first()?,
                };
                let in_range = any
                    && match (high, probe.key()) {
                        (Some(h), Some(k)) => &k[..] < h,
                        _ => any,
                    };
                probe.reset();
                if !in_range {
                    return Ok(false);
                }
                continue;
            }
            self.key = Some(self.copy_key_at(node.read(), pos)?);
            self.key_hash.set(None);
            self.load_current(node, Variant::Regular)?;
            if self.value != Value::Absent {
                return Ok(true);
            }
            // ghost: advance or retreat on a coin flip, staying in range
            let moved = if rng.gen_bool(0.5) {
                match high {
                    Some(h) => self.next_lt(h)?,
                    None => self.next()?,
                }
            } else {
                match low {
                    Some(l) => self.previous_ge(l)?,
                    None => self.previous()?,
                }
            };
            if moved {
                return Ok(true);
            }
            // walked out of the range: restart from the root
        }
        self.reset();
        Ok(false)
    }

    /// One random root-to-leaf descent bounded by `[low, high)`; binds the
    /// leaf frame at a random in-range position (complement when empty)
    fn search_to_random(
        &mut self,
        rng: &mut impl Rng,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> EngineResult<()> {
        self.reset();
        let cache = &self.tree.db.cache;
        let root = self.tree.root.clone();
        root.latch.acquire_shared();
        let mut chain = CursorFrame::new();
        // UNSAFE(@ohsayan): fresh boxed frame
        unsafe {
            frame::bind(&mut *chain, &root, 0);
        }
        let mut node = root;
        loop {
            // traverse a pending split via its low half; sampling does not
            // need exactness, and restarts absorb the bias
            loop {
                let sibling = {
                    let inner = node.read();
                    match inner.split.as_deref() {
                        None => break,
                        Some(split) => match split.low_side() {
                            SplitSide::Original => break,
                            SplitSide::Sibling => split.sibling().clone(),
                        },
                    }
                };
                sibling.latch.acquire_shared();
                // UNSAFE(@ohsayan): chain pinned; both halves latched
                unsafe {
                    frame::unbind(&mut *chain);
                    frame::bind(&mut *chain, &sibling, 0);
                }
                node.latch.release_shared();
                node = sibling;
            }
            let step = {
                let inner = node.read();
                if inner.is_leaf() {
                    let lo_pos = match low {
                        Some(l) => {
                            let s = inner.binary_search(cache, l)?;
                            if s >= 0 {
                                s
                            } else {
                                !s
                            }
                        }
                        None => 0,
                    };
                    let hi_pos = match high {
                        Some(h) => {
                            let s = inner.binary_search(cache, h)?;
                            if s >= 0 {
                                s
                            } else {
                                !s
                            }
                        }
                        None => inner.highest_pos() + 2,
                    };
                    chain.node_pos = if lo_pos >= hi_pos {
                        !lo_pos
                    } else {
                        lo_pos + 2 * (rng.gen_range(0..((hi_pos - lo_pos) >> 1)))
                    };
                    chain.not_found_key = None;
                    None
                } else {
                    let lo_idx = match low {
                        Some(l) => NodeInner::child_index_for(inner.binary_search(cache, l)?),
                        None => 0,
                    };
                    let hi_idx = match high {
                        Some(h) => NodeInner::child_index_for(inner.binary_search(cache, h)?),
                        None => inner.num_keys(),
                    };
                    let idx = if lo_idx >= hi_idx {
                        lo_idx
                    } else {
                        rng.gen_range(lo_idx..=hi_idx)
                    };
                    chain.node_pos = 2 * idx as i32;
                    Some(inner.child_id(idx))
                }
            };
            let child_id = match step {
                None => {
                    self.leaf = Some(chain);
                    return Ok(());
                }
                Some(id) => id,
            };
            let child = match self.latch_child_shared(child_id) {
                Ok(c) => c,
                Err(e) => {
                    node.latch.release_shared();
                    self.leaf = Some(chain);
                    self.reset();
                    return Err(e);
                }
            };
            let mut child_frame = CursorFrame::new();
            unsafe {
                frame::bind(&mut *child_frame, &child, 0);
            }
            child_frame.parent = Some(chain);
            node.latch.release_shared();
            chain = child_frame;
            node = child;
        }
    }

    /// Biased leaf sampler for cache-miss-driven eviction: prefers cold
    /// (uncached) subtrees, re-rolling up to twice per level. Returns the
    /// highest key of the sampled leaf. Does not move the cursor
    pub fn random_node(
        &mut self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> EngineResult<Option<Bytes>> {
        self.check_open()?;
        let cache = &self.tree.db.cache;
        let mut rng = rand::thread_rng();
        let mut node = self.tree.root.clone();
        node.latch.acquire_shared();
        loop {
            let inner = node.read();
            if inner.split.is_some() {
                // sampling is advisory; don't fight a pending split
                node.latch.release_shared();
                return Ok(None);
            }
            if inner.is_leaf() {
                let out = if inner.is_empty() {
                    None
                } else {
                    Some(inner.retrieve_key(cache, inner.highest_pos())?)
                };
                node.latch.release_shared();
                return Ok(out);
            }
            let lo_idx = match low {
                Some(l) => NodeInner::child_index_for(inner.binary_search(cache, l)?),
                None => 0,
            };
            let hi_idx = match high {
                Some(h) => NodeInner::child_index_for(inner.binary_search(cache, h)?),
                None => inner.num_keys(),
            };
            let pick = |rng: &mut rand::rngs::ThreadRng| {
                if lo_idx >= hi_idx {
                    lo_idx
                } else {
                    rng.gen_range(lo_idx..=hi_idx)
                }
            };
            // two re-rolls biased toward cold subtrees; the bottom level
            // falls back to a sequential scan on the third try
            let mut idx = pick(&mut rng);
            for _ in 0..2 {
                if !cache.is_cached(inner.child_id(idx)) {
                    break;
                }
                idx = pick(&mut rng);
            }
            if cache.is_cached(inner.child_id(idx)) && inner.is_bottom_internal() {
                idx = (lo_idx..=hi_idx)
                    .find(|&i| !cache.is_cached(inner.child_id(i)))
                    .unwrap_or(idx);
            }
            let child_id = inner.child_id(idx);
            drop(inner);
            let child = match self.latch_child_shared(child_id) {
                Ok(c) => c,
                Err(e) => {
                    node.latch.release_shared();
                    return Err(e);
                }
            };
            node.latch.release_shared();
            node = child;
        }
    }

    // ==== maintenance ====

    /// Non-transactional bulk clear: walk leftmost and keep deleting the
    /// first entry; the merge machinery collapses the tree behind us
    pub(crate) fn delete_all(&mut self) -> EngineResult<()> {
        debug_assert!(self.txn.is_bogus());
        loop {
            self.search_to_leaf(None, true)?;
            let fptr = self.leaf_ptr();
            // UNSAFE(@ohsayan): bound by descend
            let (node, pos) = unsafe {
                (
                    crate::util::Unwrappable::unsafe_unwrap((*fptr).node.clone()),
                    (*fptr).node_pos,
                )
            };
            if pos < 0 {
                // leftmost leaf empty: the tree is empty (merges pulled
                // everything left)
                node.latch.release_shared();
                self.reset();
                return Ok(());
            }
            self.key = Some(self.copy_key_at(node.read(), pos)?);
            self.key_hash.set(None);
            let node = self.upgrade_leaf()?;
            let key = unsafe { crate::util::Unwrappable::unsafe_unwrap(self.key.clone()) };
            self.store_under_latch(node, &key, None)?;
        }
    }

    /// Compaction walk: relocate every page on the cursor's path with an id
    /// above `highest_node_id`, rewrite offending fragment chains, and move
    /// on leaf by leaf. Returns `false` if aborted (observer or contention)
    pub fn compact(
        &mut self,
        highest_node_id: u64,
        observer: &mut dyn CompactObserver,
    ) -> EngineResult<bool> {
        self.check_open()?;
        if self.leaf.is_none() {
            self.search_to_leaf(None, true)?;
            // compaction positions structurally; release the read latch
            let fptr = self.leaf_ptr();
            // UNSAFE(@ohsayan): bound by descend
            unsafe {
                crate::util::Unwrappable::unsafe_unwrap((*fptr).node.clone())
                    .latch
                    .release_shared();
            }
        }
        let db = self.tree.db.clone();
        loop {
            let done = {
                let commit = db.commit_lock.shared();
                let ok = self.compact_path(highest_node_id, observer)?;
                drop(commit);
                ok
            };
            if !done {
                self.reset();
                return Ok(false);
            }
            // advance to the next leaf (key-only, no locks: Bogus semantics)
            let node = self.relatch_leaf_shared()?;
            let highest = node.read().highest_pos();
            let fptr = self.leaf_ptr();
            // UNSAFE(@ohsayan): leaf latched shared
            unsafe {
                (*fptr).node_pos = highest.max(0);
            }
            match self.move_lateral(true)? {
                Some(next) => next.latch.release_shared(),
                None => return Ok(true),
            }
        }
    }

    /// Relocate the cursor's current root→leaf path and the leaf's fragment
    /// chains. Commit lock held shared by the caller
    fn compact_path(
        &mut self,
        highest_node_id: u64,
        observer: &mut dyn CompactObserver,
    ) -> EngineResult<bool> {
        let db = self.tree.db.clone();
        let cache = &db.cache;
        // collect the path top-down
        let mut path: Vec<*mut CursorFrame> = Vec::new();
        let mut cur = self.leaf_ptr();
        while !cur.is_null() {
            path.push(cur);
            // UNSAFE(@ohsayan): our own chain
            cur = unsafe {
                match (*cur).parent.as_deref_mut() {
                    Some(p) => p as *mut CursorFrame,
                    None => core::ptr::null_mut(),
                }
            };
        }
        path.reverse();
        // walk down with exclusive coupling, relocating as we go
        let mut parent: Option<Arc<Node>> = None;
        for fptr in path {
            // UNSAFE(@ohsayan): pinned frames
            let node = match unsafe { (*fptr).acquire_exclusive() } {
                Some(n) => n,
                None => {
                    if let Some(p) = parent {
                        p.latch.release_exclusive();
                    }
                    return Ok(false);
                }
            };
            if node.read().split.is_some() {
                // somebody is mid-split here; bail and let them finish
                node.latch.release_exclusive();
                if let Some(p) = parent {
                    p.latch.release_exclusive();
                }
                return Ok(false);
            }
            if node.id() > highest_node_id {
                let old = node.id();
                let new = cache.relocate(&node)?;
                if let Some(p) = &parent {
                    match p.read().find_child_slot(old) {
                        Some(slot) => p.write().set_child_id(slot, new),
                        None => {
                            node.latch.release_exclusive();
                            p.latch.release_exclusive();
                            return Ok(false);
                        }
                    }
                    cache.mark_dirty(p);
                }
                if node.id() > highest_node_id {
                    // free ids are exhausted above the threshold: contention
                    node.latch.release_exclusive();
                    if let Some(p) = parent {
                        p.latch.release_exclusive();
                    }
                    return Ok(false);
                }
                if !observer.page_relocated(old, node.id()) {
                    node.latch.release_exclusive();
                    if let Some(p) = parent {
                        p.latch.release_exclusive();
                    }
                    return Ok(false);
                }
            }
            if let Some(p) = parent.take() {
                p.latch.release_exclusive();
            }
            parent = Some(node);
        }
        // the leaf: rewrite fragment chains with segments above the threshold
        // UNSAFE(@ohsayan): loop above always pushes the leaf last
        let leaf = unsafe { crate::util::Unwrappable::unsafe_unwrap(parent) };
        let res = (|| -> EngineResult<bool> {
            let n = leaf.read().num_keys();
            let mut touched = false;
            for i in 0..n {
                let pos = 2 * i as i32;
                if let Some((chain, _len)) = leaf.read().value_fragment_chain(pos) {
                    if let Some(new_head) = valchain::touch_chain(cache, chain, highest_node_id)? {
                        leaf.write().set_value_fragment_chain(pos, new_head);
                        touched = true;
                    }
                }
                if let Some((chain, _len)) = leaf.read().key_fragment_chain(pos) {
                    if let Some(new_head) = valchain::touch_chain(cache, chain, highest_node_id)? {
                        leaf.write().set_key_fragment_chain(pos, new_head);
                        touched = true;
                    }
                }
            }
            if touched {
                cache.mark_dirty(&leaf);
            }
            Ok(true)
        })();
        leaf.latch.release_exclusive();
        res
    }
}

/// Observer for [`Cursor::compact`]. Returning `false` aborts the pass
pub trait CompactObserver {
    fn page_relocated(&mut self, old_id: u64, new_id: u64) -> bool;
}

impl<F: FnMut(u64, u64) -> bool> CompactObserver for F {
    fn page_relocated(&mut self, old_id: u64, new_id: u64) -> bool {
        self(old_id, new_id)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.reset();
    }
}

impl core::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cursor")
            .field("tree", &self.tree.id)
            .field("txn", &self.txn)
            .field("key", &self.key.as_ref().map(|k| k.len()))
            .field("positioned", &self.is_positioned())
            .finish()
    }
}

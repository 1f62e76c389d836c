/*
 * Created on Fri Mar 07 2025
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

//! # Cursor frames
//!
//! A [`CursorFrame`] binds one level of a cursor's position stack to a node.
//! Frames of all cursors bound to the same node form an intrusive doubly
//! linked list anchored at `Node::last_cursor_frame` (the "cousin" list), so
//! that a writer mutating the node can fix every affected cursor position in
//! one pass.
//!
//! ## Access protocol
//!
//! - A frame's fields may be read freely while holding the bound node's latch
//!   in any mode: all fix-ups run under the exclusive latch.
//! - Without the node latch, field access takes the per-frame `lock` (and list
//!   surgery additionally takes the node's `frame_lock`, in that order:
//!   `frame_lock` → `lock`).
//! - To latch the node a frame is bound to, snapshot `node` under the frame
//!   lock, latch it, and re-check the binding: a concurrent split or merge may
//!   have rebound the frame in between.
//!
//! `node_pos >= 0` points at an existing entry. `node_pos == !insert_pos`
//! encodes "not found, would insert at `insert_pos`", with `not_found_key`
//! remembering the probe key so concurrent inserts at the same slot can be
//! classified.

use crate::sync::latch::FrameLock;
use crate::tree::node::Node;
use bytes::Bytes;
use core::ptr;
use std::sync::Arc;

pub struct CursorFrame {
    pub(crate) lock: FrameLock,
    pub(crate) node: Option<Arc<Node>>,
    pub(crate) node_pos: i32,
    pub(crate) not_found_key: Option<Bytes>,
    pub(crate) parent: Option<Box<CursorFrame>>,
    prev_cousin: *mut CursorFrame,
    next_cousin: *mut CursorFrame,
}

// UNSAFE(@ohsayan): cousin pointers are only followed under the node's
// frame_lock; everything else follows the access protocol above
unsafe impl Send for CursorFrame {}

impl CursorFrame {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            lock: FrameLock::new(),
            node: None,
            node_pos: 0,
            not_found_key: None,
            parent: None,
            prev_cousin: ptr::null_mut(),
            next_cousin: ptr::null_mut(),
        })
    }

    /// Snapshot the bound node without holding its latch
    pub(crate) fn node_snapshot(&self) -> Option<Arc<Node>> {
        self.lock.lock();
        let n = self.node.clone();
        self.lock.release();
        n
    }

    /// Latch the bound node shared, riding out concurrent rebinds. Returns
    /// the latched node, or `None` if the frame went unbound
    pub(crate) fn acquire_shared(&self) -> Option<Arc<Node>> {
        loop {
            let node = self.node_snapshot()?;
            node.latch.acquire_shared();
            if self
                .node
                .as_ref()
                .map(|n| Arc::ptr_eq(n, &node))
                .unwrap_or(false)
            {
                return Some(node);
            }
            node.latch.release_shared();
        }
    }

    /// Latch the bound node exclusively; see [`Self::acquire_shared`]
    pub(crate) fn acquire_exclusive(&self) -> Option<Arc<Node>> {
        loop {
            let node = self.node_snapshot()?;
            node.latch.acquire_exclusive();
            if self
                .node
                .as_ref()
                .map(|n| Arc::ptr_eq(n, &node))
                .unwrap_or(false)
            {
                return Some(node);
            }
            node.latch.release_exclusive();
        }
    }
}

impl Default for CursorFrame {
    fn default() -> Self {
        *Self::new()
    }
}

impl core::fmt::Debug for CursorFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CursorFrame")
            .field("node", &self.node.as_ref().map(|n| n.id()))
            .field("node_pos", &self.node_pos)
            .field("not_found", &self.not_found_key.is_some())
            .finish()
    }
}

/// Bind `frame` to `node` at `pos`, linking it into the cousin list. The
/// frame must be unbound and heap-pinned; the caller holds the node's latch
/// in at least shared mode
///
/// ## Safety
/// `frame` must point at a live, pinned `CursorFrame` that stays put until
/// unbound
pub(crate) unsafe fn bind(frame: *mut CursorFrame, node: &Arc<Node>, pos: i32) {
    node.frame_lock.lock();
    let f = &mut *frame;
    f.lock.lock();
    debug_assert!(f.node.is_none());
    f.node = Some(node.clone());
    f.node_pos = pos;
    let head = node.last_cursor_frame.load(core::sync::atomic::Ordering::Relaxed);
    f.next_cousin = head;
    f.prev_cousin = ptr::null_mut();
    if !head.is_null() {
        (*head).prev_cousin = frame;
    }
    node.last_cursor_frame
        .store(frame, core::sync::atomic::Ordering::Relaxed);
    f.lock.release();
    node.frame_lock.release();
}

/// Unbind `frame` from whatever node it is bound to, if any.
///
/// ## Safety
/// `frame` must point at a live `CursorFrame`
pub(crate) unsafe fn unbind(frame: *mut CursorFrame) {
    loop {
        let node = match (*frame).node_snapshot() {
            Some(n) => n,
            None => return,
        };
        node.frame_lock.lock();
        let f = &mut *frame;
        f.lock.lock();
        let still = f.node.as_ref().map(|n| Arc::ptr_eq(n, &node)).unwrap_or(false);
        if still {
            unlink_locked(&node, frame);
            f.node = None;
            f.not_found_key = None;
            f.lock.release();
            node.frame_lock.release();
            return;
        }
        f.lock.release();
        node.frame_lock.release();
    }
}

/// Unlink `frame` from `node`'s cousin list. Caller holds `node.frame_lock`
unsafe fn unlink_locked(node: &Node, frame: *mut CursorFrame) {
    use core::sync::atomic::Ordering;
    let f = &mut *frame;
    let prev = f.prev_cousin;
    let next = f.next_cousin;
    if prev.is_null() {
        debug_assert_eq!(node.last_cursor_frame.load(Ordering::Relaxed), frame);
        node.last_cursor_frame.store(next, Ordering::Relaxed);
    } else {
        (*prev).next_cousin = next;
    }
    if !next.is_null() {
        (*next).prev_cousin = prev;
    }
    f.prev_cousin = ptr::null_mut();
    f.next_cousin = ptr::null_mut();
}

/// Link `frame` into `node`'s cousin list. Caller holds `node.frame_lock`
unsafe fn link_locked(node: &Node, frame: *mut CursorFrame) {
    use core::sync::atomic::Ordering;
    let f = &mut *frame;
    let head = node.last_cursor_frame.load(Ordering::Relaxed);
    f.next_cousin = head;
    f.prev_cousin = ptr::null_mut();
    if !head.is_null() {
        (*head).prev_cousin = frame;
    }
    node.last_cursor_frame.store(frame, Ordering::Relaxed);
}

/// Run `visit` over every frame bound to `node`. The callback may mutate the
/// frame but must not unlink it. Caller holds the node's exclusive latch
fn for_each_frame(node: &Node, mut visit: impl FnMut(&mut CursorFrame)) {
    use core::sync::atomic::Ordering;
    node.frame_lock.lock();
    let mut cur = node.last_cursor_frame.load(Ordering::Relaxed);
    while !cur.is_null() {
        // UNSAFE(@ohsayan): frames stay pinned while bound; we hold frame_lock
        unsafe {
            let next = (*cur).next_cousin;
            let f = &mut *cur;
            f.lock.lock();
            visit(f);
            f.lock.release();
            cur = next;
        }
    }
    node.frame_lock.release();
}

/// Fix positions after an insert at insert position `ip`: found positions at
/// or past it shift up, not-found frames at the same slot either promote to
/// found (same key) or keep their complement. Caller holds the node's
/// exclusive latch
pub(crate) fn fix_frames_insert(node: &Arc<Node>, ip: i32, key: &[u8]) {
    for_each_frame(node, |f| {
        if f.node_pos >= 0 {
            if f.node_pos >= ip {
                f.node_pos += 2;
            }
        } else {
            let fip = !f.node_pos;
            match fip.cmp(&ip) {
                core::cmp::Ordering::Less => {}
                core::cmp::Ordering::Greater => f.node_pos = !(fip + 2),
                core::cmp::Ordering::Equal => {
                    match f.not_found_key.as_deref().map(|nf| nf.cmp(key)) {
                        Some(core::cmp::Ordering::Equal) => {
                            // the very key this frame missed just arrived
                            f.node_pos = ip;
                            f.not_found_key = None;
                        }
                        Some(core::cmp::Ordering::Greater) => f.node_pos = !(fip + 2),
                        _ => {}
                    }
                }
            }
        }
    });
}

/// Fix positions after deleting the entry that was at `pos`, whose key was
/// `key`. Caller holds the node's exclusive latch
pub(crate) fn fix_frames_delete(node: &Arc<Node>, pos: i32, key: &Bytes) {
    for_each_frame(node, |f| {
        if f.node_pos >= 0 {
            match f.node_pos.cmp(&pos) {
                core::cmp::Ordering::Greater => f.node_pos -= 2,
                core::cmp::Ordering::Equal => {
                    f.node_pos = !pos;
                    f.not_found_key = Some(key.clone());
                }
                core::cmp::Ordering::Less => {}
            }
        } else {
            let fip = !f.node_pos;
            if fip > pos {
                f.node_pos = !(fip - 2);
            }
        }
    });
}

/// A child slot was inserted at `idx` in an internal node: shift frames at or
/// past it. Caller holds the exclusive latch
pub(crate) fn fix_parent_frames_child_inserted(node: &Arc<Node>, idx: usize) {
    let cut = 2 * idx as i32;
    for_each_frame(node, |f| {
        if f.node_pos >= cut {
            f.node_pos += 2;
        }
    });
}

/// The child slot at `idx` was removed (its subtree merged into `idx - 1`).
/// Caller holds the exclusive latch
pub(crate) fn fix_parent_frames_child_removed(node: &Arc<Node>, idx: usize) {
    let cut = 2 * idx as i32;
    for_each_frame(node, |f| {
        if f.node_pos >= cut {
            f.node_pos -= 2;
        }
    });
}

/// Move frames across a leaf split. `cut_pos` is the position (2-byte units)
/// of the first entry right of the separator in pre-move numbering; for
/// `split_right` the tail `[cut_pos..]` moved to the sibling, otherwise the
/// head `[..cut_pos]` did (and retained slots shifted down by `cut_pos`).
///
/// ## Safety
/// Caller holds the node's exclusive latch; the sibling is not yet reachable
/// by other threads
pub(crate) unsafe fn rebind_frames_for_split(
    node: &Arc<Node>,
    sibling: &Arc<Node>,
    cut_pos: i32,
    split_right: bool,
    separator: &Bytes,
) {
    use core::sync::atomic::Ordering;
    node.frame_lock.lock();
    sibling.frame_lock.lock();
    let mut cur = node.last_cursor_frame.load(Ordering::Relaxed);
    while !cur.is_null() {
        let next = (*cur).next_cousin;
        let f = &mut *cur;
        f.lock.lock();
        let move_to_sibling;
        let new_pos;
        if f.node_pos >= 0 {
            if split_right {
                move_to_sibling = f.node_pos >= cut_pos;
                new_pos = if move_to_sibling {
                    f.node_pos - cut_pos
                } else {
                    f.node_pos
                };
            } else {
                move_to_sibling = f.node_pos < cut_pos;
                new_pos = if move_to_sibling {
                    f.node_pos
                } else {
                    f.node_pos - cut_pos
                };
            }
        } else {
            let fip = !f.node_pos;
            let goes_high = match fip.cmp(&cut_pos) {
                core::cmp::Ordering::Less => false,
                core::cmp::Ordering::Greater => true,
                // boundary: the not-found key decides the side
                core::cmp::Ordering::Equal => f
                    .not_found_key
                    .as_deref()
                    .map(|nf| nf >= &separator[..])
                    .unwrap_or(false),
            };
            if split_right {
                move_to_sibling = goes_high;
                new_pos = if goes_high { !(fip - cut_pos) } else { !fip };
            } else {
                move_to_sibling = !goes_high;
                new_pos = if goes_high { !(fip - cut_pos) } else { !fip };
            }
        }
        f.node_pos = new_pos;
        if move_to_sibling {
            unlink_locked(node, cur);
            link_locked(sibling, cur);
            f.node = Some(sibling.clone());
        }
        f.lock.release();
        cur = next;
    }
    sibling.frame_lock.release();
    node.frame_lock.release();
}

/// Move frames across an internal split: child slots `mid + 1 ..` moved to
/// the sibling (the separator at `mid` was promoted).
///
/// ## Safety
/// Caller holds the node's exclusive latch; the sibling is not yet reachable
pub(crate) unsafe fn rebind_frames_for_internal_split(
    node: &Arc<Node>,
    sibling: &Arc<Node>,
    mid: usize,
) {
    use core::sync::atomic::Ordering;
    let cut = 2 * (mid as i32 + 1);
    node.frame_lock.lock();
    sibling.frame_lock.lock();
    let mut cur = node.last_cursor_frame.load(Ordering::Relaxed);
    while !cur.is_null() {
        let next = (*cur).next_cousin;
        let f = &mut *cur;
        f.lock.lock();
        if f.node_pos >= cut {
            f.node_pos -= cut;
            unlink_locked(node, cur);
            link_locked(sibling, cur);
            f.node = Some(sibling.clone());
        }
        f.lock.release();
        cur = next;
    }
    sibling.frame_lock.release();
    node.frame_lock.release();
}

/// Move every frame from `right` onto `left` shifted up by `shift` (2-byte
/// units), after a merge emptied `right` into `left`.
///
/// ## Safety
/// Caller holds both nodes' exclusive latches (left-to-right order)
pub(crate) unsafe fn move_frames_for_merge(right: &Arc<Node>, left: &Arc<Node>, shift: i32) {
    use core::sync::atomic::Ordering;
    left.frame_lock.lock();
    right.frame_lock.lock();
    let mut cur = right.last_cursor_frame.load(Ordering::Relaxed);
    while !cur.is_null() {
        let next = (*cur).next_cousin;
        let f = &mut *cur;
        f.lock.lock();
        if f.node_pos >= 0 {
            f.node_pos += shift;
        } else {
            f.node_pos = !(!f.node_pos + shift);
        }
        unlink_locked(right, cur);
        link_locked(left, cur);
        f.node = Some(left.clone());
        f.lock.release();
        cur = next;
    }
    right.frame_lock.release();
    left.frame_lock.release();
}

/// Point the parent-level frame of every stack passing through `of_node` at
/// child slot `child_slot` of `parent`.
///
/// ## Safety
/// Caller holds `of_node`'s and `parent`'s exclusive latches
pub(crate) unsafe fn repoint_parent_frames(
    of_node: &Arc<Node>,
    parent: &Arc<Node>,
    child_slot: usize,
) {
    use core::sync::atomic::Ordering;
    of_node.frame_lock.lock();
    let mut cur = of_node.last_cursor_frame.load(Ordering::Relaxed);
    while !cur.is_null() {
        let next = (*cur).next_cousin;
        let f = &mut *cur;
        f.lock.lock();
        if let Some(pf) = f.parent.as_deref_mut() {
            if pf.node.as_ref().map(|n| Arc::ptr_eq(n, parent)).unwrap_or(false) {
                pf.lock.lock();
                pf.node_pos = 2 * child_slot as i32;
                pf.lock.release();
            }
        }
        f.lock.release();
        cur = next;
    }
    of_node.frame_lock.release();
}

/// After a root split produced `new_root` above `old_root` (and its sibling),
/// give every stack that topped out at the old root a frame on the new root.
/// `node_child` / `sibling_child` are the new child slots of the two halves.
///
/// ## Safety
/// Caller holds the old root's exclusive latch; the new root is not yet
/// published as the tree root
pub(crate) unsafe fn attach_root_frames(
    old_root: &Arc<Node>,
    sibling: &Arc<Node>,
    new_root: &Arc<Node>,
    node_child: usize,
    sibling_child: usize,
) {
    for (side, child_idx) in [(old_root, node_child), (sibling, sibling_child)] {
        use core::sync::atomic::Ordering;
        side.frame_lock.lock();
        let mut cur = side.last_cursor_frame.load(Ordering::Relaxed);
        while !cur.is_null() {
            let next = (*cur).next_cousin;
            let f = &mut *cur;
            f.lock.lock();
            match f.parent.as_deref_mut() {
                None => {
                    let mut parent = CursorFrame::new();
                    let ptr: *mut CursorFrame = &mut *parent;
                    bind(ptr, new_root, 2 * child_idx as i32);
                    f.parent = Some(parent);
                }
                Some(stale) if stale.node_snapshot().is_none() => {
                    // a root collapse left an unbound frame here; reuse the
                    // box in place; frames are only freed by their owner
                    let ptr: *mut CursorFrame = stale;
                    bind(ptr, new_root, 2 * child_idx as i32);
                }
                Some(_) => {}
            }
            f.lock.release();
            cur = next;
        }
        side.frame_lock.release();
    }
}

/// The root collapsed: `old_root` had `child` as its only subtree and the
/// child's content was adopted into the root. Every frame bound to `child`
/// rebinds onto the root; its old root-level frame is unbound **in place**
/// (never freed: only the owning cursor drops frame boxes, so concurrent
/// climbers dereferencing it stay safe and read it as "no parent").
///
/// ## Safety
/// Caller holds both exclusive latches and has already adopted the content
pub(crate) unsafe fn collapse_root_frames(old_root: &Arc<Node>, child: &Arc<Node>) {
    use core::sync::atomic::Ordering;
    old_root.frame_lock.lock();
    child.frame_lock.lock();
    let mut cur = child.last_cursor_frame.load(Ordering::Relaxed);
    while !cur.is_null() {
        let next = (*cur).next_cousin;
        let f = &mut *cur;
        f.lock.lock();
        if let Some(stale) = f.parent.as_deref_mut() {
            let sptr: *mut CursorFrame = stale;
            let sf = &mut *sptr;
            sf.lock.lock();
            let was_root = sf
                .node
                .as_ref()
                .map(|n| Arc::ptr_eq(n, old_root))
                .unwrap_or(false);
            if was_root {
                unlink_locked(old_root, sptr);
                sf.node = None;
                sf.not_found_key = None;
            }
            sf.lock.release();
        }
        // rebind onto the (stable) root node
        unlink_locked(child, cur);
        link_locked(old_root, cur);
        f.node = Some(old_root.clone());
        f.lock.release();
        cur = next;
    }
    child.frame_lock.release();
    old_root.frame_lock.release();
}

/*
 * Created on Tue Mar 11 2025
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

//! # Fragment chains
//!
//! Keys and values that do not fit inline are written to a chain of fragment
//! pages referenced by head page id (a direct pointer chain). A fragment page:
//!
//! ```text
//! [type u8][resv u8][next id u64][used u16][data ...]
//! ```
//!
//! Chains are immutable while the owning entry exists: readers access them
//! under the owning leaf's shared latch and every mutation happens under the
//! owning leaf's exclusive latch, so the chain pages themselves need no
//! latching of their own. The exception is [`touch_chain`], which relocates
//! pages during compaction and latches each fragment page exclusively while
//! its id changes.
//!
//! Indirect pointer chains and in-place length changes are not defined by
//! this engine (see DESIGN.md).

use crate::cache::PageCache;
use crate::error::{EngineError, EngineResult};
use crate::tree::node::{self, Node, TYPE_FRAGMENT};
use bytes::{Bytes, BytesMut};

consts! {
    OFF_NEXT: usize = 2;
    OFF_USED: usize = 10;
    OFF_DATA: usize = 12;
}

#[inline]
fn chunk_capacity(page_size: usize) -> usize {
    page_size - OFF_DATA
}

/// Write `data` out as a fragment chain, returning the head page id
pub(crate) fn write_chain(cache: &PageCache, data: &[u8]) -> EngineResult<u64> {
    debug_assert!(!data.is_empty());
    let cap = chunk_capacity(cache.page_size());
    let mut head = 0u64;
    let mut prev: Option<std::sync::Arc<Node>> = None;
    for chunk in data.chunks(cap) {
        let page = cache.alloc_node(TYPE_FRAGMENT)?;
        {
            let inner = page.write();
            let body = inner.raw_page_mut();
            node::write_u64(body, OFF_NEXT, 0);
            body[OFF_USED..OFF_USED + 2].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
            body[OFF_DATA..OFF_DATA + chunk.len()].copy_from_slice(chunk);
        }
        match prev {
            None => head = page.id(),
            Some(p) => {
                let inner = p.write();
                node::write_u64(inner.raw_page_mut(), OFF_NEXT, page.id());
            }
        }
        prev = Some(page);
    }
    Ok(head)
}

/// Read a whole chain back. `len` is the full logical length and must match
/// what the chain holds
pub(crate) fn read_chain(cache: &PageCache, head: u64, len: usize) -> EngineResult<Bytes> {
    let mut out = BytesMut::with_capacity(len);
    let mut next = head;
    while next != 0 {
        let page = cache.load_node(next)?;
        let inner = page.read();
        if inner.type_byte() & TYPE_FRAGMENT == 0 {
            return Err(EngineError::corrupted_page(next, "expected fragment page"));
        }
        let body = inner.raw_page();
        let used = u16::from_le_bytes([body[OFF_USED], body[OFF_USED + 1]]) as usize;
        if out.len() + used > len {
            return Err(EngineError::corrupted_page(next, "fragment chain overrun"));
        }
        out.extend_from_slice(&body[OFF_DATA..OFF_DATA + used]);
        next = node::read_u64(body, OFF_NEXT);
    }
    if out.len() != len {
        return Err(EngineError::corrupted_page(head, "fragment chain truncated"));
    }
    Ok(out.freeze())
}

/// Free every page of a chain
pub(crate) fn free_chain(cache: &PageCache, head: u64) -> EngineResult<()> {
    let mut next = head;
    while next != 0 {
        let page = cache.load_node(next)?;
        page.latch.acquire_exclusive();
        let following = node::read_u64(page.read().raw_page(), OFF_NEXT);
        cache.delete_node(&page);
        page.latch.release_exclusive();
        next = following;
    }
    Ok(())
}

/// Compaction support: relocate every chain page whose id exceeds
/// `highest_id`. Returns the (possibly new) head id, or `None` if nothing
/// moved. The owning leaf is latched exclusively by the caller
pub(crate) fn touch_chain(
    cache: &PageCache,
    head: u64,
    highest_id: u64,
) -> EngineResult<Option<u64>> {
    let mut new_head = None;
    let mut prev: Option<std::sync::Arc<Node>> = None;
    let mut cur_id = head;
    while cur_id != 0 {
        let page = cache.load_node(cur_id)?;
        page.latch.acquire_exclusive();
        let mut relocated = false;
        if page.id() > highest_id {
            cache.relocate(&page)?;
            relocated = true;
        }
        if relocated {
            match &prev {
                None => new_head = Some(page.id()),
                Some(p) => {
                    let inner = p.write();
                    node::write_u64(inner.raw_page_mut(), OFF_NEXT, page.id());
                    cache.mark_dirty(p);
                }
            }
        }
        let following = node::read_u64(page.read().raw_page(), OFF_NEXT);
        // keep the predecessor latched until its next pointer is final
        if let Some(p) = prev.replace(page) {
            p.latch.release_exclusive();
        }
        cur_id = following;
    }
    if let Some(p) = prev {
        p.latch.release_exclusive();
    }
    Ok(new_head)
}

/*
 * Created on Thu Feb 13 2025
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

//! # Engine configuration
//!
//! The engine is a library: there is no CLI and no environment lookup here.
//! Everything is supplied programmatically through [`EngineConfig`] and
//! validated once at open time.

use crate::error::{EngineError, EngineResult};
use crate::repl::ReplicationStream;
use std::sync::Arc;

consts! {
    pub(crate) MIN_PAGE_SIZE: usize = 256;
    pub(crate) MAX_PAGE_SIZE: usize = 65536;
    /// Default key lock acquisition budget (1s). `-1` means wait forever
    DEFAULT_LOCK_TIMEOUT_NANOS: i64 = 1_000_000_000;
}

/// How hard the redo log tries before a commit is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Commits wait for the log to be made durable
    Sync,
    /// Commits return once the log is written, syncing is left to a flusher
    NoSync,
    /// Commits return once the record is buffered
    NoFlush,
    /// No redo logging at all. Checkpoints are the only durability boundary
    NoRedo,
}

#[derive(Clone)]
pub struct EngineConfig {
    pub(crate) page_size: usize,
    pub(crate) cache_capacity: usize,
    pub(crate) lock_timeout_nanos: i64,
    pub(crate) durability: DurabilityMode,
    pub(crate) replicator: Option<Arc<dyn ReplicationStream>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_capacity: 16384,
            lock_timeout_nanos: DEFAULT_LOCK_TIMEOUT_NANOS,
            durability: DurabilityMode::NoFlush,
            replicator: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
    pub fn cache_capacity(mut self, pages: usize) -> Self {
        self.cache_capacity = pages;
        self
    }
    /// Key lock acquisition budget in nanoseconds; `-1` waits forever
    pub fn lock_timeout_nanos(mut self, nanos: i64) -> Self {
        self.lock_timeout_nanos = nanos;
        self
    }
    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }
    pub fn replicator(mut self, repl: Arc<dyn ReplicationStream>) -> Self {
        self.replicator = Some(repl);
        self
    }
    pub(crate) fn validate(&self) -> EngineResult<()> {
        if !self.page_size.is_power_of_two() {
            return Err(EngineError::BadArgument("page size must be a power of two"));
        }
        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(EngineError::BadArgument("page size out of range"));
        }
        if self.lock_timeout_nanos < -1 {
            return Err(EngineError::BadArgument("lock timeout must be >= -1"));
        }
        Ok(())
    }
}

impl core::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("page_size", &self.page_size)
            .field("cache_capacity", &self.cache_capacity)
            .field("lock_timeout_nanos", &self.lock_timeout_nanos)
            .field("durability", &self.durability)
            .field("replicator", &self.replicator.is_some())
            .finish()
    }
}

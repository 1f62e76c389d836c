/*
 * Created on Mon Mar 31 2025
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

//! # The database object
//!
//! [`Database`] is the embedding surface: open with an [`EngineConfig`], get
//! named trees, begin transactions, checkpoint, close. Everything else hangs
//! off [`DbCore`]: the page cache, the commit lock, the lock manager and the
//! redo log, shared by every tree.

use crate::cache::PageCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::redo::RedoLog;
use crate::sync::CommitLock;
use crate::tree::Tree;
use crate::txn::{LockManager, LockMode, Transaction, TxnId};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) struct DbCore {
    pub(crate) config: EngineConfig,
    pub(crate) cache: PageCache,
    pub(crate) commit_lock: CommitLock,
    pub(crate) locks: LockManager,
    pub(crate) redo: RedoLog,
    closed: AtomicBool,
    close_cause: Mutex<Option<String>>,
    /// Shared id space for transactions and non-transactional lockers (0 is
    /// reserved as "nobody")
    ids: AtomicU64,
}

impl DbCore {
    pub(crate) fn check_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed(self.close_cause.lock().clone()));
        }
        Ok(())
    }

    pub(crate) fn next_locker_id(&self) -> TxnId {
        self.ids.fetch_add(1, Ordering::AcqRel)
    }

    /// A fatal failure happened while mutating under the commit lock: record
    /// the cause and brick the database. Subsequent operations fail hard
    pub(crate) fn close_on_failure(&self, cause: &EngineError) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::error!("database closed on fatal failure: {cause}");
            *self.close_cause.lock() = Some(cause.to_string());
        }
    }
}

pub struct Database {
    core: Arc<DbCore>,
    trees: RwLock<HashMap<String, Arc<Tree>>>,
    next_tree_id: AtomicU64,
}

impl Database {
    /// Open an engine instance with the given configuration
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let cache = PageCache::new(config.page_size, config.cache_capacity);
        let redo = RedoLog::new(config.durability, config.replicator.clone());
        if let Some(repl) = &config.replicator {
            repl.start(repl.write_position())?;
        }
        let core = Arc::new(DbCore {
            config,
            cache,
            commit_lock: CommitLock::new(),
            locks: LockManager::new(),
            redo,
            closed: AtomicBool::new(false),
            close_cause: Mutex::new(None),
            ids: AtomicU64::new(1),
        });
        Ok(Self {
            core,
            trees: RwLock::new(HashMap::new()),
            next_tree_id: AtomicU64::new(1),
        })
    }

    /// Get (or create) the named tree
    pub fn open_tree(&self, name: &str) -> EngineResult<Arc<Tree>> {
        self.core.check_open()?;
        if let Some(t) = self.trees.read().get(name) {
            return Ok(t.clone());
        }
        let mut trees = self.trees.write();
        if let Some(t) = trees.get(name) {
            return Ok(t.clone());
        }
        let id = self.next_tree_id.fetch_add(1, Ordering::AcqRel);
        let tree = Tree::open(self.core.clone(), id, name.to_owned())?;
        trees.insert(name.to_owned(), tree.clone());
        log::debug!("opened tree `{name}` (id {id})");
        Ok(tree)
    }

    /// Begin a transaction at the given isolation
    pub fn begin(&self, mode: LockMode) -> EngineResult<Arc<Transaction>> {
        self.core.check_open()?;
        let id = self.core.next_locker_id();
        Ok(Arc::new(Transaction::new(self.core.clone(), id, mode)))
    }

    /// Snapshot a consistent image: the exclusive commit lock quiesces every
    /// structural mutation, the dirty generation flips, and everything dirty
    /// in the previous generation flushes to stable storage. Returns the
    /// number of pages written
    pub fn checkpoint(&self) -> EngineResult<usize> {
        self.core.check_open()?;
        let guard = self.core.commit_lock.exclusive();
        log::debug!("checkpoint: begin");
        let flushed = self.core.cache.checkpoint_flush()?;
        drop(guard);
        log::debug!("checkpoint: flushed {flushed} pages");
        Ok(flushed)
    }

    /// Orderly close: checkpoint, then refuse further work
    pub fn close(&self) -> EngineResult<()> {
        if self.core.check_open().is_err() {
            return Ok(());
        }
        self.checkpoint()?;
        self.core.closed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.core.check_open().is_err()
    }

    pub fn page_size(&self) -> usize {
        self.core.config.page_size
    }
}

impl core::fmt::Debug for Database {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.core.config)
            .field("trees", &self.trees.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

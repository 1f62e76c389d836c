/*
 * Created on Tue Mar 18 2025
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

pub mod locks;

use crate::db::DbCore;
use crate::error::EngineResult;
use crate::tree::cursor::Cursor;
use crate::tree::Tree;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

pub use locks::{LockAttempt, LockManager, LockType, TxnId};

/// Isolation for reads and writes driven through a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Upgradable,
    Exclusive,
    /// No locking at all; the caller asserts external coordination
    Unsafe,
}

impl LockMode {
    /// Reads take no key locks in this mode
    #[inline]
    pub fn no_read_lock(&self) -> bool {
        matches!(self, Self::ReadUncommitted | Self::Unsafe)
    }
    /// Read locks are retained until commit
    #[inline]
    pub fn repeatable(&self) -> bool {
        matches!(self, Self::RepeatableRead | Self::Upgradable | Self::Exclusive)
    }
    /// The lock strength this mode's reads acquire
    pub(crate) fn read_lock_type(&self) -> LockType {
        match self {
            Self::Upgradable => LockType::Upgradable,
            Self::Exclusive => LockType::Exclusive,
            _ => LockType::Shared,
        }
    }
}

/// The transaction a cursor operates under. Sentinels are variants, not
/// magic pointers: [`Txn::Bogus`] bypasses both locking and redo (used by
/// rollback and ghost reclamation), [`Txn::None`] means auto-commit
#[derive(Clone, Default)]
pub enum Txn {
    #[default]
    None,
    Bogus,
    Active(Arc<Transaction>),
}

impl Txn {
    #[inline]
    pub(crate) fn is_bogus(&self) -> bool {
        matches!(self, Self::Bogus)
    }
}

impl core::fmt::Debug for Txn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::None => write!(f, "Txn::None"),
            Self::Bogus => write!(f, "Txn::Bogus"),
            Self::Active(t) => write!(f, "Txn::Active({})", t.id()),
        }
    }
}

pub(crate) enum UndoEntry {
    /// Roll back an insert: remove the entry
    Uninsert { tree: Arc<Tree>, key: Bytes },
    /// Roll back an update: restore the previous value
    Unupdate {
        tree: Arc<Tree>,
        key: Bytes,
        old: Bytes,
    },
    /// Roll back a delete: replace the ghost with the previous value
    Undelete {
        tree: Arc<Tree>,
        key: Bytes,
        old: Bytes,
    },
}

#[derive(Default)]
struct TxnInner {
    /// Every `(tree id, key, hash)` this transaction holds a lock on, in
    /// acquisition order
    locks: Vec<(u64, Bytes, u64)>,
    undo: Vec<UndoEntry>,
    /// Keys ghosted by this transaction, physically reclaimed at commit
    ghosts: Vec<(Arc<Tree>, Bytes)>,
    /// Highest redo position this transaction must sync to on commit
    commit_pos: u64,
    finished: bool,
}

/// A transaction. Locks are owned by the transaction id and released on
/// commit or rollback; writes push undo entries so rollback can restore
/// the pre-image
pub struct Transaction {
    db: Arc<DbCore>,
    id: TxnId,
    mode: LockMode,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    pub(crate) fn new(db: Arc<DbCore>, id: TxnId, mode: LockMode) -> Self {
        Self {
            db,
            id,
            mode,
            inner: Mutex::new(TxnInner::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> TxnId {
        self.id
    }
    #[inline]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub(crate) fn note_lock(&self, tree_id: u64, key: Bytes, hash: u64) {
        let mut inner = self.inner.lock();
        if !inner
            .locks
            .iter()
            .any(|(t, k, _)| *t == tree_id && k == &key)
        {
            inner.locks.push((tree_id, key, hash));
        }
    }

    pub(crate) fn push_uninsert(&self, tree: Arc<Tree>, key: Bytes) {
        self.inner.lock().undo.push(UndoEntry::Uninsert { tree, key });
    }

    pub(crate) fn push_unupdate(&self, tree: Arc<Tree>, key: Bytes, old: Bytes) {
        self.inner
            .lock()
            .undo
            .push(UndoEntry::Unupdate { tree, key, old });
    }

    pub(crate) fn push_undelete(&self, tree: Arc<Tree>, key: Bytes, old: Bytes) {
        let mut inner = self.inner.lock();
        inner.ghosts.push((tree.clone(), key.clone()));
        inner.undo.push(UndoEntry::Undelete { tree, key, old });
    }

    pub(crate) fn observe_commit_pos(&self, pos: u64) {
        let mut inner = self.inner.lock();
        if pos > inner.commit_pos {
            inner.commit_pos = pos;
        }
    }

    /// Commit: seal the redo log, wait out the durability mode, physically
    /// reclaim ghosts, then release every lock
    pub fn commit(&self) -> EngineResult<()> {
        self.db.check_open()?;
        let (pos, ghosts) = {
            let mut inner = self.inner.lock();
            if inner.finished {
                return Ok(());
            }
            inner.finished = true;
            (inner.commit_pos, core::mem::take(&mut inner.ghosts))
        };
        let sealed = self.db.redo.commit_record(self.id, pos)?;
        self.db.redo.txn_commit_sync(sealed, -1)?;
        for (tree, key) in ghosts {
            let mut cursor = Cursor::new(tree, Txn::Bogus);
            cursor.delete_ghost(&key)?;
            cursor.reset();
        }
        self.release_locks();
        self.inner.lock().undo.clear();
        Ok(())
    }

    /// Roll back: apply the undo log in reverse, then release every lock
    pub fn rollback(&self) -> EngineResult<()> {
        self.db.check_open()?;
        let undo = {
            let mut inner = self.inner.lock();
            if inner.finished {
                return Ok(());
            }
            inner.finished = true;
            inner.ghosts.clear();
            core::mem::take(&mut inner.undo)
        };
        for entry in undo.into_iter().rev() {
            match entry {
                UndoEntry::Uninsert { tree, key } => {
                    let mut cursor = Cursor::new(tree, Txn::Bogus);
                    cursor.find(&key)?;
                    cursor.store(None)?;
                    cursor.reset();
                }
                UndoEntry::Unupdate { tree, key, old } | UndoEntry::Undelete { tree, key, old } => {
                    let mut cursor = Cursor::new(tree, Txn::Bogus);
                    cursor.find(&key)?;
                    cursor.store(Some(&old[..]))?;
                    cursor.reset();
                }
            }
        }
        self.release_locks();
        Ok(())
    }

    fn release_locks(&self) {
        let locks = core::mem::take(&mut self.inner.lock().locks);
        for (tree_id, key, hash) in locks.into_iter().rev() {
            self.db.locks.unlock(self.id, tree_id, &key, hash);
        }
        self.db.locks.retire(self.id);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let finished = self.inner.lock().finished;
        if !finished {
            // an abandoned transaction must not pin locks forever
            if let Err(e) = self.rollback() {
                log::error!("rollback of abandoned txn {} failed: {e}", self.id);
            }
        }
    }
}

impl core::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish()
    }
}

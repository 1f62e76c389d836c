/*
 * Created on Sun Mar 16 2025
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

//! # The lock manager
//!
//! Key-level locks keyed by `(tree id, key)`, sharded by hash. Three lock
//! strengths: shared, upgradable (coexists with shared, excludes other
//! upgradables) and exclusive. Lock acquisition takes a timeout in
//! nanoseconds; `-1` waits forever and `0` never blocks.
//!
//! Waiters register in a wait-for graph before parking; a cycle through the
//! requester aborts the acquisition with a deadlock error. Zero-timeout
//! try-paths swallow the deadlock and report plain unavailability instead:
//! the caller only wanted a peek.

use crate::error::{EngineError, EngineResult};
use ahash::RandomState;
use bytes::Bytes;
use core::hash::{BuildHasher, Hash, Hasher};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

typedef! {
    pub TxnId = u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Upgradable,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    OwnedAlready,
    /// Only reported by zero-timeout probes
    Unavailable,
}

#[derive(Default)]
struct LockEntry {
    exclusive: TxnId,
    upgradable: TxnId,
    shared: Vec<TxnId>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.exclusive == 0 && self.upgradable == 0 && self.shared.is_empty()
    }
    fn owners(&self, excluding: TxnId) -> Vec<TxnId> {
        let mut v = Vec::new();
        if self.exclusive != 0 && self.exclusive != excluding {
            v.push(self.exclusive);
        }
        if self.upgradable != 0 && self.upgradable != excluding {
            v.push(self.upgradable);
        }
        for &s in &self.shared {
            if s != excluding {
                v.push(s);
            }
        }
        v
    }
}

enum Grant {
    Granted,
    Owned,
    Conflict,
}

struct LockShard {
    map: Mutex<HashMap<(u64, Bytes), LockEntry>>,
    cond: Condvar,
}

pub struct LockManager {
    shards: Box<[LockShard]>,
    hasher: RandomState,
    /// waiter → the owners it is parked on
    waits: Mutex<HashMap<TxnId, Vec<TxnId>>>,
}

impl LockManager {
    pub fn new() -> Self {
        let count = (num_cpus::get() * 4).next_power_of_two();
        let shards = (0..count)
            .map(|_| LockShard {
                map: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: RandomState::new(),
            waits: Mutex::new(HashMap::new()),
        }
    }

    /// Hash for `(tree id, key)`, used to pick the shard and exposed so
    /// cursors can compute it lazily once per key
    pub fn hash(&self, tree_id: u64, key: &[u8]) -> u64 {
        let mut state = self.hasher.build_hasher();
        tree_id.hash(&mut state);
        key.hash(&mut state);
        state.finish()
    }

    #[inline]
    fn shard_for(&self, hash: u64) -> &LockShard {
        &self.shards[hash as usize & (self.shards.len() - 1)]
    }

    fn classify(entry: &LockEntry, locker: TxnId, ty: LockType) -> Grant {
        match ty {
            LockType::Shared => {
                if entry.exclusive == locker
                    || entry.upgradable == locker
                    || entry.shared.contains(&locker)
                {
                    Grant::Owned
                } else if entry.exclusive != 0 {
                    Grant::Conflict
                } else {
                    Grant::Granted
                }
            }
            LockType::Upgradable => {
                if entry.upgradable == locker || entry.exclusive == locker {
                    Grant::Owned
                } else if entry.exclusive != 0 || entry.upgradable != 0 {
                    Grant::Conflict
                } else {
                    Grant::Granted
                }
            }
            LockType::Exclusive => {
                if entry.exclusive == locker {
                    Grant::Owned
                } else if entry.exclusive != 0 {
                    Grant::Conflict
                } else if entry.upgradable != 0 && entry.upgradable != locker {
                    Grant::Conflict
                } else if entry.shared.iter().any(|&s| s != locker) {
                    Grant::Conflict
                } else {
                    Grant::Granted
                }
            }
        }
    }

    fn grant(entry: &mut LockEntry, locker: TxnId, ty: LockType) {
        match ty {
            LockType::Shared => entry.shared.push(locker),
            LockType::Upgradable => entry.upgradable = locker,
            LockType::Exclusive => {
                entry.exclusive = locker;
                entry.shared.retain(|&s| s != locker);
            }
        }
    }

    /// Would a shared acquisition by `locker` succeed right now, without
    /// taking anything?
    pub fn is_lock_available(&self, locker: TxnId, tree_id: u64, key: &[u8], hash: u64) -> bool {
        let shard = self.shard_for(hash);
        let map = shard.map.lock();
        match map.get(&(tree_id, Bytes::copy_from_slice(key))) {
            None => true,
            Some(entry) => !matches!(
                Self::classify(entry, locker, LockType::Shared),
                Grant::Conflict
            ),
        }
    }

    /// Acquire `ty` on `(tree_id, key)` for `locker`, waiting up to
    /// `timeout_nanos` (`-1` = forever, `0` = never)
    pub fn try_lock(
        &self,
        locker: TxnId,
        ty: LockType,
        tree_id: u64,
        key: &Bytes,
        hash: u64,
        timeout_nanos: i64,
    ) -> EngineResult<LockAttempt> {
        debug_assert!(locker != 0);
        let shard = self.shard_for(hash);
        let deadline = match timeout_nanos {
            -1 => None,
            n => Some(Instant::now() + Duration::from_nanos(n.max(0) as u64)),
        };
        let map_key = (tree_id, key.clone());
        let mut map = shard.map.lock();
        loop {
            let entry = map.entry(map_key.clone()).or_default();
            match Self::classify(entry, locker, ty) {
                Grant::Owned => {
                    if entry.is_free() {
                        map.remove(&map_key);
                    }
                    return Ok(LockAttempt::OwnedAlready);
                }
                Grant::Granted => {
                    Self::grant(entry, locker, ty);
                    self.waits.lock().remove(&locker);
                    return Ok(LockAttempt::Acquired);
                }
                Grant::Conflict => {
                    if timeout_nanos == 0 {
                        if entry.is_free() {
                            map.remove(&map_key);
                        }
                        return Ok(LockAttempt::Unavailable);
                    }
                    let owners = entry.owners(locker);
                    self.waits.lock().insert(locker, owners);
                    if self.cycles_back_to(locker) {
                        self.waits.lock().remove(&locker);
                        return Err(EngineError::Deadlock { tree_id });
                    }
                    let timed_out = match deadline {
                        None => {
                            shard.cond.wait(&mut map);
                            false
                        }
                        Some(dl) => shard.cond.wait_until(&mut map, dl).timed_out(),
                    };
                    if timed_out {
                        self.waits.lock().remove(&locker);
                        return Err(EngineError::LockTimeout {
                            tree_id,
                            timeout_nanos,
                        });
                    }
                }
            }
        }
    }

    /// Release whatever `locker` holds on the key
    pub fn unlock(&self, locker: TxnId, tree_id: u64, key: &Bytes, hash: u64) {
        let shard = self.shard_for(hash);
        let mut map = shard.map.lock();
        let map_key = (tree_id, key.clone());
        if let Some(entry) = map.get_mut(&map_key) {
            if entry.exclusive == locker {
                entry.exclusive = 0;
            }
            if entry.upgradable == locker {
                entry.upgradable = 0;
            }
            entry.shared.retain(|&s| s != locker);
            if entry.is_free() {
                map.remove(&map_key);
            }
        }
        drop(map);
        shard.cond.notify_all();
    }

    /// Downgrade an exclusive hold back to upgradable
    pub fn unlock_to_upgradable(&self, locker: TxnId, tree_id: u64, key: &Bytes, hash: u64) {
        let shard = self.shard_for(hash);
        let mut map = shard.map.lock();
        if let Some(entry) = map.get_mut(&(tree_id, key.clone())) {
            if entry.exclusive == locker {
                entry.exclusive = 0;
                entry.upgradable = locker;
            }
        }
        drop(map);
        shard.cond.notify_all();
    }

    /// DFS through the wait-for graph looking for a cycle containing `start`
    fn cycles_back_to(&self, start: TxnId) -> bool {
        let waits = self.waits.lock();
        let mut stack: Vec<TxnId> = waits.get(&start).cloned().unwrap_or_default();
        let mut seen = Vec::new();
        while let Some(t) = stack.pop() {
            if t == start {
                return true;
            }
            if seen.contains(&t) {
                continue;
            }
            seen.push(t);
            if let Some(next) = waits.get(&t) {
                stack.extend_from_slice(next);
            }
        }
        false
    }

    /// Forget any parked-waiter bookkeeping for a finished transaction
    pub fn retire(&self, locker: TxnId) {
        self.waits.lock().remove(&locker);
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

cfg_test! {
    mod tests {
        use super::*;
        use std::sync::Arc;
        use std::thread;

        fn key(s: &str) -> Bytes {
            Bytes::copy_from_slice(s.as_bytes())
        }

        #[test]
        fn shared_locks_coexist() {
            let mgr = LockManager::new();
            let k = key("k");
            let h = mgr.hash(1, &k);
            assert_eq!(
                mgr.try_lock(10, LockType::Shared, 1, &k, h, 0).unwrap(),
                LockAttempt::Acquired
            );
            assert_eq!(
                mgr.try_lock(11, LockType::Shared, 1, &k, h, 0).unwrap(),
                LockAttempt::Acquired
            );
            assert_eq!(
                mgr.try_lock(10, LockType::Shared, 1, &k, h, 0).unwrap(),
                LockAttempt::OwnedAlready
            );
        }

        #[test]
        fn exclusive_excludes_and_releases() {
            let mgr = LockManager::new();
            let k = key("k");
            let h = mgr.hash(1, &k);
            assert_eq!(
                mgr.try_lock(10, LockType::Exclusive, 1, &k, h, 0).unwrap(),
                LockAttempt::Acquired
            );
            assert_eq!(
                mgr.try_lock(11, LockType::Shared, 1, &k, h, 0).unwrap(),
                LockAttempt::Unavailable
            );
            assert!(!mgr.is_lock_available(11, 1, &k, h));
            mgr.unlock(10, 1, &k, h);
            assert!(mgr.is_lock_available(11, 1, &k, h));
        }

        #[test]
        fn upgradable_upgrade_path() {
            let mgr = LockManager::new();
            let k = key("k");
            let h = mgr.hash(1, &k);
            assert_eq!(
                mgr.try_lock(10, LockType::Upgradable, 1, &k, h, 0).unwrap(),
                LockAttempt::Acquired
            );
            // shared readers still welcome
            assert_eq!(
                mgr.try_lock(11, LockType::Shared, 1, &k, h, 0).unwrap(),
                LockAttempt::Acquired
            );
            // but not a second upgradable
            assert_eq!(
                mgr.try_lock(12, LockType::Upgradable, 1, &k, h, 0).unwrap(),
                LockAttempt::Unavailable
            );
            // upgrade blocked by the reader
            assert_eq!(
                mgr.try_lock(10, LockType::Exclusive, 1, &k, h, 0).unwrap(),
                LockAttempt::Unavailable
            );
            mgr.unlock(11, 1, &k, h);
            assert_eq!(
                mgr.try_lock(10, LockType::Exclusive, 1, &k, h, 0).unwrap(),
                LockAttempt::Acquired
            );
            mgr.unlock_to_upgradable(10, 1, &k, h);
            assert_eq!(
                mgr.try_lock(11, LockType::Shared, 1, &k, h, 0).unwrap(),
                LockAttempt::Acquired
            );
        }

        #[test]
        fn lock_timeout_fires() {
            let mgr = LockManager::new();
            let k = key("k");
            let h = mgr.hash(1, &k);
            mgr.try_lock(10, LockType::Exclusive, 1, &k, h, 0).unwrap();
            let err = mgr
                .try_lock(11, LockType::Exclusive, 1, &k, h, 20_000_000)
                .unwrap_err();
            assert!(matches!(err, EngineError::LockTimeout { .. }));
        }

        #[test]
        fn blocked_writer_wakes_on_release() {
            let mgr = Arc::new(LockManager::new());
            let k = key("k");
            let h = mgr.hash(1, &k);
            mgr.try_lock(10, LockType::Exclusive, 1, &k, h, 0).unwrap();
            let m2 = mgr.clone();
            let k2 = k.clone();
            let t = thread::spawn(move || {
                m2.try_lock(11, LockType::Exclusive, 1, &k2, h, -1).unwrap()
            });
            thread::sleep(Duration::from_millis(20));
            mgr.unlock(10, 1, &k, h);
            assert_eq!(t.join().unwrap(), LockAttempt::Acquired);
        }

        #[test]
        fn deadlock_detected() {
            let mgr = Arc::new(LockManager::new());
            let (ka, kb) = (key("a"), key("b"));
            let (ha, hb) = (mgr.hash(1, &ka), mgr.hash(1, &kb));
            mgr.try_lock(10, LockType::Exclusive, 1, &ka, ha, 0).unwrap();
            mgr.try_lock(11, LockType::Exclusive, 1, &kb, hb, 0).unwrap();
            let m2 = mgr.clone();
            let kb2 = kb.clone();
            let t = thread::spawn(move || {
                // txn 10 waits for b (held by 11)
                m2.try_lock(10, LockType::Exclusive, 1, &kb2, hb, -1)
            });
            thread::sleep(Duration::from_millis(20));
            // txn 11 wants a (held by 10): cycle
            let r = mgr.try_lock(11, LockType::Exclusive, 1, &ka, ha, 1_000_000_000);
            assert!(matches!(r, Err(EngineError::Deadlock { .. })));
            // let the parked waiter through
            mgr.unlock(11, 1, &kb, hb);
            assert_eq!(t.join().unwrap().unwrap(), LockAttempt::Acquired);
        }
    }
}

/*
 * Created on Thu Mar 20 2025
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

//! # The redo log
//!
//! Mutations append CRC-framed records *before* the page is touched, while the
//! leaf is exclusively latched and the commit lock is held shared. That
//! ordering gives a total order of durable writes. The returned position is
//! awaited **outside** both the latch and the commit lock
//! ([`RedoLog::txn_commit_sync`]), per the suspension-point rules.
//!
//! Record frame:
//!
//! ```text
//! [len u32][crc u32][op u8][tree u64][txn u64][klen u32][key][vlen u32][value]
//! ```
//!
//! `vlen == u32::MAX` encodes a delete. The CRC (Castagnoli) covers everything
//! after the crc field. Records also stream into the configured
//! [`ReplicationStream`], which is where real durability lives; the in-process
//! buffer is the recovery source of last resort.

use crate::config::DurabilityMode;
use crate::error::EngineResult;
use crate::repl::ReplicationStream;
use crate::txn::TxnId;
use crc::{Crc, CRC_32_ISCSI};
use parking_lot::Mutex;
use std::sync::Arc;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

consts! {
    OP_STORE: u8 = 1;
    OP_DELETE: u8 = 2;
    OP_STORE_NO_LOCK: u8 = 3;
    OP_COMMIT: u8 = 4;
    DELETE_SENTINEL: u32 = u32::MAX;
}

struct RedoState {
    buf: Vec<u8>,
    pos: u64,
}

pub struct RedoLog {
    durability: DurabilityMode,
    replicator: Option<Arc<dyn ReplicationStream>>,
    state: Mutex<RedoState>,
}

impl RedoLog {
    pub fn new(durability: DurabilityMode, replicator: Option<Arc<dyn ReplicationStream>>) -> Self {
        Self {
            durability,
            replicator,
            state: Mutex::new(RedoState {
                buf: Vec::new(),
                pos: 0,
            }),
        }
    }

    #[inline]
    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    /// Current end-of-log position
    pub fn position(&self) -> u64 {
        self.state.lock().pos
    }

    fn append(
        &self,
        op: u8,
        tree_id: u64,
        txn: TxnId,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> EngineResult<u64> {
        if self.durability == DurabilityMode::NoRedo {
            return Ok(0);
        }
        let mut payload = Vec::with_capacity(21 + key.len() + value.map_or(0, <[u8]>::len) + 4);
        payload.push(op);
        payload.extend_from_slice(&tree_id.to_le_bytes());
        payload.extend_from_slice(&txn.to_le_bytes());
        payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
        payload.extend_from_slice(key);
        match value {
            Some(v) => {
                payload.extend_from_slice(&(v.len() as u32).to_le_bytes());
                payload.extend_from_slice(v);
            }
            None => payload.extend_from_slice(&DELETE_SENTINEL.to_le_bytes()),
        }
        let crc = CRC32.checksum(&payload);
        let mut state = self.state.lock();
        state
            .buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        state.buf.extend_from_slice(&crc.to_le_bytes());
        state.buf.extend_from_slice(&payload);
        state.pos += 8 + payload.len() as u64;
        let pos = state.pos;
        if let Some(repl) = &self.replicator {
            repl.write(&state.buf[state.buf.len() - (8 + payload.len())..])?;
        }
        Ok(pos)
    }

    /// Append a store record for a locked key. Returns the commit position
    pub fn redo_store(
        &self,
        tree_id: u64,
        txn: TxnId,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> EngineResult<u64> {
        let op = if value.is_some() { OP_STORE } else { OP_DELETE };
        self.append(op, tree_id, txn, key, value)
    }

    /// Append a store record that was never covered by a key lock
    pub fn redo_store_no_lock(
        &self,
        tree_id: u64,
        txn: TxnId,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> EngineResult<u64> {
        self.append(OP_STORE_NO_LOCK, tree_id, txn, key, value)
    }

    /// Seal a transaction; `high_water` is the highest position the txn wrote
    pub fn commit_record(&self, txn: TxnId, high_water: u64) -> EngineResult<u64> {
        let pos = self.append(OP_COMMIT, 0, txn, &[], None)?;
        if let Some(repl) = &self.replicator {
            let confirm = repl.commit()?;
            return Ok(confirm.max(high_water));
        }
        Ok(pos.max(high_water))
    }

    /// Wait until `pos` is as durable as the configured mode demands.
    /// Must be called without holding any latch or the commit lock
    pub fn txn_commit_sync(&self, pos: u64, timeout_nanos: i64) -> EngineResult<()> {
        if self.durability == DurabilityMode::NoRedo || pos == 0 {
            return Ok(());
        }
        match (&self.replicator, self.durability) {
            (Some(repl), DurabilityMode::Sync) => repl.sync_confirm(pos, timeout_nanos),
            (Some(repl), DurabilityMode::NoSync) => repl.confirm(pos, timeout_nanos),
            _ => Ok(()),
        }
    }

    cfg_test! {
        pub fn raw_len(&self) -> usize {
            self.state.lock().buf.len()
        }
        pub fn verify_frames(&self) -> bool {
            let state = self.state.lock();
            let buf = &state.buf;
            let mut off = 0usize;
            while off + 8 <= buf.len() {
                let len = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
                    as usize;
                let crc = u32::from_le_bytes([
                    buf[off + 4],
                    buf[off + 5],
                    buf[off + 6],
                    buf[off + 7],
                ]);
                if off + 8 + len > buf.len() {
                    return false;
                }
                if CRC32.checksum(&buf[off + 8..off + 8 + len]) != crc {
                    return false;
                }
                off += 8 + len;
            }
            off == buf.len()
        }
    }
}

impl core::fmt::Debug for RedoLog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedoLog")
            .field("durability", &self.durability)
            .field("pos", &self.position())
            .finish()
    }
}

cfg_test! {
    mod tests {
        use super::*;

        #[test]
        fn positions_are_monotonic_and_frames_check_out() {
            let log = RedoLog::new(DurabilityMode::NoFlush, None);
            let p1 = log.redo_store(1, 7, b"alpha", Some(b"one")).unwrap();
            let p2 = log.redo_store(1, 7, b"beta", None).unwrap();
            let p3 = log.commit_record(7, p2).unwrap();
            assert!(p1 < p2 && p2 < p3);
            assert!(log.verify_frames());
            log.txn_commit_sync(p3, -1).unwrap();
        }

        #[test]
        fn no_redo_mode_writes_nothing() {
            let log = RedoLog::new(DurabilityMode::NoRedo, None);
            assert_eq!(log.redo_store(1, 7, b"k", Some(b"v")).unwrap(), 0);
            assert_eq!(log.raw_len(), 0);
        }
    }
}

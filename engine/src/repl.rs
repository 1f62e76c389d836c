/*
 * Created on Mon Feb 17 2025
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

//! # Replication glue
//!
//! The engine never implements a transport. A replication manager plugs in
//! here: the redo log streams committed records into the [`ReplicationStream`]
//! and recovery replays from it. Log positions are 64-bit, non-negative and
//! non-decreasing.

use crate::error::EngineResult;

/// Callback target during [`ReplicationStream::recover`]
pub trait RecoveryListener: Send {
    /// A replayable record was read back from the stream
    fn replay(&mut self, record: &[u8]) -> EngineResult<()>;
}

/// A log-position-based replication transport.
///
/// Writer-side methods (`write`, `commit`, `confirm`) are only called by the
/// current leader; `read` returning `None` signals a leadership change to a
/// replica applier.
pub trait ReplicationStream: Send + Sync {
    /// Start streaming at the given log position
    fn start(&self, position: u64) -> EngineResult<()>;
    /// Replay locally durable records into the listener, returning the
    /// position recovery ended at
    fn recover(&self, listener: &mut dyn RecoveryListener) -> EngineResult<u64>;
    /// Lowest position that may still be read
    fn read_position(&self) -> u64;
    /// Position the next write will be assigned
    fn write_position(&self) -> u64;
    /// Read from the stream; `None` indicates a leadership change
    fn read(&self, buf: &mut [u8]) -> EngineResult<Option<usize>>;
    /// Switch the local role between reader and writer
    fn flip(&self) -> EngineResult<()>;
    /// Append raw record bytes
    fn write(&self, buf: &[u8]) -> EngineResult<()>;
    /// Seal everything written so far; returns the confirmation position
    fn commit(&self) -> EngineResult<u64>;
    /// Wait until the given position is confirmed by the transport.
    /// `timeout_nanos` follows the engine convention: `-1` waits forever
    fn confirm(&self, position: u64, timeout_nanos: i64) -> EngineResult<()>;
    /// Make locally buffered records durable
    fn sync(&self) -> EngineResult<()>;
    /// `sync` then `confirm`
    fn sync_confirm(&self, position: u64, timeout_nanos: i64) -> EngineResult<()> {
        self.sync()?;
        self.confirm(position, timeout_nanos)
    }
}

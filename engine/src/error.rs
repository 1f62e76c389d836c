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

use core::fmt;
use std::io::Error as IoError;

pub type EngineResult<T> = Result<T, EngineError>;

pub trait ErrorContext<T> {
    /// Provide some context to an error
    fn map_err_context(self, extra: impl ToString) -> EngineResult<T>;
}

impl<T> ErrorContext<T> for Result<T, IoError> {
    fn map_err_context(self, extra: impl ToString) -> EngineResult<T> {
        self.map_err(|e| EngineError::ioerror_extra(e, extra.to_string()))
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// The cursor is not positioned at an entry
    Unpositioned,
    /// An empty key was passed where a key is required
    NullKey,
    /// A caller-supplied argument is out of range
    BadArgument(&'static str),
    /// A key lock could not be acquired within the configured timeout
    LockTimeout {
        tree_id: u64,
        timeout_nanos: i64,
    },
    /// The lock manager detected a cycle in the wait-for graph
    Deadlock {
        tree_id: u64,
    },
    /// The database has been closed; carries the recorded cause, if any
    Closed(Option<String>),
    /// A page or record failed a structural or checksum validation
    Corrupted(String),
    /// The key exceeds the fragmented-key budget for this page size
    LargeKey(usize),
    /// The operation has no defined behavior (see DESIGN.md)
    Unsupported(&'static str),
    /// An I/O error
    IoError(IoError),
    /// An I/O error with extra context
    IoErrorExtra(IoError, String),
}

impl EngineError {
    pub fn corrupted_page(id: u64, what: &str) -> Self {
        Self::Corrupted(format!("page {id}: {what}"))
    }
    pub fn ioerror_extra(ioe: IoError, extra: impl ToString) -> Self {
        Self::IoErrorExtra(ioe, extra.to_string())
    }
    /// Is this failure fatal for the database if raised while mutating under
    /// the commit lock?
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Corrupted(_) | Self::IoError(_) | Self::IoErrorExtra(_, _)
        )
    }
}

impl From<IoError> for EngineError {
    fn from(ioe: IoError) -> Self {
        Self::IoError(ioe)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unpositioned => write!(f, "cursor is not positioned"),
            Self::NullKey => write!(f, "empty key"),
            Self::BadArgument(a) => write!(f, "bad argument: {a}"),
            Self::LockTimeout {
                tree_id,
                timeout_nanos,
            } => write!(
                f,
                "lock acquisition timed out after {timeout_nanos}ns (tree {tree_id})"
            ),
            Self::Deadlock { tree_id } => write!(f, "deadlock detected (tree {tree_id})"),
            Self::Closed(Some(cause)) => write!(f, "database closed: {cause}"),
            Self::Closed(None) => write!(f, "database closed"),
            Self::Corrupted(c) => write!(f, "corruption detected: {c}"),
            Self::LargeKey(len) => write!(f, "key of {len} bytes exceeds the key budget"),
            Self::Unsupported(op) => write!(f, "operation `{op}` is not supported"),
            Self::IoError(ioe) => write!(f, "I/O error: {}", ioe),
            Self::IoErrorExtra(ioe, extra) => write!(f, "I/O error while {extra}: {ioe}"),
        }
    }
}

/*
 * Created on Tue Feb 11 2025
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

//! # Loam
//!
//! Loam is an embedded, transactional, ordered key/value storage engine built
//! on a concurrent, latch-coupled B+tree over a paged store. It is a library:
//! no server, no CLI, no environment variables. Open a [`Database`] with an
//! [`EngineConfig`], grab a [`Tree`], drive it through a [`Cursor`]:
//!
//! ```no_run
//! use loamdb::{Database, EngineConfig, Txn};
//!
//! let db = Database::open(EngineConfig::new().page_size(4096)).unwrap();
//! let tree = db.open_tree("default").unwrap();
//! let mut cursor = tree.cursor(Txn::None);
//! cursor.find_and_store(b"hello", Some(b"world".as_slice())).unwrap();
//! assert!(cursor.find(b"hello").unwrap());
//! ```
//!
//! Concurrency is latch-per-page with hand-over-hand coupling; logical
//! isolation comes from the key lock manager; durability hands off to the
//! redo log (and a pluggable replication stream). See the modules for their
//! respective documentation.

#[macro_use]
pub mod util;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod redo;
pub mod repl;
pub mod sync;
pub mod tree;
pub mod txn;

pub use config::{DurabilityMode, EngineConfig};
pub use db::Database;
pub use error::{EngineError, EngineResult};
pub use tree::cursor::{CompactObserver, Cursor, Modify, Value};
pub use tree::{Tree, VerifyObserver};
pub use txn::{LockMode, Transaction, Txn};

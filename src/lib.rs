//! lumodb: an embedded, memory-mapped, copy-on-write key/value store.
//!
//! One [`Environment`] owns a data file. Any number of read-only
//! [`Transaction`]s see stable snapshots while a single writer prepares the
//! next commit. Keys are kept sorted in a B+tree per [`Database`] and can be
//! walked with a [`Cursor`].

mod btree;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod meta;
mod midl;
mod page;
mod store;
mod transaction;
mod types;

pub use constants::{DbFlags, EnvFlags, TransactionFlags, WriteFlags, MAX_KEY_SIZE, PAGE_SIZE};
pub use cursor::{Cursor, Iter, RwCursor};
pub use database::{CompareFn, Database};
pub use env::{Environment, MDB_VERSION};
pub use error::{Error, Result};
pub use meta::{PageId, ReaderInfo, TxnId};
pub use transaction::Transaction;
pub use types::{CursorOp, EnvInfo, Stat};

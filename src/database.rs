use std::cmp::Ordering;

use crate::constants::{DbFlags, WriteFlags, MAIN_DBI, MAX_KEY_SIZE};
use crate::cursor::{Cursor, RwCursor};
use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::transaction::Transaction;
use crate::types::Stat;

/// Key comparison function for a database.
pub type CompareFn = fn(&[u8], &[u8]) -> Ordering;

/// Database handle
///
/// A plain number naming a database inside its environment. Handles stay
/// valid for the lifetime of the environment; the data they point at is
/// resolved separately by every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Database {
    /// Database identifier
    dbi: u32,
}

impl Database {
    /// The unnamed main database
    pub const MAIN: Database = Database { dbi: MAIN_DBI };

    pub(crate) fn from_dbi(dbi: u32) -> Self {
        Database { dbi }
    }

    /// Open a database in the environment
    pub fn open(txn: &Transaction<'_>, name: Option<&str>, flags: DbFlags) -> Result<Self> {
        txn.open_db(name, flags)
    }

    /// Database identifier
    pub fn dbi(&self) -> u32 {
        self.dbi
    }

    pub(crate) fn index(&self) -> usize {
        self.dbi as usize
    }

    /// Get database statistics
    pub fn stat(&self, txn: &Transaction<'_>) -> Result<Stat> {
        txn.stat(*self)
    }

    /// Get database flags
    pub fn flags(&self, txn: &Transaction<'_>) -> Result<DbFlags> {
        txn.db_flags(*self)
    }

    /// Get a value by key
    pub fn get(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<Vec<u8>> {
        txn.get(*self, key)
    }

    /// Put a key/value pair
    pub fn put(&self, txn: &mut Transaction<'_>, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        txn.put(*self, key, data, flags)
    }

    /// Delete a key/value pair
    pub fn del(&self, txn: &mut Transaction<'_>, key: &[u8]) -> Result<()> {
        txn.del(*self, key)
    }

    /// Empty the database, or delete it altogether
    pub fn drop(&self, txn: &mut Transaction<'_>, delete: bool) -> Result<()> {
        txn.drop_db(*self, delete)
    }

    /// Create a cursor for this database
    pub fn cursor<'txn>(&self, txn: &'txn Transaction<'_>) -> Result<Cursor<'txn>> {
        txn.open_cursor(*self)
    }

    /// Create a cursor that can write through this database
    pub fn rw_cursor<'txn, 'env>(&self, txn: &'txn mut Transaction<'env>) -> Result<RwCursor<'txn, 'env>> {
        txn.open_rw_cursor(*self)
    }

    /// Set custom comparison function
    pub fn set_compare(&self, txn: &mut Transaction<'_>, cmp: CompareFn) -> Result<()> {
        txn.set_compare(*self, cmp)
    }
}

/// Database state as seen by one transaction.
#[derive(Debug, Clone)]
pub(crate) struct DbState {
    pub(crate) record: DbRecord,
    pub(crate) cmp: CompareFn,
    /// Record changed and must be stored at commit
    pub(crate) dirty: bool,
}

impl DbState {
    pub(crate) fn new(record: DbRecord, custom: Option<CompareFn>) -> Self {
        DbState {
            record,
            cmp: custom.unwrap_or_else(|| default_compare(record.flags)),
            dirty: false,
        }
    }

    /// Check a key against the size limits of this database.
    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(Error::BadValSize);
        }
        if self.record.flags.contains(DbFlags::INTEGERKEY) && key.len() != 4 && key.len() != 8 {
            return Err(Error::BadValSize);
        }
        Ok(())
    }
}

pub(crate) fn default_compare(flags: DbFlags) -> CompareFn {
    if flags.contains(DbFlags::INTEGERKEY) {
        cmp_integer
    } else if flags.contains(DbFlags::REVERSEKEY) {
        cmp_reverse
    } else {
        cmp_lexical
    }
}

pub(crate) fn cmp_lexical(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Compare from the last byte backwards.
pub(crate) fn cmp_reverse(a: &[u8], b: &[u8]) -> Ordering {
    a.iter().rev().cmp(b.iter().rev())
}

/// Compare native-endian `u32` or `u64` keys.
pub(crate) fn cmp_integer(a: &[u8], b: &[u8]) -> Ordering {
    match (a.len(), b.len()) {
        (4, 4) => {
            let x = u32::from_ne_bytes([a[0], a[1], a[2], a[3]]);
            let y = u32::from_ne_bytes([b[0], b[1], b[2], b[3]]);
            x.cmp(&y)
        }
        (8, 8) => {
            let mut x = [0u8; 8];
            let mut y = [0u8; 8];
            x.copy_from_slice(a);
            y.copy_from_slice(b);
            u64::from_ne_bytes(x).cmp(&u64::from_ne_bytes(y))
        }
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}

/// Names and comparators of the databases opened in an environment.
#[derive(Debug)]
pub(crate) struct DbRegistry {
    /// Indexed by dbi; slot 0 is the main database
    names: Vec<Option<String>>,
    compare: Vec<Option<CompareFn>>,
}

impl DbRegistry {
    pub(crate) fn new(max_dbs: u32) -> Self {
        let slots = max_dbs as usize + 1;
        DbRegistry {
            names: vec![None; slots],
            compare: vec![None; slots],
        }
    }

    /// Number of database slots, main database included.
    pub(crate) fn slots(&self) -> usize {
        self.names.len()
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|n| n.as_deref() == Some(name))
            .map(|dbi| dbi as u32)
    }

    pub(crate) fn name(&self, dbi: u32) -> Option<&str> {
        self.names.get(dbi as usize)?.as_deref()
    }

    /// Handle for `name`, assigning the next free one if it is new.
    pub(crate) fn assign(&mut self, name: &str) -> Result<u32> {
        if let Some(dbi) = self.lookup(name) {
            return Ok(dbi);
        }
        let slot = self.names[1..]
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| {
                log::warn!("no free database slot for {:?}", name);
                Error::DbsFull
            })?;
        let dbi = slot + 1;
        self.names[dbi] = Some(name.to_string());
        log::debug!("assigned dbi {} to {:?}", dbi, name);
        Ok(dbi as u32)
    }

    pub(crate) fn compare(&self, dbi: u32) -> Option<CompareFn> {
        self.compare.get(dbi as usize).copied().flatten()
    }

    pub(crate) fn set_compare(&mut self, dbi: u32, cmp: CompareFn) {
        if let Some(slot) = self.compare.get_mut(dbi as usize) {
            *slot = Some(cmp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_compare() {
        assert_eq!(cmp_reverse(b"ba", b"ab"), Ordering::Less);
        assert_eq!(cmp_reverse(b"a", b"ba"), Ordering::Less);
        assert_eq!(cmp_reverse(b"xy", b"xy"), Ordering::Equal);
    }

    #[test]
    fn test_integer_compare() {
        let a = 2u32.to_ne_bytes();
        let b = 256u32.to_ne_bytes();
        assert_eq!(cmp_integer(&a, &b), Ordering::Less);
        let c = 1u64.to_ne_bytes();
        let d = (1u64 << 40).to_ne_bytes();
        assert_eq!(cmp_integer(&d, &c), Ordering::Greater);
    }

    #[test]
    fn test_registry_assigns_stable_handles() {
        let mut reg = DbRegistry::new(2);
        assert_eq!(reg.assign("a").unwrap(), 1);
        assert_eq!(reg.assign("b").unwrap(), 2);
        assert_eq!(reg.assign("a").unwrap(), 1);
        assert!(matches!(reg.assign("c"), Err(Error::DbsFull)));
        assert_eq!(reg.name(2), Some("b"));
        assert_eq!(reg.lookup("c"), None);
    }

    #[test]
    fn test_check_key() {
        let state = DbState::new(DbRecord::empty(DbFlags::INTEGERKEY), None);
        assert!(state.check_key(&7u32.to_ne_bytes()).is_ok());
        assert!(matches!(state.check_key(b"abc"), Err(Error::BadValSize)));

        let plain = DbState::new(DbRecord::empty(DbFlags::empty()), None);
        assert!(matches!(plain.check_key(b""), Err(Error::BadValSize)));
        assert!(matches!(plain.check_key(&[0u8; 512]), Err(Error::BadValSize)));
    }
}

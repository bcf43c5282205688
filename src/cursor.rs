use bitflags::bitflags;

use crate::constants::{WriteFlags, P_INVALID};
use crate::database::{Database, DbState};
use crate::error::{Error, Result};
use crate::meta::PageId;
use crate::page::{NodeView, PageRead};
use crate::transaction::Transaction;
use crate::types::CursorOp;

bitflags! {
    /// Cursor state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct CursorFlags: u32 {
        const INITIALIZED = 0x01;
        const EOF = 0x02;
        const DELETED = 0x08;
    }
}

/// Position of a cursor: the path of `(page, index)` pairs from the root
/// down to a leaf entry.
#[derive(Debug, Default)]
pub(crate) struct CursorState {
    stack: Vec<(PageId, usize)>,
    flags: CursorFlags,
}

impl CursorState {
    fn reset(&mut self) {
        self.stack.clear();
        self.flags = CursorFlags::empty();
    }

    /// Walk down from `pgno` along the leftmost or rightmost edge.
    fn descend<P: PageRead + ?Sized>(&mut self, pages: &P, mut pgno: PageId, rightmost: bool) -> Result<()> {
        loop {
            let view = NodeView::new(pages.page(pgno)?)?;
            let idx = if rightmost {
                view.len().saturating_sub(1)
            } else {
                0
            };
            self.stack.push((pgno, idx));
            if view.is_leaf() {
                return Ok(());
            }
            pgno = view.child(idx)?;
        }
    }

    fn first<P: PageRead + ?Sized>(&mut self, pages: &P, root: PageId) -> Result<()> {
        self.reset();
        if root == P_INVALID {
            return Err(Error::NotFound);
        }
        self.descend(pages, root, false)?;
        self.flags = CursorFlags::INITIALIZED;
        Ok(())
    }

    fn last<P: PageRead + ?Sized>(&mut self, pages: &P, root: PageId) -> Result<()> {
        self.reset();
        if root == P_INVALID {
            return Err(Error::NotFound);
        }
        self.descend(pages, root, true)?;
        self.flags = CursorFlags::INITIALIZED;
        Ok(())
    }

    /// Position at the first key >= `key`. Returns whether it matched exactly.
    fn seek<P: PageRead + ?Sized>(
        &mut self,
        pages: &P,
        db: &DbState,
        key: &[u8],
    ) -> Result<bool> {
        self.reset();
        let mut pgno = db.record.root;
        if pgno == P_INVALID {
            return Err(Error::NotFound);
        }
        loop {
            let view = NodeView::new(pages.page(pgno)?)?;
            if !view.is_leaf() {
                let ci = view.child_index(key, db.cmp)?;
                self.stack.push((pgno, ci));
                pgno = view.child(ci)?;
                continue;
            }
            let (idx, exact) = view.search(key, db.cmp)?;
            self.flags = CursorFlags::INITIALIZED;
            if idx < view.len() {
                self.stack.push((pgno, idx));
                return Ok(exact);
            }
            // Every key of this leaf is smaller; the answer starts the next one.
            self.stack.push((pgno, view.len().saturating_sub(1)));
            return match self.step(pages, true) {
                Err(Error::NotFound) => {
                    self.flags.insert(CursorFlags::EOF);
                    Err(Error::NotFound)
                }
                other => other.map(|_| false),
            };
        }
    }

    /// Move one entry forward or back. The position is left alone at the ends.
    fn step<P: PageRead + ?Sized>(&mut self, pages: &P, forward: bool) -> Result<()> {
        let mut level = self.stack.len();
        while level > 0 {
            level -= 1;
            let (pgno, idx) = self.stack[level];
            let view = NodeView::new(pages.page(pgno)?)?;
            let next = if forward {
                if idx + 1 >= view.len() {
                    continue;
                }
                idx + 1
            } else {
                if idx == 0 {
                    continue;
                }
                idx - 1
            };
            self.stack.truncate(level);
            self.stack.push((pgno, next));
            if !view.is_leaf() {
                self.descend(pages, view.child(next)?, !forward)?;
            }
            return Ok(());
        }
        Err(Error::NotFound)
    }

    fn current<'p, P: PageRead + ?Sized>(&self, pages: &'p P) -> Result<(&'p [u8], &'p [u8])> {
        if !self.flags.contains(CursorFlags::INITIALIZED)
            || self.flags.intersects(CursorFlags::EOF | CursorFlags::DELETED)
        {
            return Err(Error::NotFound);
        }
        let &(pgno, idx) = self.stack.last().ok_or(Error::NotFound)?;
        let view = NodeView::new(pages.page(pgno)?)?;
        if idx >= view.len() {
            return Err(Error::NotFound);
        }
        Ok((view.key(idx)?, view.value(idx)?.resolve(pages)?))
    }

    /// Carry out `op` and return the pair the cursor ends up on.
    fn position<'p, P: PageRead + ?Sized>(
        &mut self,
        pages: &'p P,
        db: &DbState,
        key: Option<&[u8]>,
        op: CursorOp,
    ) -> Result<(&'p [u8], &'p [u8])> {
        let root = db.record.root;
        match op {
            CursorOp::First => self.first(pages, root)?,
            CursorOp::Last => self.last(pages, root)?,
            CursorOp::GetCurrent => {}
            CursorOp::Next => {
                if !self.flags.contains(CursorFlags::INITIALIZED) {
                    self.first(pages, root)?;
                } else if self.flags.contains(CursorFlags::EOF) {
                    return Err(Error::NotFound);
                } else if self.flags.contains(CursorFlags::DELETED) {
                    // Already on the entry that followed the deleted one.
                    self.flags.remove(CursorFlags::DELETED);
                } else if let Err(e) = self.step(pages, true) {
                    if matches!(e, Error::NotFound) {
                        self.flags.insert(CursorFlags::EOF);
                    }
                    return Err(e);
                }
            }
            CursorOp::Prev => {
                if !self.flags.contains(CursorFlags::INITIALIZED) {
                    self.last(pages, root)?;
                } else if self.flags.contains(CursorFlags::EOF) {
                    // Past the end the stack still points at the last entry.
                    self.flags.remove(CursorFlags::EOF | CursorFlags::DELETED);
                } else {
                    self.flags.remove(CursorFlags::DELETED);
                    self.step(pages, false)?;
                }
            }
            CursorOp::Set | CursorOp::SetKey => {
                let key = key.ok_or(Error::BadValSize)?;
                db.check_key(key)?;
                if !self.seek(pages, db, key)? {
                    self.reset();
                    return Err(Error::NotFound);
                }
            }
            CursorOp::SetRange => {
                let key = key.ok_or(Error::BadValSize)?;
                db.check_key(key)?;
                self.seek(pages, db, key)?;
            }
        }
        self.current(pages)
    }
}

/// Read cursor
///
/// Walks one database in key order. Keys and values borrow from the
/// transaction, so they stay valid after the cursor moves on.
#[derive(Debug)]
pub struct Cursor<'txn> {
    txn: &'txn Transaction<'txn>,
    db: Database,
    state: CursorState,
}

impl<'txn> Cursor<'txn> {
    pub(crate) fn new(txn: &'txn Transaction<'txn>, db: Database) -> Self {
        Cursor {
            txn,
            db,
            state: CursorState::default(),
        }
    }

    /// Database this cursor walks
    pub fn db(&self) -> Database {
        self.db
    }

    /// Position the cursor and return a copy of the pair there
    pub fn get(&mut self, key: Option<&[u8]>, op: CursorOp) -> Result<(Vec<u8>, Vec<u8>)> {
        let (k, v) = self.get_val(key, op)?;
        Ok((k.to_vec(), v.to_vec()))
    }

    /// Position the cursor and return the pair there without copying
    pub fn get_val(&mut self, key: Option<&[u8]>, op: CursorOp) -> Result<(&'txn [u8], &'txn [u8])> {
        let txn = self.txn;
        txn.check_active()?;
        let db = txn.db_state(self.db)?;
        self.state.position(txn, db, key, op)
    }

    pub fn first(&mut self) -> Result<(&'txn [u8], &'txn [u8])> {
        self.get_val(None, CursorOp::First)
    }

    pub fn last(&mut self) -> Result<(&'txn [u8], &'txn [u8])> {
        self.get_val(None, CursorOp::Last)
    }

    pub fn next(&mut self) -> Result<(&'txn [u8], &'txn [u8])> {
        self.get_val(None, CursorOp::Next)
    }

    pub fn prev(&mut self) -> Result<(&'txn [u8], &'txn [u8])> {
        self.get_val(None, CursorOp::Prev)
    }

    /// Position at `key` exactly
    pub fn set(&mut self, key: &[u8]) -> Result<(&'txn [u8], &'txn [u8])> {
        self.get_val(Some(key), CursorOp::Set)
    }

    /// Position at the first key greater than or equal to `key`
    pub fn set_range(&mut self, key: &[u8]) -> Result<(&'txn [u8], &'txn [u8])> {
        self.get_val(Some(key), CursorOp::SetRange)
    }

    pub fn get_current(&mut self) -> Result<(&'txn [u8], &'txn [u8])> {
        self.get_val(None, CursorOp::GetCurrent)
    }

    /// Iterate over every pair from the first key on
    pub fn iter(&mut self) -> Iter<'_, 'txn> {
        Iter {
            cursor: self,
            op: CursorOp::First,
            done: false,
        }
    }

    /// Iterate from the first key greater than or equal to `key`
    pub fn iter_from(&mut self, key: &[u8]) -> Iter<'_, 'txn> {
        let done = match self.set_range(key) {
            Ok(_) => false,
            Err(_) => true,
        };
        Iter {
            cursor: self,
            op: CursorOp::GetCurrent,
            done,
        }
    }

    /// Close the cursor
    pub fn close(self) {}
}

/// Iterator over the pairs of a [`Cursor`]
#[derive(Debug)]
pub struct Iter<'c, 'txn> {
    cursor: &'c mut Cursor<'txn>,
    op: CursorOp,
    done: bool,
}

impl<'txn> Iterator for Iter<'_, 'txn> {
    type Item = Result<(&'txn [u8], &'txn [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.cursor.get_val(None, self.op);
        self.op = CursorOp::Next;
        match item {
            Ok(pair) => Some(Ok(pair)),
            Err(Error::NotFound) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Cursor of a write transaction
///
/// Holds the transaction exclusively, so pairs it returns borrow the cursor
/// and must be dropped before the next write.
#[derive(Debug)]
pub struct RwCursor<'txn, 'env> {
    txn: &'txn mut Transaction<'env>,
    db: Database,
    state: CursorState,
}

impl<'txn, 'env> RwCursor<'txn, 'env> {
    pub(crate) fn new(txn: &'txn mut Transaction<'env>, db: Database) -> Self {
        RwCursor {
            txn,
            db,
            state: CursorState::default(),
        }
    }

    pub fn db(&self) -> Database {
        self.db
    }

    pub fn get(&mut self, key: Option<&[u8]>, op: CursorOp) -> Result<(Vec<u8>, Vec<u8>)> {
        let (k, v) = self.get_val(key, op)?;
        Ok((k.to_vec(), v.to_vec()))
    }

    pub fn get_val(&mut self, key: Option<&[u8]>, op: CursorOp) -> Result<(&[u8], &[u8])> {
        let txn: &Transaction<'env> = self.txn;
        txn.check_active()?;
        let db = txn.db_state(self.db)?;
        self.state.position(txn, db, key, op)
    }

    pub fn first(&mut self) -> Result<(&[u8], &[u8])> {
        self.get_val(None, CursorOp::First)
    }

    pub fn last(&mut self) -> Result<(&[u8], &[u8])> {
        self.get_val(None, CursorOp::Last)
    }

    pub fn next(&mut self) -> Result<(&[u8], &[u8])> {
        self.get_val(None, CursorOp::Next)
    }

    pub fn prev(&mut self) -> Result<(&[u8], &[u8])> {
        self.get_val(None, CursorOp::Prev)
    }

    pub fn set(&mut self, key: &[u8]) -> Result<(&[u8], &[u8])> {
        self.get_val(Some(key), CursorOp::Set)
    }

    pub fn set_range(&mut self, key: &[u8]) -> Result<(&[u8], &[u8])> {
        self.get_val(Some(key), CursorOp::SetRange)
    }

    pub fn get_current(&mut self) -> Result<(&[u8], &[u8])> {
        self.get_val(None, CursorOp::GetCurrent)
    }

    /// Store a pair and leave the cursor on it
    ///
    /// With `WriteFlags::CURRENT` the key must be the one under the cursor.
    pub fn put(&mut self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        if flags.contains(WriteFlags::CURRENT) {
            let txn: &Transaction<'env> = self.txn;
            let db = txn.db_state(self.db)?;
            let (current, _) = self.state.current(txn)?;
            if (db.cmp)(current, key) != std::cmp::Ordering::Equal {
                return Err(Error::Incompatible);
            }
        }
        self.txn.put(self.db, key, data, flags)?;
        let txn: &Transaction<'env> = self.txn;
        let db = txn.db_state(self.db)?;
        self.state.seek(txn, db, key)?;
        Ok(())
    }

    /// Delete the pair under the cursor
    ///
    /// The cursor moves to the following pair; `next` returns it and
    /// `get_current` fails with `NotFound` until the cursor is repositioned.
    pub fn del(&mut self) -> Result<()> {
        let key = {
            let txn: &Transaction<'env> = self.txn;
            self.state.current(txn)?.0.to_vec()
        };
        self.txn.del(self.db, &key)?;
        let txn: &Transaction<'env> = self.txn;
        let db = txn.db_state(self.db)?;
        match self.state.seek(txn, db, &key) {
            Ok(_) | Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.state.flags.insert(CursorFlags::DELETED);
        Ok(())
    }

    /// Close the cursor
    pub fn close(self) {}
}

use once_cell::unsync::OnceCell;

use crate::btree;
use crate::constants::{
    DbFlags, EnvFlags, NodeFlags, TransactionFlags, TxnState, WriteFlags, MAIN_DBI,
    MAX_KEY_SIZE,
};
use crate::cursor::{Cursor, RwCursor};
use crate::database::{CompareFn, Database, DbState};
use crate::env::{EnvInner, WriterGuard};
use crate::error::{Error, Result};
use crate::meta::{DbRecord, MetaHeader, PageId, TxnId};
use crate::page::PageRead;
use crate::store::{read_committed, PageStore, WritePages};
use crate::types::Stat;

/// Database transaction
///
/// Read-only transactions see the database as of the commit that was current
/// when they began. A write transaction holds the environment's writer slot
/// until it commits or aborts; [`begin_nested`](Transaction::begin_nested)
/// starts a child that borrows it.
#[derive(Debug)]
pub struct Transaction<'env> {
    env: &'env EnvInner,
    flags: TransactionFlags,
    status: TxnState,
    /// Transaction ID
    txn_id: TxnId,
    /// Meta this transaction started from
    snapshot: MetaHeader,
    kind: TxnKind<'env>,
}

#[derive(Debug)]
enum TxnKind<'env> {
    Read {
        /// Reader table slot; `None` once reset
        slot: Option<usize>,
        dbs: Vec<OnceCell<DbState>>,
    },
    Write {
        state: Box<WriteState>,
        _writer: WriterGuard<'env>,
    },
    Nested {
        state: &'env mut WriteState,
    },
}

/// Uncommitted state shared by a write transaction and its children.
#[derive(Debug)]
pub(crate) struct WriteState {
    store: PageStore,
    /// Database states, indexed by dbi
    dbs: Vec<OnceCell<DbState>>,
    /// Database states to restore when a child aborts
    saved_dbs: Vec<Vec<OnceCell<DbState>>>,
}

fn fresh_dbs(env: &EnvInner, meta: &MetaHeader) -> Vec<OnceCell<DbState>> {
    let registry = env.registry.read();
    (0..registry.slots())
        .map(|dbi| {
            if dbi == MAIN_DBI as usize {
                OnceCell::with_value(DbState::new(meta.main, registry.compare(MAIN_DBI)))
            } else {
                OnceCell::new()
            }
        })
        .collect()
}

impl<'env> Transaction<'env> {
    pub(crate) fn new_read(env: &'env EnvInner) -> Result<Self> {
        let (slot, meta) = env.register_reader()?;
        env.txn_started();
        log::debug!("begin read txn on snapshot {} (slot {})", meta.txn_id, slot);
        Ok(Transaction {
            env,
            flags: TransactionFlags::RDONLY,
            status: TxnState::empty(),
            txn_id: meta.txn_id,
            snapshot: meta,
            kind: TxnKind::Read {
                slot: Some(slot),
                dbs: fresh_dbs(env, &meta),
            },
        })
    }

    pub(crate) fn new_write(env: &'env EnvInner, wait: bool) -> Result<Self> {
        if env.flags().contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }
        let writer = env.lock_writer(wait)?;
        let (meta, free) = env.writer_snapshot();
        env.txn_started();
        let txn_id = meta.txn_id + 1;
        log::debug!("begin write txn {} ({} free pages)", txn_id, free.len());
        let state = WriteState {
            store: PageStore::new(free, meta.last_pgno, env.max_pgno()),
            dbs: fresh_dbs(env, &meta),
            saved_dbs: Vec::new(),
        };
        Ok(Transaction {
            env,
            flags: TransactionFlags::empty(),
            status: TxnState::empty(),
            txn_id,
            snapshot: meta,
            kind: TxnKind::Write {
                state: Box::new(state),
                _writer: writer,
            },
        })
    }

    /// Begin a child transaction
    ///
    /// The child sees everything this transaction wrote. Its changes are
    /// folded into this transaction on commit and discarded on abort.
    pub fn begin_nested(&mut self) -> Result<Transaction<'_>> {
        self.check_active()?;
        if self.is_readonly() {
            return Err(Error::Incompatible);
        }
        let env = self.env;
        let (txn_id, snapshot) = (self.txn_id, self.snapshot);
        let state = self.write_state()?;
        state.store.push_frame();
        state.saved_dbs.push(state.dbs.clone());
        log::debug!("begin nested txn at depth {}", state.store.depth());
        Ok(Transaction {
            env,
            flags: TransactionFlags::empty(),
            status: TxnState::empty(),
            txn_id,
            snapshot,
            kind: TxnKind::Nested { state },
        })
    }

    /// Transaction ID
    ///
    /// For a read-only transaction this is the ID of the commit it reads.
    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(TransactionFlags::RDONLY)
    }

    pub(crate) fn snapshot(&self) -> &MetaHeader {
        &self.snapshot
    }

    pub(crate) fn check_active(&self) -> Result<()> {
        if self.status.intersects(TxnState::FINISHED | TxnState::RESET) {
            return Err(Error::TxnFinished);
        }
        if self.status.contains(TxnState::ERROR) {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check_active()?;
        if self.is_readonly() {
            return Err(Error::TxnReadOnly);
        }
        Ok(())
    }

    /// Flag the transaction as failed if `result` is an error that may have
    /// left a write half done.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.poisons_txn() {
                log::warn!("txn {} failed: {}", self.txn_id, e);
                self.status.insert(TxnState::ERROR);
            }
        }
        result
    }

    fn store(&self) -> Option<&PageStore> {
        match &self.kind {
            TxnKind::Read { .. } => None,
            TxnKind::Write { state, .. } => Some(&state.store),
            TxnKind::Nested { state } => Some(&state.store),
        }
    }

    fn write_state(&mut self) -> Result<&mut WriteState> {
        match &mut self.kind {
            TxnKind::Read { .. } => Err(Error::TxnReadOnly),
            TxnKind::Write { state, .. } => Ok(&mut **state),
            TxnKind::Nested { state } => Ok(&mut **state),
        }
    }

    fn dbs(&self) -> &[OnceCell<DbState>] {
        match &self.kind {
            TxnKind::Read { dbs, .. } => dbs,
            TxnKind::Write { state, .. } => &state.dbs,
            TxnKind::Nested { state } => &state.dbs,
        }
    }

    fn dbs_mut(&mut self) -> &mut [OnceCell<DbState>] {
        match &mut self.kind {
            TxnKind::Read { dbs, .. } => dbs,
            TxnKind::Write { state, .. } => &mut state.dbs,
            TxnKind::Nested { state } => &mut state.dbs,
        }
    }

    fn main_state(&self) -> Result<&DbState> {
        self.dbs()
            .get(MAIN_DBI as usize)
            .and_then(OnceCell::get)
            .ok_or_else(|| Error::corrupted("main database state missing"))
    }

    /// State of `db` in this transaction, read from the main database the
    /// first time it is used.
    pub(crate) fn db_state(&self, db: Database) -> Result<&DbState> {
        let cell = self.dbs().get(db.index()).ok_or(Error::BadDbi)?;
        cell.get_or_try_init(|| self.resolve_db(db.dbi()))
    }

    fn resolve_db(&self, dbi: u32) -> Result<DbState> {
        let (name, custom) = {
            let registry = self.env.registry.read();
            let name = registry.name(dbi).ok_or(Error::BadDbi)?.to_string();
            (name, registry.compare(dbi))
        };
        match self.find_record(&name)? {
            Some(record) => Ok(DbState::new(record, custom)),
            None => Err(Error::BadDbi),
        }
    }

    /// Record of the named database `name` stored in the main database.
    fn find_record(&self, name: &str) -> Result<Option<DbRecord>> {
        let main = self.main_state()?;
        match btree::get(self, &main.record, main.cmp, name.as_bytes())? {
            Some((flags, value)) if flags.contains(NodeFlags::SUBDATA) => {
                Ok(Some(DbRecord::decode(value.resolve(self)?)?))
            }
            Some(_) => Err(Error::Incompatible),
            None => Ok(None),
        }
    }

    /// Open a database, or the main database when `name` is `None`
    ///
    /// With `DbFlags::CREATE` a missing database is created; this needs a
    /// write transaction.
    pub fn open_db(&self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        self.check_active()?;
        let Some(name) = name else {
            return Ok(Database::MAIN);
        };
        if name.is_empty() || name.len() > MAX_KEY_SIZE {
            return Err(Error::BadValSize);
        }
        if self.env.max_dbs == 0 {
            return Err(Error::DbsFull);
        }

        let known = self.env.registry.read().lookup(name);
        if let Some(dbi) = known {
            if self.dbs().get(dbi as usize).and_then(OnceCell::get).is_some() {
                return Ok(Database::from_dbi(dbi));
            }
        }

        let key_order = DbFlags::REVERSEKEY | DbFlags::INTEGERKEY;
        let (record, created) = match self.find_record(name)? {
            Some(record) => {
                if record.flags & key_order != flags & key_order {
                    return Err(Error::Incompatible);
                }
                (record, false)
            }
            None if flags.contains(DbFlags::CREATE) => {
                if self.is_readonly() {
                    return Err(Error::TxnReadOnly);
                }
                (DbRecord::empty(flags), true)
            }
            None => return Err(Error::NotFound),
        };

        let dbi = self.env.registry.write().assign(name)?;
        let custom = self.env.registry.read().compare(dbi);
        let cell = self.dbs().get(dbi as usize).ok_or(Error::BadDbi)?;
        cell.get_or_init(|| {
            let mut state = DbState::new(record, custom);
            state.dirty = created;
            state
        });
        if created {
            log::debug!("created database {:?} (dbi {}) in txn {}", name, dbi, self.txn_id);
        }
        Ok(Database::from_dbi(dbi))
    }

    /// Get a copy of the value stored under `key`
    pub fn get(&self, db: Database, key: &[u8]) -> Result<Vec<u8>> {
        self.get_val(db, key).map(<[u8]>::to_vec)
    }

    /// Get the value stored under `key` without copying it
    pub fn get_val(&self, db: Database, key: &[u8]) -> Result<&[u8]> {
        self.check_active()?;
        let state = self.db_state(db)?;
        state.check_key(key)?;
        match btree::get(self, &state.record, state.cmp, key)? {
            Some((flags, _)) if flags.contains(NodeFlags::SUBDATA) => Err(Error::Incompatible),
            Some((_, value)) => value.resolve(self),
            None => Err(Error::NotFound),
        }
    }

    /// Store a key/value pair
    pub fn put(&mut self, db: Database, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        self.check_write()?;
        let result = self.put_inner(db, key, data, flags);
        self.track(result)
    }

    fn put_inner(&mut self, db: Database, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        self.db_state(db)?.check_key(key)?;
        let env = self.env;
        let (map, last_pgno) = (&env.map[..], self.snapshot.last_pgno);
        let state = self.write_state()?;
        let db_state = state.dbs[db.index()].get_mut().ok_or(Error::BadDbi)?;
        let mut pages = WritePages {
            map,
            last_pgno,
            store: &mut state.store,
        };
        btree::insert(
            &mut pages,
            &mut db_state.record,
            db_state.cmp,
            key,
            data,
            NodeFlags::empty(),
            flags & !WriteFlags::CURRENT,
        )?;
        db_state.dirty = true;
        Ok(())
    }

    /// Delete the pair stored under `key`
    pub fn del(&mut self, db: Database, key: &[u8]) -> Result<()> {
        self.check_write()?;
        let result = self.del_inner(db, key);
        self.track(result)
    }

    fn del_inner(&mut self, db: Database, key: &[u8]) -> Result<()> {
        self.db_state(db)?.check_key(key)?;
        let env = self.env;
        let (map, last_pgno) = (&env.map[..], self.snapshot.last_pgno);
        let state = self.write_state()?;
        let db_state = state.dbs[db.index()].get_mut().ok_or(Error::BadDbi)?;
        let mut pages = WritePages {
            map,
            last_pgno,
            store: &mut state.store,
        };
        btree::delete(&mut pages, &mut db_state.record, db_state.cmp, key, NodeFlags::empty())?;
        db_state.dirty = true;
        Ok(())
    }

    /// Empty a database; with `delete` a named database is removed as well
    pub fn drop_db(&mut self, db: Database, delete: bool) -> Result<()> {
        self.check_write()?;
        let result = self.drop_inner(db, delete);
        self.track(result)
    }

    fn drop_inner(&mut self, db: Database, delete: bool) -> Result<()> {
        self.db_state(db)?;
        let name = if delete && db != Database::MAIN {
            self.env.registry.read().name(db.dbi()).map(str::to_string)
        } else {
            None
        };
        let env = self.env;
        let (map, last_pgno) = (&env.map[..], self.snapshot.last_pgno);
        let state = self.write_state()?;
        let mut pages = WritePages {
            map,
            last_pgno,
            store: &mut state.store,
        };

        let db_state = state.dbs[db.index()].get_mut().ok_or(Error::BadDbi)?;
        btree::clear(&mut pages, &mut db_state.record)?;
        db_state.dirty = true;

        if let Some(name) = name {
            state.dbs[db.index()].take();
            let main = state.dbs[MAIN_DBI as usize]
                .get_mut()
                .ok_or_else(|| Error::corrupted("main database state missing"))?;
            match btree::delete(&mut pages, &mut main.record, main.cmp, name.as_bytes(), NodeFlags::SUBDATA) {
                // Created in this transaction and never stored.
                Err(Error::NotFound) => {}
                other => other?,
            }
            log::debug!("deleted database {:?}", name);
        }
        Ok(())
    }

    /// Install a custom key comparison function for `db`
    ///
    /// The function is remembered by the environment and applies to every
    /// later transaction as well.
    pub fn set_compare(&mut self, db: Database, cmp: CompareFn) -> Result<()> {
        self.check_active()?;
        if db.index() >= self.dbs().len() {
            return Err(Error::BadDbi);
        }
        self.env.registry.write().set_compare(db.dbi(), cmp);
        if let Some(state) = self.dbs_mut()[db.index()].get_mut() {
            state.cmp = cmp;
        }
        Ok(())
    }

    /// Get database statistics
    pub fn stat(&self, db: Database) -> Result<Stat> {
        self.check_active()?;
        Ok(Stat::from(&self.db_state(db)?.record))
    }

    /// Get database flags
    pub fn db_flags(&self, db: Database) -> Result<DbFlags> {
        self.check_active()?;
        Ok(self.db_state(db)?.record.flags)
    }

    /// Open a read cursor
    pub fn open_cursor(&self, db: Database) -> Result<Cursor<'_>> {
        self.check_active()?;
        self.db_state(db)?;
        Ok(Cursor::new(self, db))
    }

    /// Open a cursor that can also write
    pub fn open_rw_cursor(&mut self, db: Database) -> Result<RwCursor<'_, 'env>> {
        self.check_write()?;
        self.db_state(db)?;
        Ok(RwCursor::new(self, db))
    }

    /// Commit the transaction
    pub fn commit(mut self) -> Result<()> {
        if self.status.contains(TxnState::FINISHED) {
            return Err(Error::TxnFinished);
        }
        if self.is_readonly() {
            self.finish();
            return Ok(());
        }
        if self.status.contains(TxnState::ERROR) {
            self.finish();
            return Err(Error::BadTxn);
        }
        if let TxnKind::Nested { state } = &mut self.kind {
            state.store.commit_frame();
            state.saved_dbs.pop();
            self.status.insert(TxnState::FINISHED);
            log::debug!("committed nested txn into {}", self.txn_id);
            return Ok(());
        }
        let result = self.commit_top();
        self.track(result)
    }

    fn commit_top(&mut self) -> Result<()> {
        let env = self.env;
        let txn_id = self.txn_id;
        let (map, last_pgno) = (&env.map[..], self.snapshot.last_pgno);

        let records: Vec<(String, DbRecord)> = {
            let registry = env.registry.read();
            self.dbs()
                .iter()
                .enumerate()
                .skip(1)
                .filter_map(|(dbi, cell)| {
                    let state = cell.get().filter(|s| s.dirty)?;
                    let name = registry.name(dbi as u32)?;
                    Some((name.to_string(), state.record))
                })
                .collect()
        };

        let state = self.write_state()?;
        {
            let mut pages = WritePages {
                map,
                last_pgno,
                store: &mut state.store,
            };
            let main = state.dbs[MAIN_DBI as usize]
                .get_mut()
                .ok_or_else(|| Error::corrupted("main database state missing"))?;
            for (name, record) in &records {
                btree::insert(
                    &mut pages,
                    &mut main.record,
                    main.cmp,
                    name.as_bytes(),
                    &record.to_bytes(),
                    NodeFlags::SUBDATA,
                    WriteFlags::empty(),
                )?;
            }
        }

        if state.store.is_clean() {
            log::debug!("txn {} wrote nothing", txn_id);
            self.finish();
            return Ok(());
        }

        let main = state.dbs[MAIN_DBI as usize]
            .get()
            .map(|s| s.record)
            .ok_or_else(|| Error::corrupted("main database state missing"))?;
        let store = std::mem::replace(
            &mut state.store,
            PageStore::new(Default::default(), last_pgno, last_pgno),
        );
        let next_pgno = store.next_pgno();
        let (dirty, free, retired) = store.into_parts();

        let mut meta = self.snapshot;
        meta.txn_id = txn_id;
        meta.last_pgno = next_pgno;
        meta.map_size = env.map_size as u64;
        meta.main = main;

        env.write_commit(&dirty, &meta)?;
        log::debug!(
            "committed txn {}: {} pages written, {} retired, {} pages in file",
            txn_id,
            dirty.len(),
            retired.len(),
            next_pgno
        );
        env.publish(meta, free, retired);
        self.finish();
        Ok(())
    }

    /// Abort the transaction, discarding its changes
    pub fn abort(mut self) {
        self.finish();
    }

    /// Release the snapshot of a read-only transaction; [`renew`](Self::renew)
    /// starts it again on the latest commit
    pub fn reset(&mut self) {
        let env = self.env;
        if let TxnKind::Read { slot, .. } = &mut self.kind {
            if let Some(slot) = slot.take() {
                env.release_reader(slot);
            }
            self.status.insert(TxnState::RESET);
        }
    }

    /// Restart a reset read-only transaction on the latest commit
    pub fn renew(&mut self) -> Result<()> {
        if self.status.contains(TxnState::FINISHED) {
            return Err(Error::TxnFinished);
        }
        let env = self.env;
        let TxnKind::Read { slot, dbs } = &mut self.kind else {
            return Err(Error::Incompatible);
        };
        if slot.is_some() {
            return Err(Error::BadTxn);
        }
        let (new_slot, meta) = env.register_reader()?;
        *slot = Some(new_slot);
        *dbs = fresh_dbs(env, &meta);
        self.snapshot = meta;
        self.txn_id = meta.txn_id;
        self.status.remove(TxnState::RESET);
        Ok(())
    }

    /// End the transaction; anything not committed is dropped.
    fn finish(&mut self) {
        if self.status.contains(TxnState::FINISHED) {
            return;
        }
        self.status.insert(TxnState::FINISHED);
        let env = self.env;
        match &mut self.kind {
            TxnKind::Read { slot, .. } => {
                if let Some(slot) = slot.take() {
                    env.release_reader(slot);
                }
                env.txn_finished();
            }
            TxnKind::Write { .. } => {
                env.txn_finished();
            }
            TxnKind::Nested { state } => {
                state.store.abort_frame();
                if let Some(saved) = state.saved_dbs.pop() {
                    state.dbs = saved;
                }
                log::debug!("aborted nested txn in {}", self.txn_id);
            }
        }
    }
}

impl PageRead for Transaction<'_> {
    fn page_span(&self, pgno: PageId, len: usize) -> Result<&[u8]> {
        if let Some(found) = self.store().and_then(|s| s.dirty_span(pgno, len)) {
            return found;
        }
        read_committed(&self.env.map, self.snapshot.last_pgno, pgno, len)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.status.contains(TxnState::FINISHED) {
            log::debug!("txn {} dropped without commit", self.txn_id);
            self.finish();
        }
    }
}

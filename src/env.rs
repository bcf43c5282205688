use lazy_static::lazy_static;
use memmap2::{Mmap, MmapOptions};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::btree;
use crate::constants::{
    EnvFlags, TransactionFlags, DATA_FILE_NAME, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS,
    DEFAULT_MAX_READERS, MAX_KEY_SIZE, META_PAGES, MIN_MAP_PAGES, PAGE_SIZE, VERSION_MAJOR,
    VERSION_MINOR, VERSION_PATCH,
};
use crate::database::DbRegistry;
use crate::error::{Error, Result};
use crate::meta::{MetaHeader, PageId, ReaderInfo, ReaderTable, TxnId};
use crate::midl::IdList;
use crate::store::{read_committed, Snapshot};
use crate::transaction::Transaction;
use crate::types::{EnvInfo, Stat};

/// Database version
pub const MDB_VERSION: u32 = VERSION_MAJOR << 24 | VERSION_MINOR << 16 | VERSION_PATCH;

lazy_static! {
    static ref CHANGEABLE: EnvFlags = EnvFlags::NOSYNC | EnvFlags::NOMETASYNC;
}

/// Free pages and pages waiting for readers to move on.
#[derive(Debug, Default)]
pub(crate) struct FreeState {
    free: IdList,
    /// Pages retired by each committed transaction, oldest first
    pending: VecDeque<(TxnId, Vec<PageId>)>,
}

/// State of an open environment.
#[derive(Debug)]
pub(crate) struct EnvInner {
    /// Path to the data file
    path: PathBuf,
    file: File,
    pub(crate) map: Mmap,
    pub(crate) map_size: usize,
    flags: RwLock<EnvFlags>,
    pub(crate) max_dbs: u32,
    max_readers: u32,
    /// Latest committed meta
    meta: RwLock<MetaHeader>,
    readers: Mutex<ReaderTable>,
    /// Set while a write transaction is alive
    writer: Mutex<bool>,
    writer_released: Condvar,
    free: Mutex<FreeState>,
    pub(crate) registry: RwLock<DbRegistry>,
    active_txns: AtomicUsize,
}

/// Holds the writer slot until dropped.
#[derive(Debug)]
pub(crate) struct WriterGuard<'env> {
    env: &'env EnvInner,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        *self.env.writer.lock() = false;
        self.env.writer_released.notify_one();
    }
}

impl EnvInner {
    pub(crate) fn flags(&self) -> EnvFlags {
        *self.flags.read()
    }

    /// Pages the map can hold.
    pub(crate) fn max_pgno(&self) -> PageId {
        (self.map_size / PAGE_SIZE) as PageId
    }

    pub(crate) fn txn_started(&self) {
        self.active_txns.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn txn_finished(&self) {
        self.active_txns.fetch_sub(1, Ordering::SeqCst);
    }

    /// Take the writer slot, waiting for it if `wait` is set.
    pub(crate) fn lock_writer(&self, wait: bool) -> Result<WriterGuard<'_>> {
        let mut busy = self.writer.lock();
        while *busy {
            if !wait {
                return Err(Error::WriterBusy);
            }
            self.writer_released.wait(&mut busy);
        }
        *busy = true;
        Ok(WriterGuard { env: self })
    }

    /// Snapshot and free list for a new write transaction.
    ///
    /// Pages retired by transaction `T` are released once every reader
    /// snapshot is at least `T`.
    pub(crate) fn writer_snapshot(&self) -> (MetaHeader, IdList) {
        let meta = *self.meta.read();
        let oldest = self
            .readers
            .lock()
            .oldest()
            .map_or(meta.txn_id, |r| r.min(meta.txn_id));

        let mut state = self.free.lock();
        while let Some((txn_id, _)) = state.pending.front() {
            if *txn_id > oldest {
                break;
            }
            if let Some((txn_id, pages)) = state.pending.pop_front() {
                log::trace!("reclaiming {} pages retired by txn {}", pages.len(), txn_id);
                state.free.append_list(&pages);
            }
        }
        (meta, state.free.clone())
    }

    /// Register a reader on the latest committed meta.
    pub(crate) fn register_reader(&self) -> Result<(usize, MetaHeader)> {
        let mut readers = self.readers.lock();
        let meta = *self.meta.read();
        let slot = readers.register(meta.txn_id).map_err(|e| {
            log::warn!("reader table full ({} slots)", self.max_readers);
            e
        })?;
        Ok((slot, meta))
    }

    pub(crate) fn release_reader(&self, slot: usize) {
        self.readers.lock().release(slot);
    }

    /// Write a transaction's pages and then its meta page.
    pub(crate) fn write_commit(&self, pages: &[(PageId, Vec<u8>)], meta: &MetaHeader) -> Result<()> {
        let flags = self.flags();
        for (pgno, buf) in pages {
            self.file.write_all_at(buf, pgno * PAGE_SIZE as u64)?;
        }
        let needed = meta.last_pgno * PAGE_SIZE as u64;
        if self.file.metadata()?.len() < needed {
            self.file.set_len(needed)?;
        }
        if !flags.contains(EnvFlags::NOSYNC) {
            self.file.sync_data()?;
        }

        let slot = MetaHeader::slot_for(meta.txn_id);
        self.file
            .write_all_at(&meta.to_page(slot), (slot * PAGE_SIZE) as u64)?;
        if !flags.intersects(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC) {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Make a committed meta visible to new transactions.
    pub(crate) fn publish(&self, meta: MetaHeader, free: IdList, retired: Vec<PageId>) {
        {
            let mut state = self.free.lock();
            state.free = free;
            if !retired.is_empty() {
                state.pending.push_back((meta.txn_id, retired));
            }
        }
        *self.meta.write() = meta;
    }
}

/// lumodb Environment
///
/// Configure with the setters, then [`open`](Environment::open). Transactions
/// borrow the environment, so it cannot be closed or dropped under them.
#[derive(Debug)]
pub struct Environment {
    map_size: usize,
    max_dbs: u32,
    max_readers: u32,
    inner: Option<EnvInner>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Create a new environment
    pub fn new() -> Self {
        Environment {
            map_size: DEFAULT_MAP_SIZE,
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
            inner: None,
        }
    }

    /// Set the size of the memory map
    pub fn set_map_size(&mut self, size: usize) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::EnvAlreadyOpen);
        }
        if size == 0 {
            return Err(Error::EnvInvalidMapSize);
        }
        self.map_size = size;
        Ok(())
    }

    /// Set the maximum number of named databases
    pub fn set_max_dbs(&mut self, dbs: u32) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::EnvAlreadyOpen);
        }
        self.max_dbs = dbs;
        Ok(())
    }

    /// Set the maximum number of concurrent readers
    pub fn set_max_readers(&mut self, readers: u32) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::EnvAlreadyOpen);
        }
        if readers == 0 {
            return Err(Error::Invalid);
        }
        self.max_readers = readers;
        Ok(())
    }

    /// Open the environment
    ///
    /// `path` is a directory holding the data file, or the data file itself
    /// with `EnvFlags::NOSUBDIR`. `mode` is used when the file is created.
    pub fn open<P: AsRef<Path>>(&mut self, path: P, flags: EnvFlags, mode: u32) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::EnvAlreadyOpen);
        }
        let map_size = self.map_size / PAGE_SIZE * PAGE_SIZE;
        if map_size < MIN_MAP_PAGES * PAGE_SIZE {
            return Err(Error::EnvInvalidMapSize);
        }

        let path = data_file_path(path.as_ref(), flags)?;
        let readonly = flags.contains(EnvFlags::RDONLY);
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(!readonly)
            .mode(mode)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::EnvInvalidPath,
                _ => Error::Io(e),
            })?;

        let mut file_len = file.metadata()?.len() as usize;
        if file_len == 0 && !readonly {
            init_file(&file, map_size)?;
            file_len = META_PAGES * PAGE_SIZE;
            log::debug!("initialized new data file {}", path.display());
        }
        if file_len < META_PAGES * PAGE_SIZE {
            return Err(Error::corrupted(format!(
                "data file is {} bytes, shorter than its meta pages",
                file_len
            )));
        }

        // Safety: the map is read-only and pages below the published
        // last_pgno are never rewritten while a reader can reach them.
        let map = unsafe { MmapOptions::new().len(map_size).map(&file)? };

        let (slot, meta) = MetaHeader::choose(&map[..PAGE_SIZE], &map[PAGE_SIZE..2 * PAGE_SIZE])?;
        if meta.page_size as usize != PAGE_SIZE {
            return Err(Error::Invalid);
        }
        let needed = meta.last_pgno as usize * PAGE_SIZE;
        if needed > map_size {
            return Err(Error::MapSizeExceeded { needed, map_size });
        }
        if needed > file_len {
            return Err(Error::corrupted(format!(
                "data file is {} bytes, meta expects {}",
                file_len, needed
            )));
        }

        let free = rebuild_free_list(&map, &meta)?;
        log::debug!(
            "opened {} at txn {} (meta slot {}, {} pages, {} free)",
            path.display(),
            meta.txn_id,
            slot,
            meta.last_pgno,
            free.len()
        );

        self.inner = Some(EnvInner {
            path,
            file,
            map,
            map_size,
            flags: RwLock::new(flags),
            max_dbs: self.max_dbs,
            max_readers: self.max_readers,
            meta: RwLock::new(meta),
            readers: Mutex::new(ReaderTable::new(self.max_readers)),
            writer: Mutex::new(false),
            writer_released: Condvar::new(),
            free: Mutex::new(FreeState {
                free,
                pending: VecDeque::new(),
            }),
            registry: RwLock::new(DbRegistry::new(self.max_dbs)),
            active_txns: AtomicUsize::new(0),
        });
        Ok(())
    }

    /// Close the environment, releasing the map and the file
    pub fn close(&mut self) -> Result<()> {
        let inner = self.inner.as_ref().ok_or(Error::EnvNotInitialized)?;
        let active = inner.active_txns.load(Ordering::SeqCst);
        if active > 0 {
            return Err(Error::EnvHasActiveTxns(active));
        }
        if let Some(inner) = self.inner.take() {
            log::debug!("closed {}", inner.path.display());
        }
        Ok(())
    }

    pub(crate) fn inner(&self) -> Result<&EnvInner> {
        self.inner.as_ref().ok_or(Error::EnvNotInitialized)
    }

    /// Begin a transaction; read-only if `flags` contains `RDONLY`
    pub fn begin_txn(&self, flags: TransactionFlags) -> Result<Transaction<'_>> {
        if flags.contains(TransactionFlags::RDONLY) {
            self.begin_ro_txn()
        } else {
            self.begin_rw_txn()
        }
    }

    /// Begin a write transaction, waiting for the current writer to finish
    pub fn begin_rw_txn(&self) -> Result<Transaction<'_>> {
        Transaction::new_write(self.inner()?, true)
    }

    /// Begin a write transaction, failing with `WriterBusy` instead of waiting
    pub fn try_begin_rw_txn(&self) -> Result<Transaction<'_>> {
        Transaction::new_write(self.inner()?, false)
    }

    /// Begin a read-only transaction
    pub fn begin_ro_txn(&self) -> Result<Transaction<'_>> {
        Transaction::new_read(self.inner()?)
    }

    /// Turn runtime-changeable flags on or off
    pub fn set_flags(&self, flags: EnvFlags, on: bool) -> Result<()> {
        let inner = self.inner()?;
        if !CHANGEABLE.contains(flags) {
            return Err(Error::Invalid);
        }
        let mut current = inner.flags.write();
        current.set(flags, on);
        Ok(())
    }

    /// Get environment flags
    pub fn flags(&self) -> Result<EnvFlags> {
        Ok(self.inner()?.flags())
    }

    /// Path of the data file
    pub fn path(&self) -> Result<&Path> {
        Ok(&self.inner()?.path)
    }

    pub fn map_size(&self) -> usize {
        self.inner.as_ref().map_or(self.map_size, |inner| inner.map_size)
    }

    pub fn max_dbs(&self) -> u32 {
        self.max_dbs
    }

    pub fn max_readers(&self) -> u32 {
        self.max_readers
    }

    pub fn max_key_size(&self) -> usize {
        MAX_KEY_SIZE
    }

    /// Statistics of the main database at the latest commit
    pub fn stat(&self) -> Result<Stat> {
        let meta = *self.inner()?.meta.read();
        Ok(Stat::from(&meta.main))
    }

    /// Get environment info
    pub fn info(&self) -> Result<EnvInfo> {
        let inner = self.inner()?;
        let meta = *inner.meta.read();
        Ok(EnvInfo {
            mapsize: inner.map_size,
            last_pgno: meta.last_pgno.saturating_sub(1) as usize,
            last_txnid: meta.txn_id as usize,
            max_readers: inner.max_readers,
            num_readers: inner.readers.lock().num_readers() as u32,
        })
    }

    /// Active readers
    pub fn reader_list(&self) -> Result<Vec<ReaderInfo>> {
        Ok(self.inner()?.readers.lock().list())
    }

    /// Flush the data file; without `force` this is skipped under `NOSYNC`
    pub fn sync(&self, force: bool) -> Result<()> {
        let inner = self.inner()?;
        let flags = inner.flags();
        if flags.contains(EnvFlags::RDONLY) {
            return Ok(());
        }
        if force || !flags.contains(EnvFlags::NOSYNC) {
            inner.file.sync_all()?;
        }
        Ok(())
    }

    /// Copy the latest committed snapshot into a new environment at `path`
    pub fn copy<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let inner = self.inner()?;
        let txn = self.begin_ro_txn()?;
        let meta = *txn.snapshot();
        let target = data_file_path(path.as_ref(), inner.flags())?;
        let out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&target)?;

        out.write_all_at(&meta.to_page(0), 0)?;
        out.write_all_at(&meta.to_page(1), PAGE_SIZE as u64)?;
        let body_pages = meta.last_pgno as usize - META_PAGES;
        if body_pages > 0 {
            let body = read_committed(&inner.map, meta.last_pgno, META_PAGES as PageId, body_pages * PAGE_SIZE)?;
            out.write_all_at(body, (META_PAGES * PAGE_SIZE) as u64)?;
        }
        out.sync_all()?;
        log::debug!("copied txn {} to {}", meta.txn_id, target.display());
        txn.abort();
        Ok(())
    }

    /// Library version as (major, minor, patch)
    pub fn version() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            log::debug!("dropping environment {}", inner.path.display());
        }
    }
}

fn data_file_path(path: &Path, flags: EnvFlags) -> Result<PathBuf> {
    if flags.contains(EnvFlags::NOSUBDIR) {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if path.file_name().is_none() || !parent.is_dir() {
            return Err(Error::EnvInvalidPath);
        }
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        return Err(Error::EnvInvalidPath);
    }
    Ok(path.join(DATA_FILE_NAME))
}

fn init_file(file: &File, map_size: usize) -> Result<()> {
    let meta = MetaHeader::new(map_size);
    file.write_all_at(&meta.to_page(0), 0)?;
    file.write_all_at(&meta.to_page(1), PAGE_SIZE as u64)?;
    file.sync_all()?;
    Ok(())
}

/// Every page below `last_pgno` not reachable from `meta` is free.
fn rebuild_free_list(map: &[u8], meta: &MetaHeader) -> Result<IdList> {
    let snapshot = Snapshot {
        map,
        last_pgno: meta.last_pgno,
    };
    let mut runs = Vec::new();
    btree::collect_pages(&snapshot, &meta.main, &mut runs)?;
    for (_, record) in btree::sub_databases(&snapshot, &meta.main)? {
        btree::collect_pages(&snapshot, &record, &mut runs)?;
    }

    let mut used = vec![false; meta.last_pgno as usize];
    for (pgno, npages) in runs {
        for p in pgno..pgno + npages as PageId {
            let slot = used
                .get_mut(p as usize)
                .ok_or_else(|| Error::corrupted(format!("page {} is past the end of the file", p)))?;
            *slot = true;
        }
    }
    let free = (META_PAGES as PageId..meta.last_pgno)
        .filter(|&p| !used[p as usize])
        .collect();
    Ok(IdList::from_unsorted(free))
}

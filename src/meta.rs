use xxhash_rust::xxh3::xxh3_64;

use crate::constants::{DbFlags, PageFlags, DATA_VERSION, MDB_MAGIC, PAGE_SIZE, P_INVALID};
use crate::error::{Error, Result};
use crate::page::{self, PAGE_HEADER_SIZE};

/// Page number inside the data file.
pub type PageId = u64;

/// Transaction identifier; each committed write transaction bumps it by one.
pub type TxnId = u64;

/// Database info structure matching MDB_db
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct DbRecord {
    /// Database flags
    pub(crate) flags: DbFlags,
    /// Depth of B-tree
    pub(crate) depth: u32,
    /// Number of branch pages
    pub(crate) branch_pages: u64,
    /// Number of leaf pages
    pub(crate) leaf_pages: u64,
    /// Number of overflow pages
    pub(crate) overflow_pages: u64,
    /// Number of data entries
    pub(crate) entries: u64,
    /// Root page number
    pub(crate) root: PageId,
}

impl DbRecord {
    pub(crate) const SIZE: usize = 48;

    pub(crate) fn empty(flags: DbFlags) -> Self {
        DbRecord {
            flags: flags & !DbFlags::CREATE,
            root: P_INVALID,
            ..Default::default()
        }
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[4..8].copy_from_slice(&self.depth.to_le_bytes());
        buf[8..16].copy_from_slice(&self.branch_pages.to_le_bytes());
        buf[16..24].copy_from_slice(&self.leaf_pages.to_le_bytes());
        buf[24..32].copy_from_slice(&self.overflow_pages.to_le_bytes());
        buf[32..40].copy_from_slice(&self.entries.to_le_bytes());
        buf[40..48].copy_from_slice(&self.root.to_le_bytes());
    }

    pub(crate) fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        self.encode(&mut buf);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::corrupted("database record too short"));
        }
        Ok(DbRecord {
            flags: DbFlags::from_bits_truncate(read_u32(buf, 0)),
            depth: read_u32(buf, 4),
            branch_pages: read_u64(buf, 8),
            leaf_pages: read_u64(buf, 16),
            overflow_pages: read_u64(buf, 24),
            entries: read_u64(buf, 32),
            root: read_u64(buf, 40),
        })
    }
}

/// Meta header matching MDB_meta.
///
/// Two copies live in pages 0 and 1. A commit writes the slot picked by the
/// parity of its transaction id, so the previous meta survives a torn write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaHeader {
    /// Magic number identifying lumodb files
    pub(crate) magic: u32,
    /// On-disk format version
    pub(crate) version: u32,
    /// Page size for this file
    pub(crate) page_size: u32,
    /// Map size the file was last opened with
    pub(crate) map_size: u64,
    /// First page number never allocated
    pub(crate) last_pgno: PageId,
    /// txnid that committed this meta
    pub(crate) txn_id: TxnId,
    /// Main (unnamed) database
    pub(crate) main: DbRecord,
}

const META_OFF: usize = PAGE_HEADER_SIZE;
const META_BODY: usize = 40 + DbRecord::SIZE;
const META_CHECKSUM_OFF: usize = META_OFF + META_BODY;

impl MetaHeader {
    pub(crate) fn new(map_size: usize) -> Self {
        MetaHeader {
            magic: MDB_MAGIC,
            version: DATA_VERSION,
            page_size: PAGE_SIZE as u32,
            map_size: map_size as u64,
            last_pgno: crate::constants::META_PAGES as PageId,
            txn_id: 0,
            main: DbRecord::empty(DbFlags::empty()),
        }
    }

    /// Slot a transaction's meta is written to.
    pub(crate) fn slot_for(txn_id: TxnId) -> usize {
        (txn_id & 1) as usize
    }

    /// Serialize into a full meta page.
    pub(crate) fn to_page(&self, slot: usize) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        page::write_header(&mut buf, slot as PageId, PageFlags::META, 0, 0);
        buf[META_OFF..META_OFF + 4].copy_from_slice(&self.magic.to_le_bytes());
        buf[META_OFF + 4..META_OFF + 8].copy_from_slice(&self.version.to_le_bytes());
        buf[META_OFF + 8..META_OFF + 12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[META_OFF + 16..META_OFF + 24].copy_from_slice(&self.map_size.to_le_bytes());
        buf[META_OFF + 24..META_OFF + 32].copy_from_slice(&self.last_pgno.to_le_bytes());
        buf[META_OFF + 32..META_OFF + 40].copy_from_slice(&self.txn_id.to_le_bytes());
        self.main.encode(&mut buf[META_OFF + 40..META_OFF + 40 + DbRecord::SIZE]);
        let checksum = xxh3_64(&buf[META_OFF..META_CHECKSUM_OFF]);
        buf[META_CHECKSUM_OFF..META_CHECKSUM_OFF + 8].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse a meta page. Structural problems come back as errors so the
    /// caller can fall back to the other slot.
    pub(crate) fn from_page(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_CHECKSUM_OFF + 8 {
            return Err(Error::corrupted("meta page too short"));
        }
        let magic = read_u32(buf, META_OFF);
        if magic != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        let stored = read_u64(buf, META_CHECKSUM_OFF);
        if stored != xxh3_64(&buf[META_OFF..META_CHECKSUM_OFF]) {
            return Err(Error::corrupted("meta checksum mismatch"));
        }
        let version = read_u32(buf, META_OFF + 4);
        if version != DATA_VERSION {
            return Err(Error::VersionMismatch {
                found: version,
                expected: DATA_VERSION,
            });
        }
        Ok(MetaHeader {
            magic,
            version,
            page_size: read_u32(buf, META_OFF + 8),
            map_size: read_u64(buf, META_OFF + 16),
            last_pgno: read_u64(buf, META_OFF + 24),
            txn_id: read_u64(buf, META_OFF + 32),
            main: DbRecord::decode(&buf[META_OFF + 40..])?,
        })
    }

    /// Pick the newest valid meta out of the two slots.
    pub(crate) fn choose(slot0: &[u8], slot1: &[u8]) -> Result<(usize, Self)> {
        match (Self::from_page(slot0), Self::from_page(slot1)) {
            (Ok(a), Ok(b)) => {
                if b.txn_id > a.txn_id {
                    Ok((1, b))
                } else {
                    Ok((0, a))
                }
            }
            (Ok(a), Err(e)) => {
                log::warn!("meta slot 1 unusable ({}), using slot 0", e);
                Ok((0, a))
            }
            (Err(e), Ok(b)) => {
                log::warn!("meta slot 0 unusable ({}), using slot 1", e);
                Ok((1, b))
            }
            (Err(Error::Invalid), Err(Error::Invalid)) => Err(Error::Invalid),
            (Err(e @ Error::VersionMismatch { .. }), Err(_)) => Err(e),
            (Err(_), Err(_)) => Err(Error::corrupted("both meta pages are invalid")),
        }
    }
}

/// Reader info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Slot index in the reader table
    pub slot: usize,
    /// Process ID
    pub pid: u32,
    /// Transaction ID being read
    pub txn_id: TxnId,
}

/// Reader lock table matching MDB_txninfo, kept in process memory.
#[derive(Debug)]
pub(crate) struct ReaderTable {
    /// Array of reader slots; `None` marks a free slot
    slots: Vec<Option<TxnId>>,
    /// Maximum number of readers
    max_readers: usize,
}

impl ReaderTable {
    pub(crate) fn new(max_readers: u32) -> Self {
        ReaderTable {
            slots: Vec::new(),
            max_readers: max_readers as usize,
        }
    }

    pub(crate) fn register(&mut self, txn_id: TxnId) -> Result<usize> {
        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(txn_id);
            return Ok(slot);
        }
        if self.slots.len() >= self.max_readers {
            return Err(Error::ReadersFull);
        }
        self.slots.push(Some(txn_id));
        Ok(self.slots.len() - 1)
    }

    pub(crate) fn release(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
    }

    /// Oldest snapshot any reader still holds.
    pub(crate) fn oldest(&self) -> Option<TxnId> {
        self.slots.iter().flatten().copied().min()
    }

    pub(crate) fn num_readers(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub(crate) fn list(&self) -> Vec<ReaderInfo> {
        let pid = std::process::id();
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, txn)| {
                txn.map(|txn_id| ReaderInfo { slot, pid, txn_id })
            })
            .collect()
    }
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[off..off + 2]);
    u16::from_le_bytes(b)
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

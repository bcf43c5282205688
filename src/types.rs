use crate::constants::PAGE_SIZE;
use crate::meta::DbRecord;

/// Cursor positioning operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    First,
    GetCurrent,
    Last,
    Next,
    Prev,
    /// Position at the given key exactly
    Set,
    /// Same as `Set`, kept for callers used to returning the key
    SetKey,
    /// Position at the first key greater than or equal to the given key
    SetRange,
}

/// Database statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub psize: u32,
    pub depth: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    pub entries: usize,
}

impl From<&DbRecord> for Stat {
    fn from(db: &DbRecord) -> Self {
        Stat {
            psize: PAGE_SIZE as u32,
            depth: db.depth,
            branch_pages: db.branch_pages as usize,
            leaf_pages: db.leaf_pages as usize,
            overflow_pages: db.overflow_pages as usize,
            entries: db.entries as usize,
        }
    }
}

/// Environment information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    pub mapsize: usize,
    pub last_pgno: usize,
    pub last_txnid: usize,
    pub max_readers: u32,
    pub num_readers: u32,
}

//! Page layout and page access.
//!
//! Every page starts with a 16 byte header:
//!
//! ```text
//! 0..8    page number
//! 8..10   PageFlags
//! 10..12  number of entries (leaf/branch)
//! 12..16  number of pages in the run (overflow)
//! ```
//!
//! Leaf and branch pages follow the header with an array of `u16` entry
//! offsets. A leaf entry is `flags:u16 ksize:u16 dsize:u32 key data`, where
//! `data` is the value itself or, for `BIGDATA` entries, the `u64` number of
//! the first page of an overflow run. A branch entry is `child:u64 ksize:u16
//! key`; the key of the first branch entry is always empty.
//!
//! Pages are never edited in place once committed. Writers decode a page into
//! a [`Node`], change it, and encode it into a page that is dirty in the
//! current transaction.

use std::cmp::Ordering;

use crate::constants::{NodeFlags, PageFlags, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::meta::{read_u16, read_u32, read_u64, PageId};

pub(crate) const PAGE_HEADER_SIZE: usize = 16;
const LEAF_ENTRY_HEADER: usize = 8;
const BRANCH_ENTRY_HEADER: usize = 10;
const SLOT_SIZE: usize = 2;

/// Usable bytes in a leaf or branch page.
pub(crate) const PAGE_CAPACITY: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Largest leaf entry stored inline; bigger values move to overflow pages.
pub(crate) const MAX_NODE_SIZE: usize = PAGE_CAPACITY / 4 - SLOT_SIZE;

/// Nodes using fewer bytes than this get merged or rebalanced.
pub(crate) const FILL_THRESHOLD: usize = PAGE_CAPACITY / 4;

/// Largest value a leaf entry can describe (`dsize` is a `u32`).
pub(crate) const MAX_VALUE_SIZE: usize = u32::MAX as usize;

/// Read access to pages as seen by one transaction.
pub(crate) trait PageRead {
    /// `len` bytes starting at the beginning of page `pgno`.
    fn page_span(&self, pgno: PageId, len: usize) -> Result<&[u8]>;

    fn page(&self, pgno: PageId) -> Result<&[u8]> {
        self.page_span(pgno, PAGE_SIZE)
    }
}

/// Page allocation for a write transaction.
pub(crate) trait PageWrite: PageRead {
    /// Whether `pgno` is dirty in the innermost transaction and may be rewritten.
    fn is_writable(&self, pgno: PageId) -> bool;

    /// Allocate `npages` consecutive pages.
    fn alloc(&mut self, npages: usize) -> Result<PageId>;

    /// Store the content of a dirty page (or overflow run).
    fn put_page(&mut self, pgno: PageId, buf: Vec<u8>);

    /// Release `npages` pages starting at `pgno`.
    fn free(&mut self, pgno: PageId, npages: usize);
}

pub(crate) fn write_header(
    buf: &mut [u8],
    pgno: PageId,
    flags: PageFlags,
    count: u16,
    pages: u32,
) {
    buf[0..8].copy_from_slice(&pgno.to_le_bytes());
    buf[8..10].copy_from_slice(&flags.bits().to_le_bytes());
    buf[10..12].copy_from_slice(&count.to_le_bytes());
    buf[12..16].copy_from_slice(&pages.to_le_bytes());
}

pub(crate) fn page_flags(buf: &[u8]) -> PageFlags {
    PageFlags::from_bits_truncate(read_u16(buf, 8))
}

/// Pages needed for an overflow run holding `len` bytes.
pub(crate) fn overflow_pages(len: usize) -> usize {
    (PAGE_HEADER_SIZE + len).div_ceil(PAGE_SIZE)
}

/// Number of pages recorded in an overflow run's header.
pub(crate) fn overflow_run_len(buf: &[u8]) -> Result<usize> {
    if !page_flags(buf).contains(PageFlags::OVERFLOW) {
        return Err(Error::corrupted("expected an overflow page"));
    }
    Ok(read_u32(buf, 12) as usize)
}

/// Build an overflow run for `data` that starts at `pgno`.
pub(crate) fn encode_overflow(pgno: PageId, data: &[u8]) -> Vec<u8> {
    let npages = overflow_pages(data.len());
    let mut buf = vec![0u8; npages * PAGE_SIZE];
    write_header(&mut buf, pgno, PageFlags::OVERFLOW, 0, npages as u32);
    buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + data.len()].copy_from_slice(data);
    buf
}

/// Value stored in a leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueRef<'a> {
    Inline(&'a [u8]),
    Overflow { pgno: PageId, len: usize },
}

impl<'a> ValueRef<'a> {
    /// Resolve to the value bytes, reading the overflow run if needed.
    pub(crate) fn resolve<P: PageRead + ?Sized>(self, pages: &'a P) -> Result<&'a [u8]> {
        match self {
            ValueRef::Inline(data) => Ok(data),
            ValueRef::Overflow { pgno, len } => {
                let span = pages.page_span(pgno, PAGE_HEADER_SIZE + len)?;
                Ok(&span[PAGE_HEADER_SIZE..])
            }
        }
    }
}

/// Zero-copy view over a leaf or branch page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeView<'a> {
    buf: &'a [u8],
    leaf: bool,
    count: usize,
}

impl<'a> NodeView<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(Error::corrupted("page too short"));
        }
        let flags = page_flags(buf);
        let leaf = if flags.contains(PageFlags::LEAF) {
            true
        } else if flags.contains(PageFlags::BRANCH) {
            false
        } else {
            return Err(Error::corrupted(format!(
                "page {} is not a tree page ({:?})",
                read_u64(buf, 0),
                flags
            )));
        };
        let count = read_u16(buf, 10) as usize;
        if PAGE_HEADER_SIZE + count * SLOT_SIZE > buf.len() {
            return Err(Error::corrupted("entry count exceeds page"));
        }
        Ok(NodeView { buf, leaf, count })
    }

    #[inline]
    pub(crate) fn is_leaf(&self) -> bool {
        self.leaf
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    fn entry(&self, i: usize) -> Result<usize> {
        if i >= self.count {
            return Err(Error::corrupted("entry index out of range"));
        }
        let off = read_u16(self.buf, PAGE_HEADER_SIZE + i * SLOT_SIZE) as usize;
        let header = if self.leaf {
            LEAF_ENTRY_HEADER
        } else {
            BRANCH_ENTRY_HEADER
        };
        if off + header > self.buf.len() {
            return Err(Error::corrupted("entry offset out of range"));
        }
        Ok(off)
    }

    fn slice(&self, start: usize, len: usize) -> Result<&'a [u8]> {
        self.buf
            .get(start..start + len)
            .ok_or_else(|| Error::corrupted("entry exceeds page"))
    }

    pub(crate) fn key(&self, i: usize) -> Result<&'a [u8]> {
        let off = self.entry(i)?;
        if self.leaf {
            let ksize = read_u16(self.buf, off + 2) as usize;
            self.slice(off + LEAF_ENTRY_HEADER, ksize)
        } else {
            let ksize = read_u16(self.buf, off + 8) as usize;
            self.slice(off + BRANCH_ENTRY_HEADER, ksize)
        }
    }

    pub(crate) fn child(&self, i: usize) -> Result<PageId> {
        debug_assert!(!self.leaf);
        let off = self.entry(i)?;
        Ok(read_u64(self.buf, off))
    }

    pub(crate) fn leaf_flags(&self, i: usize) -> Result<NodeFlags> {
        let off = self.entry(i)?;
        Ok(NodeFlags::from_bits_truncate(read_u16(self.buf, off)))
    }

    pub(crate) fn value(&self, i: usize) -> Result<ValueRef<'a>> {
        debug_assert!(self.leaf);
        let off = self.entry(i)?;
        let flags = NodeFlags::from_bits_truncate(read_u16(self.buf, off));
        let ksize = read_u16(self.buf, off + 2) as usize;
        let dsize = read_u32(self.buf, off + 4) as usize;
        let data_off = off + LEAF_ENTRY_HEADER + ksize;
        if flags.contains(NodeFlags::BIGDATA) {
            let raw = self.slice(data_off, 8)?;
            Ok(ValueRef::Overflow {
                pgno: read_u64(raw, 0),
                len: dsize,
            })
        } else {
            Ok(ValueRef::Inline(self.slice(data_off, dsize)?))
        }
    }

    /// Leaf search: index of the first key >= `key` and whether it matched.
    pub(crate) fn search<F>(&self, key: &[u8], cmp: F) -> Result<(usize, bool)>
    where
        F: Fn(&[u8], &[u8]) -> Ordering,
    {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp(self.key(mid)?, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok((mid, true)),
            }
        }
        Ok((lo, false))
    }

    /// Branch search: index of the child whose range holds `key`.
    pub(crate) fn child_index<F>(&self, key: &[u8], cmp: F) -> Result<usize>
    where
        F: Fn(&[u8], &[u8]) -> Ordering,
    {
        // Entry 0 has no key and covers everything below entry 1.
        let (mut lo, mut hi) = (1, self.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp(self.key(mid)?, key) {
                Ordering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        Ok(lo - 1)
    }

    /// Copy the node out so it can be edited.
    pub(crate) fn to_node(&self) -> Result<Node> {
        if self.leaf {
            let mut entries = Vec::with_capacity(self.count);
            for i in 0..self.count {
                let off = self.entry(i)?;
                let flags = NodeFlags::from_bits_truncate(read_u16(self.buf, off));
                let ksize = read_u16(self.buf, off + 2) as usize;
                let dsize = read_u32(self.buf, off + 4);
                let data_len = if flags.contains(NodeFlags::BIGDATA) {
                    8
                } else {
                    dsize as usize
                };
                let key = self.slice(off + LEAF_ENTRY_HEADER, ksize)?.to_vec();
                let data = self
                    .slice(off + LEAF_ENTRY_HEADER + ksize, data_len)?
                    .to_vec();
                entries.push(LeafEntry {
                    flags,
                    key,
                    data,
                    dsize,
                });
            }
            Ok(Node::Leaf(entries))
        } else {
            let mut entries = Vec::with_capacity(self.count);
            for i in 0..self.count {
                entries.push(BranchEntry {
                    key: self.key(i)?.to_vec(),
                    child: self.child(i)?,
                });
            }
            Ok(Node::Branch(entries))
        }
    }
}

/// Leaf entry of an owned node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafEntry {
    pub(crate) flags: NodeFlags,
    pub(crate) key: Vec<u8>,
    /// Inline value, or the overflow page number for `BIGDATA`
    pub(crate) data: Vec<u8>,
    /// Length of the value
    pub(crate) dsize: u32,
}

impl LeafEntry {
    pub(crate) fn inline(key: Vec<u8>, value: Vec<u8>, flags: NodeFlags) -> Self {
        let dsize = value.len() as u32;
        LeafEntry {
            flags,
            key,
            data: value,
            dsize,
        }
    }

    pub(crate) fn overflow(key: Vec<u8>, pgno: PageId, len: usize) -> Self {
        LeafEntry {
            flags: NodeFlags::BIGDATA,
            key,
            data: pgno.to_le_bytes().to_vec(),
            dsize: len as u32,
        }
    }

    fn size(&self) -> usize {
        LEAF_ENTRY_HEADER + self.key.len() + self.data.len()
    }
}

/// Reject values whose length does not fit the entry header.
pub(crate) fn check_value_len(len: usize) -> Result<()> {
    if len > MAX_VALUE_SIZE {
        return Err(Error::BadValSize);
    }
    Ok(())
}

/// Whether a value of `len` bytes under `key` has to go to overflow pages.
pub(crate) fn needs_overflow(key: &[u8], len: usize) -> bool {
    LEAF_ENTRY_HEADER + key.len() + len > MAX_NODE_SIZE
}

/// Branch entry of an owned node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BranchEntry {
    pub(crate) key: Vec<u8>,
    pub(crate) child: PageId,
}

impl BranchEntry {
    fn size(&self) -> usize {
        BRANCH_ENTRY_HEADER + self.key.len()
    }
}

/// Owned, editable copy of a tree page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf(Vec<LeafEntry>),
    Branch(Vec<BranchEntry>),
}

impl Node {
    pub(crate) fn len(&self) -> usize {
        match self {
            Node::Leaf(e) => e.len(),
            Node::Branch(e) => e.len(),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    fn entry_size(&self, i: usize) -> usize {
        SLOT_SIZE
            + match self {
                Node::Leaf(e) => e[i].size(),
                Node::Branch(e) => e[i].size(),
            }
    }

    /// Bytes used below the page header.
    pub(crate) fn used(&self) -> usize {
        (0..self.len()).map(|i| self.entry_size(i)).sum()
    }

    pub(crate) fn fits(&self) -> bool {
        self.used() <= PAGE_CAPACITY
    }

    pub(crate) fn is_underfull(&self) -> bool {
        match self {
            Node::Leaf(e) => e.is_empty() || self.used() < FILL_THRESHOLD,
            Node::Branch(e) => e.len() < 2 || self.used() < FILL_THRESHOLD,
        }
    }

    /// Split off the upper part of an oversized node, balanced by bytes.
    ///
    /// Returns the separator key for the upper part. For branches the
    /// separator is moved out of the first upper entry.
    pub(crate) fn split_off(&mut self) -> (Vec<u8>, Node) {
        let total = self.used();
        let n = self.len();
        let mut acc = 0;
        let mut at = n - 1;
        for i in 0..n {
            acc += self.entry_size(i);
            if acc >= total / 2 {
                at = (i + 1).clamp(1, n - 1);
                break;
            }
        }
        match self {
            Node::Leaf(entries) => {
                let upper = entries.split_off(at);
                (upper[0].key.clone(), Node::Leaf(upper))
            }
            Node::Branch(entries) => {
                let mut upper = entries.split_off(at);
                let sep = std::mem::take(&mut upper[0].key);
                (sep, Node::Branch(upper))
            }
        }
    }

    pub(crate) fn encode(&self, pgno: PageId) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let count = self.len();
        let flags = if self.is_leaf() {
            PageFlags::LEAF
        } else {
            PageFlags::BRANCH
        };
        write_header(&mut buf, pgno, flags, count as u16, 0);
        let mut off = PAGE_HEADER_SIZE + count * SLOT_SIZE;
        for i in 0..count {
            let slot = PAGE_HEADER_SIZE + i * SLOT_SIZE;
            buf[slot..slot + SLOT_SIZE].copy_from_slice(&(off as u16).to_le_bytes());
            match self {
                Node::Leaf(entries) => {
                    let e = &entries[i];
                    buf[off..off + 2].copy_from_slice(&e.flags.bits().to_le_bytes());
                    buf[off + 2..off + 4].copy_from_slice(&(e.key.len() as u16).to_le_bytes());
                    buf[off + 4..off + 8].copy_from_slice(&e.dsize.to_le_bytes());
                    let k = off + LEAF_ENTRY_HEADER;
                    buf[k..k + e.key.len()].copy_from_slice(&e.key);
                    let d = k + e.key.len();
                    buf[d..d + e.data.len()].copy_from_slice(&e.data);
                    off = d + e.data.len();
                }
                Node::Branch(entries) => {
                    let e = &entries[i];
                    buf[off..off + 8].copy_from_slice(&e.child.to_le_bytes());
                    buf[off + 8..off + 10].copy_from_slice(&(e.key.len() as u16).to_le_bytes());
                    let k = off + BRANCH_ENTRY_HEADER;
                    buf[k..k + e.key.len()].copy_from_slice(&e.key);
                    off = k + e.key.len();
                }
            }
        }
        buf
    }
}

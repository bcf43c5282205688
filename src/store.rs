//! Page storage of a write transaction.
//!
//! Committed pages are only ever read, straight out of the memory map. Pages
//! written by the transaction live in memory, one [`Frame`] per nesting level,
//! until commit writes them to the file.

use std::collections::HashMap;

use crate::constants::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::meta::PageId;
use crate::midl::IdList;
use crate::page::{PageRead, PageWrite};

/// Read `len` bytes at page `pgno` of a committed snapshot ending at `last_pgno`.
pub(crate) fn read_committed(map: &[u8], last_pgno: PageId, pgno: PageId, len: usize) -> Result<&[u8]> {
    let past_end = || {
        Error::corrupted(format!(
            "page {} is past the end of the snapshot ({} pages)",
            pgno, last_pgno
        ))
    };
    if pgno >= last_pgno {
        return Err(past_end());
    }
    let start = usize::try_from(pgno)
        .ok()
        .and_then(|p| p.checked_mul(PAGE_SIZE))
        .ok_or_else(past_end)?;
    let end = start.checked_add(len).ok_or_else(past_end)?;
    let limit = usize::try_from(last_pgno)
        .ok()
        .and_then(|p| p.checked_mul(PAGE_SIZE))
        .map_or(map.len(), |bytes| bytes.min(map.len()));
    if end > limit {
        return Err(past_end());
    }
    Ok(&map[start..end])
}

/// Pages of a committed snapshot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot<'a> {
    pub(crate) map: &'a [u8],
    pub(crate) last_pgno: PageId,
}

impl PageRead for Snapshot<'_> {
    fn page_span(&self, pgno: PageId, len: usize) -> Result<&[u8]> {
        read_committed(self.map, self.last_pgno, pgno, len)
    }
}

/// Dirty pages of one nesting level.
#[derive(Debug, Default)]
struct Frame {
    dirty: HashMap<PageId, Vec<u8>>,
    /// Pages dirty in an outer frame that this frame released
    outer_freed: Vec<(PageId, usize)>,
    /// Allocator state to restore if this frame is aborted
    saved: Option<Saved>,
}

#[derive(Debug)]
struct Saved {
    free: IdList,
    retired: usize,
    next_pgno: PageId,
}

/// Page allocator and dirty page cache of a write transaction.
#[derive(Debug)]
pub(crate) struct PageStore {
    frames: Vec<Frame>,
    /// Pages that can be handed out right away
    free: IdList,
    /// Committed pages replaced by this transaction
    retired: Vec<PageId>,
    /// First page never allocated
    next_pgno: PageId,
    /// Pages the map can hold
    max_pgno: PageId,
}

impl PageStore {
    pub(crate) fn new(free: IdList, next_pgno: PageId, max_pgno: PageId) -> Self {
        PageStore {
            frames: vec![Frame::default()],
            free,
            retired: Vec::new(),
            next_pgno,
            max_pgno,
        }
    }

    pub(crate) fn next_pgno(&self) -> PageId {
        self.next_pgno
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing was written yet.
    pub(crate) fn is_clean(&self) -> bool {
        self.frames.iter().all(|f| f.dirty.is_empty()) && self.retired.is_empty()
    }

    fn lookup(&self, pgno: PageId) -> Option<&Vec<u8>> {
        self.frames.iter().rev().find_map(|f| f.dirty.get(&pgno))
    }

    /// Dirty copy of `pgno` in any frame.
    pub(crate) fn dirty_span(&self, pgno: PageId, len: usize) -> Option<Result<&[u8]>> {
        self.lookup(pgno).map(|buf| {
            buf.get(..len)
                .ok_or_else(|| Error::corrupted(format!("read past dirty page {}", pgno)))
        })
    }

    /// Start a nested transaction.
    pub(crate) fn push_frame(&mut self) {
        let saved = Saved {
            free: self.free.clone(),
            retired: self.retired.len(),
            next_pgno: self.next_pgno,
        };
        self.frames.push(Frame {
            saved: Some(saved),
            ..Default::default()
        });
    }

    /// Fold the innermost frame into its parent.
    pub(crate) fn commit_frame(&mut self) {
        if self.frames.len() < 2 {
            return;
        }
        let Some(child) = self.frames.pop() else {
            return;
        };
        let Some(parent) = self.frames.last_mut() else {
            return;
        };
        parent.dirty.extend(child.dirty);
        for (pgno, npages) in child.outer_freed {
            if parent.dirty.remove(&pgno).is_some() {
                self.free.append_list(&run(pgno, npages));
            } else {
                parent.outer_freed.push((pgno, npages));
            }
        }
    }

    /// Discard the innermost frame and restore the allocator.
    pub(crate) fn abort_frame(&mut self) {
        if self.frames.len() < 2 {
            return;
        }
        if let Some(Frame { saved: Some(saved), .. }) = self.frames.pop() {
            self.free = saved.free;
            self.retired.truncate(saved.retired);
            self.next_pgno = saved.next_pgno;
        }
    }

    /// Hand the committed result over: dirty pages sorted by number, the
    /// remaining free list and the retired pages.
    pub(crate) fn into_parts(mut self) -> (Vec<(PageId, Vec<u8>)>, IdList, Vec<PageId>) {
        let mut pages: Vec<_> = self
            .frames
            .drain(..)
            .flat_map(|f| f.dirty.into_iter())
            .collect();
        pages.sort_unstable_by_key(|(pgno, _)| *pgno);
        (pages, self.free, self.retired)
    }
}

fn run(pgno: PageId, npages: usize) -> Vec<PageId> {
    (pgno..pgno + npages as PageId).collect()
}

/// Page access for a write transaction: dirty pages first, then the map.
pub(crate) struct WritePages<'a> {
    pub(crate) map: &'a [u8],
    pub(crate) last_pgno: PageId,
    pub(crate) store: &'a mut PageStore,
}

impl PageRead for WritePages<'_> {
    fn page_span(&self, pgno: PageId, len: usize) -> Result<&[u8]> {
        match self.store.dirty_span(pgno, len) {
            Some(found) => found,
            None => read_committed(self.map, self.last_pgno, pgno, len),
        }
    }
}

impl PageWrite for WritePages<'_> {
    fn is_writable(&self, pgno: PageId) -> bool {
        self.store
            .frames
            .last()
            .is_some_and(|f| f.dirty.contains_key(&pgno))
    }

    fn alloc(&mut self, npages: usize) -> Result<PageId> {
        let store = &mut *self.store;
        if let Some(pgno) = store.free.take_run(npages) {
            log::trace!("reusing pages {}..+{}", pgno, npages);
            return Ok(pgno);
        }
        let pgno = store.next_pgno;
        if pgno + npages as PageId > store.max_pgno {
            log::warn!(
                "map full: need {} pages at {}, map holds {}",
                npages,
                pgno,
                store.max_pgno
            );
            return Err(Error::MapFull);
        }
        store.next_pgno += npages as PageId;
        Ok(pgno)
    }

    fn put_page(&mut self, pgno: PageId, buf: Vec<u8>) {
        if let Some(frame) = self.store.frames.last_mut() {
            frame.dirty.insert(pgno, buf);
        }
    }

    fn free(&mut self, pgno: PageId, npages: usize) {
        let store = &mut *self.store;
        let depth = store.frames.len();
        if let Some(top) = store.frames.last_mut() {
            if top.dirty.remove(&pgno).is_some() {
                store.free.append_list(&run(pgno, npages));
                return;
            }
        }
        if store.frames[..depth.saturating_sub(1)]
            .iter()
            .any(|f| f.dirty.contains_key(&pgno))
        {
            if let Some(top) = store.frames.last_mut() {
                top.outer_freed.push((pgno, npages));
            }
            return;
        }
        store.retired.extend(run(pgno, npages));
    }
}

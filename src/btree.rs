//! Copy-on-write B+tree over pages.
//!
//! The functions here work on any [`PageWrite`] implementation and keep the
//! [`DbRecord`] of the tree (root, depth, page counts, entries) up to date.
//! A page that is already dirty in the current transaction is rewritten in
//! place; any other page is copied to a new page number and the old one is
//! handed back to the allocator, which keeps it intact for older snapshots.

use std::collections::HashSet;

use crate::constants::{NodeFlags, WriteFlags, P_INVALID};
use crate::database::CompareFn;
use crate::error::{Error, Result};
use crate::meta::{DbRecord, PageId};
use crate::page::{
    self, BranchEntry, LeafEntry, Node, NodeView, PageRead, PageWrite, ValueRef,
};

/// Piece of a rewritten node: its page and the key separating it from the
/// previous piece. The key of the first piece is unused.
#[derive(Debug)]
struct Piece {
    key: Vec<u8>,
    pgno: PageId,
}

/// Result of rewriting a subtree.
#[derive(Debug)]
struct Outcome {
    pieces: Vec<Piece>,
    underfull: bool,
}

impl Outcome {
    fn unchanged(pgno: PageId) -> Self {
        Outcome {
            pieces: vec![Piece {
                key: Vec::new(),
                pgno,
            }],
            underfull: false,
        }
    }
}

/// Look up `key`. Returns the node flags and the stored value.
pub(crate) fn get<'p, P: PageRead + ?Sized>(
    pages: &'p P,
    db: &DbRecord,
    cmp: CompareFn,
    key: &[u8],
) -> Result<Option<(NodeFlags, ValueRef<'p>)>> {
    if db.root == P_INVALID {
        return Ok(None);
    }
    let mut pgno = db.root;
    loop {
        let view = NodeView::new(pages.page(pgno)?)?;
        if view.is_leaf() {
            let (idx, exact) = view.search(key, cmp)?;
            if !exact {
                return Ok(None);
            }
            return Ok(Some((view.leaf_flags(idx)?, view.value(idx)?)));
        }
        pgno = view.child(view.child_index(key, cmp)?)?;
    }
}

/// Largest key in the tree.
pub(crate) fn last_key<P: PageRead + ?Sized>(pages: &P, db: &DbRecord) -> Result<Option<Vec<u8>>> {
    if db.root == P_INVALID {
        return Ok(None);
    }
    let mut pgno = db.root;
    loop {
        let view = NodeView::new(pages.page(pgno)?)?;
        if view.len() == 0 {
            return Ok(None);
        }
        if view.is_leaf() {
            return Ok(Some(view.key(view.len() - 1)?.to_vec()));
        }
        pgno = view.child(view.len() - 1)?;
    }
}

/// Insert or replace `key`.
///
/// `node_flags` marks internal records (`SUBDATA`); user data never collides
/// with them silently.
pub(crate) fn insert<P: PageWrite + ?Sized>(
    pages: &mut P,
    db: &mut DbRecord,
    cmp: CompareFn,
    key: &[u8],
    value: &[u8],
    node_flags: NodeFlags,
    flags: WriteFlags,
) -> Result<()> {
    page::check_value_len(value.len())?;
    if flags.contains(WriteFlags::APPEND) {
        if let Some(last) = last_key(&*pages, db)? {
            if cmp(key, &last) != std::cmp::Ordering::Greater {
                return Err(Error::KeyExist);
            }
        }
    }

    if db.root == P_INVALID {
        let entry = new_entry(pages, db, key, value, node_flags)?;
        let pgno = pages.alloc(1)?;
        pages.put_page(pgno, Node::Leaf(vec![entry]).encode(pgno));
        db.root = pgno;
        db.depth = 1;
        db.leaf_pages += 1;
        db.entries += 1;
        log::trace!("new root leaf {}", pgno);
        return Ok(());
    }

    let root = db.root;
    let outcome = insert_at(pages, db, cmp, root, key, value, node_flags, flags)?;
    set_root(pages, db, outcome.pieces)
}

#[allow(clippy::too_many_arguments)]
fn insert_at<P: PageWrite + ?Sized>(
    pages: &mut P,
    db: &mut DbRecord,
    cmp: CompareFn,
    pgno: PageId,
    key: &[u8],
    value: &[u8],
    node_flags: NodeFlags,
    flags: WriteFlags,
) -> Result<Outcome> {
    let view = NodeView::new(pages.page(pgno)?)?;
    if !view.is_leaf() {
        let ci = view.child_index(key, cmp)?;
        let child = view.child(ci)?;
        let outcome = insert_at(pages, db, cmp, child, key, value, node_flags, flags)?;
        return replace_child(pages, db, pgno, ci, child, outcome);
    }

    let (idx, exact) = view.search(key, cmp)?;
    let mut old_overflow = None;
    if exact {
        let existing = view.leaf_flags(idx)?;
        if existing.contains(NodeFlags::SUBDATA) != node_flags.contains(NodeFlags::SUBDATA) {
            return Err(Error::Incompatible);
        }
        if flags.contains(WriteFlags::NOOVERWRITE) {
            return Err(Error::KeyExist);
        }
        if let ValueRef::Overflow { pgno, .. } = view.value(idx)? {
            old_overflow = Some(pgno);
        }
    }
    let Node::Leaf(mut entries) = view.to_node()? else {
        return Err(Error::corrupted("expected a leaf page"));
    };

    if let Some(run) = old_overflow {
        free_overflow(pages, db, run)?;
    }
    let entry = new_entry(pages, db, key, value, node_flags)?;
    if exact {
        entries[idx] = entry;
    } else {
        entries.insert(idx, entry);
        db.entries += 1;
    }
    let target = touch(pages, pgno)?;
    write_node(pages, db, target, Node::Leaf(entries))
}

fn new_entry<P: PageWrite + ?Sized>(
    pages: &mut P,
    db: &mut DbRecord,
    key: &[u8],
    value: &[u8],
    node_flags: NodeFlags,
) -> Result<LeafEntry> {
    if !page::needs_overflow(key, value.len()) {
        return Ok(LeafEntry::inline(key.to_vec(), value.to_vec(), node_flags));
    }
    let npages = page::overflow_pages(value.len());
    let pgno = pages.alloc(npages)?;
    pages.put_page(pgno, page::encode_overflow(pgno, value));
    db.overflow_pages += npages as u64;
    log::trace!("overflow run {} ({} pages)", pgno, npages);
    Ok(LeafEntry::overflow(key.to_vec(), pgno, value.len()))
}

fn free_overflow<P: PageWrite + ?Sized>(pages: &mut P, db: &mut DbRecord, pgno: PageId) -> Result<()> {
    let npages = page::overflow_run_len(pages.page(pgno)?)?;
    pages.free(pgno, npages);
    db.overflow_pages = db.overflow_pages.saturating_sub(npages as u64);
    Ok(())
}

/// Remove `key`. Fails with `NotFound` if it is absent.
pub(crate) fn delete<P: PageWrite + ?Sized>(
    pages: &mut P,
    db: &mut DbRecord,
    cmp: CompareFn,
    key: &[u8],
    node_flags: NodeFlags,
) -> Result<()> {
    if db.root == P_INVALID {
        return Err(Error::NotFound);
    }
    let root = db.root;
    let outcome = delete_at(pages, db, cmp, root, key, node_flags)?;
    set_root(pages, db, outcome.pieces)?;
    collapse_root(pages, db)
}

fn delete_at<P: PageWrite + ?Sized>(
    pages: &mut P,
    db: &mut DbRecord,
    cmp: CompareFn,
    pgno: PageId,
    key: &[u8],
    node_flags: NodeFlags,
) -> Result<Outcome> {
    let view = NodeView::new(pages.page(pgno)?)?;
    if !view.is_leaf() {
        let ci = view.child_index(key, cmp)?;
        let child = view.child(ci)?;
        let outcome = delete_at(pages, db, cmp, child, key, node_flags)?;
        return replace_child(pages, db, pgno, ci, child, outcome);
    }

    let (idx, exact) = view.search(key, cmp)?;
    if !exact {
        return Err(Error::NotFound);
    }
    if view.leaf_flags(idx)?.contains(NodeFlags::SUBDATA) != node_flags.contains(NodeFlags::SUBDATA) {
        return Err(Error::Incompatible);
    }
    let old_overflow = match view.value(idx)? {
        ValueRef::Overflow { pgno, .. } => Some(pgno),
        ValueRef::Inline(_) => None,
    };
    let Node::Leaf(mut entries) = view.to_node()? else {
        return Err(Error::corrupted("expected a leaf page"));
    };
    if let Some(run) = old_overflow {
        free_overflow(pages, db, run)?;
    }
    entries.remove(idx);
    db.entries = db.entries.saturating_sub(1);
    let target = touch(pages, pgno)?;
    write_node(pages, db, target, Node::Leaf(entries))
}

/// Splice a rewritten child back into branch `pgno` and rebalance it if it
/// became underfull.
fn replace_child<P: PageWrite + ?Sized>(
    pages: &mut P,
    db: &mut DbRecord,
    pgno: PageId,
    ci: usize,
    old_child: PageId,
    outcome: Outcome,
) -> Result<Outcome> {
    if outcome.pieces.len() == 1 && outcome.pieces[0].pgno == old_child && !outcome.underfull {
        return Ok(Outcome::unchanged(pgno));
    }

    let Node::Branch(mut entries) = NodeView::new(pages.page(pgno)?)?.to_node()? else {
        return Err(Error::corrupted("expected a branch page"));
    };
    splice(&mut entries, ci, outcome.pieces);

    if outcome.underfull && entries.len() > 1 {
        let (li, ri) = if ci + 1 < entries.len() {
            (ci, ci + 1)
        } else {
            (ci - 1, ci)
        };
        rebalance(pages, db, &mut entries, li, ri)?;
    }

    let target = touch(pages, pgno)?;
    write_node(pages, db, target, Node::Branch(entries))
}

fn splice(entries: &mut Vec<BranchEntry>, at: usize, pieces: Vec<Piece>) {
    let mut pieces = pieces.into_iter();
    if let Some(first) = pieces.next() {
        entries[at].child = first.pgno;
    }
    for (n, piece) in pieces.enumerate() {
        entries.insert(
            at + 1 + n,
            BranchEntry {
                key: piece.key,
                child: piece.pgno,
            },
        );
    }
}

/// Merge children `li` and `ri` (adjacent) and split the result again if it
/// does not fit a single page.
fn rebalance<P: PageWrite + ?Sized>(
    pages: &mut P,
    db: &mut DbRecord,
    entries: &mut Vec<BranchEntry>,
    li: usize,
    ri: usize,
) -> Result<()> {
    let left_pg = entries[li].child;
    let right_pg = entries[ri].child;
    let left = NodeView::new(pages.page(left_pg)?)?.to_node()?;
    let right = NodeView::new(pages.page(right_pg)?)?.to_node()?;

    let merged = match (left, right) {
        (Node::Leaf(mut l), Node::Leaf(r)) => {
            l.extend(r);
            db.leaf_pages = db.leaf_pages.saturating_sub(1);
            Node::Leaf(l)
        }
        (Node::Branch(mut l), Node::Branch(mut r)) => {
            // The separator comes down as the key of the right node's first child.
            if let Some(first) = r.first_mut() {
                first.key = entries[ri].key.clone();
            }
            l.extend(r);
            db.branch_pages = db.branch_pages.saturating_sub(1);
            Node::Branch(l)
        }
        _ => return Err(Error::corrupted("siblings at different depths")),
    };
    pages.free(right_pg, 1);
    log::trace!("merged page {} into {}", right_pg, left_pg);

    let target = touch(pages, left_pg)?;
    let outcome = write_node(pages, db, target, merged)?;
    entries.remove(ri);
    splice(entries, li, outcome.pieces);
    Ok(())
}

/// Get a writable version of `pgno`.
fn touch<P: PageWrite + ?Sized>(pages: &mut P, pgno: PageId) -> Result<PageId> {
    if pages.is_writable(pgno) {
        return Ok(pgno);
    }
    let new = pages.alloc(1)?;
    pages.free(pgno, 1);
    log::trace!("touched page {} -> {}", pgno, new);
    Ok(new)
}

/// Encode `node` into `target`, splitting it over new pages as needed.
fn write_node<P: PageWrite + ?Sized>(
    pages: &mut P,
    db: &mut DbRecord,
    target: PageId,
    node: Node,
) -> Result<Outcome> {
    let leaf = node.is_leaf();
    let mut parts = vec![(Vec::new(), node)];
    let mut i = 0;
    while i < parts.len() {
        if parts[i].1.fits() {
            i += 1;
            continue;
        }
        let (sep, upper) = parts[i].1.split_off();
        parts.insert(i + 1, (sep, upper));
    }

    let underfull = parts.len() == 1 && parts[0].1.is_underfull();
    let mut pieces = Vec::with_capacity(parts.len());
    for (n, (key, node)) in parts.into_iter().enumerate() {
        let pgno = if n == 0 {
            target
        } else {
            let pgno = pages.alloc(1)?;
            if leaf {
                db.leaf_pages += 1;
            } else {
                db.branch_pages += 1;
            }
            log::trace!("split into page {}", pgno);
            pgno
        };
        pages.put_page(pgno, node.encode(pgno));
        pieces.push(Piece { key, pgno });
    }
    Ok(Outcome { pieces, underfull })
}

/// Install the rewritten root, growing the tree while it is split.
fn set_root<P: PageWrite + ?Sized>(pages: &mut P, db: &mut DbRecord, mut pieces: Vec<Piece>) -> Result<()> {
    while pieces.len() > 1 {
        let entries = pieces
            .into_iter()
            .enumerate()
            .map(|(n, p)| BranchEntry {
                key: if n == 0 { Vec::new() } else { p.key },
                child: p.pgno,
            })
            .collect();
        let pgno = pages.alloc(1)?;
        db.branch_pages += 1;
        db.depth += 1;
        log::trace!("new root branch {} (depth {})", pgno, db.depth);
        pieces = write_node(pages, db, pgno, Node::Branch(entries))?.pieces;
    }
    if let Some(root) = pieces.pop() {
        db.root = root.pgno;
    }
    Ok(())
}

fn collapse_root<P: PageWrite + ?Sized>(pages: &mut P, db: &mut DbRecord) -> Result<()> {
    loop {
        let view = NodeView::new(pages.page(db.root)?)?;
        if view.is_leaf() {
            if view.len() == 0 {
                pages.free(db.root, 1);
                *db = DbRecord::empty(db.flags);
            }
            return Ok(());
        }
        if view.len() != 1 {
            return Ok(());
        }
        let child = view.child(0)?;
        pages.free(db.root, 1);
        db.root = child;
        db.branch_pages = db.branch_pages.saturating_sub(1);
        db.depth = db.depth.saturating_sub(1);
    }
}

/// Every page of the tree, as `(first page, page count)` runs.
pub(crate) fn collect_pages<P: PageRead + ?Sized>(
    pages: &P,
    db: &DbRecord,
    out: &mut Vec<(PageId, usize)>,
) -> Result<()> {
    if db.root == P_INVALID {
        return Ok(());
    }
    let mut seen = HashSet::new();
    let mut stack = vec![db.root];
    while let Some(pgno) = stack.pop() {
        if !seen.insert(pgno) {
            return Err(Error::corrupted(format!("page {} is linked twice", pgno)));
        }
        out.push((pgno, 1));
        let view = NodeView::new(pages.page(pgno)?)?;
        if view.is_leaf() {
            for i in 0..view.len() {
                if let ValueRef::Overflow { pgno: run, .. } = view.value(i)? {
                    out.push((run, page::overflow_run_len(pages.page(run)?)?));
                }
            }
        } else {
            for i in 0..view.len() {
                stack.push(view.child(i)?);
            }
        }
    }
    Ok(())
}

/// Records of the named databases stored in a main tree.
pub(crate) fn sub_databases<P: PageRead + ?Sized>(
    pages: &P,
    main: &DbRecord,
) -> Result<Vec<(Vec<u8>, DbRecord)>> {
    let mut found = Vec::new();
    if main.root == P_INVALID {
        return Ok(found);
    }
    let mut stack = vec![main.root];
    while let Some(pgno) = stack.pop() {
        let view = NodeView::new(pages.page(pgno)?)?;
        for i in 0..view.len() {
            if !view.is_leaf() {
                stack.push(view.child(i)?);
            } else if view.leaf_flags(i)?.contains(NodeFlags::SUBDATA) {
                let raw = view.value(i)?.resolve(pages)?;
                found.push((view.key(i)?.to_vec(), DbRecord::decode(raw)?));
            }
        }
    }
    Ok(found)
}

/// Release every page of the tree and reset its record.
pub(crate) fn clear<P: PageWrite + ?Sized>(pages: &mut P, db: &mut DbRecord) -> Result<()> {
    let mut runs = Vec::new();
    collect_pages(&*pages, db, &mut runs)?;
    for (pgno, npages) in runs {
        pages.free(pgno, npages);
    }
    *db = DbRecord::empty(db.flags);
    Ok(())
}

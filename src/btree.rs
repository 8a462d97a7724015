//! The copy-on-write B+tree engine (§4.5), the largest single piece of
//! the crate.
//!
//! The teacher's `bucket.rs`/`node.rs` sketched a `Bucket`/`Node` pair
//! with a `root` pgno and `put`/`get`/`delete` stubs that never touched
//! real page bytes. This module is the real thing: every mutating
//! operation decodes a page's entries into an owned `Vec`, edits the
//! Vec, and re-renders the whole page -- simpler to get right than
//! in-place byte shuffling, at the cost of an O(entries) rebuild per
//! touched page (see DESIGN.md).
//!
//! Search and positioning are generic over [`PageReader`] so the same
//! code drives read-only and read-write transactions alike; mutation
//! (`tree_insert`/`tree_delete`) requires a [`WriteTxn`] since it
//! allocates and dirties pages.

use std::cmp::Ordering;

use crate::bytes::{get_u32, put_u16};
use crate::cmp::Comparator;
use crate::consts::{MAX_KEY_SIZE, MAX_VALUE_SIZE, MIN_FILL_PERCENTAGE, OVERFLOW_THRESHOLD_DIVISOR};
use crate::error::{Error, Result};
use crate::meta::TreeDescriptor;
use crate::page::{
    branch_descend_index, branch_node_size, is_invalid_pgno, leaf_node_size, new_page_buffer,
    write_branch_node, write_node, NodeFlags, PageFlags, PageHeader, PageView, PAGE_HEADER_SIZE,
    POINTER_SIZE,
};
use crate::txn::{PageReader, WriteTxn};

/// One step of a root-to-leaf descent: the page visited and the entry
/// index chosen (or found) on it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PathEntry {
    pub pgno: u32,
    pub index: usize,
}

#[derive(Clone)]
struct LeafEntry {
    flags: NodeFlags,
    key: Vec<u8>,
    data_size: u32,
    value: Vec<u8>,
}

#[derive(Clone)]
struct BranchEntry {
    key: Vec<u8>,
    child: u32,
}

#[derive(Default)]
struct Stats {
    items_delta: i64,
    leaf_pages_delta: i64,
    branch_pages_delta: i64,
    large_pages_delta: i64,
}

enum Grow {
    Absorbed(u32),
    Split(u32, Vec<u8>, u32),
}

// ---------------------------------------------------------------------
// Search / positioning (read-only, generic over PageReader)
// ---------------------------------------------------------------------

/// Descend from `root` to the leaf that would hold `key`, recording the
/// path taken. Returns `(path, exact)`; `path` is empty iff `root` is
/// `INVALID_PGNO` (an empty tree).
pub(crate) fn search_path<R: PageReader>(
    reader: &R,
    root: u32,
    key: &[u8],
    cmp: Comparator,
) -> Result<(Vec<PathEntry>, bool)> {
    let mut path = Vec::new();
    if is_invalid_pgno(root) {
        return Ok((path, false));
    }
    let mut pgno = root;
    loop {
        let buf = reader.read_page(pgno)?;
        let view = PageView::new(&buf)?;
        let (idx, exact) = view.search(key, cmp)?;
        if view.is_branch() {
            let descend = branch_descend_index(idx, exact);
            path.push(PathEntry { pgno, index: descend });
            pgno = view.node_at(descend)?.child_pgno;
        } else {
            path.push(PathEntry { pgno, index: idx });
            return Ok((path, exact));
        }
    }
}

/// Leftmost path in the tree, or `None` if it's empty.
pub(crate) fn first_path<R: PageReader>(reader: &R, root: u32) -> Result<Option<Vec<PathEntry>>> {
    descend_extreme(reader, root, true)
}

/// Rightmost path in the tree, or `None` if it's empty.
pub(crate) fn last_path<R: PageReader>(reader: &R, root: u32) -> Result<Option<Vec<PathEntry>>> {
    descend_extreme(reader, root, false)
}

fn descend_extreme<R: PageReader>(reader: &R, root: u32, forward: bool) -> Result<Option<Vec<PathEntry>>> {
    if is_invalid_pgno(root) {
        return Ok(None);
    }
    let mut path = Vec::new();
    let mut pgno = root;
    loop {
        let buf = reader.read_page(pgno)?;
        let view = PageView::new(&buf)?;
        let n = view.num_entries();
        if view.is_branch() {
            let idx = if forward { 0 } else { n.saturating_sub(1) };
            path.push(PathEntry { pgno, index: idx });
            pgno = view.node_at(idx)?.child_pgno;
        } else {
            if n == 0 {
                return Ok(None);
            }
            let idx = if forward { 0 } else { n - 1 };
            path.push(PathEntry { pgno, index: idx });
            return Ok(Some(path));
        }
    }
}

/// Move `path` one entry forward (`forward = true`) or backward, walking
/// back up the tree and re-descending the sibling subtree as needed.
/// Returns `false` if there is no further entry in that direction.
pub(crate) fn step_path<R: PageReader>(reader: &R, path: &mut Vec<PathEntry>, forward: bool) -> Result<bool> {
    if path.is_empty() {
        return Ok(false);
    }
    {
        let leaf = path.last().copied().unwrap();
        let buf = reader.read_page(leaf.pgno)?;
        let view = PageView::new(&buf)?;
        let n = view.num_entries();
        if forward && leaf.index + 1 < n {
            path.last_mut().unwrap().index += 1;
            return Ok(true);
        }
        if !forward && leaf.index > 0 {
            path.last_mut().unwrap().index -= 1;
            return Ok(true);
        }
    }
    path.pop();
    while let Some(parent) = path.last().copied() {
        let buf = reader.read_page(parent.pgno)?;
        let view = PageView::new(&buf)?;
        let n = view.num_entries();
        let moved_index = if forward {
            if parent.index + 1 < n {
                Some(parent.index + 1)
            } else {
                None
            }
        } else if parent.index > 0 {
            Some(parent.index - 1)
        } else {
            None
        };
        if let Some(new_index) = moved_index {
            path.last_mut().unwrap().index = new_index;
            let child = view.node_at(new_index)?.child_pgno;
            drop(view);
            redescend_extreme(reader, path, child, forward)?;
            return Ok(true);
        }
        path.pop();
    }
    Ok(false)
}

fn redescend_extreme<R: PageReader>(reader: &R, path: &mut Vec<PathEntry>, start: u32, forward: bool) -> Result<()> {
    let mut pgno = start;
    loop {
        let buf = reader.read_page(pgno)?;
        let view = PageView::new(&buf)?;
        let n = view.num_entries();
        if view.is_branch() {
            let idx = if forward { 0 } else { n.saturating_sub(1) };
            path.push(PathEntry { pgno, index: idx });
            pgno = view.node_at(idx)?.child_pgno;
        } else {
            let idx = if forward { 0 } else { n.saturating_sub(1) };
            path.push(PathEntry { pgno, index: idx });
            return Ok(());
        }
    }
}

/// Decode the node a path's final (leaf) entry points at.
pub(crate) fn leaf_node_at<R: PageReader>(reader: &R, path: &[PathEntry]) -> Result<(Box<[u8]>, usize)> {
    let entry = path.last().ok_or_else(|| Error::Panic("empty cursor path".into()))?;
    Ok((reader.read_page(entry.pgno)?, entry.index))
}

/// Fetch the fully-materialized value given a node's raw parts,
/// resolving overflow pages or the first duplicate for DUP/TREE-flagged
/// nodes (the plain `Get` convention when the tree is DUPSORT). Takes
/// owned/borrowed parts rather than a `Node` so callers holding only a
/// decoded, detached copy (e.g. a cursor's current position) can use it
/// too.
pub(crate) fn resolve_value<R: PageReader>(reader: &R, flags: NodeFlags, raw_value: &[u8], data_size: u32) -> Result<Vec<u8>> {
    if flags.contains(NodeFlags::BIG) {
        let start = get_u32(raw_value, 0, u32::MAX)?;
        read_overflow(reader, start, data_size)
    } else if flags.contains(NodeFlags::DUP) {
        crate::dupsort::first_subpage_value(raw_value)
    } else if flags.contains(NodeFlags::TREE) {
        let descriptor = TreeDescriptor::read(raw_value, 0, u32::MAX)?;
        let path = first_path(reader, descriptor.root)?;
        match path {
            Some(p) => {
                let (buf, idx) = leaf_node_at(reader, &p)?;
                let view = PageView::new(&buf)?;
                Ok(view.node_at(idx)?.key.to_vec())
            }
            None => Ok(Vec::new()),
        }
    } else {
        Ok(raw_value.to_vec())
    }
}

/// As [`resolve_value`], taking a freshly-decoded [`crate::page::Node`] directly.
pub(crate) fn node_value<R: PageReader>(reader: &R, node: &crate::page::Node<'_>) -> Result<Vec<u8>> {
    resolve_value(reader, node.flags, node.value, node.data_size)
}

/// Point lookup by primary key.
pub(crate) fn tree_get<R: PageReader>(reader: &R, root: u32, key: &[u8], cmp: Comparator) -> Result<Option<Vec<u8>>> {
    let (path, exact) = search_path(reader, root, key, cmp)?;
    if !exact {
        return Ok(None);
    }
    let (buf, idx) = leaf_node_at(reader, &path)?;
    let view = PageView::new(&buf)?;
    let node = view.node_at(idx)?;
    Ok(Some(node_value(reader, &node)?))
}

// ---------------------------------------------------------------------
// Overflow ("BIG") pages
// ---------------------------------------------------------------------

fn write_overflow(txn: &mut WriteTxn, value: &[u8]) -> Result<(u32, u32)> {
    let page_size = txn.page_size() as usize;
    let payload = page_size - PAGE_HEADER_SIZE;
    let count = (((value.len() + payload - 1) / payload).max(1)) as u32;
    let start = txn.alloc_contiguous(count)?;
    for i in 0..count {
        let pgno = start + i;
        let mut buf = new_page_buffer(pgno, txn.txnid(), PageFlags::OVERFLOW, page_size as u32);
        let off = i as usize * payload;
        let end = ((i as usize + 1) * payload).min(value.len());
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + (end - off)].copy_from_slice(&value[off..end]);
        txn.put_raw_page(pgno, buf.into_boxed_slice());
    }
    Ok((start, count))
}

fn read_overflow<R: PageReader>(reader: &R, start: u32, data_size: u32) -> Result<Vec<u8>> {
    let page_size = reader.page_size() as usize;
    let payload = page_size - PAGE_HEADER_SIZE;
    let count = (((data_size as usize + payload - 1) / payload).max(1)) as u32;
    let mut out = Vec::with_capacity(data_size as usize);
    let mut remaining = data_size as usize;
    for i in 0..count {
        let buf = reader.read_page(start + i)?;
        let take = remaining.min(payload);
        out.extend_from_slice(&buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + take]);
        remaining -= take;
    }
    Ok(out)
}

fn retire_overflow(txn: &mut WriteTxn, start: u32, data_size: u32) -> u32 {
    let payload = txn.page_size() as usize - PAGE_HEADER_SIZE;
    let count = (((data_size as usize + payload - 1) / payload).max(1)) as u32;
    for i in 0..count {
        txn.retire(start + i);
    }
    count
}

/// Tear down every page of a promoted DUPSORT sub-tree (§4.6 "delete of
/// a key deletes its whole sub-tree").
pub(crate) fn retire_subtree(txn: &mut WriteTxn, root: u32) -> Result<()> {
    if is_invalid_pgno(root) {
        return Ok(());
    }
    let mut stack = vec![root];
    while let Some(pgno) = stack.pop() {
        let buf = txn.read_page(pgno)?;
        let view = PageView::new(&buf)?;
        if view.is_branch() {
            for i in 0..view.num_entries() {
                stack.push(view.node_at(i)?.child_pgno);
            }
        } else {
            for i in 0..view.num_entries() {
                let node = view.node_at(i)?;
                if node.flags.contains(NodeFlags::BIG) {
                    let start = get_u32(node.value, 0, pgno)?;
                    retire_overflow(txn, start, node.data_size);
                }
            }
        }
        txn.retire(pgno);
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Page (de/re)coding helpers
// ---------------------------------------------------------------------

fn decode_leaf(buf: &[u8]) -> Result<Vec<LeafEntry>> {
    let view = PageView::new(buf)?;
    let mut out = Vec::with_capacity(view.num_entries());
    for i in 0..view.num_entries() {
        let n = view.node_at(i)?;
        out.push(LeafEntry {
            flags: n.flags,
            key: n.key.to_vec(),
            data_size: n.data_size,
            value: n.value.to_vec(),
        });
    }
    Ok(out)
}

fn decode_branch(buf: &[u8]) -> Result<Vec<BranchEntry>> {
    let view = PageView::new(buf)?;
    let mut out = Vec::with_capacity(view.num_entries());
    for i in 0..view.num_entries() {
        let n = view.node_at(i)?;
        out.push(BranchEntry {
            key: n.key.to_vec(),
            child: n.child_pgno,
        });
    }
    Ok(out)
}

fn encoded_leaf_size(entries: &[LeafEntry]) -> usize {
    entries
        .iter()
        .map(|e| leaf_node_size(e.key.len(), e.value.len(), e.flags.contains(NodeFlags::BIG)))
        .sum()
}

fn encoded_branch_size(entries: &[BranchEntry]) -> usize {
    entries.iter().map(|e| branch_node_size(e.key.len())).sum()
}

fn render_leaf(pgno: u32, txnid: u64, page_size: u32, entries: &[LeafEntry]) -> Vec<u8> {
    let mut buf = new_page_buffer(pgno, txnid, PageFlags::LEAF, page_size);
    let mut lower = PAGE_HEADER_SIZE as u16;
    let mut upper = page_size as u16;
    for e in entries {
        let size = leaf_node_size(e.key.len(), e.value.len(), e.flags.contains(NodeFlags::BIG));
        upper -= (size - POINTER_SIZE) as u16;
        write_node(&mut buf, upper as usize, e.flags, &e.key, e.data_size, &e.value);
        put_u16(&mut buf, lower as usize, upper);
        lower += POINTER_SIZE as u16;
    }
    let mut header = PageHeader::read(&buf, pgno).expect("just-written page header");
    header.lower = lower;
    header.upper = upper;
    header.write(&mut buf);
    buf
}

fn render_branch(pgno: u32, txnid: u64, page_size: u32, entries: &[BranchEntry]) -> Vec<u8> {
    let mut buf = new_page_buffer(pgno, txnid, PageFlags::BRANCH, page_size);
    let mut lower = PAGE_HEADER_SIZE as u16;
    let mut upper = page_size as u16;
    for e in entries {
        let size = branch_node_size(e.key.len());
        upper -= (size - POINTER_SIZE) as u16;
        write_branch_node(&mut buf, upper as usize, &e.key, e.child);
        put_u16(&mut buf, lower as usize, upper);
        lower += POINTER_SIZE as u16;
    }
    let mut header = PageHeader::read(&buf, pgno).expect("just-written page header");
    header.lower = lower;
    header.upper = upper;
    header.write(&mut buf);
    buf
}

/// Choose a split point minimizing the larger resulting half's encoded
/// size; ties prefer keeping more entries in the left half (§4.5).
fn choose_split_point<T>(entries: &[T], size_of: impl Fn(&T) -> usize) -> usize {
    let n = entries.len();
    if n < 2 {
        return n;
    }
    let mut prefix = vec![0usize; n + 1];
    for i in 0..n {
        prefix[i + 1] = prefix[i] + size_of(&entries[i]);
    }
    let total = prefix[n];
    let mut best_idx = (n / 2).max(1);
    let mut best_max = usize::MAX;
    for i in 1..n {
        let left = prefix[i];
        let right = total - left;
        let m = left.max(right);
        if m < best_max || (m == best_max && left >= prefix[best_idx]) {
            best_max = m;
            best_idx = i;
        }
    }
    best_idx
}

// ---------------------------------------------------------------------
// Insert
// ---------------------------------------------------------------------

fn finish_leaf(txn: &mut WriteTxn, original_pgno: u32, entries: Vec<LeafEntry>, stats: &mut Stats) -> Result<Grow> {
    let page_size = txn.page_size();
    let avail = page_size as usize - PAGE_HEADER_SIZE;
    if encoded_leaf_size(&entries) <= avail {
        let new_pgno = txn.cow_page(original_pgno)?;
        let buf = render_leaf(new_pgno, txn.txnid(), page_size, &entries);
        txn.put_raw_page(new_pgno, buf.into_boxed_slice());
        Ok(Grow::Absorbed(new_pgno))
    } else {
        txn.retire(original_pgno);
        let split_at = choose_split_point(&entries, |e| {
            leaf_node_size(e.key.len(), e.value.len(), e.flags.contains(NodeFlags::BIG))
        });
        let (left_entries, right_entries) = entries.split_at(split_at);
        let left_pgno = txn.alloc_pgno()?;
        let right_pgno = txn.alloc_pgno()?;
        let sep_key = right_entries[0].key.clone();
        let left_buf = render_leaf(left_pgno, txn.txnid(), page_size, left_entries);
        let right_buf = render_leaf(right_pgno, txn.txnid(), page_size, right_entries);
        txn.put_raw_page(left_pgno, left_buf.into_boxed_slice());
        txn.put_raw_page(right_pgno, right_buf.into_boxed_slice());
        stats.leaf_pages_delta += 1;
        Ok(Grow::Split(left_pgno, sep_key, right_pgno))
    }
}

fn finish_branch(txn: &mut WriteTxn, original_pgno: u32, entries: Vec<BranchEntry>, stats: &mut Stats) -> Result<Grow> {
    let page_size = txn.page_size();
    let avail = page_size as usize - PAGE_HEADER_SIZE;
    if encoded_branch_size(&entries) <= avail {
        let new_pgno = txn.cow_page(original_pgno)?;
        let buf = render_branch(new_pgno, txn.txnid(), page_size, &entries);
        txn.put_raw_page(new_pgno, buf.into_boxed_slice());
        Ok(Grow::Absorbed(new_pgno))
    } else {
        txn.retire(original_pgno);
        let split_at = choose_split_point(&entries, |e| branch_node_size(e.key.len()));
        let (left_entries, right_entries) = entries.split_at(split_at);
        let sep_key = right_entries[0].key.clone();
        let mut right_owned = right_entries.to_vec();
        right_owned[0].key = Vec::new();
        let left_pgno = txn.alloc_pgno()?;
        let right_pgno = txn.alloc_pgno()?;
        let left_buf = render_branch(left_pgno, txn.txnid(), page_size, left_entries);
        let right_buf = render_branch(right_pgno, txn.txnid(), page_size, &right_owned);
        txn.put_raw_page(left_pgno, left_buf.into_boxed_slice());
        txn.put_raw_page(right_pgno, right_buf.into_boxed_slice());
        stats.branch_pages_delta += 1;
        Ok(Grow::Split(left_pgno, sep_key, right_pgno))
    }
}

fn insert_rec(
    txn: &mut WriteTxn,
    pgno: u32,
    cmp: Comparator,
    key: &[u8],
    new_flags: NodeFlags,
    new_value: &[u8],
    new_data_size: u32,
    overwrite: bool,
    stats: &mut Stats,
) -> Result<Grow> {
    let original = txn.read_page(pgno)?;
    let view = PageView::new(&original)?;
    if view.is_branch() {
        let (idx, exact) = view.search(key, cmp)?;
        let descend_idx = branch_descend_index(idx, exact);
        let child = view.node_at(descend_idx)?.child_pgno;
        drop(view);
        let grow = insert_rec(txn, child, cmp, key, new_flags, new_value, new_data_size, overwrite, stats)?;
        let mut entries = decode_branch(&original)?;
        match grow {
            Grow::Absorbed(new_child) => {
                entries[descend_idx].child = new_child;
            }
            Grow::Split(left, sep_key, right) => {
                entries[descend_idx].child = left;
                entries.insert(descend_idx + 1, BranchEntry { key: sep_key, child: right });
            }
        }
        finish_branch(txn, pgno, entries, stats)
    } else {
        let (idx, exact) = view.search(key, cmp)?;
        drop(view);
        let mut entries = decode_leaf(&original)?;
        if exact {
            if !overwrite {
                return Err(Error::KeyExist);
            }
            let old = entries.remove(idx);
            if old.flags.contains(NodeFlags::BIG) {
                let start = get_u32(&old.value, 0, pgno)?;
                let retired = retire_overflow(txn, start, old.data_size);
                stats.large_pages_delta -= retired as i64;
            }
        } else {
            stats.items_delta += 1;
        }
        let insert_at = entries.partition_point(|e| cmp.compare(&e.key, key) == Ordering::Less);
        entries.insert(
            insert_at,
            LeafEntry {
                flags: new_flags,
                key: key.to_vec(),
                data_size: new_data_size,
                value: new_value.to_vec(),
            },
        );
        finish_leaf(txn, pgno, entries, stats)
    }
}

/// Insert (or, with `overwrite`, upsert) `key`/`value` into `tree`.
/// Values larger than `page_size / OVERFLOW_THRESHOLD_DIVISOR` are
/// pushed to overflow pages automatically (§4.5).
pub(crate) fn tree_insert(
    txn: &mut WriteTxn,
    tree: TreeDescriptor,
    cmp: Comparator,
    key: &[u8],
    value: &[u8],
    overwrite: bool,
) -> Result<TreeDescriptor> {
    tree_insert_with_flags(txn, tree, cmp, key, value, NodeFlags::empty(), overwrite)
}

/// As `tree_insert`, but lets the caller force the node's representation
/// flags directly (used by the DUPSORT layer to write `DUP`/`TREE`
/// sub-page or sub-tree descriptors without them being mistaken for an
/// overflow-eligible plain value).
pub(crate) fn tree_insert_with_flags(
    txn: &mut WriteTxn,
    tree: TreeDescriptor,
    cmp: Comparator,
    key: &[u8],
    value: &[u8],
    forced_flags: NodeFlags,
    overwrite: bool,
) -> Result<TreeDescriptor> {
    if key.len() as u32 > MAX_KEY_SIZE {
        return Err(Error::BadValSize);
    }
    if value.len() as u32 > MAX_VALUE_SIZE {
        return Err(Error::BadValSize);
    }
    let page_size = txn.page_size();
    let mut descriptor = tree;
    let mut stats = Stats::default();

    let (node_flags, data_size, stored_value) = if forced_flags.is_empty() {
        let threshold = page_size as usize / OVERFLOW_THRESHOLD_DIVISOR as usize;
        if value.len() > threshold {
            let (start, count) = write_overflow(txn, value)?;
            stats.large_pages_delta += count as i64;
            (NodeFlags::BIG, value.len() as u32, start.to_le_bytes().to_vec())
        } else {
            (NodeFlags::empty(), value.len() as u32, value.to_vec())
        }
    } else {
        (forced_flags, value.len() as u32, value.to_vec())
    };

    if is_invalid_pgno(descriptor.root) {
        let pgno = txn.alloc_pgno()?;
        let entries = vec![LeafEntry {
            flags: node_flags,
            key: key.to_vec(),
            data_size,
            value: stored_value,
        }];
        let buf = render_leaf(pgno, txn.txnid(), page_size, &entries);
        txn.put_raw_page(pgno, buf.into_boxed_slice());
        descriptor.root = pgno;
        descriptor.height = 1;
        descriptor.leaf_pages = 1 + stats.leaf_pages_delta.max(0) as u32;
        descriptor.large_pages = stats.large_pages_delta.max(0) as u32;
        descriptor.items = 1;
        descriptor.mod_txnid = txn.txnid();
        return Ok(descriptor);
    }

    let grow = insert_rec(txn, descriptor.root, cmp, key, node_flags, &stored_value, data_size, overwrite, &mut stats)?;
    match grow {
        Grow::Absorbed(new_root) => descriptor.root = new_root,
        Grow::Split(left, sep_key, right) => {
            let new_root_pgno = txn.alloc_pgno()?;
            let entries = vec![
                BranchEntry { key: Vec::new(), child: left },
                BranchEntry { key: sep_key, child: right },
            ];
            let buf = render_branch(new_root_pgno, txn.txnid(), page_size, &entries);
            txn.put_raw_page(new_root_pgno, buf.into_boxed_slice());
            descriptor.root = new_root_pgno;
            descriptor.height += 1;
            stats.branch_pages_delta += 1;
        }
    }
    apply_stats(&mut descriptor, &stats, txn.txnid());
    Ok(descriptor)
}

/// Entry point used by the commit path to write a MainTree/GC-tree entry
/// keyed by a plain byte string (always lexicographic, always upsert).
pub(crate) fn tree_put_named(txn: &mut WriteTxn, tree: TreeDescriptor, key: &[u8], value: &[u8]) -> Result<TreeDescriptor> {
    tree_insert(txn, tree, Comparator::Lexicographic, key, value, true)
}

fn apply_stats(descriptor: &mut TreeDescriptor, stats: &Stats, txnid: u64) {
    descriptor.items = (descriptor.items as i64 + stats.items_delta).max(0) as u64;
    descriptor.leaf_pages = (descriptor.leaf_pages as i64 + stats.leaf_pages_delta).max(0) as u32;
    descriptor.branch_pages = (descriptor.branch_pages as i64 + stats.branch_pages_delta).max(0) as u32;
    descriptor.large_pages = (descriptor.large_pages as i64 + stats.large_pages_delta).max(0) as u32;
    descriptor.mod_txnid = txnid;
}

// ---------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------

fn finish_leaf_inplace(txn: &mut WriteTxn, pgno: u32, entries: Vec<LeafEntry>) -> Result<u32> {
    let page_size = txn.page_size();
    let new_pgno = txn.cow_page(pgno)?;
    let buf = render_leaf(new_pgno, txn.txnid(), page_size, &entries);
    txn.put_raw_page(new_pgno, buf.into_boxed_slice());
    Ok(new_pgno)
}

fn finish_branch_inplace(txn: &mut WriteTxn, pgno: u32, entries: Vec<BranchEntry>) -> Result<u32> {
    let page_size = txn.page_size();
    let new_pgno = txn.cow_page(pgno)?;
    let buf = render_branch(new_pgno, txn.txnid(), page_size, &entries);
    txn.put_raw_page(new_pgno, buf.into_boxed_slice());
    Ok(new_pgno)
}

fn is_underfull(used: usize, avail: usize) -> bool {
    (used as f32) < (avail as f32) * MIN_FILL_PERCENTAGE
}

/// After a child's subtree shrank, check whether it fell below the fill
/// threshold and, if so, merge it with an adjacent sibling (preferring
/// the right one) when the combined content fits a single page. This is
/// a merge-only rebalance: an underfull page with no mergeable sibling
/// is left as-is, which is still a structurally valid B+tree (§4.5,
/// see DESIGN.md for why redistribution is not implemented).
fn maybe_rebalance_child(txn: &mut WriteTxn, entries: &mut Vec<BranchEntry>, idx: usize, stats: &mut Stats) -> Result<()> {
    let page_size = txn.page_size() as usize;
    let avail = page_size - PAGE_HEADER_SIZE;
    let child_pgno = entries[idx].child;
    let child_buf = txn.read_page(child_pgno)?;
    let (used, is_leaf) = {
        let view = PageView::new(&child_buf)?;
        (avail - view.free_space(), view.is_leaf())
    };
    if !is_underfull(used, avail) {
        return Ok(());
    }
    let sibling_idx = if idx + 1 < entries.len() {
        idx + 1
    } else if idx > 0 {
        idx - 1
    } else {
        return Ok(());
    };
    let sib_pgno = entries[sibling_idx].child;
    let sib_buf = txn.read_page(sib_pgno)?;
    let (left_idx, right_idx) = if sibling_idx > idx { (idx, sibling_idx) } else { (sibling_idx, idx) };

    if is_leaf {
        let (left_buf, right_buf) = if left_idx == idx { (&child_buf, &sib_buf) } else { (&sib_buf, &child_buf) };
        let mut left = decode_leaf(left_buf)?;
        let right = decode_leaf(right_buf)?;
        if encoded_leaf_size(&left) + encoded_leaf_size(&right) > avail {
            return Ok(());
        }
        left.extend(right);
        txn.retire(entries[left_idx].child);
        txn.retire(entries[right_idx].child);
        let merged_pgno = txn.alloc_pgno()?;
        let buf = render_leaf(merged_pgno, txn.txnid(), page_size as u32, &left);
        txn.put_raw_page(merged_pgno, buf.into_boxed_slice());
        entries[left_idx].child = merged_pgno;
        entries.remove(right_idx);
        stats.leaf_pages_delta -= 1;
    } else {
        let (left_buf, right_buf) = if left_idx == idx { (&child_buf, &sib_buf) } else { (&sib_buf, &child_buf) };
        let mut left = decode_branch(left_buf)?;
        let mut right = decode_branch(right_buf)?;
        if !right.is_empty() {
            right[0].key = entries[right_idx].key.clone();
        }
        if encoded_branch_size(&left) + encoded_branch_size(&right) > avail {
            return Ok(());
        }
        left.extend(right);
        txn.retire(entries[left_idx].child);
        txn.retire(entries[right_idx].child);
        let merged_pgno = txn.alloc_pgno()?;
        let buf = render_branch(merged_pgno, txn.txnid(), page_size as u32, &left);
        txn.put_raw_page(merged_pgno, buf.into_boxed_slice());
        entries[left_idx].child = merged_pgno;
        entries.remove(right_idx);
        stats.branch_pages_delta -= 1;
    }
    Ok(())
}

fn delete_rec(txn: &mut WriteTxn, pgno: u32, cmp: Comparator, key: &[u8], stats: &mut Stats) -> Result<(u32, bool)> {
    let original = txn.read_page(pgno)?;
    let view = PageView::new(&original)?;
    if view.is_branch() {
        let (idx, exact) = view.search(key, cmp)?;
        let descend_idx = branch_descend_index(idx, exact);
        let child = view.node_at(descend_idx)?.child_pgno;
        drop(view);
        let (new_child, removed) = delete_rec(txn, child, cmp, key, stats)?;
        let mut entries = decode_branch(&original)?;
        entries[descend_idx].child = new_child;
        if removed {
            maybe_rebalance_child(txn, &mut entries, descend_idx, stats)?;
        }
        let new_pgno = finish_branch_inplace(txn, pgno, entries)?;
        Ok((new_pgno, removed))
    } else {
        let (idx, exact) = view.search(key, cmp)?;
        drop(view);
        if !exact {
            return Ok((pgno, false));
        }
        let mut entries = decode_leaf(&original)?;
        let old = entries.remove(idx);
        if old.flags.contains(NodeFlags::BIG) {
            let start = get_u32(&old.value, 0, pgno)?;
            let retired = retire_overflow(txn, start, old.data_size);
            stats.large_pages_delta -= retired as i64;
        }
        if old.flags.contains(NodeFlags::TREE) {
            if let Ok(descriptor) = TreeDescriptor::read(&old.value, 0, pgno) {
                retire_subtree(txn, descriptor.root)?;
            }
        }
        stats.items_delta -= 1;
        let new_pgno = finish_leaf_inplace(txn, pgno, entries)?;
        Ok((new_pgno, true))
    }
}

/// Delete `key` from `tree`. Returns the updated descriptor and whether
/// anything was actually removed.
pub(crate) fn tree_delete(txn: &mut WriteTxn, tree: TreeDescriptor, cmp: Comparator, key: &[u8]) -> Result<(TreeDescriptor, bool)> {
    if is_invalid_pgno(tree.root) {
        return Ok((tree, false));
    }
    let mut stats = Stats::default();
    let (new_root, removed) = delete_rec(txn, tree.root, cmp, key, &mut stats)?;
    if !removed {
        return Ok((tree, false));
    }
    let mut descriptor = tree;
    descriptor.root = new_root;
    loop {
        let buf = txn.read_page(descriptor.root)?;
        let view = PageView::new(&buf)?;
        if view.is_branch() && view.num_entries() == 1 {
            let child = view.node_at(0)?.child_pgno;
            drop(view);
            txn.retire(descriptor.root);
            descriptor.root = child;
            descriptor.height = descriptor.height.saturating_sub(1);
            stats.branch_pages_delta -= 1;
            continue;
        }
        if view.is_leaf() && view.num_entries() == 0 {
            drop(view);
            txn.retire(descriptor.root);
            descriptor.root = crate::consts::INVALID_PGNO;
            descriptor.height = 0;
            stats.leaf_pages_delta -= 1;
        }
        break;
    }
    apply_stats(&mut descriptor, &stats, txn.txnid());
    Ok((descriptor, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Environment, OpenFlags};
    use tempfile::tempdir;

    #[test]
    fn insert_get_delete_round_trip() {
        let dir = tempdir().unwrap();
        let env = Environment::builder().open(&dir.path().join("data.db"), OpenFlags::empty()).unwrap();
        let mut txn = env.begin_write(None).unwrap();
        let dbi = txn.open_dbi(None, crate::env::DbFlags::CREATE).unwrap();
        for i in 0u32..500 {
            txn.put(dbi, &i.to_be_bytes(), format!("value-{i}").as_bytes(), crate::cursor::PutFlags::empty()).unwrap();
        }
        txn.commit().unwrap();

        let read = env.begin_read().unwrap();
        let dbi = read.open_dbi(None).unwrap();
        for i in 0u32..500 {
            let v = read.get(dbi, &i.to_be_bytes()).unwrap().unwrap();
            assert_eq!(v, format!("value-{i}").as_bytes());
        }
        read.close();

        let mut txn = env.begin_write(None).unwrap();
        for i in (0u32..500).step_by(2) {
            assert!(txn.del(dbi, &i.to_be_bytes(), None).unwrap());
        }
        txn.commit().unwrap();

        let read = env.begin_read().unwrap();
        for i in 0u32..500 {
            let got = read.get(dbi, &i.to_be_bytes()).unwrap();
            if i % 2 == 0 {
                assert!(got.is_none());
            } else {
                assert_eq!(got.unwrap(), format!("value-{i}").as_bytes());
            }
        }
    }

    #[test]
    fn large_value_round_trips_through_overflow_pages() {
        let dir = tempdir().unwrap();
        let env = Environment::builder().open(&dir.path().join("data.db"), OpenFlags::empty()).unwrap();
        let big = vec![0x42u8; 64 * 1024];
        let mut txn = env.begin_write(None).unwrap();
        let dbi = txn.open_dbi(None, crate::env::DbFlags::CREATE).unwrap();
        txn.put(dbi, b"blob", &big, crate::cursor::PutFlags::empty()).unwrap();
        txn.commit().unwrap();

        let read = env.begin_read().unwrap();
        let dbi = read.open_dbi(None).unwrap();
        assert_eq!(read.get(dbi, b"blob").unwrap().unwrap(), big);
    }
}

//! Cursors (§4.7).
//!
//! A cursor is a path down the primary tree plus, for a DUPSORT dbi, a
//! secondary position within the current key's duplicate set. Mutation
//! (`put`/`del`) is not implemented as an in-place page edit at the
//! cursor's current position -- it delegates to the whole-tree
//! `btree`/`dupsort` operations (which may split, merge or rewrite
//! arbitrary pages) and then reposition the cursor afterward by
//! searching for the affected key. This trades the constant-time
//! "CURRENT" fast path real LMDB cursors have for reusing the same
//! COW insert/delete machinery everywhere.

use bitflags::bitflags;

use crate::btree::PathEntry;
use crate::cmp::Comparator;
use crate::dupsort::DupView;
use crate::error::{Error, Result};
use crate::meta::TreeDescriptor;
use crate::page::{NodeFlags, PageView};
use crate::txn::{PageReader, ReadTxn, WriteTxn};

bitflags! {
    /// Flags for [`Cursor::put`] (§4.7/§6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PutFlags: u32 {
        /// Fail with `Error::KeyExist` instead of overwriting an existing key.
        const NO_OVERWRITE = 0x01;
        /// Fail with `Error::KeyExist` instead of silently accepting an
        /// already-present (key, value) pair in a DUPSORT dbi.
        const NO_DUP_DATA = 0x02;
        /// Caller promises `key` sorts after every existing key; checked
        /// against the tree's current maximum, not just a hint.
        const APPEND = 0x04;
        /// As `APPEND`, for the duplicate-value ordering within a DUPSORT key.
        const APPEND_DUP = 0x08;
        /// Replace the value at the cursor's current position. `key` must
        /// equal the key the cursor already points at.
        const CURRENT = 0x10;
    }
}

/// Which half of a transaction a cursor is borrowing. Read-only
/// operations work identically either way (dispatched through
/// [`PageReader`]); `put`/`del` require the `Write` variant.
pub(crate) enum CursorTxn<'t> {
    Read(&'t ReadTxn),
    Write(&'t mut WriteTxn),
}

fn with_reader<T>(txn: &CursorTxn<'_>, f: impl FnOnce(&dyn PageReader) -> Result<T>) -> Result<T> {
    match txn {
        CursorTxn::Read(r) => f(*r),
        CursorTxn::Write(w) => f(&**w),
    }
}

/// One key's decoded leaf entry, detached from the page buffer it came
/// from so it can outlive the lookup that produced it.
struct CurrentNode {
    key: Vec<u8>,
    flags: NodeFlags,
    data_size: u32,
    raw_value: Vec<u8>,
}

/// Secondary position within the current key's duplicate set, for a
/// DUPSORT dbi. `None` means "not yet drilled in" -- `current()` then
/// reports the first duplicate, matching the non-DUPSORT `Get` convention.
enum DupState {
    None,
    Inline { values: Vec<Vec<u8>>, index: usize },
    SubTree { path: Vec<PathEntry> },
}

pub struct Cursor<'t> {
    txn: CursorTxn<'t>,
    dbi: u32,
    key_cmp: Comparator,
    dup_cmp: Comparator,
    dupsort: bool,
    path: Option<Vec<PathEntry>>,
    dup: DupState,
}

impl<'t> Cursor<'t> {
    pub(crate) fn new(txn: CursorTxn<'t>, dbi: u32) -> Result<Cursor<'t>> {
        let (key_cmp, dup_cmp) = with_reader(&txn, |r| r.comparators(dbi))?;
        let dupsort = with_reader(&txn, |r| r.tree(dbi))
            .ok()
            .map(|t| t.flags & crate::env::DbFlags::DUPSORT.bits() != 0)
            .unwrap_or(false);
        Ok(Cursor {
            txn,
            dbi,
            key_cmp,
            dup_cmp,
            dupsort,
            path: None,
            dup: DupState::None,
        })
    }

    fn tree(&mut self) -> Result<TreeDescriptor> {
        match &mut self.txn {
            CursorTxn::Read(r) => r.tree(self.dbi),
            CursorTxn::Write(w) => w.tree_of(self.dbi),
        }
    }

    fn write_mut(&mut self) -> Result<&mut WriteTxn> {
        match &mut self.txn {
            CursorTxn::Write(w) => Ok(*w),
            CursorTxn::Read(_) => Err(Error::BadTxn),
        }
    }

    fn set_tree(&mut self, tree: TreeDescriptor) -> Result<()> {
        self.write_mut()?.set_tree(self.dbi, tree);
        Ok(())
    }

    fn step(&mut self, forward: bool) -> Result<bool> {
        let Some(path) = self.path.as_mut() else { return Ok(false) };
        match &self.txn {
            CursorTxn::Read(r) => crate::btree::step_path(*r, path, forward),
            CursorTxn::Write(w) => crate::btree::step_path(&**w, path, forward),
        }
    }

    fn reader_first_path(&self, root: u32) -> Result<Option<Vec<PathEntry>>> {
        match &self.txn {
            CursorTxn::Read(r) => crate::btree::first_path(*r, root),
            CursorTxn::Write(w) => crate::btree::first_path(&**w, root),
        }
    }

    fn reader_last_path(&self, root: u32) -> Result<Option<Vec<PathEntry>>> {
        match &self.txn {
            CursorTxn::Read(r) => crate::btree::last_path(*r, root),
            CursorTxn::Write(w) => crate::btree::last_path(&**w, root),
        }
    }

    fn subtree_key_at(&self, path: &[PathEntry]) -> Result<Vec<u8>> {
        let (buf, idx) = match &self.txn {
            CursorTxn::Read(r) => crate::btree::leaf_node_at(*r, path)?,
            CursorTxn::Write(w) => crate::btree::leaf_node_at(&**w, path)?,
        };
        let view = PageView::new(&buf)?;
        Ok(view.node_at(idx)?.key.to_vec())
    }

    fn current_node(&self) -> Result<Option<CurrentNode>> {
        let Some(path) = &self.path else { return Ok(None) };
        let (buf, idx) = match &self.txn {
            CursorTxn::Read(r) => crate::btree::leaf_node_at(*r, path)?,
            CursorTxn::Write(w) => crate::btree::leaf_node_at(&**w, path)?,
        };
        let view = PageView::new(&buf)?;
        if idx >= view.num_entries() {
            return Ok(None);
        }
        let node = view.node_at(idx)?;
        Ok(Some(CurrentNode {
            key: node.key.to_vec(),
            flags: node.flags,
            data_size: node.data_size,
            raw_value: node.value.to_vec(),
        }))
    }

    fn resolve_value(&self, node: &CurrentNode) -> Result<Vec<u8>> {
        match &self.txn {
            CursorTxn::Read(r) => crate::btree::resolve_value(*r, node.flags, &node.raw_value, node.data_size),
            CursorTxn::Write(w) => crate::btree::resolve_value(&**w, node.flags, &node.raw_value, node.data_size),
        }
    }

    fn dup_view_of(&self, node: &CurrentNode) -> Result<DupView> {
        let tmp = crate::page::Node {
            flags: node.flags,
            key: &node.key,
            data_size: node.data_size,
            value: &node.raw_value,
            child_pgno: 0,
        };
        crate::dupsort::dup_view(&tmp)
    }

    /// (Re)compute `self.dup` from the node currently pointed at by
    /// `self.path`, seeding the duplicate-set position to the first
    /// (`forward`) or last entry.
    fn seed_dup(&mut self, forward: bool) -> Result<()> {
        if !self.dupsort {
            self.dup = DupState::None;
            return Ok(());
        }
        let Some(node) = self.current_node()? else {
            self.dup = DupState::None;
            return Ok(());
        };
        self.dup = match self.dup_view_of(&node)? {
            DupView::Single(_) => DupState::None,
            DupView::Inline(values) => {
                let index = if forward { 0 } else { values.len().saturating_sub(1) };
                DupState::Inline { values, index }
            }
            DupView::SubTree(descriptor) => {
                let path = if forward {
                    self.reader_first_path(descriptor.root)?
                } else {
                    self.reader_last_path(descriptor.root)?
                };
                DupState::SubTree { path: path.unwrap_or_default() }
            }
        };
        Ok(())
    }

    /// Step within the current key's duplicate set. Returns `None` once
    /// the set is exhausted in `forward`'s direction, leaving `self.dup`
    /// untouched so the caller can fall back to moving to an adjacent key.
    fn advance_dup(&mut self, forward: bool) -> Result<Option<Vec<u8>>> {
        match &mut self.dup {
            DupState::Inline { values, index } => {
                if forward {
                    if *index + 1 < values.len() {
                        *index += 1;
                        Ok(Some(values[*index].clone()))
                    } else {
                        Ok(None)
                    }
                } else if *index > 0 {
                    *index -= 1;
                    Ok(Some(values[*index].clone()))
                } else {
                    Ok(None)
                }
            }
            DupState::SubTree { path } => {
                let moved = match &self.txn {
                    CursorTxn::Read(r) => crate::btree::step_path(*r, path, forward)?,
                    CursorTxn::Write(w) => crate::btree::step_path(&**w, path, forward)?,
                };
                if !moved {
                    return Ok(None);
                }
                let (buf, idx) = match &self.txn {
                    CursorTxn::Read(r) => crate::btree::leaf_node_at(*r, path)?,
                    CursorTxn::Write(w) => crate::btree::leaf_node_at(&**w, path)?,
                };
                let view = PageView::new(&buf)?;
                Ok(Some(view.node_at(idx)?.key.to_vec()))
            }
            DupState::None => Ok(None),
        }
    }

    /// The (key, value) pair the cursor currently names, or `None` if unpositioned.
    pub fn current(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(node) = self.current_node()? else { return Ok(None) };
        if !self.dupsort {
            return Ok(Some((node.key, self.resolve_value(&node)?)));
        }
        match &self.dup {
            DupState::Inline { values, index } => Ok(Some((node.key, values.get(*index).cloned().unwrap_or_default()))),
            DupState::SubTree { path } => {
                let v = if path.is_empty() { Vec::new() } else { self.subtree_key_at(path)? };
                Ok(Some((node.key, v)))
            }
            DupState::None => Ok(Some((node.key.clone(), self.resolve_value(&node)?))),
        }
    }

    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let tree = self.tree()?;
        self.path = self.reader_first_path(tree.root)?;
        self.seed_dup(true)?;
        self.current()
    }

    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let tree = self.tree()?;
        self.path = self.reader_last_path(tree.root)?;
        self.seed_dup(false)?;
        self.current()
    }

    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.dupsort && self.path.is_some() {
            if let Some(v) = self.advance_dup(true)? {
                let key = self.current_node()?.map(|n| n.key).unwrap_or_default();
                return Ok(Some((key, v)));
            }
        }
        if !self.step(true)? {
            self.path = None;
            return Ok(None);
        }
        self.seed_dup(true)?;
        self.current()
    }

    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.dupsort && self.path.is_some() {
            if let Some(v) = self.advance_dup(false)? {
                let key = self.current_node()?.map(|n| n.key).unwrap_or_default();
                return Ok(Some((key, v)));
            }
        }
        if !self.step(false)? {
            self.path = None;
            return Ok(None);
        }
        self.seed_dup(false)?;
        self.current()
    }

    pub fn next_no_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.step(true)? {
            self.path = None;
            return Ok(None);
        }
        self.seed_dup(true)?;
        self.current()
    }

    pub fn prev_no_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.step(false)? {
            self.path = None;
            return Ok(None);
        }
        self.seed_dup(false)?;
        self.current()
    }

    pub fn first_dup(&mut self) -> Result<Option<Vec<u8>>> {
        self.seed_dup(true)?;
        Ok(self.current()?.map(|(_, v)| v))
    }

    pub fn last_dup(&mut self) -> Result<Option<Vec<u8>>> {
        self.seed_dup(false)?;
        Ok(self.current()?.map(|(_, v)| v))
    }

    pub fn next_dup(&mut self) -> Result<Option<Vec<u8>>> {
        self.advance_dup(true)
    }

    pub fn prev_dup(&mut self) -> Result<Option<Vec<u8>>> {
        self.advance_dup(false)
    }

    pub fn set(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let tree = self.tree()?;
        let (path, exact) = with_reader(&self.txn, |r| crate::btree::search_path(r, tree.root, key, self.key_cmp))?;
        if !exact {
            self.path = None;
            return Ok(None);
        }
        self.path = Some(path);
        self.seed_dup(true)?;
        self.current()
    }

    /// Position at `key`, or the next key greater than it if `key` is absent.
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let tree = self.tree()?;
        let (path, exact) = with_reader(&self.txn, |r| crate::btree::search_path(r, tree.root, key, self.key_cmp))?;
        if path.is_empty() {
            self.path = None;
            return Ok(None);
        }
        let at_end = {
            let entry = path.last().unwrap();
            let n = with_reader(&self.txn, |r| -> Result<usize> {
                let buf = r.read_page(entry.pgno)?;
                Ok(PageView::new(&buf)?.num_entries())
            })?;
            entry.index >= n
        };
        self.path = Some(path);
        if !exact && at_end {
            if !self.step(true)? {
                self.path = None;
                return Ok(None);
            }
        }
        self.seed_dup(true)?;
        self.current()
    }

    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.set(key)?.is_none() {
            return Ok(false);
        }
        let node = self.current_node()?.ok_or(Error::NotFound)?;
        if !self.dupsort {
            return Ok(self.resolve_value(&node)? == value);
        }
        match self.dup_view_of(&node)? {
            DupView::Single(v) => {
                self.dup = DupState::None;
                Ok(v == value)
            }
            DupView::Inline(values) => match values.binary_search_by(|v| self.dup_cmp.compare(v, value)) {
                Ok(i) => {
                    self.dup = DupState::Inline { values, index: i };
                    Ok(true)
                }
                Err(_) => Ok(false),
            },
            DupView::SubTree(descriptor) => {
                let (path, exact) = with_reader(&self.txn, |r| crate::btree::search_path(r, descriptor.root, value, self.dup_cmp))?;
                if exact {
                    self.dup = DupState::SubTree { path };
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Position at (`key`, `value`), or the next duplicate of `key`
    /// greater than `value` if it's absent.
    pub fn get_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.set(key)?.is_none() {
            return Ok(None);
        }
        let node = self.current_node()?.ok_or(Error::NotFound)?;
        if !self.dupsort {
            let v = self.resolve_value(&node)?;
            return if v.as_slice() >= value { Ok(Some(v)) } else { Ok(None) };
        }
        match self.dup_view_of(&node)? {
            DupView::Single(v) => {
                self.dup = DupState::None;
                if self.dup_cmp.compare(&v, value) != std::cmp::Ordering::Less {
                    Ok(Some(v))
                } else {
                    Ok(None)
                }
            }
            DupView::Inline(values) => {
                let idx = values.partition_point(|v| self.dup_cmp.compare(v, value) == std::cmp::Ordering::Less);
                if idx >= values.len() {
                    return Ok(None);
                }
                let v = values[idx].clone();
                self.dup = DupState::Inline { values, index: idx };
                Ok(Some(v))
            }
            DupView::SubTree(descriptor) => {
                let (path, _) = with_reader(&self.txn, |r| crate::btree::search_path(r, descriptor.root, value, self.dup_cmp))?;
                if path.is_empty() {
                    return Ok(None);
                }
                let entry = path.last().unwrap();
                let n = with_reader(&self.txn, |r| -> Result<usize> {
                    let buf = r.read_page(entry.pgno)?;
                    Ok(PageView::new(&buf)?.num_entries())
                })?;
                let mut path = path;
                if entry.index >= n {
                    let moved = match &self.txn {
                        CursorTxn::Read(r) => crate::btree::step_path(*r, &mut path, true)?,
                        CursorTxn::Write(w) => crate::btree::step_path(&**w, &mut path, true)?,
                    };
                    if !moved {
                        return Ok(None);
                    }
                }
                let v = self.subtree_key_at(&path)?;
                self.dup = DupState::SubTree { path };
                Ok(Some(v))
            }
        }
    }

    /// Number of duplicates currently stored under the key the cursor
    /// points at (`Cursor::Count`, §4.7; 0 or 1 for a non-DUPSORT dbi).
    pub fn count(&mut self) -> Result<u64> {
        let tree = self.tree()?;
        let Some(node) = self.current_node()? else { return Ok(0) };
        with_reader(&self.txn, |r| crate::dupsort::dup_count(r, tree, self.key_cmp, &node.key))
    }

    /// Current tree's maximum key, if any, read via a last-path descent.
    fn max_key(&self, tree: &TreeDescriptor) -> Result<Option<Vec<u8>>> {
        if tree.is_empty() {
            return Ok(None);
        }
        let Some(path) = self.reader_last_path(tree.root)? else { return Ok(None) };
        if path.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.subtree_key_at(&path)?))
    }

    /// Maximum duplicate value currently stored under `key`, if the key
    /// exists, for the `APPEND_DUP` check.
    fn max_dup_value(&self, tree: &TreeDescriptor, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (path, exact) = with_reader(&self.txn, |r| crate::btree::search_path(r, tree.root, key, self.key_cmp))?;
        if !exact {
            return Ok(None);
        }
        let (buf, idx) = match &self.txn {
            CursorTxn::Read(r) => crate::btree::leaf_node_at(*r, &path)?,
            CursorTxn::Write(w) => crate::btree::leaf_node_at(&**w, &path)?,
        };
        let view = PageView::new(&buf)?;
        let node = view.node_at(idx)?;
        match crate::dupsort::dup_view(&node)? {
            DupView::Single(v) => Ok(Some(v)),
            DupView::Inline(values) => Ok(values.into_iter().last()),
            DupView::SubTree(descriptor) => {
                let Some(path) = self.reader_last_path(descriptor.root)? else { return Ok(None) };
                if path.is_empty() {
                    return Ok(None);
                }
                Ok(Some(self.subtree_key_at(&path)?))
            }
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        let tree = self.tree()?;
        let no_overwrite = flags.contains(PutFlags::NO_OVERWRITE);
        let no_dup_data = flags.contains(PutFlags::NO_DUP_DATA);
        let append = flags.contains(PutFlags::APPEND);
        let append_dup = flags.contains(PutFlags::APPEND_DUP);
        let current = flags.contains(PutFlags::CURRENT);

        if current {
            let node = self.current_node()?.ok_or(Error::NotFound)?;
            if self.key_cmp.compare(&node.key, key) != std::cmp::Ordering::Equal {
                return Err(Error::Incompatible("CURRENT requires putting at the cursor's current key"));
            }
        }
        if append {
            if let Some(max) = self.max_key(&tree)? {
                if self.key_cmp.compare(key, &max) != std::cmp::Ordering::Greater {
                    return Err(Error::Incompatible("APPEND key does not sort after the current maximum"));
                }
            }
        }
        if append_dup {
            if let Some(max) = self.max_dup_value(&tree, key)? {
                if self.dup_cmp.compare(value, &max) != std::cmp::Ordering::Greater {
                    return Err(Error::Incompatible("APPEND_DUP value does not sort after the current maximum"));
                }
            }
        }

        let new_tree = if self.dupsort {
            let (key_cmp, dup_cmp) = (self.key_cmp, self.dup_cmp);
            if current && !no_dup_data {
                // Replace the value at the cursor's current duplicate position
                // rather than inserting a new duplicate: drop the old value first.
                if let Some(old) = self.current()?.map(|(_, v)| v) {
                    let (tree_after_del, _) = crate::dupsort::dup_del(self.write_mut()?, tree, key_cmp, dup_cmp, key, Some(&old))?;
                    crate::dupsort::dup_put(self.write_mut()?, tree_after_del, key_cmp, dup_cmp, key, value, no_dup_data)?
                } else {
                    crate::dupsort::dup_put(self.write_mut()?, tree, key_cmp, dup_cmp, key, value, no_dup_data)?
                }
            } else {
                crate::dupsort::dup_put(self.write_mut()?, tree, key_cmp, dup_cmp, key, value, no_dup_data)?
            }
        } else {
            crate::btree::tree_insert(self.write_mut()?, tree, self.key_cmp, key, value, !no_overwrite)?
        };
        self.set_tree(new_tree)?;
        self.set_range(key)?;
        Ok(())
    }

    /// Delete the current key (`value = None`) or one duplicate of it
    /// (`value = Some(..)`), repositioning to the next remaining entry afterward.
    pub fn del(&mut self, value: Option<&[u8]>) -> Result<bool> {
        let tree = self.tree()?;
        let Some(node) = self.current_node()? else { return Ok(false) };
        let key = node.key.clone();
        let (new_tree, removed) = if self.dupsort {
            let (key_cmp, dup_cmp) = (self.key_cmp, self.dup_cmp);
            crate::dupsort::dup_del(self.write_mut()?, tree, key_cmp, dup_cmp, &key, value)?
        } else {
            crate::btree::tree_delete(self.write_mut()?, tree, self.key_cmp, &key)?
        };
        if removed {
            self.set_tree(new_tree)?;
            self.set_range(&key)?;
        }
        Ok(removed)
    }
}

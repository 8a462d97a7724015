//! DUPSORT: multiple sorted values per key (§4.6).
//!
//! Reuses the plain B+tree engine in `btree.rs` wholesale by treating a
//! duplicate *value* as a *key* (with empty data) of a nested tree keyed
//! by `dup_cmp` -- there is no separate duplicate-aware insert/delete
//! path. A key's duplicates are represented one of three ways,
//! transitioning as the set grows or shrinks:
//!
//! - a single value: the node carries no `DUP`/`TREE` flag and its
//!   value bytes *are* the one duplicate, same as a non-DUPSORT key.
//! - an inline sub-page (`DUP` flag): the node's value bytes hold a
//!   compact, unpadded page buffer whose "keys" are the sorted
//!   duplicate values, built and read with the same `page.rs` codec a
//!   real page uses.
//! - a promoted sub-tree (`TREE` flag): once the inline sub-page would
//!   exceed `page_size / SUBPAGE_PROMOTE_DIVISOR`, the node's value
//!   becomes a 48-byte `TreeDescriptor` for a full nested B+tree.
//!
//! Deleting back down to exactly one duplicate collapses directly to
//! the single-value representation from either of the other two --
//! there is no intermediate demotion step (SPEC_FULL.md open question).

use std::cmp::Ordering;

use crate::bytes::put_u16;
use crate::cmp::Comparator;
use crate::consts::SUBPAGE_PROMOTE_DIVISOR;
use crate::error::{Error, Result};
use crate::meta::{TreeDescriptor, TREE_DESCRIPTOR_SIZE};
use crate::page::{leaf_node_size, write_node, NodeFlags, PageFlags, PageHeader, PageView, PAGE_HEADER_SIZE, POINTER_SIZE};
use crate::txn::{PageReader, WriteTxn};

/// How a key's duplicate set is currently represented, decoded from its
/// node so cursor code can enumerate it without re-deriving the flags.
pub(crate) enum DupView {
    Single(Vec<u8>),
    Inline(Vec<Vec<u8>>),
    SubTree(TreeDescriptor),
}

/// First (smallest, by byte order) value of an inline sub-page, without
/// decoding the rest -- the plain `Get` convention for a DUPSORT key.
pub(crate) fn first_subpage_value(buf: &[u8]) -> Result<Vec<u8>> {
    let view = PageView::new(buf)?;
    if view.num_entries() == 0 {
        return Ok(Vec::new());
    }
    Ok(view.node_at(0)?.key.to_vec())
}

pub(crate) fn dup_view(node: &crate::page::Node<'_>) -> Result<DupView> {
    if node.flags.contains(NodeFlags::TREE) {
        Ok(DupView::SubTree(TreeDescriptor::read(node.value, 0, u32::MAX)?))
    } else if node.flags.contains(NodeFlags::DUP) {
        Ok(DupView::Inline(decode_subpage_values(node.value)?))
    } else {
        Ok(DupView::Single(node.value.to_vec()))
    }
}

fn decode_subpage_values(buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    let view = PageView::new(buf)?;
    let mut out = Vec::with_capacity(view.num_entries());
    for i in 0..view.num_entries() {
        out.push(view.node_at(i)?.key.to_vec());
    }
    Ok(out)
}

fn encode_subpage(values: &[Vec<u8>]) -> Vec<u8> {
    let content: usize = values.iter().map(|v| leaf_node_size(v.len(), 0, false)).sum();
    let total = PAGE_HEADER_SIZE + content;
    let mut buf = vec![0u8; total];
    let mut lower = PAGE_HEADER_SIZE as u16;
    let mut upper = total as u16;
    for v in values {
        let size = leaf_node_size(v.len(), 0, false);
        upper -= (size - POINTER_SIZE) as u16;
        write_node(&mut buf, upper as usize, NodeFlags::empty(), v, 0, &[]);
        put_u16(&mut buf, lower as usize, upper);
        lower += POINTER_SIZE as u16;
    }
    let header = PageHeader {
        txnid: 0,
        pgno: 0,
        dupfix_ksize: 0,
        flags: PageFlags::LEAF | PageFlags::SUBPAGE,
        lower,
        upper,
    };
    header.write(&mut buf);
    buf
}

fn promote_to_subtree(txn: &mut WriteTxn, tree: TreeDescriptor, key_cmp: Comparator, dup_cmp: Comparator, key: &[u8], values: &[Vec<u8>]) -> Result<TreeDescriptor> {
    let mut sub = TreeDescriptor::empty(0);
    for v in values {
        sub = crate::btree::tree_insert(txn, sub, dup_cmp, v, &[], true)?;
    }
    let mut body = [0u8; TREE_DESCRIPTOR_SIZE];
    sub.write(&mut body, 0);
    crate::btree::tree_insert_with_flags(txn, tree, key_cmp, key, &body, NodeFlags::TREE, true)
}

/// Insert `value` as a duplicate of `key`. `no_dup_data` rejects an
/// exact (key, value) pair that's already present instead of silently
/// succeeding (the `NO_DUP_DATA` put flag, §4.6/§4.7).
pub(crate) fn dup_put(
    txn: &mut WriteTxn,
    tree: TreeDescriptor,
    key_cmp: Comparator,
    dup_cmp: Comparator,
    key: &[u8],
    value: &[u8],
    no_dup_data: bool,
) -> Result<TreeDescriptor> {
    let page_size = txn.page_size() as usize;
    let (path, exact) = crate::btree::search_path(txn, tree.root, key, key_cmp)?;
    if !exact {
        return crate::btree::tree_insert(txn, tree, key_cmp, key, value, false);
    }

    let (buf, idx) = crate::btree::leaf_node_at(txn, &path)?;
    let view = PageView::new(&buf)?;
    let node = view.node_at(idx)?;
    let decoded = dup_view(&node)?;
    drop(view);

    match decoded {
        DupView::SubTree(descriptor) => match crate::btree::tree_insert(txn, descriptor, dup_cmp, value, &[], false) {
            Ok(new_sub) => {
                let mut body = [0u8; TREE_DESCRIPTOR_SIZE];
                new_sub.write(&mut body, 0);
                crate::btree::tree_insert_with_flags(txn, tree, key_cmp, key, &body, NodeFlags::TREE, true)
            }
            Err(Error::KeyExist) if no_dup_data => Err(Error::KeyExist),
            Err(Error::KeyExist) => Ok(tree),
            Err(e) => Err(e),
        },
        DupView::Inline(mut values) => {
            match values.binary_search_by(|v| dup_cmp.compare(v, value)) {
                Ok(_) if no_dup_data => Err(Error::KeyExist),
                Ok(_) => Ok(tree),
                Err(i) => {
                    values.insert(i, value.to_vec());
                    let encoded = encode_subpage(&values);
                    if encoded.len() > page_size / SUBPAGE_PROMOTE_DIVISOR as usize {
                        promote_to_subtree(txn, tree, key_cmp, dup_cmp, key, &values)
                    } else {
                        crate::btree::tree_insert_with_flags(txn, tree, key_cmp, key, &encoded, NodeFlags::DUP, true)
                    }
                }
            }
        }
        DupView::Single(existing) => {
            if dup_cmp.compare(&existing, value) == Ordering::Equal {
                return if no_dup_data { Err(Error::KeyExist) } else { Ok(tree) };
            }
            let mut values = vec![existing, value.to_vec()];
            values.sort_by(|a, b| dup_cmp.compare(a, b));
            let encoded = encode_subpage(&values);
            crate::btree::tree_insert_with_flags(txn, tree, key_cmp, key, &encoded, NodeFlags::DUP, true)
        }
    }
}

/// Delete one duplicate (`value = Some(..)`) or every duplicate under
/// `key` (`value = None`, the plain `Del` convention for a DUPSORT
/// dbi). Returns the updated descriptor and whether anything changed.
pub(crate) fn dup_del(
    txn: &mut WriteTxn,
    tree: TreeDescriptor,
    key_cmp: Comparator,
    dup_cmp: Comparator,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<(TreeDescriptor, bool)> {
    let Some(value) = value else {
        return crate::btree::tree_delete(txn, tree, key_cmp, key);
    };

    let (path, exact) = crate::btree::search_path(txn, tree.root, key, key_cmp)?;
    if !exact {
        return Ok((tree, false));
    }
    let (buf, idx) = crate::btree::leaf_node_at(txn, &path)?;
    let view = PageView::new(&buf)?;
    let node = view.node_at(idx)?;
    let decoded = dup_view(&node)?;
    drop(view);

    match decoded {
        DupView::SubTree(descriptor) => {
            let (new_sub, removed) = crate::btree::tree_delete(txn, descriptor, dup_cmp, value)?;
            if !removed {
                return Ok((tree, false));
            }
            if new_sub.items <= 1 {
                let last = sole_subtree_value(txn, new_sub)?;
                crate::btree::retire_subtree(txn, new_sub.root)?;
                let updated = crate::btree::tree_insert(txn, tree, key_cmp, key, &last, true)?;
                return Ok((updated, true));
            }
            let mut body = [0u8; TREE_DESCRIPTOR_SIZE];
            new_sub.write(&mut body, 0);
            let updated = crate::btree::tree_insert_with_flags(txn, tree, key_cmp, key, &body, NodeFlags::TREE, true)?;
            Ok((updated, true))
        }
        DupView::Inline(mut values) => {
            let Ok(i) = values.binary_search_by(|v| dup_cmp.compare(v, value)) else {
                return Ok((tree, false));
            };
            values.remove(i);
            if values.len() == 1 {
                let updated = crate::btree::tree_insert(txn, tree, key_cmp, key, &values[0], true)?;
                return Ok((updated, true));
            }
            let encoded = encode_subpage(&values);
            let updated = crate::btree::tree_insert_with_flags(txn, tree, key_cmp, key, &encoded, NodeFlags::DUP, true)?;
            Ok((updated, true))
        }
        DupView::Single(existing) => {
            if dup_cmp.compare(&existing, value) != Ordering::Equal {
                return Ok((tree, false));
            }
            crate::btree::tree_delete(txn, tree, key_cmp, key)
        }
    }
}

fn sole_subtree_value<R: PageReader>(reader: &R, tree: TreeDescriptor) -> Result<Vec<u8>> {
    let path = crate::btree::first_path(reader, tree.root)?.ok_or(Error::NotFound)?;
    let (buf, idx) = crate::btree::leaf_node_at(reader, &path)?;
    let view = PageView::new(&buf)?;
    Ok(view.node_at(idx)?.key.to_vec())
}

/// Number of duplicates currently stored under `key` (`Cursor::Count`, §4.7).
pub(crate) fn dup_count<R: PageReader>(reader: &R, tree: TreeDescriptor, key_cmp: Comparator, key: &[u8]) -> Result<u64> {
    let (path, exact) = crate::btree::search_path(reader, tree.root, key, key_cmp)?;
    if !exact {
        return Ok(0);
    }
    let (buf, idx) = crate::btree::leaf_node_at(reader, &path)?;
    let view = PageView::new(&buf)?;
    let node = view.node_at(idx)?;
    match dup_view(&node)? {
        DupView::Single(_) => Ok(1),
        DupView::Inline(values) => Ok(values.len() as u64),
        DupView::SubTree(descriptor) => Ok(descriptor.items),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subpage_round_trips_sorted_values() {
        let values = vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()];
        let encoded = encode_subpage(&values);
        assert_eq!(decode_subpage_values(&encoded).unwrap(), values);
    }
}

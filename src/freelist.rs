//! Freelist / garbage-collection tree (§4.4).
//!
//! A retired page cannot be reused the instant it's retired: a reader
//! transaction begun before the retiring commit may still be walking
//! the old version of the tree that points at it (I3). Instead, each
//! write commit files its retired page numbers under its own txnid in
//! a small persistent B+tree -- DBI 0, the "GC tree" -- and the next
//! writer to start reclaims whatever entries no live reader's snapshot
//! could possibly still need, per the reader table's minimum live
//! txnid.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::bytes::{from_be_u64, get_u32, put_u32};
use crate::cmp::Comparator;
use crate::env::EnvInner;
use crate::error::{Error, Result};
use crate::meta::{Meta, TreeDescriptor};
use crate::mmap::View;
use crate::page::PageView;
use crate::txn::{PageReader, WriteTxn};

struct SnapshotReader<'a> {
    view: &'a View,
    page_size: u32,
}

impl<'a> PageReader for SnapshotReader<'a> {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn read_page(&self, pgno: u32) -> Result<Box<[u8]>> {
        let page_size = self.page_size as usize;
        let start = pgno as usize * page_size;
        let end = start + page_size;
        if end > self.view.len() {
            return Err(Error::PageNotFound(pgno));
        }
        Ok(self.view.as_slice()[start..end].to_vec().into_boxed_slice())
    }

    fn tree(&self, _dbi: u32) -> Result<TreeDescriptor> {
        Err(Error::BadDbi)
    }

    fn comparators(&self, _dbi: u32) -> Result<(Comparator, Comparator)> {
        Err(Error::BadDbi)
    }
}

fn encode_pgnos(pgnos: &[u32]) -> Vec<u8> {
    let mut buf = vec![0u8; pgnos.len() * 4];
    for (i, &pgno) in pgnos.iter().enumerate() {
        put_u32(&mut buf, i * 4, pgno);
    }
    buf
}

fn decode_pgnos(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(4)
        .map(|c| get_u32(c, 0, u32::MAX).expect("chunks_exact(4) guarantees 4 bytes"))
        .collect()
}

/// Walk the GC tree in ascending-txnid order, collecting every retired
/// page filed under a txnid no live reader's snapshot still depends on.
/// Entries are ascending by key, so the first txnid at or past the
/// reclaim horizon ends the scan. Returns the reclaimed pages plus the
/// now-dead GC entries' txnids, for the caller to delete once it
/// actually commits (a crash between here and commit just leaves those
/// entries unreclaimed a while longer, which is safe).
pub(crate) fn collect_reclaimable(env: &Arc<EnvInner>, recent: &Meta, view: &View) -> Result<(VecDeque<u32>, Vec<u64>)> {
    let horizon = env.reader_table.min_live_reader_txnid();
    let reader = SnapshotReader { view, page_size: recent.geometry.page_size };
    let root = recent.gc_tree.root;

    let mut pool = VecDeque::new();
    let mut dead_txnids = Vec::new();

    let mut path = match crate::btree::first_path(&reader, root)? {
        Some(p) => p,
        None => return Ok((pool, dead_txnids)),
    };
    loop {
        let (buf, idx) = crate::btree::leaf_node_at(&reader, &path)?;
        let view = PageView::new(&buf)?;
        let node = view.node_at(idx)?;
        let txnid = from_be_u64(node.key).ok_or_else(|| Error::corrupted(path.last().unwrap().pgno, "malformed gc-tree txnid key"))?;
        let reclaimable = match horizon {
            Some(h) => txnid < h,
            None => true,
        };
        if !reclaimable {
            break;
        }
        let value = crate::btree::node_value(&reader, &node)?;
        pool.extend(decode_pgnos(&value));
        dead_txnids.push(txnid);
        drop(view);
        if !crate::btree::step_path(&reader, &mut path, true)? {
            break;
        }
    }
    Ok((pool, dead_txnids))
}

/// File `retired` under `txnid` in the GC tree.
pub(crate) fn record_retired(txn: &mut WriteTxn, gc_root: TreeDescriptor, txnid: u64, retired: &[u32]) -> Result<TreeDescriptor> {
    let key = txnid.to_be_bytes();
    let value = encode_pgnos(retired);
    crate::btree::tree_insert(txn, gc_root, Comparator::Integer, &key, &value, true)
}

/// Remove the GC entries for `txnids` -- their pages have already been
/// handed back out via `alloc_pgno`'s free pool by the time this runs.
pub(crate) fn delete_reclaimed(txn: &mut WriteTxn, gc_root: TreeDescriptor, txnids: &[u64]) -> Result<TreeDescriptor> {
    let mut tree = gc_root;
    for &txnid in txnids {
        let key = txnid.to_be_bytes();
        let (updated, _) = crate::btree::tree_delete(txn, tree, Comparator::Integer, &key)?;
        tree = updated;
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pgno_list_round_trips() {
        let pgnos = vec![3u32, 1, 4, 1, 5, 9, 2, 6];
        let encoded = encode_pgnos(&pgnos);
        assert_eq!(decode_pgnos(&encoded), pgnos);
    }
}

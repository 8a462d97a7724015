//! Page and node codec (§3, §4.1).
//!
//! Generalizes the teacher's `page.rs` (which declared `Page_Flags`,
//! `BranchPageElement`, `LeafPageElement` with the pre-2018 `bitflags!`
//! macro but never implemented a reader/writer over actual bytes) into a
//! full accessor layer over a raw page buffer. Layout:
//!
//! ```text
//! offset 0            page header (20 bytes, see `PageHeader`)
//! offset 20..lower     entry pointer array (2-byte absolute offsets, one per node, ascending)
//! offset upper..size   packed node bodies, growing down from the page end
//! ```
//!
//! `lower` and `upper` are both *absolute* offsets from the start of the
//! page (not, as a literal reading of spec.md §3 might suggest, counted
//! from zero at the header boundary). This is the convention the real
//! on-disk format this crate is wire-compatible with actually uses: it
//! keeps `free_space = upper - lower` exact without an extra subtraction,
//! at the cost of subtracting `PAGE_HEADER_SIZE` once when computing
//! `num_entries` instead. See DESIGN.md open-question log.

use bitflags::bitflags;

use crate::bytes::{get_slice, get_u16, get_u32, get_u64, get_u8, put_slice, put_u16, put_u32, put_u64, put_u8};
use crate::consts::INVALID_PGNO;
use crate::error::{Error, Result};

/// Size of the fixed page header, in bytes.
pub const PAGE_HEADER_SIZE: usize = 20;

/// Size of the fixed per-node header (everything before the key bytes).
pub const NODE_HEADER_SIZE: usize = 8;

/// Size of a single slot in the entry pointer array.
pub const POINTER_SIZE: usize = 2;

bitflags! {
    /// Page-level flags (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Branch (internal) page: nodes hold child page numbers.
        const BRANCH   = 0x0001;
        /// Leaf page: nodes hold values (inline, overflow, or sub-page/tree).
        const LEAF     = 0x0002;
        /// Overflow ("large value") page.
        const OVERFLOW = 0x0004;
        /// Meta page (page 0 or 1).
        const META     = 0x0008;
        /// DUPFIX sub-page: fixed-size values packed with no per-entry pointers.
        const DUPFIX   = 0x0010;
        /// This page buffer is actually a sub-page embedded in a node's value.
        const SUBPAGE  = 0x0020;
    }
}

bitflags! {
    /// Per-node flags (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// Value lives on overflow pages; node value field is the first overflow pgno.
        const BIG  = 0x01;
        /// Value is a 48-byte serialized sub-tree descriptor (promoted DUPSORT).
        const TREE = 0x02;
        /// Value is an inline sub-page holding duplicate values (DUPSORT).
        const DUP  = 0x04;
    }
}

/// The fixed 20-byte page header, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Id of the write transaction that produced this page.
    pub txnid: u64,
    /// This page's own page number.
    pub pgno: u32,
    /// For DUPFIX sub-pages, the fixed value size; unused otherwise.
    pub dupfix_ksize: u16,
    /// Page type/flag bits.
    pub flags: PageFlags,
    /// Absolute offset where the pointer array ends.
    pub lower: u16,
    /// Absolute offset where packed node bodies begin.
    pub upper: u16,
}

impl PageHeader {
    /// Decode a header from the first 20 bytes of `buf`.
    pub fn read(buf: &[u8], pgno_hint: u32) -> Result<PageHeader> {
        let txnid = get_u64(buf, 0, pgno_hint)?;
        let pgno = get_u32(buf, 8, pgno_hint)?;
        let dupfix_ksize = get_u16(buf, 12, pgno_hint)?;
        let flags = PageFlags::from_bits_truncate(get_u16(buf, 14, pgno_hint)?);
        let lower = get_u16(buf, 16, pgno_hint)?;
        let upper = get_u16(buf, 18, pgno_hint)?;
        Ok(PageHeader {
            txnid,
            pgno,
            dupfix_ksize,
            flags,
            lower,
            upper,
        })
    }

    /// Encode this header into the first 20 bytes of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.txnid);
        put_u32(buf, 8, self.pgno);
        put_u16(buf, 12, self.dupfix_ksize);
        put_u16(buf, 14, self.flags.bits());
        put_u16(buf, 16, self.lower);
        put_u16(buf, 18, self.upper);
    }

    /// A fresh, empty header for a page of kind `flags`.
    pub fn empty(pgno: u32, txnid: u64, flags: PageFlags, page_size: u32) -> PageHeader {
        PageHeader {
            txnid,
            pgno,
            dupfix_ksize: 0,
            flags,
            lower: PAGE_HEADER_SIZE as u16,
            upper: page_size as u16,
        }
    }
}

/// A decoded node: either a branch entry (key + child pgno) or a leaf
/// entry (key + value, with the value's actual representation named by
/// `flags`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node<'a> {
    /// Node flags (`BIG`/`TREE`/`DUP`, leaf nodes only; always empty for branch nodes).
    pub flags: NodeFlags,
    /// The node's key. Branch entry 0 always has an empty key (the
    /// "leftmost subtree" sentinel, §4.5).
    pub key: &'a [u8],
    /// Logical value length (leaf nodes: the full value length, even for
    /// `BIG` nodes where the inline bytes are just a pgno).
    pub data_size: u32,
    /// The node's raw value bytes as stored inline (for `BIG`, this is 4
    /// bytes holding the starting overflow pgno; for branch nodes, empty
    /// -- use `child_pgno`).
    pub value: &'a [u8],
    /// Child page number (branch nodes only).
    pub child_pgno: u32,
}

/// A read-only view over a page buffer, exposing the accessors required
/// by §4.1. Never allocates; every accessor is total (bounds-checked).
pub struct PageView<'a> {
    buf: &'a [u8],
    header: PageHeader,
}

impl<'a> PageView<'a> {
    /// Wrap `buf` (exactly one page's worth of bytes) as a page view.
    pub fn new(buf: &'a [u8]) -> Result<PageView<'a>> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(Error::corrupted(u32::MAX, "buffer shorter than page header"));
        }
        let header = PageHeader::read(buf, u32::MAX)?;
        Ok(PageView { buf, header })
    }

    /// The decoded header.
    pub fn header(&self) -> PageHeader {
        self.header
    }

    /// Raw bytes backing this view.
    pub fn raw(&self) -> &'a [u8] {
        self.buf
    }

    pub fn is_leaf(&self) -> bool {
        self.header.flags.contains(PageFlags::LEAF)
    }
    pub fn is_branch(&self) -> bool {
        self.header.flags.contains(PageFlags::BRANCH)
    }
    pub fn is_meta(&self) -> bool {
        self.header.flags.contains(PageFlags::META)
    }
    pub fn is_overflow(&self) -> bool {
        self.header.flags.contains(PageFlags::OVERFLOW)
    }
    pub fn is_dupfix(&self) -> bool {
        self.header.flags.contains(PageFlags::DUPFIX)
    }
    pub fn is_subpage(&self) -> bool {
        self.header.flags.contains(PageFlags::SUBPAGE)
    }

    /// Number of entries on this page.
    pub fn num_entries(&self) -> usize {
        let lower = self.header.lower as usize;
        if lower < PAGE_HEADER_SIZE {
            return 0;
        }
        (lower - PAGE_HEADER_SIZE) / POINTER_SIZE
    }

    /// Free space on this page, in bytes.
    pub fn free_space(&self) -> usize {
        (self.header.upper as usize).saturating_sub(self.header.lower as usize)
    }

    fn pointer(&self, idx: usize) -> Result<u16> {
        if idx >= self.num_entries() {
            return Err(Error::corrupted(self.header.pgno, "node index out of range"));
        }
        get_u16(self.buf, PAGE_HEADER_SIZE + idx * POINTER_SIZE, self.header.pgno)
    }

    /// Decode the node at entry `idx`.
    pub fn node_at(&self, idx: usize) -> Result<Node<'a>> {
        let off = self.pointer(idx)? as usize;
        let pgno = self.header.pgno;
        if self.is_branch() {
            let child_pgno = get_u32(self.buf, off, pgno)?;
            let _flags = get_u8(self.buf, off + 4, pgno)?;
            let _extra = get_u8(self.buf, off + 5, pgno)?;
            let key_size = get_u16(self.buf, off + 6, pgno)? as usize;
            let key = get_slice(self.buf, off + NODE_HEADER_SIZE, key_size, pgno)?;
            Ok(Node {
                flags: NodeFlags::empty(),
                key,
                data_size: 0,
                value: &[],
                child_pgno,
            })
        } else {
            let data_size = get_u32(self.buf, off, pgno)?;
            let flags = NodeFlags::from_bits_truncate(get_u8(self.buf, off + 4, pgno)?);
            let key_size = get_u16(self.buf, off + 6, pgno)? as usize;
            let key = get_slice(self.buf, off + NODE_HEADER_SIZE, key_size, pgno)?;
            let value_off = off + NODE_HEADER_SIZE + key_size;
            let value_len = if flags.contains(NodeFlags::BIG) {
                4
            } else {
                data_size as usize
            };
            let value = get_slice(self.buf, value_off, value_len, pgno)?;
            Ok(Node {
                flags,
                key,
                data_size,
                value,
                child_pgno: 0,
            })
        }
    }

    /// Binary search for `key` among this page's entries using
    /// `compare`. Returns `(index, exact)`: `index` is the position the
    /// key is at (if exact) or would be inserted at (if not); `exact`
    /// indicates equality with the entry at `index` (when `index <
    /// num_entries()`).
    ///
    /// For branch pages, entry 0 is never compared against (its key is
    /// the leftmost-subtree sentinel, §4.5): the search range is
    /// `1..num_entries()` and callers should descend via entry `0`'s
    /// child when `key` sorts before entry `1`.
    pub fn search(&self, key: &[u8], cmp: crate::cmp::Comparator) -> Result<(usize, bool)> {
        let (lo_start, n) = if self.is_branch() {
            (1usize, self.num_entries())
        } else {
            (0usize, self.num_entries())
        };
        if n <= lo_start {
            return Ok((lo_start.saturating_sub(1).max(0).min(self.num_entries()), false));
        }
        let mut lo = lo_start;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let node = self.node_at(mid)?;
            match cmp.compare(node.key, key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Equal => return Ok((mid, true)),
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok((lo, false))
    }
}

/// A sub-page header is byte-identical to a page header; `SubPageHeader`
/// is a thin alias used at call sites that embed one inside a node's
/// value bytes rather than in a standalone page.
pub type SubPageHeader = PageHeader;

/// Build a fresh, empty page buffer of `page_size` bytes with the given
/// flags (allocation helper used by the B+tree engine and meta/freelist
/// code; not part of the read-only codec contract above).
pub fn new_page_buffer(pgno: u32, txnid: u64, flags: PageFlags, page_size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; page_size as usize];
    PageHeader::empty(pgno, txnid, flags, page_size).write(&mut buf);
    buf
}

/// Encode a node (branch or leaf) into `buf` at `offset`, returning the
/// number of bytes written. Caller is responsible for ensuring `offset`
/// has room (`NODE_HEADER_SIZE + key.len() + value.len()`).
pub fn write_node(
    buf: &mut [u8],
    offset: usize,
    flags: NodeFlags,
    key: &[u8],
    data_size: u32,
    value: &[u8],
) -> usize {
    put_u32(buf, offset, data_size);
    put_u8(buf, offset + 4, flags.bits());
    put_u8(buf, offset + 5, 0);
    put_u16(buf, offset + 6, key.len() as u16);
    put_slice(buf, offset + NODE_HEADER_SIZE, key);
    put_slice(buf, offset + NODE_HEADER_SIZE + key.len(), value);
    NODE_HEADER_SIZE + key.len() + value.len()
}

/// Encode a branch node (key + child pgno) into `buf` at `offset`.
pub fn write_branch_node(buf: &mut [u8], offset: usize, key: &[u8], child_pgno: u32) -> usize {
    put_u32(buf, offset, child_pgno);
    put_u8(buf, offset + 4, 0);
    put_u8(buf, offset + 5, 0);
    put_u16(buf, offset + 6, key.len() as u16);
    put_slice(buf, offset + NODE_HEADER_SIZE, key);
    NODE_HEADER_SIZE + key.len()
}

/// Encoded size a leaf node with `key`/`value` (or an overflow pointer,
/// for `BIG` values) will occupy, plus one pointer slot.
pub fn leaf_node_size(key_len: usize, value_len: usize, big: bool) -> usize {
    POINTER_SIZE + NODE_HEADER_SIZE + key_len + if big { 4 } else { value_len }
}

/// Encoded size a branch node with `key` will occupy, plus one pointer slot.
pub fn branch_node_size(key_len: usize) -> usize {
    POINTER_SIZE + NODE_HEADER_SIZE + key_len
}

/// Whether `root` denotes an empty tree (§3).
pub fn is_invalid_pgno(pgno: u32) -> bool {
    pgno == INVALID_PGNO
}

/// Translate a branch page's `search()` result into the entry index whose
/// child subtree should be descended into (§4.5): the search range for
/// branch pages starts at entry 1 (entry 0 is the leftmost-subtree
/// sentinel with no comparable key), so an inexact result at the low
/// bound means "no entry's key is `<= target`" and entry 0 is correct.
pub fn branch_descend_index(idx: usize, exact: bool) -> usize {
    if exact {
        idx
    } else if idx == 0 {
        0
    } else {
        idx - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::Comparator;

    fn build_leaf(entries: &[(&[u8], &[u8])], page_size: u32) -> Vec<u8> {
        let mut buf = new_page_buffer(1, 1, PageFlags::LEAF, page_size);
        let mut lower = PAGE_HEADER_SIZE as u16;
        let mut upper = page_size as u16;
        for (k, v) in entries {
            let size = leaf_node_size(k.len(), v.len(), false);
            upper -= size as u16 - POINTER_SIZE as u16;
            write_node(&mut buf, upper as usize, NodeFlags::empty(), k, v.len() as u32, v);
            put_u16(&mut buf, lower as usize, upper);
            lower += POINTER_SIZE as u16;
        }
        let mut header = PageHeader::read(&buf, 1).unwrap();
        header.lower = lower;
        header.upper = upper;
        header.write(&mut buf);
        buf
    }

    #[test]
    fn leaf_roundtrip_and_search() {
        let page_size = 256;
        let buf = build_leaf(&[(b"a", b"1"), (b"b", b"22"), (b"c", b"333")], page_size);
        let view = PageView::new(&buf).unwrap();
        assert!(view.is_leaf());
        assert_eq!(view.num_entries(), 3);
        let n0 = view.node_at(0).unwrap();
        assert_eq!(n0.key, b"a");
        assert_eq!(n0.value, b"1");
        let n2 = view.node_at(2).unwrap();
        assert_eq!(n2.key, b"c");
        assert_eq!(n2.value, b"333");

        let (idx, exact) = view.search(b"b", Comparator::Lexicographic).unwrap();
        assert!(exact);
        assert_eq!(idx, 1);

        let (idx, exact) = view.search(b"bb", Comparator::Lexicographic).unwrap();
        assert!(!exact);
        assert_eq!(idx, 2);
    }

    #[test]
    fn out_of_range_index_is_corrupted_error() {
        let buf = build_leaf(&[(b"a", b"1")], 256);
        let view = PageView::new(&buf).unwrap();
        assert!(view.node_at(5).is_err());
    }
}

//! Meta page and tree descriptor codec (§3, §4.8, §6).
//!
//! Generalizes the teacher's `Meta` struct in `db.rs` (which hashed
//! itself with `std::collections::hash_map::DefaultHasher` for a
//! "checksum" -- not stable across process restarts, since `DefaultHasher`
//! is seeded randomly) into the real two-phase-commit meta body the spec
//! requires, checksummed with `crc32fast` the way `vvoss-dev-reedbase`
//! and the `qdequele-ZeroDB` manifest both do for on-disk integrity.

use crate::bytes::{get_u32, get_u64, put_u32, put_u64};
use crate::consts::{INVALID_PGNO, MAGIC, VERSION};
use crate::error::{Error, Result};
use crate::page::PAGE_HEADER_SIZE;

/// Size of a `Geometry` record, in bytes (7 packed `u32`s).
pub const GEOMETRY_SIZE: usize = 28;

/// Size of a `TreeDescriptor` record, in bytes.
pub const TREE_DESCRIPTOR_SIZE: usize = 48;

/// Size of the meta body (everything after the 20-byte page header).
pub const META_BODY_SIZE: usize = 4 + 4 + 8 + GEOMETRY_SIZE + TREE_DESCRIPTOR_SIZE * 2 + 4 + 8;

/// File/geometry parameters carried in every meta page (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Minimum size, in pages, the file will ever shrink to.
    pub lower: u32,
    /// Current size, in pages, of the mapped region.
    pub now: u32,
    /// Next free page number -- the allocation watermark.
    pub next: u32,
    /// Maximum size, in pages, the file may grow to.
    pub upper: u32,
    /// Pages to grow by when extending the file.
    pub grow_step: u32,
    /// Fraction-of-capacity threshold (in pages) below which the file
    /// may shrink on remap; `0` disables shrinking.
    pub shrink_threshold: u32,
    /// Page size, in bytes, fixed for the lifetime of the file.
    pub page_size: u32,
}

impl Geometry {
    fn read(buf: &[u8], off: usize, pgno: u32) -> Result<Geometry> {
        Ok(Geometry {
            lower: get_u32(buf, off, pgno)?,
            now: get_u32(buf, off + 4, pgno)?,
            next: get_u32(buf, off + 8, pgno)?,
            upper: get_u32(buf, off + 12, pgno)?,
            grow_step: get_u32(buf, off + 16, pgno)?,
            shrink_threshold: get_u32(buf, off + 20, pgno)?,
            page_size: get_u32(buf, off + 24, pgno)?,
        })
    }

    fn write(&self, buf: &mut [u8], off: usize) {
        put_u32(buf, off, self.lower);
        put_u32(buf, off + 4, self.now);
        put_u32(buf, off + 8, self.next);
        put_u32(buf, off + 12, self.upper);
        put_u32(buf, off + 16, self.grow_step);
        put_u32(buf, off + 20, self.shrink_threshold);
        put_u32(buf, off + 24, self.page_size);
    }
}

/// 48-byte tree descriptor (§3): identifies one B+tree (a named DBI, the
/// MainTree, the GCTree, or a DUPSORT sub-tree) within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeDescriptor {
    /// `DbFlags` bits this tree was created with (DUPSORT, DUPFIX, ...).
    pub flags: u16,
    /// Tree height; `0` for an empty tree.
    pub height: u16,
    /// For DUPFIX trees, the fixed value size; `0` otherwise.
    pub dupfix_size: u32,
    /// Root page number, or `INVALID_PGNO` for an empty tree.
    pub root: u32,
    /// Count of branch pages reachable from `root`.
    pub branch_pages: u32,
    /// Count of leaf pages reachable from `root`.
    pub leaf_pages: u32,
    /// Count of overflow ("large") pages reachable from `root`.
    pub large_pages: u32,
    /// Monotonic sequence counter (`NextSequence`-style use).
    pub sequence: u64,
    /// Number of primary-key entries (not counting duplicates).
    pub items: u64,
    /// Txnid of the write transaction that last modified this tree.
    pub mod_txnid: u64,
}

impl TreeDescriptor {
    /// A fresh, empty tree descriptor.
    pub fn empty(flags: u16) -> TreeDescriptor {
        TreeDescriptor {
            flags,
            height: 0,
            dupfix_size: 0,
            root: INVALID_PGNO,
            branch_pages: 0,
            leaf_pages: 0,
            large_pages: 0,
            sequence: 0,
            items: 0,
            mod_txnid: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root == INVALID_PGNO
    }

    pub fn read(buf: &[u8], off: usize, pgno: u32) -> Result<TreeDescriptor> {
        Ok(TreeDescriptor {
            flags: get_u32(buf, off, pgno)? as u16,
            height: (get_u32(buf, off, pgno)? >> 16) as u16,
            dupfix_size: get_u32(buf, off + 4, pgno)?,
            root: get_u32(buf, off + 8, pgno)?,
            branch_pages: get_u32(buf, off + 12, pgno)?,
            leaf_pages: get_u32(buf, off + 16, pgno)?,
            large_pages: get_u32(buf, off + 20, pgno)?,
            sequence: get_u64(buf, off + 24, pgno)?,
            items: get_u64(buf, off + 32, pgno)?,
            mod_txnid: get_u64(buf, off + 40, pgno)?,
        })
    }

    pub fn write(&self, buf: &mut [u8], off: usize) {
        put_u32(buf, off, (self.flags as u32) | ((self.height as u32) << 16));
        put_u32(buf, off + 4, self.dupfix_size);
        put_u32(buf, off + 8, self.root);
        put_u32(buf, off + 12, self.branch_pages);
        put_u32(buf, off + 16, self.leaf_pages);
        put_u32(buf, off + 20, self.large_pages);
        put_u64(buf, off + 24, self.sequence);
        put_u64(buf, off + 32, self.items);
        put_u64(buf, off + 40, self.mod_txnid);
    }
}

/// A decoded meta body (§3, §4.8). `txnid_a`/`txnid_b` surround the
/// payload; the meta is valid only when they agree (`a == b`) and the
/// checksum over the payload matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub txnid_a: u64,
    pub magic: u32,
    pub version: u32,
    pub geometry: Geometry,
    pub main_tree: TreeDescriptor,
    pub gc_tree: TreeDescriptor,
    pub checksum: u32,
    pub txnid_b: u64,
}

const OFF_TXNID_A: usize = 0;
const OFF_MAGIC: usize = 8;
const OFF_VERSION: usize = 12;
const OFF_GEOMETRY: usize = 16;
const OFF_MAIN_TREE: usize = OFF_GEOMETRY + GEOMETRY_SIZE;
const OFF_GC_TREE: usize = OFF_MAIN_TREE + TREE_DESCRIPTOR_SIZE;
const OFF_CHECKSUM: usize = OFF_GC_TREE + TREE_DESCRIPTOR_SIZE;
const OFF_TXNID_B: usize = OFF_CHECKSUM + 4;
const CHECKSUM_REGION_END: usize = OFF_CHECKSUM;

impl Meta {
    /// Construct the meta for a brand-new, empty database.
    pub fn new_empty(page_size: u32) -> Meta {
        let geometry = Geometry {
            lower: crate::consts::META_PAGES,
            now: crate::consts::META_PAGES,
            next: crate::consts::META_PAGES,
            upper: u32::MAX / page_size,
            grow_step: 128,
            shrink_threshold: 0,
            page_size,
        };
        let mut m = Meta {
            txnid_a: 0,
            magic: MAGIC,
            version: VERSION,
            geometry,
            main_tree: TreeDescriptor::empty(0),
            gc_tree: TreeDescriptor::empty(0),
            checksum: 0,
            txnid_b: 0,
        };
        m.checksum = m.compute_checksum();
        m
    }

    fn compute_checksum(&self) -> u32 {
        let mut buf = [0u8; CHECKSUM_REGION_END];
        self.write_payload(&mut buf);
        crc32fast::hash(&buf)
    }

    fn write_payload(&self, buf: &mut [u8]) {
        put_u64(buf, OFF_TXNID_A, self.txnid_a);
        put_u32(buf, OFF_MAGIC, self.magic);
        put_u32(buf, OFF_VERSION, self.version);
        self.geometry.write(buf, OFF_GEOMETRY);
        self.main_tree.write(buf, OFF_MAIN_TREE);
        self.gc_tree.write(buf, OFF_GC_TREE);
    }

    /// Encode this meta into the 152-byte body immediately following a
    /// page header (caller writes the page header separately).
    pub fn write(&self, buf: &mut [u8]) {
        self.write_payload(buf);
        put_u32(buf, OFF_CHECKSUM, self.checksum);
        put_u64(buf, OFF_TXNID_B, self.txnid_b);
    }

    /// Decode a meta body from `buf` (page-header-relative offset 0).
    /// `pgno` is used only to annotate bounds-check errors.
    pub fn read(buf: &[u8], pgno: u32) -> Result<Meta> {
        if buf.len() < META_BODY_SIZE {
            return Err(Error::corrupted(pgno, "meta body shorter than expected"));
        }
        let txnid_a = get_u64(buf, OFF_TXNID_A, pgno)?;
        let magic = get_u32(buf, OFF_MAGIC, pgno)?;
        let version = get_u32(buf, OFF_VERSION, pgno)?;
        let geometry = Geometry::read(buf, OFF_GEOMETRY, pgno)?;
        let main_tree = TreeDescriptor::read(buf, OFF_MAIN_TREE, pgno)?;
        let gc_tree = TreeDescriptor::read(buf, OFF_GC_TREE, pgno)?;
        let checksum = get_u32(buf, OFF_CHECKSUM, pgno)?;
        let txnid_b = get_u64(buf, OFF_TXNID_B, pgno)?;
        Ok(Meta {
            txnid_a,
            magic,
            version,
            geometry,
            main_tree,
            gc_tree,
            checksum,
            txnid_b,
        })
    }

    /// Whether this meta passes every validity check (§4.8, I5): magic,
    /// version, checksum over the payload, and `txnid_a == txnid_b`.
    pub fn is_valid(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Invalid);
        }
        if self.version != VERSION {
            return Err(Error::VersionMismatch);
        }
        if self.checksum != self.compute_checksum() {
            return Err(Error::corrupted(u32::MAX, "meta checksum mismatch"));
        }
        if self.txnid_a != self.txnid_b {
            return Err(Error::corrupted(u32::MAX, "meta txnid_a != txnid_b (torn write)"));
        }
        Ok(())
    }

    /// The committed txnid this meta represents (only meaningful once valid).
    pub fn txnid(&self) -> u64 {
        self.txnid_a
    }

    /// Begin the two-phase update described in §4.8 step 5: bump the
    /// txnid and mark `txnid_b` invalid until the second write completes.
    pub fn begin_commit(&mut self, new_txnid: u64) {
        self.txnid_a = new_txnid;
        self.txnid_b = 0;
        self.checksum = self.compute_checksum();
    }

    /// Complete the two-phase update: this is only valid to call after
    /// the phase-one bytes (with `txnid_b == 0`) have been durably
    /// written to their file offset.
    pub fn complete_commit(&mut self) {
        self.txnid_b = self.txnid_a;
    }
}

/// Absolute byte offset of meta page `index` (0 or 1) within the file.
pub fn meta_page_offset(index: u32, page_size: u32) -> u64 {
    index as u64 * page_size as u64
}

/// Byte offset of the meta *body* within its page (just past the 20-byte
/// page header).
pub const META_BODY_OFFSET: usize = PAGE_HEADER_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_meta_is_valid_and_round_trips() {
        let mut meta = Meta::new_empty(4096);
        meta.txnid_b = meta.txnid_a;
        meta.checksum = meta.compute_checksum();
        let mut buf = [0u8; META_BODY_SIZE];
        meta.write(&mut buf);
        let decoded = Meta::read(&buf, 0).unwrap();
        decoded.is_valid().unwrap();
        assert_eq!(decoded.geometry.page_size, 4096);
        assert!(decoded.main_tree.is_empty());
    }

    #[test]
    fn torn_write_is_rejected() {
        let mut meta = Meta::new_empty(4096);
        meta.begin_commit(5);
        let mut buf = [0u8; META_BODY_SIZE];
        meta.write(&mut buf);
        let decoded = Meta::read(&buf, 0).unwrap();
        assert!(decoded.is_valid().is_err());
    }

    #[test]
    fn checksum_catches_corruption() {
        let mut meta = Meta::new_empty(4096);
        meta.txnid_b = meta.txnid_a;
        meta.checksum = meta.compute_checksum();
        let mut buf = [0u8; META_BODY_SIZE];
        meta.write(&mut buf);
        buf[OFF_GEOMETRY] ^= 0xFF;
        let decoded = Meta::read(&buf, 0).unwrap();
        assert!(decoded.is_valid().is_err());
    }
}

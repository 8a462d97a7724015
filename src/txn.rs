//! Transaction engine (§4.8, §5).
//!
//! Generalizes the teacher's `transaction.rs` (which declared the shape
//! of `Tx`/`TxStats` but never implemented `begin`/`commit`/`abort`) into
//! the full read/write transaction lifecycle: page allocation, the
//! dirty-page tracker, and the two-phase meta commit protocol.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cmp::Comparator;
use crate::consts::{DIRTY_SMALL_PGNO_LIMIT, GC_DBI, INVALID_PGNO, MAIN_DBI};
use crate::env::{EnvInner, Environment};
use crate::error::{Error, Result};
use crate::lockfile::ReaderHandle;
use crate::meta::{Meta, TreeDescriptor};
use crate::mmap::View;
use crate::page::{new_page_buffer, PageFlags, PageHeader, PAGE_HEADER_SIZE};
use std::sync::Arc;

/// Read access to pages, uniform across read-only and read-write
/// transactions so the search/cursor code in `btree.rs`/`cursor.rs` does
/// not need to know which kind of transaction it is driving.
///
/// Pages are handed back as owned buffers rather than slices borrowed
/// from the mmap: see DESIGN.md's "zero-copy" deviation note. This keeps
/// the COW engine free of self-referential lifetimes at the cost of one
/// `page_size`-sized copy per page visited.
pub trait PageReader {
    fn page_size(&self) -> u32;
    fn read_page(&self, pgno: u32) -> Result<Box<[u8]>>;
    fn tree(&self, dbi: u32) -> Result<TreeDescriptor>;
    fn comparators(&self, dbi: u32) -> Result<(Comparator, Comparator)>;
}

/// Dirty-page tracker (§4.8): a flat array for small page numbers plus
/// an overflow map for large ones, with an insertion-ordered index so
/// commit can iterate in O(len) rather than scanning the whole array.
#[derive(Default)]
pub struct DirtyPages {
    small: Vec<Option<Box<[u8]>>>,
    overflow: HashMap<u32, Box<[u8]>>,
    order: Vec<u32>,
}

impl DirtyPages {
    pub fn get(&self, pgno: u32) -> Option<&[u8]> {
        if (pgno as usize) < DIRTY_SMALL_PGNO_LIMIT as usize {
            self.small.get(pgno as usize).and_then(|o| o.as_deref())
        } else {
            self.overflow.get(&pgno).map(|b| &b[..])
        }
    }

    pub fn get_mut(&mut self, pgno: u32) -> Option<&mut [u8]> {
        if (pgno as usize) < DIRTY_SMALL_PGNO_LIMIT as usize {
            self.small.get_mut(pgno as usize).and_then(|o| o.as_deref_mut())
        } else {
            self.overflow.get_mut(&pgno).map(|b| &mut b[..])
        }
    }

    pub fn set(&mut self, pgno: u32, page: Box<[u8]>) {
        let is_new = self.get(pgno).is_none();
        if (pgno as usize) < DIRTY_SMALL_PGNO_LIMIT as usize {
            let idx = pgno as usize;
            if self.small.len() <= idx {
                self.small.resize_with(idx + 1, || None);
            }
            self.small[idx] = Some(page);
        } else {
            self.overflow.insert(pgno, page);
        }
        if is_new {
            self.order.push(pgno);
        }
    }

    pub fn contains(&self, pgno: u32) -> bool {
        self.get(pgno).is_some()
    }

    pub fn for_each(&self, mut f: impl FnMut(u32, &[u8])) {
        for &pgno in &self.order {
            if let Some(buf) = self.get(pgno) {
                f(pgno, buf);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.small.clear();
        self.overflow.clear();
        self.order.clear();
    }
}

/// A read-only, snapshot-isolated transaction (§4.8 "Read txn start").
pub struct ReadTxn {
    env: Arc<EnvInner>,
    view: View,
    meta: Meta,
    trees: std::cell::RefCell<HashMap<u32, TreeDescriptor>>,
    reader: Option<ReaderHandle>,
}

impl ReadTxn {
    pub(crate) fn begin(env: Arc<EnvInner>) -> Result<ReadTxn> {
        let reader = env.reader_table.acquire_reader(std::process::id(), thread_id())?;
        let meta = env.load_recent_meta()?;
        env.reader_table.set_reader_txnid(reader, meta.txnid());
        let view = env.mmap.current();
        Ok(ReadTxn {
            env,
            view,
            meta,
            trees: std::cell::RefCell::new(HashMap::new()),
            reader: Some(reader),
        })
    }

    /// The snapshot txnid this transaction observes (I3, L8).
    pub fn id(&self) -> u64 {
        self.meta.txnid()
    }

    /// End the transaction, releasing its reader slot.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(handle) = self.reader.take() {
            self.env.reader_table.release_reader(handle);
        }
    }

    /// Voluntarily release the reader slot while keeping the snapshot
    /// handle alive (§5 "Reader-slot parking"). A parked txn cannot read
    /// until `unpark` is called.
    pub fn park(&mut self) {
        if let Some(handle) = self.reader.take() {
            self.env.reader_table.release_reader(handle);
        }
    }

    /// Re-acquire a reader slot for this snapshot's txnid (§5). Fails
    /// with `ReadersFull` if no slot is available; per spec, a parked
    /// txn that cannot unpark must then be aborted by the caller.
    pub fn unpark(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        let handle = self.env.reader_table.acquire_reader(std::process::id(), thread_id())?;
        self.env.reader_table.set_reader_txnid(handle, self.meta.txnid());
        self.reader = Some(handle);
        Ok(())
    }

    pub(crate) fn main_root(&self) -> u32 {
        self.meta.main_tree.root
    }

    pub(crate) fn env(&self) -> &Arc<EnvInner> {
        &self.env
    }

    fn resolve_tree(&self, dbi: u32) -> Result<TreeDescriptor> {
        if dbi == GC_DBI {
            return Ok(self.meta.gc_tree);
        }
        if dbi == MAIN_DBI {
            return Ok(self.meta.main_tree);
        }
        if let Some(t) = self.trees.borrow().get(&dbi) {
            return Ok(*t);
        }
        let slot = self.env.dbis.read().expect("dbi registry poisoned").slot(dbi)?;
        let found = crate::btree::tree_get(self, self.meta.main_tree.root, slot.name.as_bytes(), Comparator::Lexicographic)?;
        let descriptor = match found {
            Some(bytes) => TreeDescriptor::read(&bytes, 0, u32::MAX)?,
            None => TreeDescriptor::empty(0),
        };
        self.trees.borrow_mut().insert(dbi, descriptor);
        Ok(descriptor)
    }
}

impl PageReader for ReadTxn {
    fn page_size(&self) -> u32 {
        self.meta.geometry.page_size
    }

    fn read_page(&self, pgno: u32) -> Result<Box<[u8]>> {
        let page_size = self.page_size() as usize;
        let start = pgno as usize * page_size;
        let end = start + page_size;
        if end > self.view.len() {
            return Err(Error::PageNotFound(pgno));
        }
        Ok(self.view.as_slice()[start..end].to_vec().into_boxed_slice())
    }

    fn tree(&self, dbi: u32) -> Result<TreeDescriptor> {
        self.resolve_tree(dbi)
    }

    fn comparators(&self, dbi: u32) -> Result<(Comparator, Comparator)> {
        self.env.dbis.read().expect("dbi registry poisoned").comparators(dbi)
    }
}

impl Drop for ReadTxn {
    fn drop(&mut self) {
        self.release();
    }
}

/// A read-write transaction (§4.8 "Write txn start"/"Commit protocol").
pub struct WriteTxn {
    env: Arc<EnvInner>,
    view: View,
    meta: Meta,
    trees: HashMap<u32, TreeDescriptor>,
    modified_dbis: HashSet<u32>,
    dirty: DirtyPages,
    retired: Vec<u32>,
    free_pool: VecDeque<u32>,
    reclaimed_txnids: Vec<u64>,
    txnid: u64,
    finished: bool,
}

impl WriteTxn {
    pub(crate) fn begin(env: Arc<EnvInner>) -> Result<WriteTxn> {
        let recent = env.load_recent_meta()?;
        let txnid = recent.txnid() + 1;
        let view = env.mmap.current();
        let (free_pool, reclaimed_txnids) = crate::freelist::collect_reclaimable(&env, &recent, &view)?;
        let mut trees = HashMap::new();
        trees.insert(GC_DBI, recent.gc_tree);
        trees.insert(MAIN_DBI, recent.main_tree);
        Ok(WriteTxn {
            env,
            view,
            meta: recent,
            trees,
            modified_dbis: HashSet::new(),
            dirty: DirtyPages::default(),
            retired: Vec::new(),
            free_pool,
            reclaimed_txnids,
            txnid,
            finished: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.txnid
    }

    pub(crate) fn main_root(&self) -> u32 {
        self.meta.main_tree.root
    }

    pub(crate) fn env(&self) -> &Arc<EnvInner> {
        &self.env
    }

    /// Look up (resolving from MainTree if necessary) and cache the
    /// working descriptor for `dbi` within this transaction.
    pub(crate) fn tree_of(&mut self, dbi: u32) -> Result<TreeDescriptor> {
        if let Some(t) = self.trees.get(&dbi) {
            return Ok(*t);
        }
        let slot = self.env.dbis.read().expect("dbi registry poisoned").slot(dbi)?;
        let found = crate::btree::tree_get(self, self.meta.main_tree.root, slot.name.as_bytes(), Comparator::Lexicographic)?;
        let descriptor = match found {
            Some(bytes) => TreeDescriptor::read(&bytes, 0, u32::MAX)?,
            None => TreeDescriptor::empty(0),
        };
        self.trees.insert(dbi, descriptor);
        Ok(descriptor)
    }

    /// Record a new working descriptor for `dbi`, to be persisted at
    /// commit step 1 (MainTree update) or directly into the meta body
    /// for the two built-in trees.
    pub(crate) fn set_tree(&mut self, dbi: u32, descriptor: TreeDescriptor) {
        self.trees.insert(dbi, descriptor);
        if dbi != GC_DBI && dbi != MAIN_DBI {
            self.modified_dbis.insert(dbi);
        }
    }

    /// Register a brand-new DBI's empty descriptor and the name that
    /// will back it in MainTree (§4.8 "DBI discovery").
    pub(crate) fn create_tree(&mut self, dbi: u32, descriptor: TreeDescriptor) {
        self.set_tree(dbi, descriptor);
    }

    /// Allocate a fresh page number: first from this txn's freelist
    /// pool (pages the writer reclaimed at commit-start, §4.4), else by
    /// bumping the allocation watermark (§4.8 "Page allocation").
    pub(crate) fn alloc_pgno(&mut self) -> Result<u32> {
        if let Some(pgno) = self.free_pool.pop_front() {
            return Ok(pgno);
        }
        let pgno = self.meta.geometry.next;
        let next = pgno
            .checked_add(1)
            .ok_or(Error::MapFull)?;
        self.meta.geometry.next = next;
        Ok(pgno)
    }

    /// Allocate and zero-initialize a brand-new page with `flags`,
    /// inserting it into the dirty-page tracker.
    pub(crate) fn new_page(&mut self, flags: PageFlags) -> Result<u32> {
        let pgno = self.alloc_pgno()?;
        let buf = new_page_buffer(pgno, self.txnid, flags, self.page_size());
        self.dirty.set(pgno, buf.into_boxed_slice());
        Ok(pgno)
    }

    /// Copy-on-write: if `pgno` is already a page this transaction owns
    /// (previously allocated or COW'd), return it unchanged -- it's
    /// already safe to mutate in place. Otherwise copy its current
    /// bytes under a freshly allocated page number, retire the original,
    /// and return the new number (I4).
    pub(crate) fn cow_page(&mut self, pgno: u32) -> Result<u32> {
        if self.dirty.contains(pgno) {
            return Ok(pgno);
        }
        let original = self.read_page(pgno)?;
        let new_pgno = self.alloc_pgno()?;
        let mut buf = original;
        let mut header = PageHeader::read(&buf, pgno)?;
        header.txnid = self.txnid;
        header.pgno = new_pgno;
        header.write(&mut buf);
        self.dirty.set(new_pgno, buf);
        self.retired.push(pgno);
        Ok(new_pgno)
    }

    /// Mutable access to a page this transaction already owns (must have
    /// gone through `new_page`/`cow_page` first).
    pub(crate) fn page_mut(&mut self, pgno: u32) -> Result<&mut [u8]> {
        self.dirty.get_mut(pgno).ok_or(Error::PageNotFound(pgno))
    }

    /// Reserve `count` *contiguous* fresh page numbers, bypassing the
    /// freed-page pool (overflow values are walked as a contiguous run
    /// rather than a linked list, so they must come from the bump
    /// allocator directly; §4.6 "Overflow pages").
    pub(crate) fn alloc_contiguous(&mut self, count: u32) -> Result<u32> {
        let start = self.meta.geometry.next;
        let next = start.checked_add(count).ok_or(Error::MapFull)?;
        self.meta.geometry.next = next;
        Ok(start)
    }

    /// Insert an already-built page buffer into the dirty set under
    /// `pgno`. Used by overflow-page writers, which build whole pages
    /// directly rather than going through `new_page`.
    pub(crate) fn put_raw_page(&mut self, pgno: u32, buf: Box<[u8]>) {
        self.dirty.set(pgno, buf);
    }

    /// Mark `pgno` as retired by this transaction (used directly for
    /// overflow pages and sub-tree teardown, which don't go through
    /// `cow_page`).
    pub(crate) fn retire(&mut self, pgno: u32) {
        self.retired.push(pgno);
    }

    pub(crate) fn txnid(&self) -> u64 {
        self.txnid
    }

    /// Abort: discard all dirty pages and pending state, release the
    /// writer lock. Leaves the last-valid meta untouched (§7).
    pub fn abort(mut self) {
        self.finished = true;
        self.env.writer_lock.release();
    }

    /// Commit protocol (§4.8 steps 1-9).
    pub fn commit(mut self) -> Result<u64> {
        // Step 1: persist modified named-tree descriptors into MainTree.
        let modified: Vec<u32> = self.modified_dbis.iter().copied().collect();
        for dbi in modified {
            let descriptor = *self.trees.get(&dbi).expect("tracked as modified");
            let name = self.env.dbis.read().expect("dbi registry poisoned").slot(dbi)?.name;
            let mut body = [0u8; crate::meta::TREE_DESCRIPTOR_SIZE];
            descriptor.write(&mut body, 0);
            let main_root = self.trees.get(&MAIN_DBI).copied().unwrap_or(self.meta.main_tree);
            let new_main =
                crate::btree::tree_put_named(&mut self, main_root, name.as_bytes(), &body)?;
            self.trees.insert(MAIN_DBI, new_main);
        }

        // Step 1b: flush any pages retired this txn into the GC tree
        // under this txnid, *before* recomputing final geometry so the
        // freelist write's own allocations are accounted for.
        if !self.retired.is_empty() {
            let gc_root = self.trees.get(&GC_DBI).copied().unwrap_or(self.meta.gc_tree);
            let new_gc = crate::freelist::record_retired(&mut self, gc_root, self.txnid, &self.retired.clone())?;
            self.trees.insert(GC_DBI, new_gc);
        }

        // Step 1c: drop the now-dead GC entries this txn's free_pool
        // consumed -- their pages were just handed back out by
        // `alloc_pgno`, so the bookkeeping entry is obsolete.
        if !self.reclaimed_txnids.is_empty() {
            let gc_root = self.trees.get(&GC_DBI).copied().unwrap_or(self.meta.gc_tree);
            let txnids = self.reclaimed_txnids.clone();
            let new_gc = crate::freelist::delete_reclaimed(&mut self, gc_root, &txnids)?;
            self.trees.insert(GC_DBI, new_gc);
        }

        self.meta.main_tree = *self.trees.get(&MAIN_DBI).unwrap();
        self.meta.gc_tree = *self.trees.get(&GC_DBI).unwrap();

        // Step 2-3: final geometry; grow + remap if needed.
        let page_size = self.meta.geometry.page_size as u64;
        let required_len = self.meta.geometry.next as u64 * page_size;
        if required_len > self.view.len() as u64 {
            let grow_to = required_len.max(
                (self.view.len() as u64 / page_size + self.meta.geometry.grow_step as u64) * page_size,
            );
            self.view = self.env.mmap.grow(grow_to)?;
            self.meta.geometry.now = (self.view.len() as u64 / page_size) as u32;
        }

        // Step 4: write dirty pages to their final offsets.
        {
            let view = &self.view;
            // SAFETY: this is the sole writer (writer_lock held); no
            // live reader's snapshot includes these pgnos since they
            // were either newly allocated (>= prior `next`) or retired
            // pages not reachable from any meta a reader could hold.
            let dest = unsafe { view.as_mut_slice() };
            self.dirty.for_each(|pgno, buf| {
                let off = pgno as usize * page_size as usize;
                dest[off..off + page_size as usize].copy_from_slice(buf);
            });
        }

        // Step 5: meta two-phase update.
        let target_index = self.env.next_meta_index();
        self.meta.begin_commit(self.txnid);
        self.write_meta_page(target_index)?;
        self.meta.complete_commit();
        self.write_meta_page(target_index)?;

        // Step 6: fsync.
        if !self.env.flags.contains(crate::env::OpenFlags::NO_SYNC) {
            self.env.mmap.sync(&self.view)?;
        }

        // Step 7: refresh environment's notion of the recent meta.
        self.env.set_recent_meta(target_index, self.meta);

        // Step 8: update cached per-DBI descriptors, strictly after 3/5.
        self.env
            .dbis
            .write()
            .expect("dbi registry poisoned")
            .refresh_from_tree(&self)?;

        // Step 9: release the writer mutex.
        self.finished = true;
        self.env.writer_lock.release();
        Ok(self.txnid)
    }

    fn write_meta_page(&self, index: u32) -> Result<()> {
        let page_size = self.meta.geometry.page_size as usize;
        let off = crate::meta::meta_page_offset(index, self.meta.geometry.page_size) as usize;
        let view = &self.view;
        // SAFETY: see `commit`'s step-4 comment.
        let dest = unsafe { view.as_mut_slice() };
        let page = &mut dest[off..off + page_size];
        let header = PageHeader::empty(index, self.txnid, PageFlags::META, self.meta.geometry.page_size);
        header.write(page);
        self.meta.write(&mut page[PAGE_HEADER_SIZE..]);
        Ok(())
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        if !self.finished {
            self.env.writer_lock.release();
        }
    }
}

impl PageReader for WriteTxn {
    fn page_size(&self) -> u32 {
        self.meta.geometry.page_size
    }

    fn read_page(&self, pgno: u32) -> Result<Box<[u8]>> {
        if let Some(buf) = self.dirty.get(pgno) {
            return Ok(buf.to_vec().into_boxed_slice());
        }
        let page_size = self.page_size() as usize;
        let start = pgno as usize * page_size;
        let end = start + page_size;
        if end > self.view.len() {
            return Err(Error::PageNotFound(pgno));
        }
        Ok(self.view.as_slice()[start..end].to_vec().into_boxed_slice())
    }

    fn tree(&self, dbi: u32) -> Result<TreeDescriptor> {
        self.trees.get(&dbi).copied().ok_or(Error::BadDbi)
    }

    fn comparators(&self, dbi: u32) -> Result<(Comparator, Comparator)> {
        self.env.dbis.read().expect("dbi registry poisoned").comparators(dbi)
    }
}

pub(crate) fn thread_id() -> u64 {
    // A stable-enough per-thread identifier for the reader table; actual
    // uniqueness only matters for diagnostics, not correctness (the slot
    // index is what the engine relies on).
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    use std::hash::{Hash, Hasher};
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

pub(crate) fn now_epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

// Re-exported for `env.rs`, which constructs the first transaction ever
// (the implicit "create empty database" write) without going through
// `Environment::begin_write`'s writer-lock dance.
pub(crate) use self::WriteTxn as RawWriteTxn;

#[allow(dead_code)]
fn _assert_invalid_pgno_sentinel_unused_without_tree() {
    let _ = INVALID_PGNO;
}

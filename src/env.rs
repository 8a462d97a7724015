//! Environment: the top-level handle opening a database file (§4.1, §4.9, §6).
//!
//! Generalizes the teacher's `Db::open`/`Settings` in `db.rs` (which
//! never got past locking the file and reading its length) into the
//! full open sequence: exclusive/shared advisory locking via `fs2`,
//! reading or initializing both meta pages, mapping the file, and
//! wiring up the reader table and writer mutex the teacher's `Settings`
//! struct gestured at but never built.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use bitflags::bitflags;

use crate::cmp::Comparator;
use crate::consts::{DEFAULT_PAGE_SIZE, DEFAULT_READERS, FIRST_USER_DBI, GC_DBI, MAIN_DBI, MAX_DBIS, META_PAGES};
use crate::cursor::{Cursor, CursorTxn, PutFlags};
use crate::error::{Error, Result};
use crate::lockfile::{LockFile, ReaderTable};
use crate::meta::{meta_page_offset, Meta, TreeDescriptor, META_BODY_OFFSET};
use crate::mmap::MmapManager;
use crate::page::{PageFlags, PageHeader};
use crate::txn::{PageReader, RawWriteTxn as WriteTxn, ReadTxn};

bitflags! {
    /// Environment-open flags (§6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const READ_ONLY = 0x01;
        /// Treat `path` as the literal data file rather than a directory
        /// containing one. This implementation always behaves this way
        /// (see DESIGN.md); the flag is accepted for API compatibility.
        const NO_SUB_DIR = 0x02;
        const NO_SYNC = 0x04;
        const NO_META_SYNC = 0x08;
        const WRITE_MAP = 0x10;
        const NO_TLS = 0x20;
        const COALESCE = 0x40;
        const LIFO_RECLAIM = 0x80;
    }
}

bitflags! {
    /// Per-database flags, set at `open_dbi` time and persisted in the
    /// database's [`TreeDescriptor`] (§3, §4.9).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u16 {
        const CREATE = 0x01;
        const DUPSORT = 0x02;
        const DUPFIX = 0x04;
        const INTEGER_KEY = 0x08;
        const INTEGER_DUP = 0x10;
        const REVERSE_KEY = 0x20;
        const REVERSE_DUP = 0x40;
    }
}

/// Summary statistics for a database (`mdb_stat`-style, §4.9).
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub page_size: u32,
    pub depth: u16,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
}

impl Stat {
    fn from_tree(tree: TreeDescriptor, page_size: u32) -> Stat {
        Stat {
            page_size,
            depth: tree.height,
            branch_pages: tree.branch_pages as u64,
            leaf_pages: tree.leaf_pages as u64,
            overflow_pages: tree.large_pages as u64,
            entries: tree.items,
        }
    }
}

#[derive(Clone)]
pub(crate) struct DbiSlot {
    pub name: String,
    pub flags: DbFlags,
    pub key_cmp: Comparator,
    pub dup_cmp: Comparator,
}

fn comparators_for(flags: DbFlags) -> (Comparator, Comparator) {
    let key_cmp = if flags.contains(DbFlags::REVERSE_KEY) {
        Comparator::Reverse
    } else if flags.contains(DbFlags::INTEGER_KEY) {
        Comparator::Integer
    } else {
        Comparator::Lexicographic
    };
    let dup_cmp = if flags.contains(DbFlags::REVERSE_DUP) {
        Comparator::Reverse
    } else if flags.contains(DbFlags::INTEGER_DUP) {
        Comparator::Integer
    } else {
        Comparator::Lexicographic
    };
    (key_cmp, dup_cmp)
}

/// Process-local table mapping a named DBI to its slot number, flags,
/// and comparators. Stable for the lifetime of the `Environment` --
/// tree *descriptors* (root pgno, item count, ...) are never cached
/// here; each transaction resolves its own working copy from MainTree
/// (see `ReadTxn::resolve_tree`/`WriteTxn::tree_of`).
pub(crate) struct DbiRegistry {
    slots: Vec<Option<DbiSlot>>,
    by_name: HashMap<String, u32>,
    next_free: u32,
}

impl DbiRegistry {
    fn new() -> DbiRegistry {
        DbiRegistry {
            slots: vec![None; MAX_DBIS],
            by_name: HashMap::new(),
            next_free: FIRST_USER_DBI,
        }
    }

    pub(crate) fn slot(&self, dbi: u32) -> Result<DbiSlot> {
        self.slots.get(dbi as usize).and_then(|s| s.clone()).ok_or(Error::BadDbi)
    }

    pub(crate) fn comparators(&self, dbi: u32) -> Result<(Comparator, Comparator)> {
        if dbi == GC_DBI {
            return Ok((Comparator::Integer, Comparator::Lexicographic));
        }
        if dbi == MAIN_DBI {
            return Ok((Comparator::Lexicographic, Comparator::Lexicographic));
        }
        let slot = self.slot(dbi)?;
        Ok((slot.key_cmp, slot.dup_cmp))
    }

    pub(crate) fn find_by_name(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn allocate(&mut self, name: &str, flags: DbFlags) -> Result<u32> {
        if let Some(dbi) = self.by_name.get(name) {
            return Ok(*dbi);
        }
        while (self.next_free as usize) < MAX_DBIS {
            let idx = self.next_free;
            self.next_free += 1;
            if self.slots[idx as usize].is_none() {
                let (key_cmp, dup_cmp) = comparators_for(flags);
                self.slots[idx as usize] = Some(DbiSlot {
                    name: name.to_string(),
                    flags,
                    key_cmp,
                    dup_cmp,
                });
                self.by_name.insert(name.to_string(), idx);
                return Ok(idx);
            }
        }
        Err(Error::DbsFull)
    }

    /// Hook called at the end of commit (§4.8 step 8). The registry
    /// holds no tree-shaped state that a commit could invalidate -- this
    /// exists so `WriteTxn::commit` has a single place to keep the
    /// registry consistent if that ever changes.
    pub(crate) fn refresh_from_tree(&mut self, _txn: &WriteTxn) -> Result<()> {
        Ok(())
    }
}

/// In-process mutual exclusion for "at most one write transaction"
/// (§5). Backed by a plain `Mutex`+`Condvar` rather than a try-lock loop
/// so waiting writers block instead of spinning.
pub(crate) struct WriterLock {
    active: Mutex<bool>,
    cv: Condvar,
}

impl WriterLock {
    fn new() -> WriterLock {
        WriterLock {
            active: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut active = self.active.lock().expect("writer lock poisoned");
        while *active {
            active = self.cv.wait(active).expect("writer lock poisoned");
        }
        *active = true;
    }

    pub(crate) fn release(&self) {
        let mut active = self.active.lock().expect("writer lock poisoned");
        *active = false;
        self.cv.notify_one();
    }
}

struct MetaState {
    metas: [Meta; 2],
    recent: u32,
}

pub(crate) struct EnvInner {
    #[allow(dead_code)]
    path: PathBuf,
    pub(crate) flags: OpenFlags,
    pub(crate) mmap: MmapManager,
    #[allow(dead_code)]
    lock_file: LockFile,
    pub(crate) reader_table: ReaderTable,
    pub(crate) writer_lock: WriterLock,
    pub(crate) dbis: RwLock<DbiRegistry>,
    meta_state: RwLock<MetaState>,
}

impl EnvInner {
    pub(crate) fn load_recent_meta(&self) -> Result<Meta> {
        let state = self.meta_state.read().expect("meta state poisoned");
        Ok(state.metas[state.recent as usize])
    }

    /// The meta slot (0 or 1) the *next* commit should write to -- the
    /// one that is not currently the recent, valid meta (§4.8 step 5).
    pub(crate) fn next_meta_index(&self) -> u32 {
        let state = self.meta_state.read().expect("meta state poisoned");
        1 - state.recent
    }

    pub(crate) fn set_recent_meta(&self, index: u32, meta: Meta) {
        let mut state = self.meta_state.write().expect("meta state poisoned");
        state.metas[index as usize] = meta;
        state.recent = index;
    }
}

/// Builder for opening an [`Environment`] (§4.9, generalizing the
/// teacher's `Settings`).
pub struct EnvBuilder {
    page_size: u32,
    max_readers: u32,
    map_size: u64,
}

impl Default for EnvBuilder {
    fn default() -> EnvBuilder {
        EnvBuilder {
            page_size: DEFAULT_PAGE_SIZE,
            max_readers: DEFAULT_READERS,
            map_size: 16 * 1024 * 1024,
        }
    }
}

impl EnvBuilder {
    /// Page size for a brand-new database file. Ignored when opening an
    /// existing file, whose on-disk geometry is authoritative.
    pub fn page_size(mut self, size: u32) -> EnvBuilder {
        self.page_size = size;
        self
    }

    pub fn max_readers(mut self, n: u32) -> EnvBuilder {
        self.max_readers = n;
        self
    }

    /// Initial mapped size for a brand-new file, in bytes (§4.2). An
    /// existing file's current length is always honored regardless of
    /// this setting; growth beyond it happens automatically on commit.
    pub fn map_size(mut self, bytes: u64) -> EnvBuilder {
        self.map_size = bytes;
        self
    }

    pub fn open(self, path: impl AsRef<Path>, flags: OpenFlags) -> Result<Environment> {
        let path = path.as_ref().to_path_buf();
        let read_only = flags.contains(OpenFlags::READ_ONLY);
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(&path)?;

        let lock_file = LockFile::open(&path)?;
        if read_only {
            lock_file.lock_shared()?;
        } else {
            lock_file.lock_exclusive()?;
        }

        let existing_len = file.metadata()?.len();
        let min_len = META_PAGES as u64 * self.page_size as u64;
        let is_new = existing_len < min_len;

        if is_new && read_only {
            return Err(Error::Invalid);
        }

        let (meta0, meta1, page_size) = if is_new {
            let mut fresh = Meta::new_empty(self.page_size);
            fresh.begin_commit(0);
            fresh.complete_commit();
            (fresh, fresh, self.page_size)
        } else {
            let (m0, m1) = read_metas(&file)?;
            (m0, m1, pick_page_size(&m0, &m1)?)
        };

        let recent = pick_recent(meta0, meta1)?;

        let mapped_len = if is_new {
            existing_len.max(min_len).max(self.map_size)
        } else {
            existing_len
        };
        if !read_only {
            file.set_len(mapped_len)?;
        }
        let mmap = if read_only {
            MmapManager::new_read_only(file, mapped_len)?
        } else {
            MmapManager::new(file, mapped_len)?
        };

        if is_new {
            let view = mmap.current();
            // SAFETY: no other handle to this mapping exists yet.
            let dest = unsafe { view.as_mut_slice() };
            for index in 0..META_PAGES {
                let off = meta_page_offset(index, page_size) as usize;
                let header = PageHeader::empty(index, 0, PageFlags::META, page_size);
                let page = &mut dest[off..off + page_size as usize];
                header.write(page);
                meta0.write(&mut page[META_BODY_OFFSET..]);
            }
            mmap.sync(&view)?;
        }

        let inner = Arc::new(EnvInner {
            path,
            flags,
            mmap,
            lock_file,
            reader_table: ReaderTable::new(self.max_readers as usize),
            writer_lock: WriterLock::new(),
            dbis: RwLock::new(DbiRegistry::new()),
            meta_state: RwLock::new(MetaState {
                metas: [meta0, meta1],
                recent,
            }),
        });
        Ok(Environment { inner })
    }
}

fn read_metas(file: &File) -> Result<(Meta, Meta)> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file.try_clone()?;
    let meta_region = crate::page::PAGE_HEADER_SIZE + crate::meta::META_BODY_SIZE;

    let mut page0 = vec![0u8; meta_region];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut page0)?;
    let meta0 = Meta::read(&page0[crate::page::PAGE_HEADER_SIZE..], 0)?;
    // The real page size lives inside meta0 itself; a corrupt meta0
    // leaves no way to locate meta1 precisely, so fall back to the
    // compiled-in default (meta1's own validity check then decides
    // whether that guess paid off).
    let page_size = if meta0.is_valid().is_ok() {
        meta0.geometry.page_size
    } else {
        DEFAULT_PAGE_SIZE
    } as u64;

    let mut page1 = vec![0u8; meta_region];
    file.seek(SeekFrom::Start(page_size))?;
    file.read_exact(&mut page1)?;
    let meta1 = Meta::read(&page1[crate::page::PAGE_HEADER_SIZE..], 1)?;
    Ok((meta0, meta1))
}

fn pick_page_size(m0: &Meta, m1: &Meta) -> Result<u32> {
    if m0.is_valid().is_ok() {
        Ok(m0.geometry.page_size)
    } else if m1.is_valid().is_ok() {
        Ok(m1.geometry.page_size)
    } else {
        Err(Error::Invalid)
    }
}

fn pick_recent(m0: Meta, m1: Meta) -> Result<u32> {
    match (m0.is_valid().is_ok(), m1.is_valid().is_ok()) {
        (true, true) => Ok(if m1.txnid() > m0.txnid() { 1 } else { 0 }),
        (true, false) => Ok(0),
        (false, true) => Ok(1),
        (false, false) => Err(Error::Invalid),
    }
}

/// A handle to an open database file. Cheap to clone (an `Arc` inside);
/// transactions borrow a clone and can outlive the `Environment` value
/// that created them (§4.1).
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    pub fn builder() -> EnvBuilder {
        EnvBuilder::default()
    }

    pub fn begin_read(&self) -> Result<ReadTxn> {
        ReadTxn::begin(self.inner.clone())
    }

    /// Begin a write transaction. `parent` mirrors the nested-transaction
    /// shape real LMDB exposes, but nesting isn't implemented here (see
    /// DESIGN.md) -- passing `Some(..)` always fails with `Incompatible`
    /// rather than silently flattening into a top-level transaction.
    pub fn begin_write(&self, parent: Option<&WriteTxn>) -> Result<WriteTxn> {
        if parent.is_some() {
            return Err(Error::Incompatible("nested transactions are not supported"));
        }
        if self.inner.mmap.is_read_only() {
            return Err(Error::PermissionDenied);
        }
        self.inner.writer_lock.acquire();
        match WriteTxn::begin(self.inner.clone()) {
            Ok(txn) => Ok(txn),
            Err(e) => {
                self.inner.writer_lock.release();
                Err(e)
            }
        }
    }

    pub fn sync(&self) -> Result<()> {
        let view = self.inner.mmap.current();
        self.inner.mmap.sync(&view)
    }
}

impl ReadTxn {
    /// Resolve a database name to its DBI slot (`None` for the unnamed
    /// MainTree). Falls back to walking MainTree itself and registering
    /// the slot on first sight within this process (§4.9 "DBI discovery").
    pub fn open_dbi(&self, name: Option<&str>) -> Result<u32> {
        let Some(name) = name else { return Ok(MAIN_DBI) };
        if let Some(dbi) = self.env().dbis.read().expect("dbi registry poisoned").find_by_name(name) {
            return Ok(dbi);
        }
        let found = crate::btree::tree_get(self, self.main_root(), name.as_bytes(), Comparator::Lexicographic)?;
        let Some(bytes) = found else { return Err(Error::BadDbi) };
        let descriptor = TreeDescriptor::read(&bytes, 0, u32::MAX)?;
        let mut registry = self.env().dbis.write().expect("dbi registry poisoned");
        registry.allocate(name, DbFlags::from_bits_truncate(descriptor.flags))
    }

    pub fn get(&self, dbi: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tree = self.tree(dbi)?;
        let (key_cmp, _) = self.comparators(dbi)?;
        crate::btree::tree_get(self, tree.root, key, key_cmp)
    }

    pub fn open_cursor(&self, dbi: u32) -> Result<Cursor<'_>> {
        Cursor::new(CursorTxn::Read(self), dbi)
    }

    pub fn stat(&self, dbi: u32) -> Result<Stat> {
        let tree = self.tree(dbi)?;
        Ok(Stat::from_tree(tree, self.page_size()))
    }
}

impl WriteTxn {
    /// As [`ReadTxn::open_dbi`], but may create a not-yet-existing named
    /// database when `flags` carries `CREATE` (§4.9).
    pub fn open_dbi(&mut self, name: Option<&str>, flags: DbFlags) -> Result<u32> {
        let Some(name) = name else { return Ok(MAIN_DBI) };
        if let Some(dbi) = self.env().dbis.read().expect("dbi registry poisoned").find_by_name(name) {
            self.tree_of(dbi)?;
            return Ok(dbi);
        }
        let existing = crate::btree::tree_get(self, self.main_root(), name.as_bytes(), Comparator::Lexicographic)?;
        if let Some(bytes) = existing {
            let descriptor = TreeDescriptor::read(&bytes, 0, u32::MAX)?;
            let dbi = self
                .env()
                .dbis
                .write()
                .expect("dbi registry poisoned")
                .allocate(name, DbFlags::from_bits_truncate(descriptor.flags))?;
            self.set_tree(dbi, descriptor);
            return Ok(dbi);
        }
        if !flags.contains(DbFlags::CREATE) {
            return Err(Error::BadDbi);
        }
        let dbi = self.env().dbis.write().expect("dbi registry poisoned").allocate(name, flags)?;
        self.create_tree(dbi, TreeDescriptor::empty(flags.bits()));
        Ok(dbi)
    }

    pub fn get(&mut self, dbi: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tree = self.tree_of(dbi)?;
        let (key_cmp, _) = self.comparators(dbi)?;
        crate::btree::tree_get(&*self, tree.root, key, key_cmp)
    }

    pub fn put(&mut self, dbi: u32, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        let mut cursor = Cursor::new(CursorTxn::Write(self), dbi)?;
        cursor.put(key, value, flags)
    }

    pub fn del(&mut self, dbi: u32, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        let mut cursor = Cursor::new(CursorTxn::Write(self), dbi)?;
        if cursor.set(key)?.is_none() {
            return Ok(false);
        }
        cursor.del(value)
    }

    pub fn open_cursor(&mut self, dbi: u32) -> Result<Cursor<'_>> {
        Cursor::new(CursorTxn::Write(self), dbi)
    }

    pub fn stat(&mut self, dbi: u32) -> Result<Stat> {
        let tree = self.tree_of(dbi)?;
        Ok(Stat::from_tree(tree, self.page_size()))
    }
}

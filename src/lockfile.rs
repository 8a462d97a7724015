//! Lock file / reader table (§4.3).
//!
//! The teacher leans on `fs2::FileExt::lock_exclusive` for writer
//! exclusion in `db.rs` but never built the companion reader table. This
//! module keeps `fs2` for the on-disk advisory lock (excluding a second
//! *process* from opening the same file read-write, belt-and-braces
//! alongside the in-process writer mutex that actually enforces §5's
//! "at most one write txn" rule within this engine) and adds the bounded
//! slot array of active reader txnids the spec requires.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use fs2::FileExt;

use crate::error::{Error, Result};

/// One reader slot (§4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderSlot {
    pub pid: u32,
    pub tid: u64,
    pub txnid: u64,
    pub in_use: bool,
}

/// Bounded table of active reader transaction ids, guarded by a single
/// lightweight mutex (§5: "slot acquisition is lock-free per-slot after
/// selection" -- this implementation selects and updates under the same
/// mutex since the table is small and updates are brief).
pub struct ReaderTable {
    slots: Mutex<Vec<ReaderSlot>>,
}

/// A handle identifying which slot a reader transaction occupies.
#[derive(Debug, Clone, Copy)]
pub struct ReaderHandle {
    pub index: usize,
}

impl ReaderTable {
    pub fn new(capacity: usize) -> ReaderTable {
        ReaderTable {
            slots: Mutex::new(vec![ReaderSlot::default(); capacity]),
        }
    }

    /// Acquire a free slot for `pid`/`tid`. Returns `Error::ReadersFull`
    /// if every slot is occupied.
    pub fn acquire_reader(&self, pid: u32, tid: u64) -> Result<ReaderHandle> {
        let mut slots = self.slots.lock().expect("reader table mutex poisoned");
        for (index, slot) in slots.iter_mut().enumerate() {
            if !slot.in_use {
                slot.in_use = true;
                slot.pid = pid;
                slot.tid = tid;
                slot.txnid = 0;
                return Ok(ReaderHandle { index });
            }
        }
        Err(Error::ReadersFull)
    }

    /// Record the snapshot txnid a reader is now observing.
    pub fn set_reader_txnid(&self, handle: ReaderHandle, txnid: u64) {
        let mut slots = self.slots.lock().expect("reader table mutex poisoned");
        slots[handle.index].txnid = txnid;
    }

    /// Release a reader's slot (on commit/abort, or voluntary parking).
    pub fn release_reader(&self, handle: ReaderHandle) {
        let mut slots = self.slots.lock().expect("reader table mutex poisoned");
        slots[handle.index] = ReaderSlot::default();
    }

    /// The minimum txnid among all currently-registered readers, or
    /// `None` if no reader is active. Used by the freelist to decide
    /// which retired pages are safe to reclaim (I3, §4.4).
    pub fn min_live_reader_txnid(&self) -> Option<u64> {
        let slots = self.slots.lock().expect("reader table mutex poisoned");
        slots
            .iter()
            .filter(|s| s.in_use)
            .map(|s| s.txnid)
            .min()
    }

    /// Snapshot of all in-use slots, for diagnostics/tests.
    pub fn live_readers(&self) -> Vec<ReaderSlot> {
        self.slots
            .lock()
            .expect("reader table mutex poisoned")
            .iter()
            .filter(|s| s.in_use)
            .copied()
            .collect()
    }
}

/// The advisory file lock backing cross-process writer exclusion. Held
/// for the lifetime of a read-write environment open; a second process
/// attempting a read-write open on the same path blocks (or fails
/// immediately under `TRY`) at the OS level, in addition to this
/// process's own in-process writer mutex (§5).
pub struct LockFile {
    file: File,
}

impl LockFile {
    /// Open (creating if absent) the lock file alongside the data file.
    pub fn open(path: &Path) -> Result<LockFile> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        Ok(LockFile { file })
    }

    /// Block until an exclusive lock is obtained.
    pub fn lock_exclusive(&self) -> Result<()> {
        self.file.lock_exclusive().map_err(Error::from)
    }

    /// Attempt to obtain an exclusive lock without blocking (`TRY` flag, §6).
    pub fn try_lock_exclusive(&self) -> Result<bool> {
        match self.file.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(Error::from(err)),
        }
    }

    /// Obtain a shared lock, used by read-only environments so a
    /// read-write open elsewhere is still visible as contention.
    pub fn lock_shared(&self) -> Result<()> {
        self.file.lock_shared().map_err(Error::from)
    }

    pub fn unlock(&self) -> Result<()> {
        self.file.unlock().map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_table_tracks_min_live_txnid() {
        let table = ReaderTable::new(4);
        let a = table.acquire_reader(1, 1).unwrap();
        let b = table.acquire_reader(1, 2).unwrap();
        table.set_reader_txnid(a, 10);
        table.set_reader_txnid(b, 5);
        assert_eq!(table.min_live_reader_txnid(), Some(5));
        table.release_reader(b);
        assert_eq!(table.min_live_reader_txnid(), Some(10));
        table.release_reader(a);
        assert_eq!(table.min_live_reader_txnid(), None);
    }

    #[test]
    fn reader_table_full_errors() {
        let table = ReaderTable::new(1);
        let _a = table.acquire_reader(1, 1).unwrap();
        assert!(matches!(table.acquire_reader(1, 2), Err(Error::ReadersFull)));
    }
}

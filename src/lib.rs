//! An embedded, single-writer/multi-reader, copy-on-write B+tree
//! key-value store over a memory-mapped file.
//!
//! A write transaction never mutates a page a live reader's snapshot
//! can still reach -- every touched page is copied, edited, and
//! committed atomically via a two-phase meta update, so a reader begun
//! before a commit keeps seeing a fully consistent prior version of the
//! whole database for as long as its transaction is open.

#![allow(dead_code)]

mod btree;
mod bytes;
mod cmp;
mod consts;
mod cursor;
mod dupsort;
mod env;
mod error;
mod freelist;
mod lockfile;
mod meta;
mod mmap;
mod page;
mod txn;

pub use cmp::Comparator;
pub use cursor::{Cursor, PutFlags};
pub use env::{DbFlags, EnvBuilder, Environment, OpenFlags, Stat};
pub use error::{Error, Result};
pub use txn::{ReadTxn, RawWriteTxn as WriteTxn};

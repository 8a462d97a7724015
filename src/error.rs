//! Error taxonomy (§7).
//!
//! The teacher declares its errors with `quick_error!` in `errors.rs` but
//! never lists `quick_error` among its dependencies -- a dangling
//! reference in the original skeleton. `thiserror` is the crate the rest
//! of the example pack reaches for in its place (see SPEC_FULL.md), and
//! is what is actually resolvable, so the taxonomy is rebuilt on it here.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The unified error taxonomy described in spec §7.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Insert with no-overwrite semantics hit an existing key (or
    /// key+value, under DUPSORT).
    #[error("key already exists")]
    KeyExist,

    /// Key (or key+value, under DUPSORT) absent.
    #[error("key not found")]
    NotFound,

    /// A page number referenced by the tree does not exist in the file.
    #[error("page {0} not found")]
    PageNotFound(u32),

    /// A page or meta region failed an integrity check.
    #[error("corrupted page {pgno}: {reason}")]
    Corrupted {
        /// The offending page number, if known (`u32::MAX` if not page-scoped).
        pgno: u32,
        /// Which invariant failed.
        reason: String,
    },

    /// An internal invariant was violated; indicates a bug rather than
    /// user misuse or on-disk corruption.
    #[error("internal invariant violated: {0}")]
    Panic(String),

    /// The data file's format version doesn't match this build.
    #[error("version mismatch")]
    VersionMismatch,

    /// The data file is not a valid database (bad magic, both metas
    /// invalid, etc).
    #[error("invalid database file")]
    Invalid,

    /// A reader's mapped view is stale relative to the current geometry.
    #[error("map resized by another process")]
    MapResized,

    /// The environment's configured maximum map size has been reached.
    #[error("map full")]
    MapFull,

    /// The DBI slot table has no room for another named database.
    #[error("too many open databases")]
    DbsFull,

    /// The reader table has no free slot.
    #[error("too many open readers")]
    ReadersFull,

    /// Too many nested/concurrent transactions for this environment.
    #[error("too many transactions")]
    TxnFull,

    /// The cursor stack exceeded its maximum depth.
    #[error("cursor stack exhausted")]
    CursorFull,

    /// A page could not accommodate an entry even after a split.
    #[error("page full")]
    PageFull,

    /// The file could not be extended to satisfy an allocation.
    #[error("unable to extend file")]
    UnableToExtend,

    /// Operation is incompatible with the tree's kind or current state
    /// (e.g. a DUPSORT-only op on a non-DUPSORT tree, out-of-order
    /// `APPEND`).
    #[error("incompatible operation: {0}")]
    Incompatible(&'static str),

    /// Transaction used after commit/abort, or from the wrong thread.
    #[error("transaction is no longer valid")]
    BadTxn,

    /// A key or value violated a size constraint.
    #[error("bad value size")]
    BadValSize,

    /// An unknown or stale DBI handle was used.
    #[error("bad database handle")]
    BadDbi,

    /// Caller lacks permission for the requested operation (e.g. a write
    /// on a read-only environment).
    #[error("permission denied")]
    PermissionDenied,

    /// Wrapped OS I/O error.
    #[error("I/O error: {0}")]
    Problem(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::Corrupted`] with a static invariant description.
    pub fn corrupted(pgno: u32, reason: impl Into<String>) -> Error {
        Error::Corrupted {
            pgno,
            reason: reason.into(),
        }
    }
}

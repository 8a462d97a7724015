//! Compile-time constants shared across the engine.
//!
//! Mirrors the teacher's `constants.rs`, extended with the sizes the
//! page/meta codec and B+tree engine need that the stub never declared.

/// Default page size in bytes. Must match what an on-disk file declares;
/// `Meta::page_size` is the source of truth once a file exists.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// The minimum number of keys required in a database page. Data items
/// larger than `page_size / MIN_KEYS_PER_PAGE` are pushed to overflow
/// pages instead of being stored directly in a leaf node.
pub const MIN_KEYS_PER_PAGE: u16 = 2;

/// Stamp identifying a file as belonging to this engine.
pub const MAGIC: u32 = 0x0BAD_C0DE;

/// On-disk format version.
pub const VERSION: u32 = 1;

/// Maximum length of a key, in bytes.
pub const MAX_KEY_SIZE: u32 = 511;

/// Maximum length of a value, in bytes.
pub const MAX_VALUE_SIZE: u32 = (1 << 31) - 2;

/// Sentinel meaning "no page" / an empty tree.
pub const INVALID_PGNO: u32 = 0xFFFF_FFFF;

/// Page numbers 0 and 1 are always meta pages.
pub const META_PAGES: u32 = 2;

/// Fraction of a page a value may occupy before it is pushed to overflow
/// pages. `1/4` matches the teacher's own commentary in `constants.rs`.
pub const OVERFLOW_THRESHOLD_DIVISOR: u32 = 4;

/// Fraction of a page a DUPSORT sub-page may occupy before its values are
/// promoted into a standalone sub-tree (see SPEC_FULL.md open question 1).
pub const SUBPAGE_PROMOTE_DIVISOR: u32 = 4;

/// Fill factor below which a page is a rebalance candidate on delete.
pub const MIN_FILL_PERCENTAGE: f32 = 0.25;

/// Fill factor split pages target by default.
pub const DEF_FILL_PERCENTAGE: f32 = 0.5;

/// Number of slots in the reader table / lock file.
pub const DEFAULT_READERS: u32 = 126;

/// Dirty-page tracker flat-array threshold (§4.8): pgnos below this bound
/// are indexed directly; pgnos at or above it fall into the overflow map.
pub const DIRTY_SMALL_PGNO_LIMIT: u32 = 65536;

/// Maximum cursor stack depth (tree height bound).
pub const CURSOR_STACK_SIZE: usize = 32;

/// DBI slot for the freelist / GC tree.
pub const GC_DBI: u32 = 0;

/// DBI slot for the tree of named databases.
pub const MAIN_DBI: u32 = 1;

/// Number of built-in DBI slots before user-named trees start.
pub const FIRST_USER_DBI: u32 = 2;

/// Maximum number of open DBI slots per environment.
pub const MAX_DBIS: usize = 128;

//! Key/value comparators (Design Notes, "Comparators").
//!
//! The default comparator is byte-lexicographic. `IntegerKey`/`IntegerDup`
//! compare fixed 8-byte big-endian integers (SPEC_FULL.md open question
//! 3). `ReverseKey`/`ReverseDup` compare byte strings right-to-left.
//! Comparators are not persisted -- the spec requires the caller supply
//! the same one on every open, so this is a plain enum rather than a
//! trait object, matching the "not user-supplied closures" decision in
//! SPEC_FULL.md.

use std::cmp::Ordering;

/// A total order over byte strings, selected at `open_dbi` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// Byte-lexicographic (`memcmp`-style) order. The default.
    Lexicographic,
    /// Fixed 8-byte big-endian integer order.
    Integer,
    /// Byte-lexicographic order, compared right-to-left.
    Reverse,
}

impl Comparator {
    /// Compare `a` and `b` under this comparator. Total order; never
    /// panics regardless of input length (malformed `Integer` keys fall
    /// back to length-then-lexicographic so a corrupted file can't wedge
    /// the engine mid-search).
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Comparator::Lexicographic => a.cmp(b),
            Comparator::Integer => match (as_u64(a), as_u64(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            },
            Comparator::Reverse => {
                a.iter().rev().cmp(b.iter().rev())
            }
        }
    }
}

fn as_u64(bytes: &[u8]) -> Option<u64> {
    crate::bytes::from_be_u64(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicographic_orders_bytes() {
        assert_eq!(Comparator::Lexicographic.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(Comparator::Lexicographic.compare(b"ab", b"a"), Ordering::Greater);
    }

    #[test]
    fn integer_orders_numerically_not_lexicographically() {
        let small = 1u64.to_be_bytes();
        let large = 256u64.to_be_bytes();
        assert_eq!(Comparator::Integer.compare(&small, &large), Ordering::Less);
    }

    #[test]
    fn reverse_compares_right_to_left() {
        assert_eq!(Comparator::Reverse.compare(b"ab", b"bb"), Ordering::Less);
        assert_eq!(Comparator::Reverse.compare(b"za", b"ab"), Ordering::Less);
    }
}

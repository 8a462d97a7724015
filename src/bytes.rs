//! Little-endian accessors over page byte slices.
//!
//! The teacher's `enc.rs` read and wrote struct fields through raw
//! pointer arithmetic (`ptr::read`/`ptr::write` on `*const u8`). Several
//! pack examples doing the same job (`libmdbx-rs`, `jarnac`, `delamarch3
//! -base`) instead reach for `byteorder` over safe slices, which is also
//! what this crate's bounds-checking requirement (§4.1: "Accessors must
//! never allocate" and "return `InvalidPage` when offsets would be out of
//! bounds") needs: every read here is a checked slice index, not an
//! unchecked pointer offset.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

#[inline]
fn bounds_check(buf: &[u8], offset: usize, len: usize, pgno: u32) -> Result<()> {
    if offset.checked_add(len).map_or(true, |end| end > buf.len()) {
        return Err(Error::corrupted(pgno, "accessor out of page bounds"));
    }
    Ok(())
}

/// Read a `u16` at `offset`, bounds-checked against `pgno`'s page.
pub fn get_u16(buf: &[u8], offset: usize, pgno: u32) -> Result<u16> {
    bounds_check(buf, offset, 2, pgno)?;
    Ok(LittleEndian::read_u16(&buf[offset..offset + 2]))
}

/// Read a `u32` at `offset`, bounds-checked against `pgno`'s page.
pub fn get_u32(buf: &[u8], offset: usize, pgno: u32) -> Result<u32> {
    bounds_check(buf, offset, 4, pgno)?;
    Ok(LittleEndian::read_u32(&buf[offset..offset + 4]))
}

/// Read a `u64` at `offset`, bounds-checked against `pgno`'s page.
pub fn get_u64(buf: &[u8], offset: usize, pgno: u32) -> Result<u64> {
    bounds_check(buf, offset, 8, pgno)?;
    Ok(LittleEndian::read_u64(&buf[offset..offset + 8]))
}

/// Read a `u8` at `offset`, bounds-checked against `pgno`'s page.
pub fn get_u8(buf: &[u8], offset: usize, pgno: u32) -> Result<u8> {
    bounds_check(buf, offset, 1, pgno)?;
    Ok(buf[offset])
}

/// Borrow `len` bytes starting at `offset`, bounds-checked.
pub fn get_slice(buf: &[u8], offset: usize, len: usize, pgno: u32) -> Result<&[u8]> {
    bounds_check(buf, offset, len, pgno)?;
    Ok(&buf[offset..offset + len])
}

/// Write a `u16` at `offset`. Panics on out-of-bounds: callers only ever
/// write within a page they just sized the free-space check against.
pub fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    LittleEndian::write_u16(&mut buf[offset..offset + 2], v);
}

/// Write a `u32` at `offset`.
pub fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    LittleEndian::write_u32(&mut buf[offset..offset + 4], v);
}

/// Write a `u64` at `offset`.
pub fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    LittleEndian::write_u64(&mut buf[offset..offset + 8], v);
}

/// Write a single byte at `offset`.
pub fn put_u8(buf: &mut [u8], offset: usize, v: u8) {
    buf[offset] = v;
}

/// Copy `bytes` into `buf` starting at `offset`.
pub fn put_slice(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Big-endian encode of a `u64`, used for freelist keys (txnids) and the
/// `IntegerKey`/`IntegerDup` comparators, which must sort the same way
/// the integers they represent do.
pub fn be_u64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

/// Decode a big-endian `u64`. Returns `None` if `bytes` isn't exactly 8
/// bytes long.
pub fn from_be_u64(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut buf = [0u8; 16];
        put_u16(&mut buf, 0, 0xABCD);
        put_u32(&mut buf, 2, 0xDEAD_BEEF);
        put_u64(&mut buf, 6, 0x0102_0304_0506_0708);
        assert_eq!(get_u16(&buf, 0, 0).unwrap(), 0xABCD);
        assert_eq!(get_u32(&buf, 2, 0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(get_u64(&buf, 6, 0).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn out_of_bounds_is_corrupted_not_panic() {
        let buf = [0u8; 4];
        assert!(matches!(
            get_u32(&buf, 2, 7),
            Err(Error::Corrupted { pgno: 7, .. })
        ));
    }

    #[quickcheck_macros::quickcheck]
    fn be_u64_round_trips(v: u64) -> bool {
        from_be_u64(&be_u64(v)) == Some(v)
    }
}
